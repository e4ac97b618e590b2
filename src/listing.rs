use std::fmt;
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use crate::handler::{self, Ctx};
use crate::http::{HtmlEscaped, HttpDate, Method, Request, UrlEncoded, SERVER_SOFTWARE};
use crate::lock::DirLock;
use crate::response::{Framing, ResponseWriter, CHUNK_SIZE};

/// Respond with the HTML index for a directory, either generated on the fly
/// (chunked) or through the on-disk cache.
pub fn serve_listing(
    ctx: &Ctx<'_>,
    req: &Request,
    w: &mut ResponseWriter<'_>,
    dir: &Path,
    url_path: &str,
) -> io::Result<()> {
    if req.method == Method::Post {
        return handler::deny(w, 405, "POST is only supported for CGI scripts.");
    }
    if ctx.config.html_cache {
        return serve_cached(ctx, req, w, dir, url_path);
    }

    let page = render(ctx, dir, url_path)?;
    w.send_head(
        200,
        &[("Content-Type", "text/html; charset=UTF-8".to_string())],
        Framing::Chunked,
    )?;
    let mut body = w.chunked();
    for piece in page.as_bytes().chunks(CHUNK_SIZE) {
        body.write_chunk(piece)?;
    }
    body.finish()
}

/// Serve the listing through the cache file, regenerating it under the lock
/// when the directory is newer.
fn serve_cached(
    ctx: &Ctx<'_>,
    req: &Request,
    w: &mut ResponseWriter<'_>,
    dir: &Path,
    url_path: &str,
) -> io::Result<()> {
    let cache_file = cache_path(&ctx.config.html_cache_dir, dir, ".html");
    if stale(&cache_file, dir)? {
        let _lock = DirLock::acquire(&cache_file.with_extension("html.lock"))?;
        // a sibling may have regenerated while we waited
        if stale(&cache_file, dir)? {
            let page = render(ctx, dir, url_path)?;
            let tmp = cache_file.with_extension("html.tmp");
            fs::write(&tmp, &page)?;
            fs::rename(&tmp, &cache_file)?;
        }
    }
    handler::serve_file(ctx, req, w, &cache_file)
}

/// Cache key: the directory path with all slashes removed.
pub(crate) fn cache_path(cache_dir: &Path, source: &Path, suffix: &str) -> PathBuf {
    let key: String = source
        .to_string_lossy()
        .chars()
        .filter(|&c| c != '/')
        .collect();
    cache_dir.join(format!("{}{}", key, suffix))
}

/// A cache file is stale when it is missing or older than its source.
pub(crate) fn stale(cache_file: &Path, source: &Path) -> io::Result<bool> {
    let source_meta = fs::metadata(source)?;
    match fs::metadata(cache_file) {
        Ok(cache_meta) => Ok(cache_meta.mtime() < source_meta.mtime()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(e),
    }
}

fn render(ctx: &Ctx<'_>, dir: &Path, url_path: &str) -> io::Result<String> {
    let entries = collect(ctx, dir)?;
    Ok(ListingPage {
        url_path,
        at_root: url_path == "/",
        entries: &entries,
    }
    .to_string())
}

struct Entry {
    name: String,
    is_dir: bool,
    mtime: i64,
    size: u64,
    kind: String,
}

/// Gather and order the rows: hidden entries (when enabled), then
/// directories, then files, each sorted by name.
fn collect(ctx: &Ctx<'_>, dir: &Path) -> io::Result<Vec<Entry>> {
    let mut hidden = Vec::new();
    let mut dirs = Vec::new();
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => continue,
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        let is_hidden = name.starts_with('.');
        if is_hidden && !ctx.config.allow_hidden {
            continue;
        }
        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(_) => continue,
        };
        let is_link = meta.file_type().is_symlink();
        let is_dir = if is_link {
            fs::metadata(entry.path())
                .map(|target| target.is_dir())
                .unwrap_or(false)
        } else {
            meta.is_dir()
        };
        let kind = if is_link && is_dir {
            "symbolic link->Directory".to_string()
        } else if is_dir {
            "Directory".to_string()
        } else {
            ctx.mime.for_name(&name).to_string()
        };
        let row = Entry {
            name,
            is_dir,
            mtime: meta.mtime(),
            size: meta.len(),
            kind,
        };
        if is_hidden {
            hidden.push(row);
        } else if is_dir {
            dirs.push(row);
        } else {
            files.push(row);
        }
    }
    for group in [&mut hidden, &mut dirs, &mut files] {
        group.sort_by(|a, b| a.name.cmp(&b.name));
    }
    let mut entries = hidden;
    entries.append(&mut dirs);
    entries.append(&mut files);
    Ok(entries)
}

/// The rendered index page.
struct ListingPage<'a> {
    url_path: &'a str,
    at_root: bool,
    entries: &'a [Entry],
}

impl<'a> fmt::Display for ListingPage<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<html>\n<head>\n<title>Index of {title}</title>\n\
            <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n\
            </head>\n<body>\n<h1>Index of {title}</h1>\n<table>\n\
            <tr><th>Name</th><th>Last-Modified</th><th>Size</th><th>Type</th></tr>\n",
            title = HtmlEscaped(self.url_path),
        )?;
        if !self.at_root {
            write!(
                f,
                "<tr><td><a href=\"../\">../</a></td><td></td><td>-</td><td>Directory</td></tr>\n"
            )?;
        }
        for entry in self.entries {
            let slash = if entry.is_dir { "/" } else { "" };
            write!(
                f,
                "<tr><td><a href=\"{}{slash}\">{}{slash}</a></td><td>{}</td><td>{}</td><td>{}</td></tr>\n",
                UrlEncoded(&entry.name),
                HtmlEscaped(&entry.name),
                HttpDate(entry.mtime),
                SizeCell(entry),
                HtmlEscaped(&entry.kind),
            )?;
        }
        write!(
            f,
            "</table>\n<hr>\nGenerated by {}\n</body>\n</html>\n",
            SERVER_SOFTWARE
        )
    }
}

struct SizeCell<'a>(&'a Entry);

impl<'a> fmt::Display for SizeCell<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_dir {
            write!(f, "-")
        } else {
            write!(f, "{}", HumanSize(self.0.size))
        }
    }
}

/// Sizes render as B, K, M, or G with one decimal place.
struct HumanSize(u64);

impl fmt::Display for HumanSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const KIB: f64 = 1024.0;
        let size = self.0 as f64;
        if size >= KIB * KIB * KIB {
            write!(f, "{:.1}G", size / (KIB * KIB * KIB))
        } else if size >= KIB * KIB {
            write!(f, "{:.1}M", size / (KIB * KIB))
        } else if size >= KIB {
            write!(f, "{:.1}K", size / KIB)
        } else {
            write!(f, "{:.1}B", size)
        }
    }
}
