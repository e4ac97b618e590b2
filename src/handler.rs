use std::fs::{self, File, Metadata};
use std::io;
use std::net::SocketAddr;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use nix::unistd::{access, AccessFlags};

use crate::config::ServerConfig;
use crate::http::{sanitize_path, url_decode, HttpDate, Method, Request};
use crate::listing;
use crate::logger::Logger;
use crate::mime::MimeTable;
use crate::response::{self, Framing, ResponseWriter};

/// Per-request view of the server's shared state.
pub struct Ctx<'a> {
    pub config: &'a ServerConfig,
    pub mime: &'a MimeTable,
    pub logger: &'a Logger,
    pub peer: SocketAddr,
    pub serve: Option<&'a dyn ServeOverride>,
    pub send: Option<&'a dyn SendOverride>,
}

/// The single override point for fulfilling a validated request for a path.
/// An override either writes a complete response (returning true) or leaves
/// the request untouched for the static handler (returning false).
pub trait ServeOverride: Send + Sync {
    fn serve(
        &self,
        ctx: &Ctx<'_>,
        req: &Request,
        w: &mut ResponseWriter<'_>,
        path: &Path,
    ) -> io::Result<bool>;
}

/// A regular file about to be sent with identity framing.
pub struct StaticFile<'a> {
    pub file: &'a mut File,
    pub path: &'a Path,
    pub mime: &'a str,
    pub length: u64,
    pub headers: &'a [(&'static str, String)],
}

/// Replacement for the identity file-send step.
pub trait SendOverride: Send + Sync {
    fn send_file(
        &self,
        ctx: &Ctx<'_>,
        req: &Request,
        w: &mut ResponseWriter<'_>,
        file: StaticFile<'_>,
    ) -> io::Result<bool>;
}

/// Send an error response. Policy errors that leave the connection usable
/// (405) keep it; everything else closes.
pub(crate) fn deny(
    w: &mut ResponseWriter<'_>,
    status: u16,
    detail: &str,
) -> io::Result<()> {
    if status != 405 {
        w.set_close(true);
    }
    response::send_error(w, status, detail)
}

/// Map the decoded URL to the filesystem and write a complete response.
pub fn route(ctx: &Ctx<'_>, req: &Request, w: &mut ResponseWriter<'_>) -> io::Result<()> {
    match dispatch(ctx, req, w) {
        Ok(()) => Ok(()),
        // The response is already framed; nothing can be patched up.
        Err(e) if w.started() => Err(e),
        Err(e) => {
            ctx.logger
                .error(&format!("handling {} failed: {}", req.url, e));
            deny(w, 500, "The server failed to handle this request.")
        }
    }
}

fn dispatch(ctx: &Ctx<'_>, req: &Request, w: &mut ResponseWriter<'_>) -> io::Result<()> {
    let decoded = match String::from_utf8(url_decode(&req.path)) {
        Ok(decoded) => decoded,
        Err(_) => return deny(w, 400, "You requested an invalid URL."),
    };
    let safe = match sanitize_path(&decoded) {
        Some(safe) => safe,
        None => return deny(w, 400, "You requested an invalid URL."),
    };

    if !ctx.config.allow_hidden {
        let segment = safe.rsplit('/').find(|seg| !seg.is_empty()).unwrap_or("");
        if segment.starts_with('.') {
            return deny(w, 403, "You don't have permission to access this URL.");
        }
    }

    let target = ctx.config.doc_root.join(safe.trim_start_matches('/'));

    let link_meta = match fs::symlink_metadata(&target) {
        Ok(meta) => meta,
        Err(e) => {
            return if e.kind() == io::ErrorKind::PermissionDenied {
                deny(w, 403, "You don't have permission to access this URL.")
            } else if e.kind() == io::ErrorKind::NotFound
                || e.raw_os_error() == Some(libc::ENOTDIR)
            {
                deny(w, 404, "The URL you requested was not found.")
            } else {
                Err(e)
            }
        }
    };
    if link_meta.file_type().is_symlink() && !ctx.config.follow_symlinks {
        return deny(w, 403, "You don't have permission to access this URL.");
    }

    let real = match target.canonicalize() {
        Ok(real) => real,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return deny(w, 404, "The URL you requested was not found.")
        }
        Err(e) => return Err(e),
    };
    if !ctx.config.follow_symlinks && !real.starts_with(&ctx.config.doc_root) {
        return deny(w, 403, "You don't have permission to access this URL.");
    }

    let meta = match fs::metadata(&target) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return deny(w, 404, "The URL you requested was not found.")
        }
        Err(e) => return Err(e),
    };

    if meta.is_file() {
        return serve_path(ctx, req, w, &target);
    }
    if meta.is_dir() {
        if !safe.ends_with('/') {
            let location = format!(
                "http://{}:{}{}/",
                ctx.config.addr(),
                ctx.config.port,
                req.path
            );
            return response::send_redirect(w, &location);
        }
        let index = target.join(&ctx.config.index_filename);
        if index.is_file() {
            return serve_path(ctx, req, w, &index);
        }
        if !dir_accessible(&target) {
            return deny(w, 403, "You don't have permission to list this directory.");
        }
        return listing::serve_listing(ctx, req, w, &target, &safe);
    }
    deny(w, 403, "Not a regular file.")
}

/// Fulfill a validated request for a path: the override hook first, then
/// the static handler.
pub fn serve_path(
    ctx: &Ctx<'_>,
    req: &Request,
    w: &mut ResponseWriter<'_>,
    path: &Path,
) -> io::Result<()> {
    if let Some(hook) = ctx.serve {
        if hook.serve(ctx, req, w, path)? {
            return Ok(());
        }
    }
    serve_file(ctx, req, w, path)
}

/// The static file handler: MIME, conditional requests, identity framing.
pub fn serve_file(
    ctx: &Ctx<'_>,
    req: &Request,
    w: &mut ResponseWriter<'_>,
    path: &Path,
) -> io::Result<()> {
    if req.method == Method::Post {
        return deny(w, 405, "POST is only supported for CGI scripts.");
    }

    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) => {
            return match e.kind() {
                io::ErrorKind::PermissionDenied => {
                    deny(w, 403, "You don't have permission to access this URL.")
                }
                io::ErrorKind::NotFound => {
                    deny(w, 404, "The URL you requested was not found.")
                }
                _ => Err(e),
            }
        }
    };
    let meta = file.metadata()?;
    let mime = ctx.mime.for_name(&path.to_string_lossy());

    let mut headers: Vec<(&'static str, String)> =
        vec![("Content-Type", mime.to_string())];
    if ctx.config.http_cache {
        let etag = file_etag(&meta, &ctx.config.server_software);
        if let Some(held) = req.header("if-match") {
            if held.trim() != etag {
                return deny(w, 412, "The entity tag no longer matches.");
            }
        }
        if req.header("if-none-match").map(str::trim) == Some(etag.as_str()) {
            return w.send_head(304, &[("ETag", etag)], Framing::None);
        }
        headers.push((
            "Cache-Control",
            format!("max-age={}", ctx.config.http_cache_age),
        ));
        headers.push(("ETag", etag));
    }
    headers.push(("Last-Modified", HttpDate(meta.mtime()).to_string()));

    let length = meta.len();
    if let Some(hook) = ctx.send {
        let handled = hook.send_file(
            ctx,
            req,
            w,
            StaticFile {
                file: &mut file,
                path,
                mime,
                length,
                headers: &headers,
            },
        )?;
        if handled {
            return Ok(());
        }
    }

    w.send_head(200, &headers, Framing::Identity(length))?;
    w.send_reader(&mut file, length)
}

/// ETag: mtime, inode, and the server identity.
fn file_etag(meta: &Metadata, software: &str) -> String {
    format!("\"{:x}-{:x}-{}\"", meta.mtime(), meta.ino(), software)
}

/// A listing requires the directory to be readable and searchable.
pub(crate) fn dir_accessible(path: &Path) -> bool {
    access(path, AccessFlags::R_OK | AccessFlags::X_OK).is_ok()
}
