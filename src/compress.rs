use std::fs::{self, File};
use std::io;
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;

use crate::handler::{Ctx, SendOverride, StaticFile};
use crate::http::Request;
use crate::listing;
use crate::lock::DirLock;
use crate::response::{Framing, ResponseWriter};

/// gzip module: replaces the identity file send when the client accepts it
/// and the policy matches; otherwise falls through untouched.
pub struct CompressModule;

impl SendOverride for CompressModule {
    fn send_file(
        &self,
        ctx: &Ctx<'_>,
        req: &Request,
        w: &mut ResponseWriter<'_>,
        send: StaticFile<'_>,
    ) -> io::Result<bool> {
        let policy = &ctx.config.compress;
        if !policy.enable || send.length < policy.min_size {
            return Ok(false);
        }
        if !policy.types.iter().any(|t| t == send.mime) {
            return Ok(false);
        }
        if !accepts_gzip(req) {
            return Ok(false);
        }

        let mut headers = send.headers.to_vec();
        headers.push(("Content-Encoding", "gzip".to_string()));

        if policy.cache {
            serve_cached_gzip(ctx, w, send.path, &headers)?;
            return Ok(true);
        }

        w.send_head(200, &headers, Framing::Chunked)?;
        let body = w.chunked();
        let mut encoder = GzEncoder::new(body, Compression::new(policy.level));
        io::copy(send.file, &mut encoder)?;
        encoder.finish()?.finish()?;
        Ok(true)
    }
}

fn accepts_gzip(req: &Request) -> bool {
    req.header("accept-encoding").map_or(false, |value| {
        value
            .split(',')
            .any(|token| token.trim().split(';').next().unwrap_or("") == "gzip")
    })
}

/// Serve a cached gzip body as a regular identity response, regenerating the
/// cache file under the lock when the source is newer.
fn serve_cached_gzip(
    ctx: &Ctx<'_>,
    w: &mut ResponseWriter<'_>,
    source: &Path,
    headers: &[(&'static str, String)],
) -> io::Result<()> {
    let cache_file = listing::cache_path(&ctx.config.html_cache_dir, source, ".gz");
    if listing::stale(&cache_file, source)? {
        let _lock = DirLock::acquire(&cache_file.with_extension("gz.lock"))?;
        if listing::stale(&cache_file, source)? {
            let tmp = cache_file.with_extension("gz.tmp");
            let mut encoder = GzEncoder::new(
                File::create(&tmp)?,
                Compression::new(ctx.config.compress.level),
            );
            io::copy(&mut File::open(source)?, &mut encoder)?;
            encoder.finish()?;
            fs::rename(&tmp, &cache_file)?;
        }
    }
    let mut gz = File::open(&cache_file)?;
    let length = gz.metadata()?.len();
    w.send_head(200, headers, Framing::Identity(length))?;
    w.send_reader(&mut gz, length)
}
