use std::collections::HashMap;
use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use once_cell::sync::Lazy;

use crate::handler::{self, Ctx, ServeOverride};
use crate::http::Request;
use crate::response::{Framing, ResponseWriter, CHUNK_SIZE};

static INTERPRETERS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    [
        ("php", "php-cgi"),
        ("pl", "perl"),
        ("py", "python3"),
        ("rb", "ruby"),
        ("sh", "sh"),
    ]
    .into_iter()
    .collect()
});

const WATCHDOG_TICK: Duration = Duration::from_millis(50);

/// CGI module: claims requests for executable files with a configured
/// extension and leaves everything else to the static handler.
pub struct CgiModule;

impl ServeOverride for CgiModule {
    fn serve(
        &self,
        ctx: &Ctx<'_>,
        req: &Request,
        w: &mut ResponseWriter<'_>,
        path: &Path,
    ) -> io::Result<bool> {
        if !ctx.config.cgi.enable || !is_cgi(path, &ctx.config.cgi.extensions) {
            return Ok(false);
        }
        run_script(ctx, req, w, path)?;
        Ok(true)
    }
}

/// A configured extension on an executable file.
fn is_cgi(path: &Path, extensions: &[String]) -> bool {
    let extension = match path.extension().and_then(|e| e.to_str()) {
        Some(extension) => extension.to_lowercase(),
        None => return false,
    };
    if !extensions.iter().any(|e| *e == extension) {
        return false;
    }
    fs::metadata(path)
        .map(|meta| meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// CGI/1.1 environment for one request. The child sees nothing else.
fn build_env(ctx: &Ctx<'_>, req: &Request, path: &Path) -> Vec<(String, String)> {
    let config = ctx.config;
    let mut env: Vec<(String, String)> = vec![
        ("GATEWAY_INTERFACE".into(), "CGI/1.1".into()),
        ("SERVER_SOFTWARE".into(), config.server_software.clone()),
        ("SERVER_PROTOCOL".into(), "HTTP/1.1".into()),
        ("SERVER_NAME".into(), config.addr().to_string()),
        ("SERVER_ADDR".into(), config.addr().to_string()),
        ("SERVER_PORT".into(), config.port.to_string()),
        ("DOCUMENT_ROOT".into(), config.doc_root.display().to_string()),
        ("REDIRECT_STATUS".into(), "1".into()),
        ("REQUEST_METHOD".into(), req.method.to_string()),
        ("REQUEST_URI".into(), format!("{}{}", req.path, req.query)),
        ("SCRIPT_FILENAME".into(), path.display().to_string()),
        ("SCRIPT_NAME".into(), script_name(path, &config.doc_root)),
        (
            "QUERY_STRING".into(),
            req.query.strip_prefix('?').unwrap_or(&req.query).to_string(),
        ),
        ("REMOTE_ADDR".into(), ctx.peer.ip().to_string()),
        ("REMOTE_HOST".into(), "NULL".into()),
        (
            "CONTENT_TYPE".into(),
            req.header("content-type").unwrap_or("NULL").to_string(),
        ),
        (
            "CONTENT_LENGTH".into(),
            req.header("content-length").unwrap_or("NULL").to_string(),
        ),
    ];
    for (key, value) in &req.headers {
        if matches!(
            key.as_str(),
            "connection" | "content-length" | "content-type" | "method" | "version"
                | "url" | "querystr"
        ) {
            continue;
        }
        env.push((
            format!("HTTP_{}", key.to_uppercase().replace('-', "_")),
            value.clone(),
        ));
    }
    env
}

fn script_name(path: &Path, doc_root: &Path) -> String {
    match path.strip_prefix(doc_root) {
        Ok(rel) => format!("/{}", rel.display()),
        Err(_) => path.display().to_string(),
    }
}

fn run_script(
    ctx: &Ctx<'_>,
    req: &Request,
    w: &mut ResponseWriter<'_>,
    path: &Path,
) -> io::Result<()> {
    let interpreter = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .and_then(|e| INTERPRETERS.get(e.as_str()).copied());

    let mut command = match interpreter {
        Some(program) => {
            let mut command = Command::new(program);
            command.arg(path);
            command
        }
        None => Command::new(path),
    };
    command
        .env_clear()
        .envs(build_env(ctx, req, path))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .process_group(0);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            ctx.logger
                .error(&format!("failed to spawn CGI for {}: {}", path.display(), e));
            return handler::deny(w, 500, "The server failed to run this script.");
        }
    };

    // feed the request body from a separate thread
    if let Some(mut stdin) = child.stdin.take() {
        let body = req.body.clone();
        thread::spawn(move || {
            stdin.write_all(&body).ok();
        });
    }

    let pid = Pid::from_raw(child.id() as i32);
    let done = Arc::new(AtomicBool::new(false));
    let timed_out = Arc::new(AtomicBool::new(false));
    if !ctx.config.cgi.timeout.is_zero() {
        let deadline = Instant::now() + ctx.config.cgi.timeout;
        let done = done.clone();
        let timed_out = timed_out.clone();
        thread::spawn(move || watchdog(pid, deadline, done, timed_out));
    }

    let stdout = child.stdout.take().expect("child stdout is piped");
    let mut reader = BufReader::new(stdout);
    let relayed = relay(ctx, req, w, &mut reader, path);
    if relayed.is_err() {
        killpg(pid, Signal::SIGKILL).ok();
    }
    let exit = child.wait();
    done.store(true, Ordering::Release);

    if timed_out.load(Ordering::Acquire) {
        ctx.logger.error(&format!(
            "CGI {} exceeded its {}s timeout",
            path.display(),
            ctx.config.cgi.timeout.as_secs()
        ));
        if !w.started() {
            return handler::deny(w, 500, "The script took too long.");
        }
        w.set_close(true);
        return Ok(());
    }
    match exit {
        Ok(status) if !status.success() => ctx
            .logger
            .error(&format!("CGI {} exited with {}", path.display(), status)),
        Err(e) => ctx
            .logger
            .error(&format!("failed to reap CGI {}: {}", path.display(), e)),
        _ => {}
    }
    relayed
}

/// Kill the child's process group when the deadline passes first.
fn watchdog(pid: Pid, deadline: Instant, done: Arc<AtomicBool>, timed_out: Arc<AtomicBool>) {
    while !done.load(Ordering::Acquire) {
        if Instant::now() >= deadline {
            timed_out.store(true, Ordering::Release);
            killpg(pid, Signal::SIGKILL).ok();
            return;
        }
        thread::sleep(WATCHDOG_TICK);
    }
}

/// Read the script's header block, then stream its body as chunks.
fn relay(
    ctx: &Ctx<'_>,
    _req: &Request,
    w: &mut ResponseWriter<'_>,
    reader: &mut impl BufRead,
    path: &Path,
) -> io::Result<()> {
    let mut status = 200u16;
    let mut headers: Vec<(String, String)> = Vec::new();
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        let trimmed = line.trim_end_matches(|c| c == '\r' || c == '\n');
        if trimmed.is_empty() {
            break;
        }
        let Some((key, value)) = trimmed.split_once(':') else {
            continue;
        };
        let value = value.trim_start();
        if key.eq_ignore_ascii_case("status") {
            status = value
                .split(' ')
                .next()
                .unwrap_or(value)
                .parse()
                .unwrap_or(200);
        } else {
            headers.push((key.to_string(), value.to_string()));
        }
    }

    if !headers
        .iter()
        .any(|(key, _)| key.eq_ignore_ascii_case("content-type"))
    {
        ctx.logger.error(&format!(
            "CGI {} produced no Content-Type",
            path.display()
        ));
        return handler::deny(w, 500, "The script produced an invalid response.");
    }

    let header_refs: Vec<(&str, String)> = headers
        .iter()
        .map(|(key, value)| (key.as_str(), value.clone()))
        .collect();
    w.send_head(status, &header_refs, Framing::Chunked)?;

    let mut body = w.chunked();
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        body.write_chunk(&buf[..n])?;
    }
    body.finish()
}
