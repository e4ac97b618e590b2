use std::fs;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;

use anyhow::{Context, Result};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::cgi::CgiModule;
use crate::compress::CompressModule;
use crate::config::{Overrides, ServerConfig};
use crate::handler::{self, Ctx, SendOverride, ServeOverride};
use crate::http::Method;
use crate::logger::Logger;
use crate::mime::MimeTable;
use crate::parser::{self, ClientStream, RecvError};
use crate::response::{self, ResponseWriter};

static RUNNING: AtomicBool = AtomicBool::new(true);
static RELOAD: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_stop(_signal: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

extern "C" fn handle_reload(_signal: libc::c_int) {
    RELOAD.store(true, Ordering::Relaxed);
}

/// INT/TERM stop the accept loop, HUP reloads the config, PIPE is ignored.
/// SA_RESTART stays off so a signal interrupts a blocking accept.
pub fn install_signal_handlers() -> Result<()> {
    let stop = SigAction::new(SigHandler::Handler(handle_stop), SaFlags::empty(), SigSet::empty());
    let reload = SigAction::new(
        SigHandler::Handler(handle_reload),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    unsafe {
        sigaction(Signal::SIGINT, &stop).context("failed to set SIGINT handler")?;
        sigaction(Signal::SIGTERM, &stop).context("failed to set SIGTERM handler")?;
        sigaction(Signal::SIGHUP, &reload).context("failed to set SIGHUP handler")?;
        sigaction(Signal::SIGPIPE, &ignore).context("failed to set SIGPIPE handler")?;
    }
    Ok(())
}

/// Shared state: config behind a copy-on-write swap, the immutable MIME
/// table, the log sink, the registered override modules, and the live
/// worker count.
pub struct ServerState {
    config: RwLock<Arc<ServerConfig>>,
    overrides: Overrides,
    mime: MimeTable,
    logger: Logger,
    serve_override: Option<Box<dyn ServeOverride>>,
    send_override: Option<Box<dyn SendOverride>>,
    live_workers: AtomicUsize,
}

impl ServerState {
    pub fn new(config: ServerConfig, overrides: Overrides) -> Result<ServerState> {
        let logger = if config.log_stdout {
            Logger::stdout()
        } else {
            Logger::append(&config.log_file)?
        };
        let mut mime = MimeTable::built_in();
        if let Some(path) = &config.mime_file {
            mime.merge_file(path)?;
        }
        Ok(ServerState {
            config: RwLock::new(Arc::new(config)),
            overrides,
            mime,
            logger,
            serve_override: Some(Box::new(CgiModule)),
            send_override: Some(Box::new(CompressModule)),
            live_workers: AtomicUsize::new(0),
        })
    }

    fn config(&self) -> Arc<ServerConfig> {
        self.config.read().expect("config lock poisoned").clone()
    }

    fn try_acquire_worker(&self, max: usize) -> bool {
        let mut live = self.live_workers.load(Ordering::Relaxed);
        loop {
            if live >= max {
                return false;
            }
            match self.live_workers.compare_exchange_weak(
                live,
                live + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => live = actual,
            }
        }
    }

    fn release_worker(&self) {
        self.live_workers.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Holds one slot of the connection semaphore for the worker's lifetime.
struct WorkerSlot(Arc<ServerState>);

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        self.0.release_worker();
    }
}

/// Build the shared state and serve until a stop signal.
pub fn run(config: ServerConfig, overrides: Overrides) -> Result<()> {
    let state = Arc::new(ServerState::new(config, overrides)?);
    serve(state)
}

fn bind(config: &ServerConfig) -> Result<TcpListener> {
    TcpListener::bind(("0.0.0.0", config.port))
        .with_context(|| format!("failed to bind port {}", config.port))
}

fn serve(state: Arc<ServerState>) -> Result<()> {
    let mut config = state.config();
    if config.needs_cache_dir() {
        fs::create_dir_all(&config.html_cache_dir).with_context(|| {
            format!(
                "failed to create cache directory {}",
                config.html_cache_dir.display()
            )
        })?;
    }
    let mut listener = bind(&config)?;

    while RUNNING.load(Ordering::Relaxed) {
        if RELOAD.swap(false, Ordering::Relaxed) {
            match reload(&state, &config) {
                Ok(Some(new_listener)) => listener = new_listener,
                Ok(None) => {}
                Err(e) => state.logger.error(&format!("reload failed: {:#}", e)),
            }
            config = state.config();
        }
        let (stream, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                state.logger.error(&format!("accept failed: {}", e));
                continue;
            }
        };
        config = state.config();
        if !state.try_acquire_worker(config.max_conn) {
            overloaded(&state, stream, peer, &config);
            continue;
        }
        let slot = WorkerSlot(state.clone());
        let worker_state = state.clone();
        let spawned = thread::Builder::new()
            .name(format!("worker-{}", peer))
            .spawn(move || {
                let _slot = slot;
                worker(worker_state, stream, peer);
            });
        if let Err(e) = spawned {
            state.logger.error(&format!("failed to spawn worker: {}", e));
        }
    }

    if config.needs_cache_dir() {
        fs::remove_dir_all(&config.html_cache_dir).ok();
    }
    Ok(())
}

/// Re-read the config and swap it in. The listening socket survives an
/// unchanged port; a changed port rebinds.
fn reload(state: &Arc<ServerState>, old: &Arc<ServerConfig>) -> Result<Option<TcpListener>> {
    let mut new = ServerConfig::load(&state.overrides)?;
    if new.server_addr.is_none() {
        new.server_addr = old.server_addr;
    }
    if new.needs_cache_dir() {
        fs::create_dir_all(&new.html_cache_dir).with_context(|| {
            format!(
                "failed to create cache directory {}",
                new.html_cache_dir.display()
            )
        })?;
    }
    let listener = if new.port != old.port {
        Some(bind(&new)?)
    } else {
        None
    };
    state.logger.note(&format!(
        "configuration reloaded (port {})",
        new.port
    ));
    *state.config.write().expect("config lock poisoned") = Arc::new(new);
    Ok(listener)
}

/// The semaphore is full: answer 503 on the fresh connection and drop it.
fn overloaded(state: &ServerState, mut stream: TcpStream, peer: SocketAddr, config: &ServerConfig) {
    let mut w = ResponseWriter::new(&mut stream, &config.server_software, false, true, 0);
    response::send_error(&mut w, 503, "The server is at its connection limit.").ok();
    drain(&stream);
    state
        .logger
        .error(&format!("connection limit reached; refused {}", peer));
}

/// Discard the unread remainder of a rejected request; closing a socket with
/// pending input resets the peer before it can read the error response.
fn drain(stream: &TcpStream) {
    stream
        .set_read_timeout(Some(std::time::Duration::from_millis(500)))
        .ok();
    let mut reader = stream;
    let mut scratch = [0u8; 1024];
    while matches!(io::Read::read(&mut reader, &mut scratch), Ok(n) if n > 0) {}
}

fn worker(state: Arc<ServerState>, stream: TcpStream, peer: SocketAddr) {
    if let Err(e) = serve_connection(&state, stream, peer) {
        // transport failures end the worker silently
        if !matches!(
            e.kind(),
            io::ErrorKind::BrokenPipe
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::UnexpectedEof
        ) {
            state
                .logger
                .error(&format!("worker for {} failed: {}", peer, e));
        }
    }
}

/// Parse, route, log, repeat while keep-alive allows.
fn serve_connection(
    state: &Arc<ServerState>,
    stream: TcpStream,
    peer: SocketAddr,
) -> io::Result<()> {
    let mut client = ClientStream::new(stream.try_clone()?)?;
    let mut out = stream;
    loop {
        let config = state.config();
        let req = match parser::read_request(&mut client, &config) {
            Ok(req) => req,
            Err(RecvError::Closed) => return Ok(()),
            Err(RecvError::Bad { status, detail }) => {
                let mut w =
                    ResponseWriter::new(&mut out, &config.server_software, false, true, 0);
                response::send_error(&mut w, status, &detail)?;
                drain(&out);
                state
                    .logger
                    .error(&format!("{}: rejected request: {} ({})", peer, status, detail));
                return Ok(());
            }
        };

        let close = !config.keep_alive || req.wants_close();
        let head_only = req.method == Method::Head;
        let keep_alive_secs = config.idle_timeout.map(|d| d.as_secs()).unwrap_or(0);
        let mut w = ResponseWriter::new(
            &mut out,
            &config.server_software,
            head_only,
            close,
            keep_alive_secs,
        );
        let ctx = Ctx {
            config: &config,
            mime: &state.mime,
            logger: &state.logger,
            peer,
            serve: state.serve_override.as_deref(),
            send: state.send_override.as_deref(),
        };
        let result = handler::route(&ctx, &req, &mut w);
        state
            .logger
            .request(peer.ip(), &req.method, &req.url, w.status());
        let close_now = w.close_requested() || w.broken();
        result?;
        if close_now {
            return Ok(());
        }
    }
}
