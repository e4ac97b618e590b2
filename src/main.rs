use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::path::PathBuf;
use std::process::exit;

use anyhow::{anyhow, Context, Result};

use denhttpd::http::SERVER_SOFTWARE;
use denhttpd::{install_signal_handlers, run, Overrides, ServerConfig};

const EXIT_FATAL: i32 = 113;
const EXIT_NO_FACILITY: i32 = 127;

fn usage(argv0: &str) {
    print!(
        "usage:\t{} [-c CONFIG] [-p PORT] [-v] [PATH]\n\n\
        flags:\t-c CONFIG\n\
        \t\tLoad settings from a KEY=VALUE config file.\n\n\
        \t-p PORT (default: 8080)\n\
        \t\tSpecifies which port to listen on for connections.\n\
        \t\tPorts up to 1024 are refused.\n\n\
        \t-v\n\
        \t\tWrite the log to stdout instead of LOG_FILE.\n\n\
        \tPATH (default: current directory)\n\
        \t\tDocument root to serve files from.\n\n",
        argv0
    );
}

fn parse_commandline() -> Result<Overrides> {
    let mut overrides = Overrides::default();
    let mut args = std::env::args();
    let name = args.next().unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string());

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-c" => {
                overrides.config_file =
                    Some(PathBuf::from(args.next().context("missing filename after -c")?));
            }
            "-p" => {
                let number = args.next().context("missing number after -p")?;
                overrides.port = Some(
                    number
                        .parse()
                        .with_context(|| format!("port number {} is invalid", number))?,
                );
            }
            "-v" => overrides.log_stdout = true,
            "-h" | "--help" => {
                usage(&name);
                exit(0);
            }
            path if !path.starts_with('-') => {
                if overrides.doc_root.is_some() {
                    return Err(anyhow!("unexpected extra argument `{}'", path));
                }
                overrides.doc_root = Some(PathBuf::from(path));
            }
            other => return Err(anyhow!("unknown argument `{}'", other)),
        }
    }
    Ok(overrides)
}

/// Ask the routing table which local address faces outward. No packet is
/// ever sent through the probe socket.
fn detect_local_addr() -> Result<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .context("failed to open a probe socket")?;
    socket
        .connect((Ipv4Addr::new(192, 0, 2, 1), 80))
        .context("no route to detect the local address")?;
    Ok(socket
        .local_addr()
        .context("failed to read the probe socket address")?
        .ip())
}

fn fatal(error: &anyhow::Error) -> ! {
    eprintln!("{}: {:#}", env!("CARGO_PKG_NAME"), error);
    exit(EXIT_FATAL);
}

fn main() {
    let overrides = match parse_commandline() {
        Ok(overrides) => overrides,
        Err(e) => fatal(&e),
    };
    let mut config = match ServerConfig::load(&overrides) {
        Ok(config) => config,
        Err(e) => fatal(&e),
    };
    if config.server_addr.is_none() {
        match detect_local_addr() {
            Ok(addr) => config.server_addr = Some(addr),
            Err(e) => {
                eprintln!(
                    "{}: local address detection failed: {:#}",
                    env!("CARGO_PKG_NAME"),
                    e
                );
                exit(EXIT_NO_FACILITY);
            }
        }
    }
    if let Err(e) = install_signal_handlers() {
        fatal(&e);
    }

    println!(
        "{} serving {} on http://{}:{}/",
        SERVER_SOFTWARE,
        config.doc_root.display(),
        config.addr(),
        config.port
    );
    if let Err(e) = run(config, overrides) {
        fatal(&e);
    }
}
