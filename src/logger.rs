use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, TimeZone};

use crate::http::Method;

/// Where to put the log.
#[derive(Debug)]
enum LogSink {
    Stdout,
    File(BufWriter<File>),
}

/// Append-only request/error log. Whole records are written under one lock
/// so concurrent workers never interleave mid-line.
#[derive(Debug)]
pub struct Logger {
    sink: Mutex<LogSink>,
}

impl Logger {
    pub fn stdout() -> Logger {
        Logger {
            sink: Mutex::new(LogSink::Stdout),
        }
    }

    pub fn append(path: &Path) -> Result<Logger> {
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        Ok(Logger {
            sink: Mutex::new(LogSink::File(BufWriter::new(file))),
        })
    }

    /// One record per completed request.
    pub fn request(&self, peer: IpAddr, method: &Method, url: &str, status: u16) {
        self.write_record(format!(
            "{} {} \"{} {} HTTP/1.1\" {}",
            peer,
            ClfDate(crate::http::now_unix()),
            LogEncoded(method.as_str()),
            LogEncoded(url),
            status
        ));
    }

    pub fn error(&self, detail: &str) {
        self.write_record(format!(
            "{} error: {}",
            ClfDate(crate::http::now_unix()),
            LogEncoded(detail)
        ));
    }

    pub fn note(&self, detail: &str) {
        self.write_record(format!(
            "{} {}",
            ClfDate(crate::http::now_unix()),
            LogEncoded(detail)
        ));
    }

    fn write_record(&self, record: String) {
        let mut sink = self.sink.lock().expect("log sink lock poisoned");
        match &mut *sink {
            LogSink::Stdout => {
                println!("{}", record);
            }
            LogSink::File(file) => {
                writeln!(file, "{}", record).and_then(|_| file.flush()).ok();
            }
        }
    }
}

/// Common Log Format (CLF) formatted date in local timezone.
struct ClfDate(i64);

impl fmt::Display for ClfDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let datetime: DateTime<Local> = Local
            .timestamp_opt(self.0, 0)
            .single()
            .unwrap_or_else(Local::now);
        write!(f, "{}", datetime.format("[%d/%b/%Y:%H:%M:%S %z]"))
    }
}

/// Encode string for logging. Logs should not contain control characters or
/// double quotes.
struct LogEncoded<'a>(&'a str);

impl<'a> fmt::Display for LogEncoded<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in self.0.chars() {
            if !c.is_ascii() || c.is_ascii_control() || c == '"' {
                let mut buf = [0; 4];
                c.encode_utf8(&mut buf);
                for byte in buf.iter().take(c.len_utf8()) {
                    write!(f, "%{:02X}", byte)?;
                }
            } else {
                write!(f, "{}", c)?;
            }
        }
        Ok(())
    }
}
