use std::io::{self, Write};

use crate::http::{now_unix, reason_phrase, HtmlEscaped, HttpDate};

pub const CHUNK_SIZE: usize = 8 * 1024;

/// Body framing chosen by the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// `Content-Length` header; the body is exactly that many bytes.
    Identity(u64),
    /// `Transfer-Encoding: chunked`; hex-sized chunks ending in `0\r\n\r\n`.
    Chunked,
    /// No body and no framing header (304 and friends).
    None,
}

/// Serializes one response onto the client stream: status line, standard
/// headers, then the body in the chosen framing. Tracks what was sent so the
/// worker can log the status and decide whether the connection is reusable.
/// Broken-pipe style write failures are swallowed; they only mark the
/// connection unusable.
pub struct ResponseWriter<'a> {
    out: &'a mut dyn Write,
    server: &'a str,
    head_only: bool,
    close: bool,
    keep_alive_secs: u64,
    status: u16,
    started: bool,
    broken: bool,
}

impl<'a> ResponseWriter<'a> {
    pub fn new(
        out: &'a mut dyn Write,
        server: &'a str,
        head_only: bool,
        close: bool,
        keep_alive_secs: u64,
    ) -> ResponseWriter<'a> {
        ResponseWriter {
            out,
            server,
            head_only,
            close,
            keep_alive_secs,
            status: 0,
            started: false,
            broken: false,
        }
    }

    pub fn set_close(&mut self, close: bool) {
        self.close = close;
    }

    pub fn close_requested(&self) -> bool {
        self.close
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn broken(&self) -> bool {
        self.broken
    }

    /// Status line, standard headers, handler headers in their given order,
    /// framing header, blank line.
    pub fn send_head(
        &mut self,
        status: u16,
        headers: &[(&str, String)],
        framing: Framing,
    ) -> io::Result<()> {
        let mut head = String::with_capacity(256);
        head.push_str(&format!(
            "HTTP/1.1 {} {}\r\n",
            status,
            reason_phrase(status)
        ));
        if self.close {
            head.push_str("Connection: close\r\n");
        } else {
            head.push_str("Connection: keep-alive\r\n");
            if self.keep_alive_secs > 0 {
                head.push_str(&format!("Keep-Alive: timeout={}\r\n", self.keep_alive_secs));
            }
        }
        head.push_str(&format!("Date: {}\r\n", HttpDate(now_unix())));
        head.push_str(&format!("Server: {}\r\n", self.server));
        for (name, value) in headers {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        match framing {
            Framing::Identity(length) => {
                head.push_str(&format!("Content-Length: {}\r\n", length))
            }
            Framing::Chunked => head.push_str("Transfer-Encoding: chunked\r\n"),
            Framing::None => {}
        }
        head.push_str("\r\n");
        self.status = status;
        self.write_all(head.as_bytes())
    }

    /// Identity body from memory. Suppressed for HEAD.
    pub fn send_body(&mut self, body: &[u8]) -> io::Result<()> {
        if self.head_only {
            return Ok(());
        }
        self.write_all(body)
    }

    /// Identity body: copy exactly `length` bytes from the reader.
    pub fn send_reader(
        &mut self,
        reader: &mut dyn io::Read,
        length: u64,
    ) -> io::Result<()> {
        if self.head_only {
            return Ok(());
        }
        let mut remaining = length;
        let mut buf = [0u8; CHUNK_SIZE];
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let got = reader.read(&mut buf[..want])?;
            if got == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "file ended before the promised Content-Length",
                ));
            }
            self.write_all(&buf[..got])?;
            remaining -= got as u64;
        }
        Ok(())
    }

    /// Start a chunked body. For HEAD the returned writer discards chunks.
    pub fn chunked<'w>(&'w mut self) -> ChunkedBody<'w, 'a> {
        ChunkedBody {
            writer: self,
            buf: Vec::new(),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        if self.broken {
            return Ok(());
        }
        match self.out.write_all(buf).and_then(|_| self.out.flush()) {
            Ok(()) => {
                self.started = true;
                Ok(())
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::BrokenPipe
                        | io::ErrorKind::ConnectionReset
                        | io::ErrorKind::ConnectionAborted
                ) =>
            {
                self.broken = true;
                self.close = true;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Chunked body writer. `write_chunk` emits one frame per call; the
/// `io::Write` impl coalesces small writes into CHUNK_SIZE frames so stream
/// encoders can plug in directly. `finish` emits the zero-chunk terminator.
pub struct ChunkedBody<'w, 'a> {
    writer: &'w mut ResponseWriter<'a>,
    buf: Vec<u8>,
}

impl ChunkedBody<'_, '_> {
    pub fn write_chunk(&mut self, data: &[u8]) -> io::Result<()> {
        self.flush_buf()?;
        self.emit(data)
    }

    pub fn finish(mut self) -> io::Result<()> {
        self.flush_buf()?;
        if self.writer.head_only {
            return Ok(());
        }
        self.writer.write_all(b"0\r\n\r\n")
    }

    fn flush_buf(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let data = std::mem::take(&mut self.buf);
        self.emit(&data)
    }

    fn emit(&mut self, data: &[u8]) -> io::Result<()> {
        if data.is_empty() || self.writer.head_only {
            return Ok(());
        }
        let mut frame = Vec::with_capacity(data.len() + 16);
        write!(frame, "{:x}\r\n", data.len())?;
        frame.extend_from_slice(data);
        frame.extend_from_slice(b"\r\n");
        self.writer.write_all(&frame)
    }
}

impl Write for ChunkedBody<'_, '_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        if self.buf.len() >= CHUNK_SIZE {
            self.flush_buf()?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_buf()
    }
}

/// A generated page for any (erroneous) occasion.
pub fn error_page(status: u16, detail: &str) -> String {
    let reason = reason_phrase(status);
    format!(
        "<html><head><title>{} {}</title></head><body>\n\
        <h1>{}</h1>\n\
        {}\n\
        <hr>\n\
        Generated by {}\n\
        </body></html>\n",
        status,
        reason,
        reason,
        detail,
        crate::http::SERVER_SOFTWARE,
    )
}

pub fn send_error(
    w: &mut ResponseWriter<'_>,
    status: u16,
    detail: &str,
) -> io::Result<()> {
    let page = error_page(status, detail);
    w.send_head(
        status,
        &[("Content-Type", "text/html; charset=UTF-8".to_string())],
        Framing::Identity(page.len() as u64),
    )?;
    w.send_body(page.as_bytes())
}

/// A permanent redirect.
pub fn send_redirect(w: &mut ResponseWriter<'_>, location: &str) -> io::Result<()> {
    let page = format!(
        "<html><head><title>301 Moved Permanently</title></head><body>\n\
        <h1>Moved Permanently</h1>\n\
        Moved to: <a href=\"{0}\">{0}</a>\n\
        <hr>\n\
        Generated by {1}\n\
        </body></html>\n",
        HtmlEscaped(location),
        crate::http::SERVER_SOFTWARE,
    );
    w.send_head(
        301,
        &[
            ("Location", location.to_string()),
            ("Content-Type", "text/html; charset=UTF-8".to_string()),
        ],
        Framing::Identity(page.len() as u64),
    )?;
    w.send_body(page.as_bytes())
}

#[cfg(test)]
mod test {
    use super::*;

    fn writer(out: &mut Vec<u8>, head_only: bool, close: bool) -> ResponseWriter<'_> {
        ResponseWriter::new(out, "testd/0.0", head_only, close, 30)
    }

    #[test]
    fn head_has_standard_headers() {
        let mut out = Vec::new();
        let mut w = writer(&mut out, false, false);
        w.send_head(
            200,
            &[("Content-Type", "text/plain".to_string())],
            Framing::Identity(2),
        )
        .unwrap();
        w.send_body(b"ok").unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Connection: keep-alive\r\n"));
        assert!(text.contains("Keep-Alive: timeout=30\r\n"));
        assert!(text.contains("Date: "));
        assert!(text.contains("Server: testd/0.0\r\n"));
        assert!(text.contains("Content-Type: text/plain\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(text.ends_with("\r\n\r\nok"));
    }

    #[test]
    fn close_suppresses_keep_alive() {
        let mut out = Vec::new();
        let mut w = writer(&mut out, false, true);
        w.send_head(200, &[], Framing::None).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Connection: close\r\n"));
        assert!(!text.contains("Keep-Alive"));
    }

    #[test]
    fn head_only_suppresses_bodies() {
        let mut out = Vec::new();
        let mut w = writer(&mut out, true, true);
        w.send_head(200, &[], Framing::Identity(5)).unwrap();
        w.send_body(b"hello").unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn chunked_frames_are_canonical() {
        let mut out = Vec::new();
        let mut w = writer(&mut out, false, true);
        w.send_head(200, &[], Framing::Chunked).unwrap();
        let mut body = w.chunked();
        body.write_chunk(b"hello ").unwrap();
        body.write_chunk(b"world").unwrap();
        body.write_chunk(b"").unwrap();
        body.finish().unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Transfer-Encoding: chunked\r\n"));
        let body_part = text.split("\r\n\r\n").nth(1).unwrap();
        assert_eq!(body_part, "6\r\nhello \r\n5\r\nworld\r\n0\r\n\r\n");
    }

    #[test]
    fn chunked_write_impl_coalesces() {
        let mut out = Vec::new();
        let mut w = writer(&mut out, false, true);
        w.send_head(200, &[], Framing::Chunked).unwrap();
        let mut body = w.chunked();
        for _ in 0..3 {
            Write::write_all(&mut body, b"abc").unwrap();
        }
        body.finish().unwrap();

        let text = String::from_utf8(out).unwrap();
        let body_part = text.split("\r\n\r\n").nth(1).unwrap();
        assert_eq!(body_part, "9\r\nabcabcabc\r\n0\r\n\r\n");
    }

    #[test]
    fn head_only_chunked_is_headers_only() {
        let mut out = Vec::new();
        let mut w = writer(&mut out, true, true);
        w.send_head(200, &[], Framing::Chunked).unwrap();
        let mut body = w.chunked();
        body.write_chunk(b"invisible").unwrap();
        body.finish().unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.ends_with("\r\n\r\n"));
        assert!(!text.contains("invisible"));
    }

    #[test]
    fn error_page_mentions_status() {
        let page = error_page(404, "The URL you requested was not found.");
        assert!(page.contains("404 Not Found"));
        assert!(page.contains("The URL you requested was not found."));
    }
}
