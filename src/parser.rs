use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Read};
use std::net::TcpStream;
use std::time::Duration;

use crate::config::ServerConfig;
use crate::http::{Method, Request};

/// Why a request could not be produced.
#[derive(Debug)]
pub enum RecvError {
    /// Peer went away without starting a request: EOF, idle timeout before
    /// the first byte, or a reset. Nothing to answer.
    Closed,
    /// Protocol or policy failure. The worker answers with this status and
    /// closes the connection.
    Bad { status: u16, detail: String },
}

fn bad(status: u16, detail: &str) -> RecvError {
    RecvError::Bad {
        status,
        detail: detail.to_string(),
    }
}

fn timed_out(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// The read half of a connection. A second handle to the socket carries the
/// timeout changes; the reads themselves go through the buffer.
pub struct ClientStream {
    reader: BufReader<TcpStream>,
    ctrl: TcpStream,
}

impl ClientStream {
    pub fn new(stream: TcpStream) -> io::Result<ClientStream> {
        let ctrl = stream.try_clone()?;
        Ok(ClientStream {
            reader: BufReader::new(stream),
            ctrl,
        })
    }

    fn set_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.ctrl.set_read_timeout(timeout)
    }

    /// Read one line into `buf`, stripping the LF and an optional CR.
    /// Returns the raw byte count, zero meaning EOF. On error `buf` holds
    /// whatever partial data arrived.
    fn read_line(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        buf.clear();
        let n = self.reader.read_until(b'\n', buf)?;
        if buf.last() == Some(&b'\n') {
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
        }
        Ok(n)
    }
}

/// Read and validate one request. The request line is read under the idle
/// timeout; everything after it under the receive timeout.
pub fn read_request(
    client: &mut ClientStream,
    config: &ServerConfig,
) -> Result<Request, RecvError> {
    let mut line = Vec::new();

    client
        .set_timeout(config.idle_timeout)
        .map_err(|_| RecvError::Closed)?;
    match client.read_line(&mut line) {
        Ok(0) => return Err(RecvError::Closed),
        Ok(_) => {}
        Err(e) if timed_out(&e) && line.is_empty() => return Err(RecvError::Closed),
        Err(e) if timed_out(&e) => {
            return Err(bad(400, "timed out reading the request line"))
        }
        Err(_) => return Err(RecvError::Closed),
    }
    let request_line = String::from_utf8(line.clone())
        .map_err(|_| bad(400, "request line is not valid UTF-8"))?;
    let (method, url, version) = parse_request_line(&request_line)
        .ok_or_else(|| bad(400, "malformed request line"))?;
    let (path, query) = split_query(&url);

    client
        .set_timeout(config.recv_timeout)
        .map_err(|_| RecvError::Closed)?;
    let mut headers = HashMap::new();
    loop {
        match client.read_line(&mut line) {
            Ok(0) => return Err(bad(400, "connection closed before the headers ended")),
            Ok(_) => {}
            Err(e) if timed_out(&e) => return Err(bad(400, "timed out reading headers")),
            Err(_) => return Err(RecvError::Closed),
        }
        if line.is_empty() {
            break;
        }
        let text = std::str::from_utf8(&line)
            .map_err(|_| bad(400, "header line is not valid UTF-8"))?;
        let (key, value) = text
            .split_once(':')
            .ok_or_else(|| bad(400, "header line without a colon"))?;
        let key = key.to_lowercase();
        let value = value.trim_start_matches(' ').to_string();
        if key.is_empty() || value.is_empty() {
            return Err(bad(400, "empty header name or value"));
        }
        headers.insert(key, value);
    }

    if let Method::Other(name) = &method {
        return Err(bad(501, &format!("method {} is not implemented", name)));
    }
    if version != "HTTP/1.1" {
        return Err(bad(505, &format!("version {} is not supported", version)));
    }
    if !headers.contains_key("host") {
        return Err(bad(400, "HTTP/1.1 requires a Host header"));
    }

    let body = if headers
        .get("transfer-encoding")
        .map_or(false, |v| v.trim().eq_ignore_ascii_case("chunked"))
    {
        read_chunked_body(&mut client.reader, config.max_body_bytes)?
    } else if let Some(value) = headers.get("content-length") {
        let length = parse_content_length(value)
            .ok_or_else(|| bad(400, "Content-Length is not a valid integer"))?;
        if length > config.max_body_bytes {
            return Err(bad(413, "request body exceeds the configured limit"));
        }
        let mut body = vec![0; length];
        client.reader.read_exact(&mut body).map_err(body_err)?;
        body
    } else {
        Vec::new()
    };

    Ok(Request {
        method,
        url,
        path,
        query,
        version,
        headers,
        body,
    })
}

/// Split the request line on single spaces into method, url, version.
fn parse_request_line(line: &str) -> Option<(Method, String, String)> {
    let mut parts = line.splitn(3, ' ');
    let method = parts.next().filter(|tok| !tok.is_empty())?;
    let url = parts.next().filter(|tok| !tok.is_empty())?;
    let version = parts.next().filter(|tok| !tok.is_empty())?;
    Some((Method::parse(method), url.to_string(), version.to_string()))
}

/// Split a URL at the first `?`; the query keeps the `?`.
fn split_query(url: &str) -> (String, String) {
    match url.find('?') {
        Some(index) => (url[..index].to_string(), url[index..].to_string()),
        None => (url.to_string(), String::new()),
    }
}

/// Content-Length must be a plain non-negative decimal.
fn parse_content_length(value: &str) -> Option<usize> {
    let value = value.trim();
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}

/// Short reads and timeouts mid-body are protocol errors; resets are not.
fn body_err(e: io::Error) -> RecvError {
    if timed_out(&e) {
        bad(400, "timed out reading the body")
    } else if e.kind() == io::ErrorKind::UnexpectedEof {
        bad(400, "body ended before the promised length")
    } else {
        RecvError::Closed
    }
}

/// Chunked body: hex size line, that many bytes, a trailing CRLF; a zero
/// size ends the body. The accumulated total is capped.
fn read_chunked_body<R: BufRead>(
    reader: &mut R,
    max_bytes: usize,
) -> Result<Vec<u8>, RecvError> {
    let mut body = Vec::new();
    let mut line = Vec::new();
    loop {
        read_body_line(reader, &mut line)?;
        let text = std::str::from_utf8(&line)
            .map_err(|_| bad(400, "chunk size line is not valid UTF-8"))?;
        let size_field = text.split(';').next().unwrap_or(text).trim();
        let size = usize::from_str_radix(size_field, 16)
            .map_err(|_| bad(400, "chunk size is not a hex number"))?;
        if size == 0 {
            // the final CRLF after the last chunk
            read_body_line(reader, &mut line).ok();
            return Ok(body);
        }
        if body.len() + size > max_bytes {
            return Err(bad(413, "request body exceeds the configured limit"));
        }
        let start = body.len();
        body.resize(start + size, 0);
        reader.read_exact(&mut body[start..]).map_err(body_err)?;
        read_body_line(reader, &mut line)?;
    }
}

fn read_body_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> Result<(), RecvError> {
    buf.clear();
    match reader.read_until(b'\n', buf) {
        Ok(0) => Err(bad(400, "body ended before the promised length")),
        Ok(_) => {
            if buf.last() == Some(&b'\n') {
                buf.pop();
                if buf.last() == Some(&b'\r') {
                    buf.pop();
                }
            }
            Ok(())
        }
        Err(e) => Err(body_err(e)),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::io::Cursor;

    use test_case::test_case;

    #[test]
    fn parse_request_line_works() {
        let (method, url, version) =
            parse_request_line("GET /a.txt HTTP/1.1").unwrap();
        assert_eq!(method, Method::Get);
        assert_eq!(url, "/a.txt");
        assert_eq!(version, "HTTP/1.1");
    }

    #[test_case("" ; "empty line")]
    #[test_case("GET" ; "method only")]
    #[test_case("GET /a.txt" ; "missing version")]
    #[test_case(" /a.txt HTTP/1.1" ; "empty method")]
    fn parse_request_line_rejects(line: &str) {
        assert!(parse_request_line(line).is_none());
    }

    #[test_case("/a.txt", "/a.txt", "" ; "no query")]
    #[test_case("/cgi.php?x=1", "/cgi.php", "?x=1" ; "simple query")]
    #[test_case("/p?a=1?b=2", "/p", "?a=1?b=2" ; "first question mark wins")]
    #[test_case("/p?", "/p", "?" ; "empty query keeps the marker")]
    fn split_query_works(url: &str, path: &str, query: &str) {
        assert_eq!(split_query(url), (path.to_string(), query.to_string()));
    }

    #[test_case("0", Some(0) ; "zero")]
    #[test_case("124", Some(124) ; "plain number")]
    #[test_case(" 124 ", Some(124) ; "surrounding space")]
    #[test_case("+124", None ; "signed")]
    #[test_case("-1", None ; "negative")]
    #[test_case("12a", None ; "junk")]
    #[test_case("", None ; "empty")]
    fn parse_content_length_works(value: &str, expected: Option<usize>) {
        assert_eq!(parse_content_length(value), expected);
    }

    #[test]
    fn chunked_body_reassembles() {
        let mut input = Cursor::new(b"6\r\nhello \r\n5\r\nworld\r\n0\r\n\r\n".to_vec());
        let body = read_chunked_body(&mut input, 1024).unwrap();
        assert_eq!(body, b"hello world");
    }

    #[test]
    fn chunked_body_ignores_extensions() {
        let mut input = Cursor::new(b"5;name=value\r\nhello\r\n0\r\n\r\n".to_vec());
        let body = read_chunked_body(&mut input, 1024).unwrap();
        assert_eq!(body, b"hello");
    }

    #[test]
    fn chunked_body_enforces_cap() {
        let mut input = Cursor::new(b"6\r\nhello \r\n5\r\nworld\r\n0\r\n\r\n".to_vec());
        match read_chunked_body(&mut input, 8) {
            Err(RecvError::Bad { status: 413, .. }) => {}
            other => panic!("expected 413, got {:?}", other),
        }
    }

    #[test]
    fn chunked_body_rejects_bad_size() {
        let mut input = Cursor::new(b"xyz\r\nhello\r\n0\r\n\r\n".to_vec());
        match read_chunked_body(&mut input, 1024) {
            Err(RecvError::Bad { status: 400, .. }) => {}
            other => panic!("expected 400, got {:?}", other),
        }
    }

    #[test]
    fn chunked_body_rejects_truncation() {
        let mut input = Cursor::new(b"6\r\nhel".to_vec());
        match read_chunked_body(&mut input, 1024) {
            Err(RecvError::Bad { status: 400, .. }) => {}
            other => panic!("expected 400, got {:?}", other),
        }
    }
}
