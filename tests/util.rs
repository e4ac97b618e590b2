use std::fs::{create_dir, File};
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::thread;
use std::thread::sleep;
use std::time::Duration;

use tempfile::{tempdir, TempDir};

use denhttpd::{Overrides, ServerConfig};

fn get_unused_port() -> Option<u16> {
    TcpListener::bind(("localhost", 0))
        .ok()
        .map(|listener| listener.local_addr().unwrap().port())
}

fn wait_for_port(port: u16) -> bool {
    for _ in 0..1000 {
        if TcpStream::connect(("localhost", port)).is_ok() {
            return true;
        }
        sleep(Duration::from_millis(1));
    }
    false
}

/// A server running on a background thread against a temporary document
/// root. The thread dies with the test process.
pub struct Server {
    port: u16,
    root: TempDir,
    state: TempDir,
}

impl Server {
    /// Start with extra config file lines on top of the test defaults.
    pub fn with_config(extra: &str) -> Self {
        let root = tempdir().expect("failed to create tempdir");
        let state = tempdir().expect("failed to create tempdir");

        // Get an unused port. Assumes the port won't be reused before the
        // server binds it.
        let port = get_unused_port().expect("failed to get unused port");

        let conf_path = state.path().join("test.conf");
        std::fs::write(
            &conf_path,
            format!(
                "PORT={}\nSERVER_ADDR=127.0.0.1\nHTML_CACHE_DIR={}\n{}\n",
                port,
                state.path().join("cache").display(),
                extra
            ),
        )
        .expect("failed to write config");

        let overrides = Overrides {
            config_file: Some(conf_path),
            port: None,
            log_stdout: false,
            doc_root: Some(root.path().to_path_buf()),
        };
        let config = ServerConfig::load(&overrides).expect("failed to load test config");
        thread::spawn(move || denhttpd::run(config, overrides).expect("server failed"));

        // Wait until the socket is open.
        assert!(wait_for_port(port), "failed to connect to server");

        Self { port, root, state }
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn cache_dir(&self) -> std::path::PathBuf {
        self.state.path().join("cache")
    }

    pub fn create_dir(&self, name: &str) {
        create_dir(self.root().join(name)).expect("failed to create directory");
    }

    pub fn create_file(&self, name: &str, contents: &[u8]) {
        let mut file = File::create(self.root().join(name)).expect("failed to create file");
        file.write_all(contents).expect("failed to write file");
    }

    /// An executable script in the document root.
    pub fn create_script(&self, name: &str, contents: &str) {
        let path = self.root().join(name);
        std::fs::write(&path, contents).expect("failed to write script");
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).expect("failed to chmod script");
    }

    pub fn stream(&self) -> TcpStream {
        let stream =
            TcpStream::connect(("localhost", self.port)).expect("failed to connect to server");
        // Set timeouts to prevent tests from hanging
        stream
            .set_read_timeout(Some(Duration::from_secs(3)))
            .unwrap();
        stream
            .set_write_timeout(Some(Duration::from_secs(3)))
            .unwrap();
        stream
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Write raw bytes and collect everything until the server closes.
    pub fn raw(&self, request: &[u8]) -> Vec<u8> {
        let mut stream = self.stream();
        stream.write_all(request).expect("failed to write request");
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).ok();
        buf
    }

    pub fn get(&self, path: &str) -> Response {
        self.get_with(path, &[])
    }

    pub fn get_with(&self, path: &str, extra: &[(&str, &str)]) -> Response {
        let mut stream = self.stream();
        let mut headers = vec![("Host", "test"), ("Connection", "close")];
        headers.extend_from_slice(extra);
        send_request(&mut stream, "GET", path, &headers, b"");
        Response::from_reader(&mut stream).expect("failed to read response")
    }
}

pub fn send_request(
    stream: &mut TcpStream,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: &[u8],
) {
    write!(stream, "{} {} HTTP/1.1\r\n", method, path).unwrap();
    for (name, value) in headers {
        write!(stream, "{}: {}\r\n", name, value).unwrap();
    }
    write!(stream, "\r\n").unwrap();
    stream.write_all(body).unwrap();
}

/// One HTTP response, with the body already unframed.
pub struct Response {
    pub status_line: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn from_reader<R: Read>(reader: &mut R) -> io::Result<Self> {
        let status_line = read_header_line(reader)?;
        let mut headers = Vec::new();
        loop {
            let line = read_header_line(reader)?;
            if line.is_empty() {
                break;
            }
            let (name, value) = line.split_once(':').expect("invalid header");
            headers.push((name.to_string(), value.trim_start().to_string()));
        }
        let response = Self {
            status_line,
            headers,
            body: Vec::new(),
        };
        let body = if response.header("Transfer-Encoding") == Some("chunked") {
            read_chunked_body(reader)?
        } else if let Some(length) = response.header("Content-Length") {
            let length = length.parse().expect("invalid content length");
            let mut body = vec![0; length];
            reader.read_exact(&mut body)?;
            body
        } else {
            Vec::new()
        };
        Ok(Self { body, ..response })
    }

    pub fn status(&self) -> u16 {
        self.status_line
            .split(' ')
            .nth(1)
            .expect("invalid status line")
            .parse()
            .expect("invalid status code")
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

fn read_header_line<R: Read>(reader: &mut R) -> io::Result<String> {
    read_until_slice(reader, b"\r\n")
        .map(|line| String::from_utf8(line).expect("header line is not valid UTF-8"))
}

fn read_chunked_body<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut body = Vec::new();
    loop {
        let line = read_header_line(reader)?;
        let size = usize::from_str_radix(line.split(';').next().unwrap().trim(), 16)
            .expect("invalid chunk size");
        if size == 0 {
            read_until_slice(reader, b"\r\n").ok();
            return Ok(body);
        }
        let start = body.len();
        body.resize(start + size, 0);
        reader.read_exact(&mut body[start..])?;
        read_until_slice(reader, b"\r\n")?;
    }
}

fn read_until_slice<R: Read>(reader: &mut R, separator: &[u8]) -> io::Result<Vec<u8>> {
    let mut byte = [0; 1];
    let mut buf = Vec::new();
    loop {
        reader.read_exact(&mut byte)?;
        buf.push(byte[0]);
        if buf.as_slice().ends_with(separator) {
            buf.truncate(buf.len() - separator.len());
            return Ok(buf);
        }
    }
}
