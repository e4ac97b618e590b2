use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, TimeZone, Utc};

/// Server identity sent in `Server:` headers and embedded in ETags.
pub const SERVER_SOFTWARE: &str =
    concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Other(String),
}

impl Method {
    /// Parse a request-line method token. The token is uppercased first.
    pub fn parse(token: &str) -> Method {
        match token.to_uppercase().as_str() {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "POST" => Method::Post,
            other => Method::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Other(name) => name,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed request. Header keys are lowercased; values keep their raw form
/// with leading spaces trimmed. `query` includes the leading `?` when the
/// URL carried one.
#[derive(Debug)]
pub struct Request {
    pub method: Method,
    pub url: String,
    pub path: String,
    pub query: String,
    pub version: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn wants_close(&self) -> bool {
        self.header("connection")
            .map_or(false, |value| value.trim().eq_ignore_ascii_case("close"))
    }
}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        301 => "Moved Permanently",
        304 => "Not Modified",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        412 => "Precondition Failed",
        413 => "Request Entity Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

/// RFC 1123 formatted date.
pub struct HttpDate(pub i64);

impl fmt::Display for HttpDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let datetime = Utc
            .timestamp_opt(self.0, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        write!(f, "{}", datetime.format("%a, %d %b %Y %H:%M:%S GMT"))
    }
}

pub fn now_unix() -> i64 {
    Utc::now().timestamp()
}

/// Encode string to be an RFC3986-compliant URL part.
pub struct UrlEncoded<'a>(pub &'a str);

impl<'a> fmt::Display for UrlEncoded<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in self.0.chars() {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~') {
                write!(f, "{}", c)?;
            } else {
                let mut buf = [0; 4];
                c.encode_utf8(&mut buf);
                for byte in buf.iter().take(c.len_utf8()) {
                    write!(f, "%{:02X}", byte)?;
                }
            }
        }
        Ok(())
    }
}

/// Decode %XX (where XX are hexadecimal digits) to the byte it represents.
/// Invalid escapes pass through untouched.
pub fn url_decode(url: &str) -> Vec<u8> {
    let url = url.as_bytes();
    let mut decoded = Vec::with_capacity(url.len());
    let mut i = 0;
    while i < url.len() {
        let c = url[i];
        if c == b'%'
            && i + 2 < url.len()
            && url[i + 1].is_ascii_hexdigit()
            && url[i + 2].is_ascii_hexdigit()
        {
            decoded.push(hex_to_digit(url[i + 1]) * 16 + hex_to_digit(url[i + 2]));
            i += 3;
        } else {
            decoded.push(c);
            i += 1;
        }
    }
    decoded
}

/// Convert hex digit to integer.
fn hex_to_digit(hex: u8) -> u8 {
    if hex.is_ascii_uppercase() {
        hex - b'A' + 10
    } else if hex.is_ascii_lowercase() {
        hex - b'a' + 10
    } else {
        hex - b'0'
    }
}

/// Escape < > & ' " into HTML entities.
pub struct HtmlEscaped<'a>(pub &'a str);

impl<'a> fmt::Display for HtmlEscaped<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in self.0.chars() {
            match c {
                '<' => write!(f, "&lt;")?,
                '>' => write!(f, "&gt;")?,
                '&' => write!(f, "&amp;")?,
                '\'' => write!(f, "&apos;")?,
                '"' => write!(f, "&quot;")?,
                c => write!(f, "{}", c)?,
            }
        }
        Ok(())
    }
}

/// Resolve //, /./, and /../ in a decoded URL path.
///
/// Returns None if the path is invalid or climbs above the root.
pub fn sanitize_path(path: &str) -> Option<String> {
    let mut path = path.as_bytes().to_vec();

    // Paths not starting with a slash are illegal.
    if !path.starts_with(&[b'/']) {
        return None;
    }

    let mut src_index = 0;
    let mut dst_index = 0;
    while src_index < path.len() {
        if path[src_index] == b'/' && path.get(src_index + 1) == Some(&b'/') {
            // skip slash
            src_index += 1;
        } else if path[src_index] == b'/'
            && path.get(src_index + 1) == Some(&b'.')
            && matches!(path.get(src_index + 2), Some(&b'/') | None)
        {
            // skip slash dot slash
            src_index += 2;
        } else if path[src_index] == b'/'
            && path.get(src_index + 1) == Some(&b'.')
            && path.get(src_index + 2) == Some(&b'.')
            && matches!(path.get(src_index + 3), Some(&b'/') | None)
        {
            // skip slash dot dot slash
            src_index += 3;
            // overwrite previous component
            loop {
                if dst_index == 0 {
                    return None;
                }
                dst_index -= 1;
                if path[dst_index] == b'/' {
                    break;
                }
            }
        } else {
            path[dst_index] = path[src_index];
            src_index += 1;
            dst_index += 1;
        }
    }

    // Always preserve the leading slash.
    dst_index = dst_index.max(1);
    path.truncate(dst_index);

    String::from_utf8(path).ok()
}

#[cfg(test)]
mod test {
    use super::*;

    use test_case::test_case;

    #[test_case("GET", Method::Get ; "get")]
    #[test_case("head", Method::Head ; "lowercase head")]
    #[test_case("Post", Method::Post ; "mixed case post")]
    #[test_case("DELETE", Method::Other("DELETE".to_string()) ; "delete")]
    fn method_parse_works(token: &str, expected: Method) {
        assert_eq!(Method::parse(token), expected);
    }

    #[test]
    fn url_encoded_works() {
        assert_eq!(
            UrlEncoded("escape(this)name\tcrab\u{1F980}").to_string(),
            "escape%28this%29name%09crab%F0%9F%A6%80"
        );
    }

    #[test]
    fn url_decode_works() {
        assert_eq!(url_decode("escape%28this%29name%09"), b"escape(this)name\t");
        assert_eq!(url_decode("edge%"), b"edge%");
        assert_eq!(url_decode("edge%2"), b"edge%2");
        assert_eq!(url_decode("edge%20"), b"edge ");
        assert_eq!(url_decode("invalid%C3%28"), b"invalid\xc3\x28");
    }

    #[test]
    fn html_escaped_works() {
        assert_eq!(
            HtmlEscaped("foo<>&'\"").to_string(),
            "foo&lt;&gt;&amp;&apos;&quot;"
        );
    }

    #[test]
    fn http_date_works() {
        assert_eq!(
            HttpDate(1622040683).to_string(),
            "Wed, 26 May 2021 14:51:23 GMT"
        );
    }

    #[test]
    fn sanitize_path_works() {
        let test_cases = &[
            ("", None),
            ("/", Some("/")),
            ("/.", Some("/")),
            ("/./", Some("/")),
            ("/.d", Some("/.d")),
            ("//.d", Some("/.d")),
            ("/../", None),
            ("/abc", Some("/abc")),
            ("/abc/", Some("/abc/")),
            ("/abc/.", Some("/abc")),
            ("/abc/./", Some("/abc/")),
            ("/abc/..", Some("/")),
            ("/abc/../", Some("/")),
            ("/abc/../def", Some("/def")),
            ("/abc/../def/", Some("/def/")),
            ("/abc/../def/..", Some("/")),
            ("/abc/../def/../", Some("/")),
            ("/abc/../def/../../", None),
            ("/abc/../def/.././", Some("/")),
            ("/abc/../def/.././../", None),
            ("/a/b/c/../../d/", Some("/a/d/")),
            ("/a/b/../../../c", None),
            ("//a///b////c/////", Some("/a/b/c/")),
        ];
        for (path, expected) in test_cases {
            assert_eq!(sanitize_path(path), expected.map(|s| s.to_string()));
        }
    }
}
