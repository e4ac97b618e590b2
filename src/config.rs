use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};

use crate::http::SERVER_SOFTWARE;

/// Settings the command line applies on top of the config file.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub config_file: Option<PathBuf>,
    pub port: Option<u16>,
    pub log_stdout: bool,
    pub doc_root: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct CgiConfig {
    pub enable: bool,
    pub extensions: Vec<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct CompressConfig {
    pub enable: bool,
    pub types: Vec<String>,
    pub level: u32,
    pub min_size: u64,
    pub cache: bool,
}

/// Validated server settings. Built once at startup; replaced wholesale by
/// the reload path, never mutated in place.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub max_conn: usize,
    pub keep_alive: bool,
    pub idle_timeout: Option<Duration>,
    pub recv_timeout: Option<Duration>,
    pub max_body_bytes: usize,
    pub http_cache: bool,
    pub http_cache_age: u64,
    pub index_filename: String,
    pub allow_hidden: bool,
    pub follow_symlinks: bool,
    pub html_cache: bool,
    pub html_cache_dir: PathBuf,
    pub log_file: PathBuf,
    pub log_stdout: bool,
    pub doc_root: PathBuf,
    pub server_addr: Option<IpAddr>,
    pub server_software: String,
    pub mime_file: Option<PathBuf>,
    pub cgi: CgiConfig,
    pub compress: CompressConfig,
}

impl ServerConfig {
    fn defaults() -> ServerConfig {
        ServerConfig {
            port: 8080,
            max_conn: 12,
            keep_alive: true,
            idle_timeout: Some(Duration::from_secs(30)),
            recv_timeout: Some(Duration::from_secs(5)),
            max_body_bytes: 16384,
            http_cache: false,
            http_cache_age: 200,
            index_filename: "index.html".to_string(),
            allow_hidden: false,
            follow_symlinks: false,
            html_cache: false,
            html_cache_dir: std::env::temp_dir()
                .join(format!("{}-{}", env!("CARGO_PKG_NAME"), std::process::id())),
            log_file: PathBuf::from("/dev/null"),
            log_stdout: false,
            doc_root: PathBuf::from("."),
            server_addr: None,
            server_software: SERVER_SOFTWARE.to_string(),
            mime_file: None,
            cgi: CgiConfig {
                enable: true,
                extensions: vec!["php".to_string()],
                timeout: Duration::from_secs(300),
            },
            compress: CompressConfig {
                enable: true,
                types: ["text/html", "text/plain", "text/css", "text/javascript"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
                level: 6,
                min_size: 256,
                cache: false,
            },
        }
    }

    /// Load and validate settings: defaults, then the config file, then the
    /// command-line overrides.
    pub fn load(overrides: &Overrides) -> Result<ServerConfig> {
        let mut config = ServerConfig::defaults();
        if let Some(path) = &overrides.config_file {
            config
                .read_file(path)
                .with_context(|| format!("failed to load config {}", path.display()))?;
        }
        if let Some(port) = overrides.port {
            config.port = port;
        }
        if overrides.log_stdout {
            config.log_stdout = true;
        }
        if let Some(root) = &overrides.doc_root {
            config.doc_root = root.clone();
        }
        config.validate()?;
        Ok(config)
    }

    /// The address used in redirects and handed to CGI children. Resolved
    /// before serving starts; loopback is only a placeholder until then.
    pub fn addr(&self) -> IpAddr {
        self.server_addr
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    pub fn needs_cache_dir(&self) -> bool {
        self.html_cache || (self.compress.enable && self.compress.cache)
    }

    fn read_file(&mut self, path: &Path) -> Result<()> {
        let text = fs::read_to_string(path)?;
        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| anyhow!("line {}: expected KEY=VALUE", index + 1))?;
            self.apply(key.trim(), unquote(value.trim()))
                .with_context(|| format!("line {}", index + 1))?;
        }
        Ok(())
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "MAX_CONN" => self.max_conn = parse_number(value)? as usize,
            "PORT" => {
                self.port = parse_number(value)?
                    .try_into()
                    .map_err(|_| anyhow!("port {} is out of range", value))?
            }
            "HTTP_KEEP_ALIVE" => self.keep_alive = parse_flag(value)?,
            "HTTP_TIMEOUT" => self.idle_timeout = seconds(parse_number(value)?),
            "HTTP_RECV_TIMEOUT" => self.recv_timeout = seconds(parse_number(value)?),
            "HTTP_BODY_SIZE" => self.max_body_bytes = parse_number(value)? as usize,
            "HTTP_CACHE" => self.http_cache = parse_flag(value)?,
            "HTTP_CACHE_AGE" => self.http_cache_age = parse_number(value)?,
            "INDEX_FILE" => self.index_filename = value.to_string(),
            "HIDDEN_FILES" => self.allow_hidden = parse_flag(value)?,
            "FOLLOW_SYMLINKS" => self.follow_symlinks = parse_flag(value)?,
            "HTML_CACHE" => self.html_cache = parse_flag(value)?,
            "HTML_CACHE_DIR" => self.html_cache_dir = PathBuf::from(value),
            "LOG_FILE" => self.log_file = PathBuf::from(value),
            "DOC_ROOT" => self.doc_root = PathBuf::from(value),
            "SERVER_ADDR" => {
                self.server_addr = Some(
                    value
                        .parse()
                        .map_err(|_| anyhow!("SERVER_ADDR {} is not an IP address", value))?,
                )
            }
            "MIME_FILE" => self.mime_file = Some(PathBuf::from(value)),
            "CGI_ENABLE" => self.cgi.enable = parse_flag(value)?,
            "CGI_EXTS" => {
                self.cgi.extensions = value
                    .split_whitespace()
                    .map(|ext| ext.trim_start_matches('.').to_lowercase())
                    .collect()
            }
            "CGI_TIMEOUT" => {
                self.cgi.timeout = Duration::from_secs(parse_number(value)?)
            }
            "COMPRESS" => self.compress.enable = parse_flag(value)?,
            "COMPRESS_TYPES" => {
                self.compress.types =
                    value.split_whitespace().map(str::to_string).collect()
            }
            "COMPRESS_LEVEL" => {
                self.compress.level = parse_number(value)?
                    .try_into()
                    .map_err(|_| anyhow!("COMPRESS_LEVEL {} is out of range", value))?
            }
            "COMPRESS_MIN_SIZE" => self.compress.min_size = parse_number(value)?,
            "COMPRESS_CACHE" => self.compress.cache = parse_flag(value)?,
            // The config source may be a shell fragment carrying unrelated
            // variables.
            other => eprintln!(
                "{}: ignoring unrecognized config key {}",
                env!("CARGO_PKG_NAME"),
                other
            ),
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.port <= 1024 {
            bail!("port {} is reserved: use a port above 1024", self.port);
        }
        if self.max_conn == 0 {
            bail!("MAX_CONN must be at least 1");
        }
        if self.compress.level > 9 {
            bail!("COMPRESS_LEVEL must be between 0 and 9");
        }
        self.doc_root = self.doc_root.canonicalize().with_context(|| {
            format!("invalid document root {}", self.doc_root.display())
        })?;
        if !self.doc_root.is_dir() {
            bail!("document root {} is not a directory", self.doc_root.display());
        }
        Ok(())
    }
}

/// Strip one pair of surrounding double quotes, if present.
fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(value)
}

/// Boolean keys must be exactly `0` or `1`.
fn parse_flag(value: &str) -> Result<bool> {
    match value {
        "0" => Ok(false),
        "1" => Ok(true),
        other => Err(anyhow!("expected 0 or 1, got `{}'", other)),
    }
}

/// Integer keys must be non-negative decimals.
fn parse_number(value: &str) -> Result<u64> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(anyhow!("expected a non-negative number, got `{}'", value));
    }
    value
        .parse()
        .map_err(|_| anyhow!("number {} is too large", value))
}

/// Zero disables a timeout.
fn seconds(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value))
}

#[cfg(test)]
mod test {
    use super::*;

    use std::io::Write;

    use test_case::test_case;

    fn load_with(content: &str) -> Result<ServerConfig> {
        let root = tempfile::tempdir().unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", content).unwrap();
        let overrides = Overrides {
            config_file: Some(file.path().to_path_buf()),
            doc_root: Some(root.path().to_path_buf()),
            ..Overrides::default()
        };
        ServerConfig::load(&overrides)
    }

    #[test]
    fn defaults_load() {
        let config = load_with("").unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.max_conn, 12);
        assert!(config.keep_alive);
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.max_body_bytes, 16384);
        assert_eq!(config.index_filename, "index.html");
        assert_eq!(config.cgi.extensions, vec!["php".to_string()]);
    }

    #[test]
    fn file_values_apply() {
        let config = load_with(
            "PORT=9999\n\
             MAX_CONN=3\n\
             HTTP_KEEP_ALIVE=0\n\
             HTTP_TIMEOUT=0\n\
             CGI_EXTS=\"php sh\"\n\
             # comment\n\
             \n\
             INDEX_FILE=start.html\n",
        )
        .unwrap();
        assert_eq!(config.port, 9999);
        assert_eq!(config.max_conn, 3);
        assert!(!config.keep_alive);
        assert_eq!(config.idle_timeout, None);
        assert_eq!(config.cgi.extensions, vec!["php", "sh"]);
        assert_eq!(config.index_filename, "start.html");
    }

    #[test_case("HTTP_CACHE=yes" ; "flag must be 0 or 1")]
    #[test_case("HTTP_CACHE=01" ; "flag must be exact")]
    #[test_case("MAX_CONN=-1" ; "negative number")]
    #[test_case("MAX_CONN=1x" ; "trailing junk")]
    #[test_case("PORT=70000" ; "port out of range")]
    #[test_case("PORT=80" ; "reserved port")]
    #[test_case("COMPRESS_LEVEL=10" ; "level out of range")]
    #[test_case("SERVER_ADDR=nonsense" ; "bad address")]
    #[test_case("just a line" ; "missing equals")]
    fn bad_values_refuse_startup(content: &str) {
        assert!(load_with(content).is_err());
    }

    #[test]
    fn unknown_keys_are_ignored() {
        assert!(load_with("SOME_SHELL_VAR=whatever\n").is_ok());
    }

    #[test]
    fn overrides_win() {
        let root = tempfile::tempdir().unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "PORT=9000\n").unwrap();
        let overrides = Overrides {
            config_file: Some(file.path().to_path_buf()),
            port: Some(9001),
            log_stdout: true,
            doc_root: Some(root.path().to_path_buf()),
        };
        let config = ServerConfig::load(&overrides).unwrap();
        assert_eq!(config.port, 9001);
        assert!(config.log_stdout);
    }

    #[test]
    fn missing_doc_root_refuses_startup() {
        let overrides = Overrides {
            doc_root: Some(PathBuf::from("/does/not/exist")),
            ..Overrides::default()
        };
        assert!(ServerConfig::load(&overrides).is_err());
    }
}
