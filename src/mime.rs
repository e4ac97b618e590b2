use std::collections::HashMap;
use std::fs::File;
use std::io::BufRead;
use std::path::Path;

use anyhow::{Context, Result};

pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

const DEFAULT_EXTENSIONS_MAP: &[&str] = &[
    "application/ogg         ogg",
    "application/pdf         pdf",
    "application/wasm        wasm",
    "application/xml         xsl xml",
    "application/xml-dtd     dtd",
    "application/xslt+xml    xslt",
    "application/zip         zip",
    "audio/mpeg              mp2 mp3 mpga",
    "image/gif               gif",
    "image/jpeg              jpeg jpe jpg",
    "image/png               png",
    "image/svg+xml           svg",
    "text/css                css",
    "text/html               html htm",
    "text/javascript         js",
    "text/plain              txt asc",
    "video/mpeg              mpeg mpe mpg",
    "video/quicktime         qt mov",
    "video/x-msvideo         avi",
    "video/mp4               mp4",
];

/// Extension to MIME type mapping. Immutable after startup.
#[derive(Debug)]
pub struct MimeTable {
    types: HashMap<String, String>,
    default: String,
}

impl MimeTable {
    /// Create a MimeTable from the built-in extension map.
    pub fn built_in() -> MimeTable {
        let mut table = MimeTable {
            types: HashMap::new(),
            default: DEFAULT_MIME_TYPE.to_string(),
        };
        for line in DEFAULT_EXTENSIONS_MAP {
            table.add_line(line);
        }
        table
    }

    /// Merge an extension map file over the built-in entries.
    pub fn merge_file(&mut self, path: &Path) -> Result<()> {
        let file = File::open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        for line in std::io::BufReader::new(file).lines() {
            let line =
                line.with_context(|| format!("failed to read {}", path.display()))?;
            self.add_line(&line);
        }
        Ok(())
    }

    /// Add one line from an extension map: a mimetype followed by the
    /// extensions it covers. The pseudo-extension `default` replaces the
    /// fallback type.
    fn add_line(&mut self, line: &str) {
        let mut fields = line
            .split(|c| c == ' ' || c == '\t')
            .filter(|field| !field.is_empty());
        let mimetype = match fields.next() {
            Some(mimetype) => mimetype,
            None => return, // empty line
        };
        if mimetype.starts_with('#') {
            return; // comment
        }
        for extension in fields {
            if extension == "default" {
                self.default = mimetype.to_string();
            } else {
                self.types
                    .insert(extension.to_lowercase(), mimetype.to_string());
            }
        }
    }

    /// MIME type for a file name. The final path segment is lowercased, a
    /// leading dot is ignored, and the extension is everything after the
    /// first remaining dot.
    pub fn for_name(&self, name: &str) -> &str {
        extension_of(name)
            .and_then(|extension| self.types.get(&extension))
            .map(String::as_str)
            .unwrap_or(&self.default)
    }
}

fn extension_of(name: &str) -> Option<String> {
    let segment = name.rsplit('/').next().unwrap_or(name).to_lowercase();
    let segment = segment.strip_prefix('.').unwrap_or(&segment);
    segment
        .split_once('.')
        .map(|(_, extension)| extension.to_string())
}

#[cfg(test)]
mod test {
    use super::*;

    use std::io::Write;

    use test_case::test_case;

    #[test_case("a.txt", "text/plain" ; "plain file")]
    #[test_case("/some/dir/page.HTML", "text/html" ; "uppercase extension")]
    #[test_case("archive.tar.gz", "application/octet-stream" ; "first dot wins")]
    #[test_case(".bashrc", "application/octet-stream" ; "dotfile has no extension")]
    #[test_case(".config.js", "text/javascript" ; "dotfile with extension")]
    #[test_case("README", "application/octet-stream" ; "no extension")]
    fn for_name_works(name: &str, expected: &str) {
        assert_eq!(MimeTable::built_in().for_name(name), expected);
    }

    #[test]
    fn merge_file_works() {
        let mut map_file = tempfile::NamedTempFile::new().unwrap();
        writeln!(map_file, "test/type1 a1").unwrap();
        writeln!(map_file, "# comment line").unwrap();
        writeln!(map_file, "test/fallback default").unwrap();
        writeln!(map_file, "text/x-markdown\tmd markdown").unwrap();

        let mut table = MimeTable::built_in();
        table.merge_file(map_file.path()).unwrap();
        assert_eq!(table.for_name("x.a1"), "test/type1");
        assert_eq!(table.for_name("x.md"), "text/x-markdown");
        assert_eq!(table.for_name("x.unknown"), "test/fallback");
        // built-in entries survive the merge
        assert_eq!(table.for_name("x.png"), "image/png");
    }
}
