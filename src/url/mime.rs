//! MIME type ↔ file extension table
//!
//! A small built-in table covering what websites commonly serve, extended at
//! runtime by the `[[mime]]` definitions of the configuration file.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use url::Url;

/// MIME type used for markup documents
pub const HTML_MIME: &str = "text/html";

/// MIME type used for stylesheets
pub const CSS_MIME: &str = "text/css";

/// Fallback when nothing better is known
pub const OCTET_STREAM: &str = "application/octet-stream";

const BUILTIN: &[(&str, &[&str])] = &[
    ("text/html", &["html", "htm", "shtml"]),
    ("application/xhtml+xml", &["xhtml"]),
    ("text/css", &["css"]),
    ("text/javascript", &["js"]),
    ("application/javascript", &["js", "mjs"]),
    ("application/json", &["json"]),
    ("application/xml", &["xml"]),
    ("text/plain", &["txt"]),
    ("text/csv", &["csv"]),
    ("image/png", &["png"]),
    ("image/jpeg", &["jpg", "jpeg", "jpe"]),
    ("image/gif", &["gif"]),
    ("image/svg+xml", &["svg"]),
    ("image/x-icon", &["ico"]),
    ("image/webp", &["webp"]),
    ("image/avif", &["avif"]),
    ("image/bmp", &["bmp"]),
    ("font/woff", &["woff"]),
    ("font/woff2", &["woff2"]),
    ("font/ttf", &["ttf"]),
    ("font/otf", &["otf"]),
    ("application/vnd.ms-fontobject", &["eot"]),
    ("application/pdf", &["pdf"]),
    ("application/zip", &["zip"]),
    ("audio/mpeg", &["mp3"]),
    ("audio/ogg", &["ogg"]),
    ("audio/wav", &["wav"]),
    ("video/mp4", &["mp4"]),
    ("video/webm", &["webm"]),
    ("application/octet-stream", &["bin"]),
];

/// An extra MIME definition from the `[[mime]]` configuration tables
#[derive(Debug, Clone, Deserialize)]
pub struct MimeDefinition {
    #[serde(rename = "type")]
    pub mime: String,
    pub extensions: Vec<String>,
}

/// Bidirectional MIME ↔ extension lookup
#[derive(Debug, Clone)]
pub struct MimeTable {
    by_extension: HashMap<String, String>,
    by_mime: HashMap<String, String>,
}

impl Default for MimeTable {
    fn default() -> Self {
        let mut table = Self {
            by_extension: HashMap::new(),
            by_mime: HashMap::new(),
        };
        for (mime, extensions) in BUILTIN {
            table.define(mime, extensions.iter().copied());
        }
        table
    }
}

impl MimeTable {
    /// Creates the built-in table extended with user definitions
    pub fn with_definitions(definitions: &[MimeDefinition]) -> Self {
        let mut table = Self::default();
        for definition in definitions {
            table.define(
                &definition.mime,
                definition.extensions.iter().map(String::as_str),
            );
        }
        table
    }

    /// Registers a MIME type; its first extension becomes the canonical one
    pub fn define<'a>(&mut self, mime: &str, extensions: impl IntoIterator<Item = &'a str>) {
        let mime = essence(mime);
        for (i, ext) in extensions.into_iter().enumerate() {
            let ext = ext.trim_start_matches('.').to_ascii_lowercase();
            if i == 0 {
                self.by_mime.insert(mime.clone(), ext.clone());
            }
            self.by_extension.insert(ext, mime.clone());
        }
    }

    /// Guesses a MIME type from the extension of a path
    pub fn lookup_path(&self, path: &str) -> Option<&str> {
        let file = path.rsplit('/').next().unwrap_or(path);
        let ext = Path::new(file).extension()?.to_str()?;
        self.by_extension
            .get(&ext.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Guesses a MIME type from the path component of a URL
    pub fn lookup_url(&self, url: &Url) -> Option<&str> {
        self.lookup_path(url.path())
    }

    /// Returns the canonical file extension for a MIME type
    pub fn extension(&self, mime: &str) -> Option<&str> {
        self.by_mime.get(&essence(mime)).map(String::as_str)
    }
}

/// Strips parameters and whitespace from a Content-Type value
///
/// `"text/html; charset=utf-8"` becomes `"text/html"`.
pub fn essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}
