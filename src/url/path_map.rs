//! Deterministic mapping from remote URLs to files in the mirror tree
//!
//! Both functions here are pure: no filesystem access, no state. The same
//! `(url, mime)` pair always lands on the same file, which is what lets a page
//! rewrite its links before the linked resources have been downloaded.

use crate::url::mime::MimeTable;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;
use url::Url;

/// Encoded query strings longer than this are replaced by a digest
pub const MAX_ENCODED_QUERY_LEN: usize = 32;

/// Extension used when the MIME type is unknown
const FALLBACK_EXTENSION: &str = "html";

fn builtin_mimes() -> &'static MimeTable {
    static TABLE: OnceLock<MimeTable> = OnceLock::new();
    TABLE.get_or_init(MimeTable::default)
}

/// Maps a remote URL to its local file using the built-in MIME table
///
/// See [`local_path_with`] for the algorithm.
///
/// # Examples
///
/// ```
/// use site_mirror::url::local_path_for;
/// use std::path::Path;
/// use url::Url;
///
/// let url = Url::parse("http://example.com/docs/").unwrap();
/// let path = local_path_for(&url, "text/html", Path::new("/mirror"), "index");
/// assert_eq!(path, Path::new("/mirror/example.com/docs/index.html"));
/// ```
pub fn local_path_for(url: &Url, mime: &str, root: &Path, default_index: &str) -> PathBuf {
    local_path_with(url, mime, root, default_index, builtin_mimes())
}

/// Maps a remote URL to its local file
///
/// 1. An empty or root path becomes `/<default_index>`, a trailing `/` gets
///    `<default_index>` appended
/// 2. The extension of the last segment is replaced by the one implied by
///    `mime` (`html` if unknown)
/// 3. A query string is base64-encoded into the file name; if the encoded
///    form is longer than [`MAX_ENCODED_QUERY_LEN`] a SHA-256 based digest of
///    the same length is used instead
/// 4. The result is `root/<hostname>/<path>`
pub fn local_path_with(
    url: &Url,
    mime: &str,
    root: &Path,
    default_index: &str,
    mimes: &MimeTable,
) -> PathBuf {
    let mut path = url.path().to_string();
    if path.is_empty() || path == "/" {
        path = format!("/{}", default_index);
    } else if path.ends_with('/') {
        path.push_str(default_index);
    }

    let (dir, file) = path.rsplit_once('/').unwrap_or(("", path.as_str()));
    let stem = match file.rfind('.') {
        Some(dot) if dot > 0 => &file[..dot],
        _ => file,
    };

    let mut name = stem.to_string();
    if let Some(query) = url.query() {
        name.push_str(&encode_query(query));
    }
    name.push('.');
    name.push_str(mimes.extension(mime).unwrap_or(FALLBACK_EXTENSION));

    let mut local = root.join(host_dir(url));
    for segment in dir.split('/') {
        if !segment.is_empty() && segment != "." && segment != ".." {
            local.push(segment);
        }
    }
    local.push(name);
    local
}

fn host_dir(url: &Url) -> &str {
    match url.host_str() {
        Some(host) if !host.is_empty() => host,
        _ => "_",
    }
}

/// Turns a query string into a file-name-safe token of bounded length
fn encode_query(query: &str) -> String {
    let search = format!("?{}", query);
    let encoded = URL_SAFE_NO_PAD.encode(search.as_bytes());
    if encoded.len() <= MAX_ENCODED_QUERY_LEN {
        return encoded;
    }
    let digest = hex::encode(Sha256::digest(search.as_bytes()));
    digest[..MAX_ENCODED_QUERY_LEN].to_string()
}

/// Computes the relative path leading from `from_dir` to `to`
///
/// Both paths must be expressed against the same base (both absolute, or both
/// relative to the same directory).
pub fn relative_path(from_dir: &Path, to: &Path) -> PathBuf {
    let from: Vec<Component> = from_dir
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect();
    let to_components: Vec<Component> = to
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect();

    let common = from
        .iter()
        .zip(to_components.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut relative = PathBuf::new();
    for _ in common..from.len() {
        relative.push("..");
    }
    for component in &to_components[common..] {
        relative.push(component.as_os_str());
    }
    relative
}

/// Computes the href a document at `referer` must use to reach `target`
///
/// The query string and fragment of `target_url`, when given, are appended
/// verbatim.
///
/// # Examples
///
/// ```
/// use site_mirror::url::relative_url_between;
/// use std::path::Path;
/// use url::Url;
///
/// let target = Path::new("/m/example.com/img/logo.png");
/// let referer = Path::new("/m/example.com/blog/post.html");
/// let url = Url::parse("http://example.com/img/logo.png#top").unwrap();
/// assert_eq!(relative_url_between(target, referer, Some(&url)), "../img/logo.png#top");
/// ```
pub fn relative_url_between(target: &Path, referer: &Path, target_url: Option<&Url>) -> String {
    let referer_dir = referer.parent().unwrap_or_else(|| Path::new(""));
    let relative = relative_path(referer_dir, target);

    let mut href = relative
        .components()
        .map(|c| encode_href_segment(&c.as_os_str().to_string_lossy()))
        .collect::<Vec<_>>()
        .join("/");

    if let Some(url) = target_url {
        if let Some(query) = url.query() {
            href.push('?');
            href.push_str(query);
        }
        if let Some(fragment) = url.fragment() {
            href.push('#');
            href.push_str(fragment);
        }
    }
    href
}

/// Escapes characters that would change meaning inside a relative URL
fn encode_href_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for ch in segment.chars() {
        match ch {
            '%' => out.push_str("%25"),
            '#' => out.push_str("%23"),
            '?' => out.push_str("%3F"),
            ' ' => out.push_str("%20"),
            '"' => out.push_str("%22"),
            '\\' => out.push_str("%5C"),
            _ => out.push(ch),
        }
    }
    out
}
