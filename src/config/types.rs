use crate::url::{FilterRuleConfig, MimeDefinition};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Main configuration structure for Site-Mirror
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub project: ProjectConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub pacing: PacingConfig,
    #[serde(default)]
    pub files: FilesConfig,
    /// Extra MIME ↔ extension definitions
    #[serde(default)]
    pub mime: Vec<MimeDefinition>,
    /// Ordered allow/deny rules; empty means "entry host only"
    #[serde(default)]
    pub filter: Vec<FilterRuleConfig>,
}

/// What to mirror and where to put it
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProjectConfig {
    /// Root of the mirrored tree
    pub local_path: PathBuf,

    /// Entry URL the crawl starts from
    pub remote: String,

    /// Directory for in-flight downloads
    ///
    /// Defaults to a hidden sibling of `local-path`.
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,

    /// Delete the local tree and temp directory before starting
    #[serde(default)]
    pub clean_local: bool,

    /// File name used for directory URLs (without extension)
    #[serde(default = "default_index")]
    pub default_index: String,

    /// Collapse duplicate slashes, drop trailing slashes and sort query parameters
    #[serde(default)]
    pub aggressive_url_sanitation: bool,

    /// Process non-markup resources before pages
    #[serde(default = "default_true")]
    pub prioritize_assets: bool,
}

impl ProjectConfig {
    /// Returns the configured temp directory, or the default next to `local-path`
    pub fn effective_temp_dir(&self) -> PathBuf {
        self.temp_dir
            .clone()
            .unwrap_or_else(|| default_temp_dir(&self.local_path))
    }
}

/// `<parent>/.<name>-tmp` for a local root `<parent>/<name>`
pub(crate) fn default_temp_dir(local_path: &Path) -> PathBuf {
    let name = local_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "mirror".to_string());
    let parent = local_path.parent().map(PathBuf::from).unwrap_or_default();
    parent.join(format!(".{}-tmp", name))
}

/// HTTP behaviour
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FetchConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Optional HTTP/HTTPS/SOCKS proxy URL
    #[serde(default)]
    pub proxy: Option<String>,

    /// How many times a timed-out resource is tried again
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Time allowed until response headers arrive (milliseconds)
    #[serde(default = "default_timeout_to_headers")]
    pub timeout_to_headers: u64,

    /// Time allowed for the whole body (milliseconds)
    #[serde(default = "default_timeout_to_download")]
    pub timeout_to_download: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            proxy: None,
            max_retries: default_max_retries(),
            timeout_to_headers: default_timeout_to_headers(),
            timeout_to_download: default_timeout_to_download(),
        }
    }
}

/// Delay between two tasks
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PacingConfig {
    /// Fixed part of the delay (milliseconds)
    #[serde(default)]
    pub base_wait: u64,

    /// Upper bound of the uniformly random extra delay (milliseconds)
    #[serde(default)]
    pub random_wait: u64,
}

/// Local file handling
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FilesConfig {
    /// Do not re-download files that already exist locally
    #[serde(default)]
    pub skip_existing: bool,

    /// MIME types that are always re-downloaded even with `skip-existing`
    #[serde(default = "default_skip_exclusion")]
    pub skip_existing_exclusion: Vec<String>,

    /// Symlink redirect and canonical aliases to the installed file
    #[serde(default)]
    pub link_redirects: bool,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            skip_existing: false,
            skip_existing_exclusion: default_skip_exclusion(),
            link_redirects: false,
        }
    }
}

fn default_index() -> String {
    "index".to_string()
}

fn default_true() -> bool {
    true
}

fn default_user_agent() -> String {
    format!("site-mirror/{}", env!("CARGO_PKG_VERSION"))
}

fn default_max_retries() -> u32 {
    3
}

fn default_timeout_to_headers() -> u64 {
    6000
}

fn default_timeout_to_download() -> u64 {
    12000
}

fn default_skip_exclusion() -> Vec<String> {
    vec!["text/html".to_string()]
}
