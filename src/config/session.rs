//! Runtime options of one mirroring session
//!
//! [`SessionOptions`] is what the engine actually consumes. It is usually built
//! from a TOML [`Config`], but programmatic users can construct it directly and
//! plug in their own filter predicate or rewriter registry.

use crate::config::types::{default_temp_dir, Config};
use crate::rewrite::RewriterRegistry;
use crate::url::{parse_normalized, FilterRules, MimeTable, SameHostFilter, UrlFilter};
use crate::ConfigError;
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Effective settings of a crawl session
#[derive(Clone)]
pub struct SessionOptions {
    /// Root of the mirrored tree
    pub local_path: PathBuf,
    /// Directory for in-flight downloads
    pub temp_dir: PathBuf,
    /// Entry URL
    pub entry: Url,
    pub clean_local: bool,
    pub default_index: String,
    pub aggressive_url_sanitation: bool,
    pub prioritize_assets: bool,

    pub user_agent: String,
    pub proxy: Option<String>,
    pub max_retries: u32,
    pub timeout_to_headers: Duration,
    pub timeout_to_download: Duration,

    pub base_wait: Duration,
    pub random_wait: Duration,

    pub skip_existing: bool,
    /// MIME types re-downloaded even when `skip_existing` is set
    pub skip_existing_exclusion: HashSet<String>,
    pub link_redirects: bool,

    /// Allow/deny predicate for discovered URLs
    pub filter: Arc<dyn UrlFilter>,
    pub mimes: Arc<MimeTable>,
    pub rewriters: RewriterRegistry,
}

impl SessionOptions {
    /// Creates options with defaults for everything but the two required values
    ///
    /// The filter admits only the entry URL's host.
    pub fn new(local_path: impl Into<PathBuf>, entry: Url) -> Self {
        let local_path = local_path.into();
        Self {
            temp_dir: default_temp_dir(&local_path),
            local_path,
            filter: Arc::new(SameHostFilter::for_entry(&entry)),
            entry,
            clean_local: false,
            default_index: "index".to_string(),
            aggressive_url_sanitation: false,
            prioritize_assets: true,
            user_agent: format!("site-mirror/{}", env!("CARGO_PKG_VERSION")),
            proxy: None,
            max_retries: 3,
            timeout_to_headers: Duration::from_millis(6000),
            timeout_to_download: Duration::from_millis(12000),
            base_wait: Duration::ZERO,
            random_wait: Duration::ZERO,
            skip_existing: false,
            skip_existing_exclusion: HashSet::from(["text/html".to_string()]),
            link_redirects: false,
            mimes: Arc::new(MimeTable::default()),
            rewriters: RewriterRegistry::default(),
        }
    }

    /// Replaces the allow/deny predicate
    pub fn with_filter(mut self, filter: impl UrlFilter + 'static) -> Self {
        self.filter = Arc::new(filter);
        self
    }

    /// True if an existing local file of this MIME type may be kept as is
    pub fn may_skip_existing(&self, mime: &str) -> bool {
        self.skip_existing && !self.skip_existing_exclusion.contains(mime)
    }
}

impl fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionOptions")
            .field("local_path", &self.local_path)
            .field("temp_dir", &self.temp_dir)
            .field("entry", &self.entry.as_str())
            .field("clean_local", &self.clean_local)
            .field("default_index", &self.default_index)
            .field("aggressive_url_sanitation", &self.aggressive_url_sanitation)
            .field("prioritize_assets", &self.prioritize_assets)
            .field("user_agent", &self.user_agent)
            .field("proxy", &self.proxy)
            .field("max_retries", &self.max_retries)
            .field("timeout_to_headers", &self.timeout_to_headers)
            .field("timeout_to_download", &self.timeout_to_download)
            .field("base_wait", &self.base_wait)
            .field("random_wait", &self.random_wait)
            .field("skip_existing", &self.skip_existing)
            .field("skip_existing_exclusion", &self.skip_existing_exclusion)
            .field("link_redirects", &self.link_redirects)
            .field("rewriters", &self.rewriters)
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Converts the file configuration into runtime options
    ///
    /// Compiles the filter rules and merges the extra MIME definitions into
    /// the built-in table.
    pub fn session_options(&self) -> Result<SessionOptions, ConfigError> {
        let project = &self.project;
        let entry = parse_normalized(&project.remote, project.aggressive_url_sanitation)
            .map_err(|e| ConfigError::InvalidUrl(format!("{}: {}", project.remote, e)))?;

        let mut options = SessionOptions::new(project.local_path.clone(), entry);
        options.temp_dir = project.effective_temp_dir();
        options.clean_local = project.clean_local;
        options.default_index = project.default_index.clone();
        options.aggressive_url_sanitation = project.aggressive_url_sanitation;
        options.prioritize_assets = project.prioritize_assets;

        options.user_agent = self.fetch.user_agent.clone();
        options.proxy = self.fetch.proxy.clone();
        options.max_retries = self.fetch.max_retries;
        options.timeout_to_headers = Duration::from_millis(self.fetch.timeout_to_headers);
        options.timeout_to_download = Duration::from_millis(self.fetch.timeout_to_download);

        options.base_wait = Duration::from_millis(self.pacing.base_wait);
        options.random_wait = Duration::from_millis(self.pacing.random_wait);

        options.skip_existing = self.files.skip_existing;
        options.skip_existing_exclusion = self
            .files
            .skip_existing_exclusion
            .iter()
            .map(|m| crate::url::mime::essence(m))
            .collect();
        options.link_redirects = self.files.link_redirects;

        if !self.filter.is_empty() {
            options.filter = Arc::new(FilterRules::compile(&self.filter)?);
        }
        options.mimes = Arc::new(MimeTable::with_definitions(&self.mime));

        Ok(options)
    }
}
