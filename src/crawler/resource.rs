//! Resource pipeline
//!
//! Drives one [`ResourceTask`] through
//! `Fetching → Downloading → Diffing → Installing → Done`. The task records
//! what happened (final URL, MIME type, local path, discovered links, bytes);
//! deciding what the outcome means for the crawl is left to the coordinator.

use crate::config::SessionOptions;
use crate::crawler::bandwidth::ByteCounter;
use crate::crawler::fetcher::{FetchResponse, ResponseMeta, Transport};
use crate::crawler::hooks::{DiscoveredLink, ResourceHooks};
use crate::rewrite::ContentRewriter;
use crate::state::UrlRegistry;
use crate::url::mime::{essence, OCTET_STREAM};
use crate::url::{local_path_with, normalize_url, relative_path};
use crate::{MirrorError, Result, TimeoutPhase};
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use url::Url;

/// Position of a task in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResourcePhase {
    #[default]
    Fetching,
    Downloading,
    Diffing,
    Installing,

    // ===== Terminal States =====
    Done,
    Skipped,
}

impl ResourcePhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fetching => "fetching",
            Self::Downloading => "downloading",
            Self::Diffing => "diffing",
            Self::Installing => "installing",
            Self::Done => "done",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for ResourcePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One attempt at mirroring one URL
#[derive(Debug, Clone)]
pub struct ResourceTask {
    /// The URL as it was linked (normalized)
    pub linked_url: Url,
    /// Where the server redirected to, if anywhere
    pub redirect_url: Option<Url>,
    /// Canonical URL declared by the document itself
    pub canonical_url: Option<Url>,
    /// Redirect and canonical paths were linked to the primary file
    pub aliases_linked: bool,
    /// Redirect target this attempt moved into the queue itself
    pub claimed_alias: Option<Url>,
    /// Base URL override from a `<base>` tag
    pub base_url: Option<Url>,
    /// MIME type implied by the referring link
    pub expected_mime: Option<String>,
    /// Local path the referring page already linked to
    pub expected_local_path: Option<PathBuf>,
    pub temp_file: Option<PathBuf>,
    pub retries: u32,
    pub referer: Option<Url>,
    /// Allowed, previously unknown links found in the content
    pub discovered: Vec<DiscoveredLink>,
    /// Body bytes received
    pub bytes: u64,
    pub bytes_per_ms: f64,
    pub phase: ResourcePhase,
    /// MIME type the content was handled as
    pub mime: Option<String>,
    /// Primary local file
    pub local_path: Option<PathBuf>,
}

impl ResourceTask {
    pub fn new(url: Url) -> Self {
        Self {
            linked_url: url,
            redirect_url: None,
            canonical_url: None,
            aliases_linked: false,
            claimed_alias: None,
            base_url: None,
            expected_mime: None,
            expected_local_path: None,
            temp_file: None,
            retries: 0,
            referer: None,
            discovered: Vec::new(),
            bytes: 0,
            bytes_per_ms: 0.0,
            phase: ResourcePhase::Fetching,
            mime: None,
            local_path: None,
        }
    }

    pub fn with_mime(mut self, mime: Option<&str>) -> Self {
        self.expected_mime = mime.map(essence);
        self
    }

    /// Builds the follow-up task for a link discovered in another resource
    pub fn from_link(link: &DiscoveredLink) -> Self {
        let mut task = Self::new(link.url.clone()).with_mime(Some(&link.mime));
        task.expected_local_path = Some(link.local_path.clone());
        task.referer = Some(link.referer.clone());
        task
    }

    /// Every URL whose local path this task's content was written to
    ///
    /// Redirect and canonical URLs only count once their paths were linked.
    pub fn urls(&self) -> Vec<&Url> {
        let mut urls = vec![&self.linked_url];
        if !self.aliases_linked {
            return urls;
        }
        for alias in [&self.redirect_url, &self.canonical_url].into_iter().flatten() {
            if !urls.contains(&alias) {
                urls.push(alias);
            }
        }
        urls
    }

    /// The URL the content was actually served from
    pub fn final_url(&self) -> &Url {
        self.redirect_url.as_ref().unwrap_or(&self.linked_url)
    }

    /// Clears everything a previous attempt found out
    fn reset_attempt(&mut self) {
        self.redirect_url = None;
        self.canonical_url = None;
        self.aliases_linked = false;
        self.claimed_alias = None;
        self.base_url = None;
        self.temp_file = None;
        self.discovered.clear();
        self.bytes = 0;
        self.bytes_per_ms = 0.0;
        self.phase = ResourcePhase::Fetching;
        self.mime = None;
        self.local_path = None;
    }
}

/// Shared state of one crawl session
///
/// Tasks and hooks receive this context instead of pointing back at the
/// coordinator.
pub struct SessionContext {
    pub options: SessionOptions,
    pub transport: Arc<dyn Transport>,
    registry: Mutex<UrlRegistry>,
    temp_counter: AtomicU64,
}

impl SessionContext {
    pub fn new(options: SessionOptions, transport: Arc<dyn Transport>) -> Self {
        let registry = UrlRegistry::new(options.filter.clone());
        Self {
            options,
            transport,
            registry: Mutex::new(registry),
            temp_counter: AtomicU64::new(0),
        }
    }

    /// Locks the registry; never hold the guard across an `.await`
    pub fn registry(&self) -> MutexGuard<'_, UrlRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a fresh temp file path inside the session's temp directory
    pub fn next_temp_file(&self) -> PathBuf {
        let n = self.temp_counter.fetch_add(1, Ordering::Relaxed);
        self.options.temp_dir.join(format!("{:08}.tmp", n))
    }

    pub fn normalize(&self, url: &Url) -> Result<Url> {
        Ok(normalize_url(url, self.options.aggressive_url_sanitation)?)
    }

    pub fn local_path_for(&self, url: &Url, mime: &str) -> PathBuf {
        local_path_with(
            url,
            mime,
            &self.options.local_path,
            &self.options.default_index,
            &self.options.mimes,
        )
    }
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("options", &self.options)
            .field("registry", &*self.registry())
            .finish_non_exhaustive()
    }
}

/// Runs one attempt of a task through the pipeline
///
/// On error the temp file (if any) is removed and `task.phase` tells how far
/// the attempt got.
pub async fn process(task: &mut ResourceTask, session: &Arc<SessionContext>) -> Result<()> {
    task.reset_attempt();
    let result = run_phases(task, session).await;
    if result.is_err() {
        if let Some(temp) = task.temp_file.take() {
            let _ = tokio::fs::remove_file(&temp).await;
        }
    }
    result
}

async fn run_phases(task: &mut ResourceTask, session: &Arc<SessionContext>) -> Result<()> {
    let options = &session.options;

    // ===== Fetching =====
    task.phase = ResourcePhase::Fetching;
    let mut headers = Vec::new();
    if let Some(referer) = &task.referer {
        headers.push(("Referer".to_string(), referer.to_string()));
    }

    let response = tokio::time::timeout(
        options.timeout_to_headers,
        session.transport.open(&task.linked_url, &headers),
    )
    .await
    .map_err(|_| MirrorError::Timeout {
        url: task.linked_url.to_string(),
        phase: TimeoutPhase::Headers,
    })??;
    let FetchResponse { meta, body } = response;

    if meta.status >= 400 {
        return Err(MirrorError::Remote {
            url: task.linked_url.to_string(),
            status: meta.status,
        });
    }

    let final_url = session
        .normalize(&meta.final_url)
        .unwrap_or_else(|_| meta.final_url.clone());
    if final_url != task.linked_url {
        tracing::debug!("{} redirected to {}", task.linked_url, final_url);
        if options.link_redirects && session.registry().mark_queued(&final_url) {
            task.claimed_alias = Some(final_url.clone());
        }
        task.redirect_url = Some(final_url.clone());
    }

    let mime = choose_mime(task, options, &meta);
    let linked_path = task
        .expected_local_path
        .clone()
        .unwrap_or_else(|| session.local_path_for(&task.linked_url, &mime));
    let primary = if options.link_redirects {
        session.local_path_for(&final_url, &mime)
    } else {
        linked_path.clone()
    };
    task.mime = Some(mime.clone());
    task.local_path = Some(primary.clone());

    if options.may_skip_existing(&mime) && path_exists(&primary).await {
        drop(body);
        tracing::debug!("Keeping existing {}", primary.display());
        if options.link_redirects {
            link_alias(&linked_path, &primary).await?;
            task.aliases_linked = true;
        }
        task.phase = ResourcePhase::Done;
        return Ok(());
    }

    // ===== Downloading =====
    task.phase = ResourcePhase::Downloading;
    let temp = session.next_temp_file();
    task.temp_file = Some(temp.clone());

    let hooks = Arc::new(ResourceHooks::new(
        session.clone(),
        final_url.clone(),
        primary.clone(),
    ));
    let mut rewriter = options.rewriters.create(&mime, &hooks.rewrite_hooks());
    let counter = tokio::time::timeout(
        options.timeout_to_download,
        download(body, rewriter.as_mut(), &temp),
    )
    .await
    .map_err(|_| MirrorError::Timeout {
        url: task.linked_url.to_string(),
        phase: TimeoutPhase::Body,
    })??;
    drop(rewriter);

    task.bytes = counter.bytes();
    task.bytes_per_ms = counter.bytes_per_ms();
    let outcome = hooks.take_outcome();
    task.discovered = outcome.discovered;
    task.base_url = outcome.base_url;
    task.canonical_url = outcome
        .canonical_url
        .filter(|canonical| canonical != &task.linked_url && canonical != &final_url);

    // ===== Diffing =====
    task.phase = ResourcePhase::Diffing;
    let unchanged = path_exists(&primary).await && same_content(&primary, &temp).await?;

    if unchanged {
        tracing::debug!("{} is unchanged", primary.display());
        tokio::fs::remove_file(&temp)
            .await
            .map_err(|e| MirrorError::filesystem(&temp, e))?;
    } else {
        // ===== Installing =====
        task.phase = ResourcePhase::Installing;
        install(&temp, &primary).await?;
    }
    task.temp_file = None;

    if options.link_redirects {
        link_alias(&linked_path, &primary).await?;
        if let Some(canonical) = &task.canonical_url {
            let canonical_path = session.local_path_for(canonical, &mime);
            link_alias(&canonical_path, &primary).await?;
        }
        task.aliases_linked = true;
    }

    task.phase = ResourcePhase::Done;
    Ok(())
}

/// Picks the MIME type a resource is handled as
///
/// The type implied by the referring link wins over the URL extension, which
/// wins over the response header: the referring page has already been written
/// with a file name derived from the first two.
fn choose_mime(task: &ResourceTask, options: &SessionOptions, meta: &ResponseMeta) -> String {
    if let Some(expected) = &task.expected_mime {
        return expected.clone();
    }
    if let Some(from_url) = options.mimes.lookup_url(&task.linked_url) {
        return from_url.to_string();
    }
    meta.content_type()
        .map(essence)
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| OCTET_STREAM.to_string())
}

async fn download(
    mut body: BoxStream<'static, Result<Bytes>>,
    rewriter: &mut dyn ContentRewriter,
    temp: &Path,
) -> Result<ByteCounter> {
    if let Some(dir) = temp.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| MirrorError::filesystem(dir, e))?;
    }
    let mut file = tokio::fs::File::create(temp)
        .await
        .map_err(|e| MirrorError::filesystem(temp, e))?;
    let mut counter = ByteCounter::new();

    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        counter.record(&chunk);
        let out = rewriter.transform(&chunk).await?;
        file.write_all(&out)
            .await
            .map_err(|e| MirrorError::filesystem(temp, e))?;
    }

    let out = rewriter.finish().await?;
    file.write_all(&out)
        .await
        .map_err(|e| MirrorError::filesystem(temp, e))?;
    file.flush()
        .await
        .map_err(|e| MirrorError::filesystem(temp, e))?;

    Ok(counter)
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

async fn file_digest(path: &Path) -> std::io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_vec())
}

/// Compares two files by SHA-256 digest
async fn same_content(existing: &Path, candidate: &Path) -> Result<bool> {
    let existing_digest = file_digest(existing)
        .await
        .map_err(|e| MirrorError::filesystem(existing, e))?;
    let candidate_digest = file_digest(candidate)
        .await
        .map_err(|e| MirrorError::filesystem(candidate, e))?;
    Ok(existing_digest == candidate_digest)
}

/// Moves a finished temp file to its destination
///
/// Falls back to copy + remove when a rename is not possible, e.g. across
/// filesystems.
async fn install(temp: &Path, destination: &Path) -> Result<()> {
    if let Some(dir) = destination.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| MirrorError::filesystem(dir, e))?;
    }

    if tokio::fs::symlink_metadata(destination)
        .await
        .is_ok_and(|m| m.file_type().is_symlink())
    {
        tokio::fs::remove_file(destination)
            .await
            .map_err(|e| MirrorError::filesystem(destination, e))?;
    }

    if tokio::fs::rename(temp, destination).await.is_err() {
        tokio::fs::copy(temp, destination)
            .await
            .map_err(|e| MirrorError::filesystem(destination, e))?;
        tokio::fs::remove_file(temp)
            .await
            .map_err(|e| MirrorError::filesystem(temp, e))?;
    }

    tracing::trace!("Installed {}", destination.display());
    Ok(())
}

/// Points `alias` at `primary` with a relative symlink
///
/// Nothing happens when both paths coincide or the link already exists. A
/// regular file at `alias` is mirrored content of its own and is kept.
async fn link_alias(alias: &Path, primary: &Path) -> Result<()> {
    if alias == primary {
        return Ok(());
    }
    let dir = alias.parent().unwrap_or_else(|| Path::new(""));
    let target = relative_path(dir, primary);

    if tokio::fs::read_link(alias)
        .await
        .is_ok_and(|existing| existing == target)
    {
        return Ok(());
    }

    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| MirrorError::filesystem(dir, e))?;
    match tokio::fs::symlink_metadata(alias).await {
        Ok(meta) if meta.file_type().is_symlink() => {
            tokio::fs::remove_file(alias)
                .await
                .map_err(|e| MirrorError::filesystem(alias, e))?;
        }
        Ok(_) => {
            tracing::debug!(
                "Keeping {}, not linking it to {}",
                alias.display(),
                primary.display()
            );
            return Ok(());
        }
        Err(_) => {}
    }

    #[cfg(unix)]
    tokio::fs::symlink(&target, alias)
        .await
        .map_err(|e| MirrorError::filesystem(alias, e))?;
    #[cfg(not(unix))]
    tokio::fs::copy(primary, alias)
        .await
        .map_err(|e| MirrorError::filesystem(alias, e))?;

    tracing::debug!("Linked {} -> {}", alias.display(), target.display());
    Ok(())
}
