//! Mirror coordinator - main crawl orchestration logic
//!
//! This module contains the crawl loop that ties everything together:
//! - Preparing the local and temp directories
//! - Seeding the queue with the entry URL
//! - Running one task at a time through the resource pipeline
//! - Turning task outcomes into registry transitions, retries and new tasks
//! - Pacing between tasks and reporting lifecycle signals

use crate::config::{Config, SessionOptions};
use crate::crawler::events::{CrawlObserver, TracingObserver};
use crate::crawler::fetcher::{ReqwestTransport, Transport};
use crate::crawler::resource::{self, ResourcePhase, ResourceTask, SessionContext};
use crate::crawler::scheduler::Scheduler;
use crate::rewrite::RewriterKind;
use crate::state::{FilterAnalysis, RegistryStats, UrlState};
use crate::{MirrorError, Result};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use url::Url;

/// Run state of a [`Mirror`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Idle,
    Running,
    /// `stop()` was called; the in-flight task finishes, nothing new starts
    Draining,
}

enum Next {
    Task(ResourceTask),
    Finished { stopped: bool },
}

struct MirrorInner {
    session: Arc<SessionContext>,
    scheduler: Mutex<Scheduler>,
    state: Mutex<RunState>,
    /// A run-level fault happened during the current run
    faulted: AtomicBool,
    observer: Arc<dyn CrawlObserver>,
}

/// Handle to a mirroring session
///
/// Cloning is cheap; all clones drive and observe the same session. Exactly
/// one task is in the pipeline at any time.
///
/// # Example
///
/// ```no_run
/// use site_mirror::config::load_config;
/// use site_mirror::Mirror;
/// use std::path::Path;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = load_config(Path::new("mirror.toml"))?;
/// let mirror = Mirror::from_config(&config)?;
/// let completed = mirror.run().await?;
/// println!("completed: {}, {}", completed, mirror.stats());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Mirror {
    inner: Arc<MirrorInner>,
}

impl Mirror {
    /// Creates a new, idle mirror
    ///
    /// # Arguments
    ///
    /// * `options` - Effective session settings
    /// * `transport` - Where requests go
    /// * `observer` - Receives lifecycle signals
    pub fn new(
        options: SessionOptions,
        transport: Arc<dyn Transport>,
        observer: Arc<dyn CrawlObserver>,
    ) -> Self {
        let scheduler = Scheduler::new(
            options.prioritize_assets,
            options.base_wait,
            options.random_wait,
        );
        Self {
            inner: Arc::new(MirrorInner {
                session: Arc::new(SessionContext::new(options, transport)),
                scheduler: Mutex::new(scheduler),
                state: Mutex::new(RunState::Idle),
                faulted: AtomicBool::new(false),
                observer,
            }),
        }
    }

    /// Creates a mirror using the reqwest transport and log output
    ///
    /// # Returns
    ///
    /// * `Ok(Mirror)` - Ready to run
    /// * `Err(MirrorError)` - Invalid configuration or HTTP client setup failure
    pub fn from_config(config: &Config) -> Result<Self> {
        let options = config.session_options()?;
        let transport = ReqwestTransport::new(&options.user_agent, options.proxy.as_deref())?;
        Ok(Self::new(options, Arc::new(transport), Arc::new(TracingObserver)))
    }

    pub fn options(&self) -> &SessionOptions {
        &self.inner.session.options
    }

    fn state(&self) -> MutexGuard<'_, RunState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn scheduler(&self) -> MutexGuard<'_, Scheduler> {
        self.inner
            .scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        *self.state() != RunState::Idle
    }

    /// Number of tasks waiting in the queue
    pub fn queue_len(&self) -> usize {
        self.scheduler().len()
    }

    pub fn stats(&self) -> RegistryStats {
        self.inner.session.registry().stats()
    }

    pub fn filter_analysis(&self) -> FilterAnalysis {
        self.inner.session.registry().filter_analysis()
    }

    /// Current registry state of a URL
    pub fn url_state(&self, url: &Url) -> UrlState {
        self.inner.session.registry().state(url)
    }

    /// Runs a complete mirror session
    ///
    /// Prepares the directories, seeds the entry URL and processes the queue
    /// until it is empty or [`Self::stop`] is called.
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - The queue ran empty
    /// * `Ok(false)` - The run was stopped or hit a filesystem fault
    /// * `Err(MirrorError)` - Already running, or setup failed
    pub async fn run(&self) -> Result<bool> {
        self.start().await?;
        Ok(self.process_queue().await)
    }

    /// Prepares the session and seeds the queue without processing it
    ///
    /// Follow up with [`Self::process_queue`]. A setup failure emits an
    /// `error` signal followed by `run_ended(false)`.
    pub async fn start(&self) -> Result<()> {
        let options = &self.inner.session.options;
        let entry = self.inner.session.normalize(&options.entry)?;
        {
            let mut state = self.state();
            if *state != RunState::Idle {
                return Err(MirrorError::AlreadyRunning);
            }
            *state = RunState::Running;
        }
        self.inner.faulted.store(false, Ordering::SeqCst);

        tracing::info!(
            "Starting mirror of {} into {}",
            options.entry,
            options.local_path.display()
        );

        if let Err(e) = prepare_directories(options).await {
            self.inner.observer.error(&e);
            *self.state() = RunState::Idle;
            self.inner.observer.run_ended(false);
            return Err(e);
        }

        let seeded = {
            let mut registry = self.inner.session.registry();
            registry.reconsider(&entry);
            registry.mark_queued(&entry)
        };
        if seeded {
            self.enqueue(ResourceTask::new(entry));
        }
        Ok(())
    }

    /// Injects a URL while the session exists
    ///
    /// The URL is queued unless it is already waiting; a URL that finished
    /// earlier is fetched again. If the mirror is idle, processing resumes on
    /// a spawned task, so this must be called from within a tokio runtime.
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - The URL was queued
    /// * `Ok(false)` - It was already queued
    pub async fn add_url(&self, url: &Url, mime: Option<&str>) -> Result<bool> {
        let url = self.inner.session.normalize(url)?;
        let queued = {
            let mut registry = self.inner.session.registry();
            registry.reconsider(&url);
            registry.mark_queued(&url)
        };
        if !queued {
            return Ok(false);
        }

        tracing::debug!("Added {}", url);
        let resume = {
            let mut state = self.state();
            self.push_task(ResourceTask::new(url).with_mime(mime));
            let idle = *state == RunState::Idle;
            if idle {
                *state = RunState::Running;
                self.inner.faulted.store(false, Ordering::SeqCst);
            }
            idle
        };

        if resume {
            let mirror = self.clone();
            tokio::spawn(async move {
                mirror.process_queue().await;
            });
        }
        Ok(true)
    }

    /// Stops the run after the in-flight task
    pub fn stop(&self) {
        let mut state = self.state();
        if *state == RunState::Running {
            tracing::info!("Stopping after the current task");
            *state = RunState::Draining;
        }
    }

    /// Processes queued tasks until the queue is empty or the run is stopped
    ///
    /// Returns whether the run completed; the same value is passed to the
    /// observer's `run_ended`.
    pub async fn process_queue(&self) -> bool {
        let mut processed: u64 = 0;
        let started = std::time::Instant::now();

        let stopped = loop {
            let mut task = match self.next_task() {
                Next::Task(task) => task,
                Next::Finished { stopped } => break stopped,
            };
            if self.url_state(&task.linked_url) != UrlState::Queued {
                tracing::trace!("Dropping {}: already handled as an alias", task.linked_url);
                continue;
            }

            self.inner.observer.task_started(&task);
            let result = resource::process(&mut task, &self.inner.session).await;
            self.finish_task(task, result);

            processed += 1;
            if processed % 10 == 0 {
                tracing::info!(
                    "Progress: {} resources processed, {} queued, {:.2}/sec",
                    processed,
                    self.queue_len(),
                    processed as f64 / started.elapsed().as_secs_f64().max(f64::EPSILON)
                );
            }

            if !self.is_running() || self.queue_len() == 0 {
                continue;
            }
            let delay = self.scheduler().next_delay();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        };

        let completed = !stopped && !self.inner.faulted.load(Ordering::SeqCst);
        tracing::info!(
            "Mirror finished after {:?}: {}",
            started.elapsed(),
            self.stats()
        );
        self.inner.observer.run_ended(completed);
        completed
    }

    /// Pops the next task, or goes idle when the run should end
    ///
    /// The state lock is held across the queue check and the transition to
    /// `Idle`, so `add_url` never pushes into a run that has already decided
    /// to finish.
    fn next_task(&self) -> Next {
        let mut state = self.state();
        if *state == RunState::Running {
            if let Some(task) = self.scheduler().next_task() {
                return Next::Task(task);
            }
        }
        let stopped = *state == RunState::Draining;
        *state = RunState::Idle;
        Next::Finished { stopped }
    }

    fn enqueue(&self, task: ResourceTask) {
        let _state = self.state();
        self.push_task(task);
    }

    /// Callers hold the state lock
    fn push_task(&self, task: ResourceTask) {
        let is_markup = task.expected_mime.as_deref().map_or(true, |mime| {
            self.inner.session.options.rewriters.kind_for(mime) == RewriterKind::Markup
        });
        self.scheduler().push(task, is_markup);
    }

    /// Applies the outcome of one attempt
    fn finish_task(&self, mut task: ResourceTask, result: Result<()>) {
        let session = &self.inner.session;

        match result {
            Ok(()) => {
                let follow_ups: Vec<ResourceTask> = {
                    let mut registry = session.registry();
                    if task.bytes > 0 {
                        registry.record_transfer(task.bytes, task.bytes_per_ms);
                    }
                    for url in task.urls() {
                        registry.mark_downloaded(url);
                    }
                    task.discovered
                        .iter()
                        .filter(|link| registry.mark_queued(&link.url))
                        .map(ResourceTask::from_link)
                        .collect()
                };

                self.inner.observer.task_finished(None, &task);
                if !follow_ups.is_empty() {
                    tracing::debug!(
                        "Queueing {} new links from {}",
                        follow_ups.len(),
                        task.final_url()
                    );
                    let _state = self.state();
                    for follow_up in follow_ups {
                        self.push_task(follow_up);
                    }
                }
            }

            Err(e) if e.is_retryable() && task.retries < session.options.max_retries => {
                if let Some(alias) = &task.claimed_alias {
                    // the next attempt claims it again, maybe elsewhere
                    let mut registry = session.registry();
                    registry.mark_skipped(alias);
                    registry.reconsider(alias);
                }
                self.inner.observer.task_finished(Some(&e), &task);
                task.retries += 1;
                self.enqueue(task);
            }

            Err(e) => {
                {
                    let mut registry = session.registry();
                    registry.mark_skipped(&task.linked_url);
                    if let Some(alias) = &task.claimed_alias {
                        registry.mark_skipped(alias);
                    }
                }
                task.phase = ResourcePhase::Skipped;
                self.inner.observer.task_finished(Some(&e), &task);

                if e.is_run_fault() {
                    self.inner.faulted.store(true, Ordering::SeqCst);
                    self.inner.observer.error(&e);
                    self.stop();
                }
            }
        }
    }
}

impl std::fmt::Debug for Mirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mirror")
            .field("session", &self.inner.session)
            .field("state", &*self.state())
            .field("queued", &self.queue_len())
            .finish_non_exhaustive()
    }
}

/// Cleans (if asked to) and creates the local and temp directories
async fn prepare_directories(options: &SessionOptions) -> Result<()> {
    if options.clean_local {
        tracing::info!("Cleaning {}", options.local_path.display());
        remove_dir_if_present(&options.local_path).await?;
        remove_dir_if_present(&options.temp_dir).await?;
    }

    for dir in [&options.local_path, &options.temp_dir] {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| MirrorError::filesystem(dir, e))?;
    }
    Ok(())
}

async fn remove_dir_if_present(dir: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(MirrorError::filesystem(dir, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::events::{ChannelObserver, CrawlEvent};
    use crate::crawler::fetcher::{FetchResponse, ResponseMeta};
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::stream::{self, StreamExt};
    use std::collections::HashMap;
    use tempfile::TempDir;
    use tokio::sync::mpsc::UnboundedReceiver;

    /// Serves fixed bodies from memory
    struct StaticTransport {
        pages: HashMap<&'static str, (&'static str, &'static str)>,
        /// Followed before serving, like a client that follows redirects
        redirects: HashMap<&'static str, &'static str>,
    }

    impl StaticTransport {
        fn new(pages: &[(&'static str, &'static str, &'static str)]) -> Self {
            Self {
                pages: pages.iter().map(|(u, c, b)| (*u, (*c, *b))).collect(),
                redirects: HashMap::new(),
            }
        }
    }

    #[async_trait]
    impl Transport for StaticTransport {
        async fn open(&self, url: &Url, _headers: &[(String, String)]) -> Result<FetchResponse> {
            let final_url = match self.redirects.get(url.as_str()) {
                Some(target) => Url::parse(target).unwrap(),
                None => url.clone(),
            };
            let (status, content_type, body) = match self.pages.get(final_url.as_str()) {
                Some((content_type, body)) => (200, *content_type, *body),
                None => (404, "text/plain", ""),
            };
            Ok(FetchResponse {
                meta: ResponseMeta {
                    final_url,
                    status,
                    headers: HashMap::from([(
                        "content-type".to_string(),
                        content_type.to_string(),
                    )]),
                },
                body: stream::iter(vec![Ok(Bytes::from_static(body.as_bytes()))]).boxed(),
            })
        }
    }

    fn options(dir: &TempDir) -> SessionOptions {
        let mut options =
            SessionOptions::new(dir.path().join("site"), Url::parse("http://x/").unwrap());
        options.temp_dir = dir.path().join("tmp");
        options
    }

    fn mirror(
        dir: &TempDir,
        pages: &[(&'static str, &'static str, &'static str)],
    ) -> (Mirror, UnboundedReceiver<CrawlEvent>) {
        let (observer, events) = ChannelObserver::channel();
        (
            Mirror::new(
                options(dir),
                Arc::new(StaticTransport::new(pages)),
                Arc::new(observer),
            ),
            events,
        )
    }

    /// Entry page linking both `old.html` and `new.html`; `old.html` redirects
    fn redirecting_mirror(dir: &TempDir, link_redirects: bool) -> Mirror {
        let mut transport = StaticTransport::new(&[
            (
                "http://x/",
                "text/html",
                r#"<a href="old.html">old</a><a href="new.html">new</a>"#,
            ),
            ("http://x/new.html", "text/html", "<p>new</p>"),
        ]);
        transport
            .redirects
            .insert("http://x/old.html", "http://x/new.html");
        let mut options = options(dir);
        options.link_redirects = link_redirects;
        Mirror::new(options, Arc::new(transport), Arc::new(TracingObserver))
    }

    fn drain(events: &mut UnboundedReceiver<CrawlEvent>) -> Vec<CrawlEvent> {
        std::iter::from_fn(|| events.try_recv().ok()).collect()
    }

    #[tokio::test]
    async fn test_run_follows_links() {
        let dir = TempDir::new().unwrap();
        let (mirror, mut events) = mirror(
            &dir,
            &[
                ("http://x/", "text/html", r#"<a href="a.html">a</a>"#),
                ("http://x/a.html", "text/html", r#"<a href="/">home</a>"#),
            ],
        );

        assert!(mirror.run().await.unwrap());
        assert!(!mirror.is_running());

        let stats = mirror.stats();
        assert_eq!(stats.downloaded, 2);
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.skipped, 0);
        assert!(dir.path().join("site/x/index.html").exists());
        assert!(dir.path().join("site/x/a.html").exists());

        let events = drain(&mut events);
        assert_eq!(events.last(), Some(&CrawlEvent::RunEnded { completed: true }));
        let started = events
            .iter()
            .filter(|e| matches!(e, CrawlEvent::TaskStarted { .. }))
            .count();
        assert_eq!(started, 2);
    }

    #[tokio::test]
    async fn test_remote_error_is_skipped() {
        let dir = TempDir::new().unwrap();
        let (mirror, mut events) = mirror(
            &dir,
            &[("http://x/", "text/html", r#"<img src="missing.png">"#)],
        );

        assert!(mirror.run().await.unwrap());
        let stats = mirror.stats();
        assert_eq!(stats.downloaded, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(
            mirror.url_state(&Url::parse("http://x/missing.png").unwrap()),
            UrlState::Skipped
        );

        let failed = drain(&mut events).into_iter().any(|e| {
            matches!(e, CrawlEvent::TaskFinished { url, error: Some(_) } if url == "http://x/missing.png")
        });
        assert!(failed);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let dir = TempDir::new().unwrap();
        let (mirror, _events) = mirror(&dir, &[]);

        mirror.start().await.unwrap();
        assert!(mirror.is_running());
        assert!(matches!(
            mirror.start().await,
            Err(MirrorError::AlreadyRunning)
        ));
        assert_eq!(mirror.queue_len(), 1);
    }

    #[tokio::test]
    async fn test_stop_before_processing() {
        let dir = TempDir::new().unwrap();
        let (mirror, mut events) =
            mirror(&dir, &[("http://x/", "text/html", "<p>hi</p>")]);

        mirror.start().await.unwrap();
        mirror.stop();
        assert!(!mirror.process_queue().await);
        assert!(!mirror.is_running());
        assert_eq!(mirror.stats().downloaded, 0);
        assert_eq!(drain(&mut events), vec![CrawlEvent::RunEnded { completed: false }]);
    }

    #[tokio::test]
    async fn test_clean_local_removes_previous_tree() {
        let dir = TempDir::new().unwrap();
        let stale = dir.path().join("site/stale.txt");
        std::fs::create_dir_all(stale.parent().unwrap()).unwrap();
        std::fs::write(&stale, "old").unwrap();

        let transport = StaticTransport::new(&[("http://x/", "text/html", "<p>hi</p>")]);
        let mut options = options(&dir);
        options.clean_local = true;
        let mirror = Mirror::new(options, Arc::new(transport), Arc::new(TracingObserver));

        assert!(mirror.run().await.unwrap());
        assert!(!stale.exists());
        assert!(dir.path().join("site/x/index.html").exists());
    }

    #[tokio::test]
    async fn test_redirect_target_linked_directly_is_written() {
        let dir = TempDir::new().unwrap();
        let mirror = redirecting_mirror(&dir, false);

        assert!(mirror.run().await.unwrap());
        let old = dir.path().join("site/x/old.html");
        let new = dir.path().join("site/x/new.html");
        assert_eq!(std::fs::read_to_string(&old).unwrap(), "<p>new</p>");
        assert_eq!(std::fs::read_to_string(&new).unwrap(), "<p>new</p>");
        assert!(!std::fs::symlink_metadata(&old).unwrap().file_type().is_symlink());

        let stats = mirror.stats();
        assert_eq!(stats.downloaded, 3);
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.skipped, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_linked_redirect_covers_target() {
        let dir = TempDir::new().unwrap();
        let mirror = redirecting_mirror(&dir, true);

        assert!(mirror.run().await.unwrap());
        let old = dir.path().join("site/x/old.html");
        let new = dir.path().join("site/x/new.html");
        assert_eq!(std::fs::read_to_string(&new).unwrap(), "<p>new</p>");
        assert!(std::fs::symlink_metadata(&old).unwrap().file_type().is_symlink());
        assert_eq!(std::fs::read_to_string(&old).unwrap(), "<p>new</p>");
        assert_eq!(
            mirror.url_state(&Url::parse("http://x/new.html").unwrap()),
            UrlState::Downloaded
        );
        assert_eq!(mirror.stats().queued, 0);
    }

    #[tokio::test]
    async fn test_add_url_resumes_idle_mirror() {
        let dir = TempDir::new().unwrap();
        let (mirror, mut events) = mirror(
            &dir,
            &[
                ("http://x/", "text/html", "<p>hi</p>"),
                ("http://x/extra.txt", "text/plain", "extra"),
            ],
        );
        assert!(mirror.run().await.unwrap());
        drain(&mut events);

        let extra = Url::parse("http://x/extra.txt").unwrap();
        assert!(mirror.add_url(&extra, None).await.unwrap());

        loop {
            match events.recv().await {
                Some(CrawlEvent::RunEnded { completed }) => {
                    assert!(completed);
                    break;
                }
                Some(_) => continue,
                None => panic!("observer channel closed"),
            }
        }
        assert_eq!(mirror.url_state(&extra), UrlState::Downloaded);
        assert!(dir.path().join("site/x/extra.txt").exists());
    }
}
