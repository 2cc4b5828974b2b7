//! Integration tests for the mirror
//!
//! These tests use wiremock to create mock HTTP servers and run the full
//! fetch / rewrite / install cycle end-to-end into temporary directories.

use async_trait::async_trait;
use site_mirror::config::SessionOptions;
use site_mirror::crawler::{
    ChannelObserver, CrawlEvent, FetchResponse, Mirror, ReqwestTransport, Transport,
};
use site_mirror::{Result, UrlState};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Creates session options mirroring `server` into `dir`
fn create_test_options(server: &MockServer, dir: &TempDir) -> SessionOptions {
    let entry = Url::parse(&format!("{}/", server.uri())).expect("Failed to parse base URL");
    let mut options = SessionOptions::new(dir.path().join("site"), entry);
    options.temp_dir = dir.path().join("tmp");
    options.user_agent = "site-mirror-test/1.0".to_string();
    options
}

fn create_mirror(options: SessionOptions) -> (Mirror, UnboundedReceiver<CrawlEvent>) {
    let transport = ReqwestTransport::new(&options.user_agent, None).expect("Failed to build client");
    let (observer, events) = ChannelObserver::channel();
    (
        Mirror::new(options, Arc::new(transport), Arc::new(observer)),
        events,
    )
}

fn collect_events(events: &mut UnboundedReceiver<CrawlEvent>) -> Vec<CrawlEvent> {
    std::iter::from_fn(|| events.try_recv().ok()).collect()
}

/// Directory of the mirrored host inside the local tree
fn host_dir(dir: &TempDir) -> PathBuf {
    dir.path().join("site").join("127.0.0.1")
}

async fn mount_body(server: &MockServer, at: &str, body: &str, mime: &str) {
    Mock::given(method("GET"))
        .and(path(at))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body.as_bytes().to_vec(), mime))
        .mount(server)
        .await;
}

/// Modification times of every regular file below `root`
fn snapshot(root: &Path) -> HashMap<PathBuf, SystemTime> {
    let mut files = HashMap::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir).unwrap() {
            let entry = entry.unwrap();
            let meta = entry.metadata().unwrap();
            if meta.is_dir() {
                pending.push(entry.path());
            } else {
                files.insert(entry.path(), meta.modified().unwrap());
            }
        }
    }
    files
}

#[tokio::test]
async fn test_mirror_rewrites_and_follows_links() {
    let mock_server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    mount_body(
        &mock_server,
        "/",
        r#"<html><body><a href="/b.html">B</a><img src="c.png"></body></html>"#,
        "text/html; charset=utf-8",
    )
    .await;
    mount_body(&mock_server, "/b.html", "<p>b</p>", "text/html").await;
    mount_body(&mock_server, "/c.png", "not really a png", "image/png").await;

    let (mirror, mut events) = create_mirror(create_test_options(&mock_server, &dir));
    let completed = mirror.run().await.expect("Mirror failed to start");
    assert!(completed, "Expected the run to complete");

    let index = std::fs::read_to_string(host_dir(&dir).join("index.html")).unwrap();
    assert_eq!(
        index,
        r#"<html><body><a href="b.html">B</a><img src="c.png"></body></html>"#
    );
    assert_eq!(
        std::fs::read_to_string(host_dir(&dir).join("b.html")).unwrap(),
        "<p>b</p>"
    );
    assert_eq!(
        std::fs::read_to_string(host_dir(&dir).join("c.png")).unwrap(),
        "not really a png"
    );

    let stats = mirror.stats();
    assert_eq!(stats.downloaded, 3);
    assert_eq!(stats.skipped, 0);
    assert_eq!(stats.queued, 0);

    let events = collect_events(&mut events);
    assert_eq!(events.last(), Some(&CrawlEvent::RunEnded { completed: true }));
    let finished = events
        .iter()
        .filter(|e| matches!(e, CrawlEvent::TaskFinished { error: None, .. }))
        .count();
    assert_eq!(finished, 3);

    // Nothing left behind in the temp directory
    assert!(std::fs::read_dir(dir.path().join("tmp")).unwrap().next().is_none());
}

#[tokio::test]
async fn test_denied_links_point_at_remote() {
    let mock_server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    mount_body(
        &mock_server,
        "/",
        r#"<a href="http://elsewhere.invalid/page">out</a><a href="mailto:a@b.c">mail</a>"#,
        "text/html",
    )
    .await;

    let (mirror, _events) = create_mirror(create_test_options(&mock_server, &dir));
    assert!(mirror.run().await.unwrap());

    let index = std::fs::read_to_string(host_dir(&dir).join("index.html")).unwrap();
    assert_eq!(
        index,
        r#"<a href="http://elsewhere.invalid/page">out</a><a href="mailto:a@b.c">mail</a>"#
    );

    let stats = mirror.stats();
    assert_eq!(stats.downloaded, 1);
    assert_eq!(stats.denied, 1);

    let analysis = mirror.filter_analysis();
    assert_eq!(analysis.denied.len(), 1);
    assert_eq!(analysis.denied[0].0, "http://elsewhere.invalid/page");
}

#[tokio::test]
async fn test_stylesheet_resources_are_mirrored() {
    let mock_server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    mount_body(
        &mock_server,
        "/",
        r#"<link rel="stylesheet" href="/css/site.css"><div style="background: url('/img/dot.gif')"></div>"#,
        "text/html",
    )
    .await;
    mount_body(
        &mock_server,
        "/css/site.css",
        "body { background: url(\"../img/bg.png\") }\n@import 'more.css';\n",
        "text/css",
    )
    .await;
    mount_body(&mock_server, "/css/more.css", "p { margin: 0 }", "text/css").await;
    mount_body(&mock_server, "/img/bg.png", "bg", "image/png").await;
    mount_body(&mock_server, "/img/dot.gif", "dot", "image/gif").await;

    let (mirror, _events) = create_mirror(create_test_options(&mock_server, &dir));
    assert!(mirror.run().await.unwrap());

    let index = std::fs::read_to_string(host_dir(&dir).join("index.html")).unwrap();
    assert_eq!(
        index,
        r#"<link rel="stylesheet" href="css/site.css"><div style="background: url('img/dot.gif')"></div>"#
    );

    let css = std::fs::read_to_string(host_dir(&dir).join("css/site.css")).unwrap();
    assert_eq!(
        css,
        "body { background: url(\"../img/bg.png\") }\n@import 'more.css';\n"
    );

    assert!(host_dir(&dir).join("css/more.css").exists());
    assert!(host_dir(&dir).join("img/bg.png").exists());
    assert!(host_dir(&dir).join("img/dot.gif").exists());
    assert_eq!(mirror.stats().downloaded, 5);
}

#[tokio::test]
async fn test_http_errors_are_skipped_not_retried() {
    let mock_server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    mount_body(&mock_server, "/", r#"<a href="gone.html">gone</a>"#, "text/html").await;
    Mock::given(method("GET"))
        .and(path("/gone.html"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&mock_server)
        .await;

    let (mirror, mut events) = create_mirror(create_test_options(&mock_server, &dir));
    assert!(mirror.run().await.unwrap());

    let gone = Url::parse(&format!("{}/gone.html", mock_server.uri())).unwrap();
    assert_eq!(mirror.url_state(&gone), UrlState::Skipped);
    assert_eq!(mirror.stats().skipped, 1);
    assert!(!host_dir(&dir).join("gone.html").exists());

    let failure = collect_events(&mut events).into_iter().find_map(|e| match e {
        CrawlEvent::TaskFinished {
            error: Some(error), ..
        } => Some(error),
        _ => None,
    });
    assert!(failure.unwrap().contains("404"));
}

#[tokio::test]
async fn test_skip_existing_rerun_writes_nothing() {
    let mock_server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    let page = r#"<a href="/b.html">B</a><img src="c.png">"#;
    mount_body(&mock_server, "/", page, "text/html").await;
    mount_body(&mock_server, "/b.html", "<p>b</p>", "text/html").await;
    mount_body(&mock_server, "/c.png", "pixels", "image/png").await;

    let mut options = create_test_options(&mock_server, &dir);
    options.skip_existing = true;

    let (first, _events) = create_mirror(options.clone());
    assert!(first.run().await.unwrap());
    let before = snapshot(&dir.path().join("site"));
    assert_eq!(before.len(), 3);

    // Make any rewrite visible in the modification time
    tokio::time::sleep(Duration::from_millis(20)).await;

    let (second, mut events) = create_mirror(options);
    assert!(second.run().await.unwrap());
    let after = snapshot(&dir.path().join("site"));
    assert_eq!(before, after, "Expected no file to be rewritten");

    let stats = second.stats();
    assert_eq!(stats.downloaded, 3);
    // Markup is excluded from skipping and fetched again; the image is not
    assert_eq!(
        stats.bytes_total,
        (page.len() + "<p>b</p>".len()) as u64
    );
    assert_eq!(
        collect_events(&mut events).last(),
        Some(&CrawlEvent::RunEnded { completed: true })
    );
}

#[cfg(unix)]
#[tokio::test]
async fn test_redirect_is_linked() {
    let mock_server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/page.html"))
        .respond_with(ResponseTemplate::new(301).insert_header("Location", "/page1.html"))
        .mount(&mock_server)
        .await;
    mount_body(&mock_server, "/page1.html", "<p>moved</p>", "text/html").await;

    let mut options = create_test_options(&mock_server, &dir);
    options.entry = Url::parse(&format!("{}/page.html", mock_server.uri())).unwrap();
    options.link_redirects = true;

    let (mirror, _events) = create_mirror(options);
    assert!(mirror.run().await.unwrap());

    let primary = host_dir(&dir).join("page1.html");
    let alias = host_dir(&dir).join("page.html");
    assert_eq!(std::fs::read_to_string(&primary).unwrap(), "<p>moved</p>");
    assert!(std::fs::symlink_metadata(&alias)
        .unwrap()
        .file_type()
        .is_symlink());
    assert_eq!(std::fs::read_link(&alias).unwrap(), PathBuf::from("page1.html"));
    assert_eq!(std::fs::read_to_string(&alias).unwrap(), "<p>moved</p>");

    // Both the linked and the redirect URL count as downloaded
    let redirected = Url::parse(&format!("{}/page1.html", mock_server.uri())).unwrap();
    assert_eq!(mirror.url_state(&redirected), UrlState::Downloaded);
    assert_eq!(mirror.stats().downloaded, 2);
}

/// Transport whose responses never arrive
struct StallingTransport {
    attempts: AtomicU32,
}

#[async_trait]
impl Transport for StallingTransport {
    async fn open(&self, _url: &Url, _headers: &[(String, String)]) -> Result<FetchResponse> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }
}

#[tokio::test]
async fn test_timeouts_are_retried_up_to_the_limit() {
    let dir = TempDir::new().unwrap();
    let entry = Url::parse("http://stalled.invalid/").unwrap();

    let mut options = SessionOptions::new(dir.path().join("site"), entry.clone());
    options.temp_dir = dir.path().join("tmp");
    options.max_retries = 2;
    options.timeout_to_headers = Duration::from_millis(10);

    let transport = Arc::new(StallingTransport {
        attempts: AtomicU32::new(0),
    });
    let (observer, mut events) = ChannelObserver::channel();
    let mirror = Mirror::new(options, transport.clone(), Arc::new(observer));

    // Timeouts are per-resource failures, so the run still completes
    assert!(mirror.run().await.unwrap());

    assert_eq!(transport.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(mirror.url_state(&entry), UrlState::Skipped);
    assert_eq!(mirror.stats().skipped, 1);

    let events = collect_events(&mut events);
    let retries: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            CrawlEvent::TaskStarted { retries, .. } => Some(*retries),
            _ => None,
        })
        .collect();
    assert_eq!(retries, vec![0, 1, 2]);
}

#[tokio::test]
async fn test_second_run_while_running_is_rejected() {
    let mock_server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    mount_body(&mock_server, "/", "<p>hi</p>", "text/html").await;

    let (mirror, _events) = create_mirror(create_test_options(&mock_server, &dir));
    mirror.start().await.unwrap();
    assert!(matches!(
        mirror.run().await,
        Err(site_mirror::MirrorError::AlreadyRunning)
    ));

    assert!(mirror.process_queue().await);
    assert!(host_dir(&dir).join("index.html").exists());
}
