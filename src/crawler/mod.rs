//! Crawler module for fetching and mirroring resources
//!
//! This module contains the core mirroring logic, including:
//! - HTTP transport with header and body timeouts
//! - The per-resource fetch / rewrite / install pipeline
//! - Link discovery while content streams through the rewriters
//! - Queue ordering, pacing and overall run coordination

mod bandwidth;
mod coordinator;
mod events;
mod fetcher;
mod hooks;
mod resource;
mod scheduler;

pub use bandwidth::ByteCounter;
pub use coordinator::Mirror;
pub use events::{ChannelObserver, CrawlEvent, CrawlObserver, NoopObserver, TracingObserver};
pub use fetcher::{
    build_http_client, FetchResponse, ReqwestTransport, ResponseMeta, Transport, MAX_REDIRECTS,
};
pub use hooks::DiscoveredLink;
pub use resource::{process, ResourcePhase, ResourceTask, SessionContext};
pub use scheduler::Scheduler;

use crate::config::Config;
use crate::Result;

/// Runs a complete mirror operation from a configuration
///
/// This is the main entry point for a one-shot mirror. It will:
/// 1. Build the session options and HTTP transport
/// 2. Prepare the local and temp directories
/// 3. Fetch, rewrite and install every reachable allowed resource
///
/// # Returns
///
/// * `Ok(true)` - The queue ran empty
/// * `Ok(false)` - The run ended early
/// * `Err(MirrorError)` - Setup failed
pub async fn mirror(config: &Config) -> Result<bool> {
    Mirror::from_config(config)?.run().await
}
