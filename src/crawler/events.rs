//! Lifecycle signals of a mirror run
//!
//! The coordinator reports progress through a [`CrawlObserver`]. The default
//! observer logs; [`ChannelObserver`] forwards [`CrawlEvent`]s to whoever
//! holds the receiving end.

use crate::crawler::resource::ResourceTask;
use crate::MirrorError;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Receives lifecycle signals from the coordinator
///
/// All methods default to doing nothing.
pub trait CrawlObserver: Send + Sync {
    fn task_started(&self, _task: &ResourceTask) {}

    /// `error` is `None` when the task completed
    fn task_finished(&self, _error: Option<&MirrorError>, _task: &ResourceTask) {}

    /// `completed` is false when the run was stopped or hit a fault
    fn run_ended(&self, _completed: bool) {}

    /// Unrecoverable fault (setup or filesystem)
    fn error(&self, _error: &MirrorError) {}
}

/// Observer that does nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl CrawlObserver for NoopObserver {}

/// Observer that logs every signal through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl CrawlObserver for TracingObserver {
    fn task_started(&self, task: &ResourceTask) {
        if task.retries > 0 {
            tracing::debug!("Retrying {} (attempt {})", task.linked_url, task.retries + 1);
        } else {
            tracing::debug!("Fetching {}", task.linked_url);
        }
    }

    fn task_finished(&self, error: Option<&MirrorError>, task: &ResourceTask) {
        match error {
            None => tracing::info!(
                "Mirrored {} ({} bytes, {})",
                task.final_url(),
                task.bytes,
                task.mime.as_deref().unwrap_or("unknown type")
            ),
            Some(e) if e.is_retryable() => {
                tracing::debug!("Attempt for {} failed: {}", task.linked_url, e)
            }
            Some(e) => tracing::warn!("Skipped {}: {}", task.linked_url, e),
        }
    }

    fn run_ended(&self, completed: bool) {
        if completed {
            tracing::info!("Mirror run completed");
        } else {
            tracing::info!("Mirror run ended early");
        }
    }

    fn error(&self, error: &MirrorError) {
        tracing::error!("Mirror run fault: {}", error);
    }
}

/// Owned form of a lifecycle signal
#[derive(Debug, Clone, PartialEq)]
pub enum CrawlEvent {
    TaskStarted {
        url: String,
        retries: u32,
    },
    TaskFinished {
        url: String,
        error: Option<String>,
    },
    RunEnded {
        completed: bool,
    },
    Error(String),
}

/// Observer that forwards events over an unbounded channel
///
/// Events sent after the receiver was dropped are discarded.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    sender: UnboundedSender<CrawlEvent>,
}

impl ChannelObserver {
    pub fn new(sender: UnboundedSender<CrawlEvent>) -> Self {
        Self { sender }
    }

    /// Creates an observer together with its receiving end
    pub fn channel() -> (Self, UnboundedReceiver<CrawlEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self::new(sender), receiver)
    }

    fn send(&self, event: CrawlEvent) {
        let _ = self.sender.send(event);
    }
}

impl CrawlObserver for ChannelObserver {
    fn task_started(&self, task: &ResourceTask) {
        self.send(CrawlEvent::TaskStarted {
            url: task.linked_url.to_string(),
            retries: task.retries,
        });
    }

    fn task_finished(&self, error: Option<&MirrorError>, task: &ResourceTask) {
        self.send(CrawlEvent::TaskFinished {
            url: task.linked_url.to_string(),
            error: error.map(ToString::to_string),
        });
    }

    fn run_ended(&self, completed: bool) {
        self.send(CrawlEvent::RunEnded { completed });
    }

    fn error(&self, error: &MirrorError) {
        self.send(CrawlEvent::Error(error.to_string()));
    }
}
