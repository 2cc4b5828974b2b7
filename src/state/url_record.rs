//! Per-URL lifecycle tracking
//!
//! Every distinct normalized URL the crawl touches gets exactly one record.

use std::fmt;

/// Lifecycle position of a URL
///
/// Being an enum, a URL can never be queued and downloaded (or skipped) at
/// the same time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum UrlState {
    /// Seen, but never queued
    #[default]
    New,

    /// Waiting in the queue or currently being processed
    Queued,

    // ===== Terminal States =====
    /// Mirrored successfully (or confirmed unchanged)
    Downloaded,

    /// Given up on (HTTP error, transport failure, retries exhausted)
    Skipped,
}

impl UrlState {
    /// Returns true once the URL has reached a final outcome
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Downloaded | Self::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Queued => "queued",
            Self::Downloaded => "downloaded",
            Self::Skipped => "skipped",
        }
    }

    /// Checks whether moving from this state to `to` is allowed
    ///
    /// | From | To | Allowed |
    /// |------|----|---------|
    /// | New | Queued | yes |
    /// | Queued | Downloaded, Skipped | yes |
    /// | anything else | | no |
    pub fn can_transition_to(&self, to: UrlState) -> bool {
        matches!(
            (self, to),
            (Self::New, Self::Queued)
                | (Self::Queued, Self::Downloaded)
                | (Self::Queued, Self::Skipped)
        )
    }
}

impl fmt::Display for UrlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Everything the registry knows about one URL
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UrlRecord {
    /// Memoized filter decision, computed on the first query
    pub allowed: Option<bool>,

    /// How many times the allow decision was asked for
    pub asked_count: u32,

    pub state: UrlState,
}

impl UrlRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if the URL was never queued, downloaded or skipped
    pub fn is_new(&self) -> bool {
        self.state == UrlState::New
    }

    pub fn is_queued(&self) -> bool {
        self.state == UrlState::Queued
    }

    pub fn is_allowed(&self) -> bool {
        self.allowed == Some(true)
    }
}
