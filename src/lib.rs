//! Site-Mirror: a recursive website mirroring engine
//!
//! This crate fetches a remote page, rewrites every link inside it to point at
//! the corresponding local file, discovers newly referenced resources and keeps
//! going until no unvisited, filter-allowed URL remains.

pub mod config;
pub mod crawler;
pub mod output;
pub mod rewrite;
pub mod state;
pub mod url;

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Which part of a response a timeout fired in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    /// Waiting for the status line and headers
    Headers,
    /// Streaming the body through the rewriter
    Body,
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Headers => write!(f, "headers"),
            Self::Body => write!(f, "body"),
        }
    }
}

/// Main error type for Site-Mirror operations
#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Remote returned HTTP {status} for {url}")]
    Remote { url: String, status: u16 },

    #[error("Timeout waiting for {phase} of {url}")]
    Timeout { url: String, phase: TimeoutPhase },

    #[error("Transport error for {url}: {message}")]
    Transport { url: String, message: String },

    #[error("Filesystem error at {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("URL error: {0}")]
    Url(#[from] UrlError),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] ::url::ParseError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Rewrite error: {0}")]
    Rewrite(String),

    #[error("Mirror is already running")]
    AlreadyRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MirrorError {
    /// Returns true if the failed task may be queued for another attempt
    ///
    /// Only timeouts are retried; a broken connection or an HTTP error status
    /// is not expected to heal on an immediate retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns true if the error means the destination tree is unusable
    pub fn is_run_fault(&self) -> bool {
        matches!(self, Self::Filesystem { .. })
    }

    /// Wraps an IO error with the path it happened at
    pub fn filesystem(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Filesystem {
            path: path.into(),
            source,
        }
    }
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),

    #[error("Invalid filter rule: {0}")]
    InvalidFilter(String),
}

/// URL-specific errors
#[derive(Debug, Error)]
pub enum UrlError {
    #[error("Failed to parse URL: {0}")]
    Parse(String),

    #[error("Invalid URL scheme: {0}")]
    InvalidScheme(String),

    #[error("Missing host in URL")]
    MissingHost,
}

/// Result type alias for Site-Mirror operations
pub type Result<T> = std::result::Result<T, MirrorError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for URL operations
pub type UrlResult<T> = std::result::Result<T, UrlError>;

// Re-export commonly used types
pub use config::{Config, SessionOptions};
pub use crawler::{CrawlEvent, CrawlObserver, Mirror, ResourceTask};
pub use state::{RegistryStats, UrlRegistry, UrlState};
pub use url::{local_path_for, normalize_url, relative_url_between, UrlFilter};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_timeouts_are_retryable() {
        let timeout = MirrorError::Timeout {
            url: "http://x/".to_string(),
            phase: TimeoutPhase::Body,
        };
        let remote = MirrorError::Remote {
            url: "http://x/".to_string(),
            status: 404,
        };
        let transport = MirrorError::Transport {
            url: "http://x/".to_string(),
            message: "connection reset".to_string(),
        };

        assert!(timeout.is_retryable());
        assert!(!remote.is_retryable());
        assert!(!transport.is_retryable());
    }

    #[test]
    fn test_filesystem_is_run_fault() {
        let err = MirrorError::filesystem(
            "/nope",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(err.is_run_fault());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("/nope"));
    }
}
