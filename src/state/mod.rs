//! State module for tracking crawl progress
//!
//! # Components
//!
//! - `UrlState`: lifecycle of an individual URL (new, queued, downloaded, skipped)
//! - `UrlRecord`: memoized filter decision and lifecycle of one URL
//! - `UrlRegistry`: owns all records and the session-wide counters

mod registry;
mod url_record;

// Re-export main types
pub use registry::{FilterAnalysis, RegistryStats, UrlRegistry};
pub use url_record::{UrlRecord, UrlState};
