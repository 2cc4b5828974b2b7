//! Output module for reporting mirror results
//!
//! This module handles printing the registry statistics and the filter
//! analysis once a run has ended.

pub mod stats;

pub use stats::{format_bytes, print_filter_analysis, print_statistics, success_rate};
