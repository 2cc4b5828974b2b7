//! URL handling module for Site-Mirror
//!
//! This module provides URL normalization, the allow/deny filter predicate,
//! MIME type guessing, and the deterministic URL → local path mapping.

mod filter;
pub mod mime;
mod normalize;
mod path_map;

// Re-export main functions
pub use filter::{
    FilterRule, FilterRuleConfig, FilterRules, FilterTarget, FilterValue, SameHostFilter,
    UrlFilter,
};
pub use mime::{MimeDefinition, MimeTable};
pub use normalize::{normalize_url, parse_normalized};
pub use path_map::{
    local_path_for, local_path_with, relative_path, relative_url_between, MAX_ENCODED_QUERY_LEN,
};
