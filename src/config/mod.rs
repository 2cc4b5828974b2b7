//! Configuration module for Site-Mirror
//!
//! This module handles loading, parsing, and validating TOML configuration files
//! and turning them into the runtime [`SessionOptions`].
//!
//! # Example
//!
//! ```no_run
//! use site_mirror::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("mirror.toml")).unwrap();
//! let options = config.session_options().unwrap();
//! println!("Mirroring {} into {}", options.entry, options.local_path.display());
//! ```

mod parser;
mod session;
mod types;
mod validation;

// Re-export types
pub use session::SessionOptions;
pub use types::{Config, FetchConfig, FilesConfig, PacingConfig, ProjectConfig};

// Re-export parser functions
pub use parser::{compute_config_hash, load_config, load_config_with_hash, parse_config};
pub use validation::validate;
