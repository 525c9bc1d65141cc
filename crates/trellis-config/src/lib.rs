#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
//! Configuration for the trellis bundle runtime.
//!
//! A single [`Config`] describes:
//!
//! - the **bundle catalog** (`[bundles.<name>]`): install location, version,
//!   compatibility declarations and the settings schema of each bundle;
//! - the **environments** (`[environments.<env>]`): which engine instances
//!   exist, which apps they load in which order, with which settings, and the
//!   framework instances available to them;
//! - the **selectors** (`[[selectors]]`): the ordered rules that pick an
//!   environment for a context.
//!
//! # Usage
//!
//! ```rust,no_run
//! use trellis_config::Config;
//!
//! let config = Config::load(std::path::Path::new("trellis.toml")).unwrap();
//! println!("{} bundles", config.bundles.len());
//! ```
//!
//! # Design
//!
//! This crate has **no dependencies on other internal trellis crates**.
//! Conversion to runtime domain types happens in the runtime's config
//! resolver.

/// Configuration error types.
pub mod error;
/// Configuration file discovery and loading.
pub mod loader;
/// Configuration struct definitions.
pub mod types;
/// Configuration validation rules.
pub mod validate;

pub use error::{ConfigError, ConfigResult};
pub use types::*;

impl Config {
    /// Load and validate a configuration file.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the file is missing, malformed, or fails
    /// validation.
    pub fn load(path: &std::path::Path) -> ConfigResult<Self> {
        loader::load_file(path)
    }

    /// Parse and validate a configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the TOML is malformed or fails validation.
    pub fn from_toml_str(contents: &str) -> ConfigResult<Self> {
        loader::from_toml_str(contents)
    }
}
