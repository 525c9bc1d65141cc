//! Config file discovery and loading.
//!
//! Discovery order (first existing file wins):
//! 1. `$TRELLIS_CONFIG`
//! 2. `{workspace}/.trellis/config.toml`
//! 3. `~/.trellis/config.toml`

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{ConfigError, ConfigResult};
use crate::types::Config;
use crate::validate;

/// Environment variable pointing at an explicit config file.
pub const CONFIG_ENV_VAR: &str = "TRELLIS_CONFIG";

/// Parse and validate a configuration from a TOML string.
///
/// # Errors
///
/// Returns a [`ConfigError`] if the TOML is malformed or fails validation.
pub fn from_toml_str(contents: &str) -> ConfigResult<Config> {
    let config: Config = toml::from_str(contents).map_err(|e| ConfigError::ParseError {
        path: "<inline>".to_owned(),
        source: e,
    })?;
    validate::validate(&config)?;
    Ok(config)
}

/// Load, parse and validate a configuration file.
///
/// # Errors
///
/// Returns a [`ConfigError`] if the file cannot be read, is malformed, or
/// fails validation.
pub fn load_file(path: &Path) -> ConfigResult<Config> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.display().to_string(),
        source: e,
    })?;
    let config: Config = toml::from_str(&contents).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        source: e,
    })?;
    validate::validate(&config)?;
    info!(
        path = %path.display(),
        bundles = config.bundles.len(),
        environments = config.environments.len(),
        "loaded config"
    );
    Ok(config)
}

/// Load a configuration file if it exists.
///
/// # Errors
///
/// Returns a [`ConfigError`] if the file exists but cannot be loaded.
pub fn try_load_file(path: &Path) -> ConfigResult<Option<Config>> {
    if !path.exists() {
        debug!(path = %path.display(), "config file not present");
        return Ok(None);
    }
    load_file(path).map(Some)
}

/// The ordered list of locations searched by [`discover`].
#[must_use]
pub fn search_paths(workspace_root: Option<&Path>, home_override: Option<&Path>) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(explicit) = std::env::var_os(CONFIG_ENV_VAR) {
        paths.push(PathBuf::from(explicit));
    }
    if let Some(root) = workspace_root {
        paths.push(root.join(".trellis").join("config.toml"));
    }
    let home = home_override
        .map(Path::to_path_buf)
        .or_else(|| directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()));
    if let Some(home) = home {
        paths.push(home.join(".trellis").join("config.toml"));
    }
    paths
}

/// Find and load the first existing configuration file.
///
/// # Errors
///
/// Returns [`ConfigError::NotFound`] if no search location holds a file, or
/// the error of the first file that fails to load.
pub fn discover(workspace_root: Option<&Path>, home_override: Option<&Path>) -> ConfigResult<Config> {
    let paths = search_paths(workspace_root, home_override);
    for path in &paths {
        if let Some(config) = try_load_file(path)? {
            return Ok(config);
        }
    }
    Err(ConfigError::NotFound {
        searched: paths
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", "),
    })
}
