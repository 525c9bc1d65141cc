//! Configuration types for the trellis runtime.
//!
//! All types in this module are self-contained with no dependencies on other
//! internal trellis crates. Domain types (descriptors, environments, schemas)
//! are mirrored here and converted at the boundary by the runtime's config
//! resolver. Every struct implements [`Default`] so that a bare `[section]`
//! header in TOML produces a working configuration.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Free-form settings table attached to an engine, app or framework.
pub type SettingsTable = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root configuration for the trellis runtime.
///
/// A single TOML document describes the bundle catalog (what can be loaded),
/// the environments (which bundles are loaded together, with which settings)
/// and the selectors that map a context onto an environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Runtime tunables (metrics queue and dispatcher).
    pub runtime: RuntimeSection,
    /// Logging level, format, and per-crate directives.
    pub logging: LoggingSection,
    /// Bundle catalog keyed by bundle name.
    pub bundles: BTreeMap<String, BundleSection>,
    /// Environments keyed by environment name.
    pub environments: BTreeMap<String, EnvironmentSection>,
    /// Ordered environment selectors. The first match wins.
    pub selectors: Vec<SelectorSection>,
}

// ---------------------------------------------------------------------------
// RuntimeSection
// ---------------------------------------------------------------------------

/// Runtime behaviour knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSection {
    /// Whether usage metrics are collected at all.
    pub metrics_enabled: bool,
    /// Maximum number of queued metric events. The oldest are dropped first.
    pub metrics_queue_capacity: usize,
    /// Maximum number of events handed to the transport per dispatch.
    pub metrics_batch_size: usize,
    /// Interval between two dispatcher polls, in milliseconds.
    pub metrics_poll_interval_ms: u64,
    /// How long teardown waits for the dispatcher to flush, in milliseconds.
    pub metrics_flush_timeout_ms: u64,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            metrics_queue_capacity: 1000,
            metrics_batch_size: 10,
            metrics_poll_interval_ms: 5000,
            metrics_flush_timeout_ms: 2000,
        }
    }
}

// ---------------------------------------------------------------------------
// LoggingSection
// ---------------------------------------------------------------------------

/// Logging configuration as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Base level filter (e.g. `"info"`).
    pub level: String,
    /// Output format: `pretty`, `compact`, `json` or `full`.
    pub format: String,
    /// Directory for rolling log files. Logs go to stderr when unset.
    pub directory: Option<PathBuf>,
    /// Per-target directive overrides (e.g. `trellis_runtime=debug`).
    pub directives: Vec<String>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: "pretty".to_owned(),
            directory: None,
            directives: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Bundle catalog
// ---------------------------------------------------------------------------

/// One entry of the bundle catalog: where a bundle lives and what it declares.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleSection {
    /// Install location on disk.
    pub path: PathBuf,
    /// Bundle version string.
    pub version: String,
    /// Whether this is a development checkout (enables "Reload and Restart").
    pub dev: bool,
    /// Whether a framework bundle is shared between all bundles of an engine.
    pub shared: bool,
    /// Human readable description, used as the default command description.
    pub description: Option<String>,
    /// Icon used as the default command icon.
    pub icon: Option<PathBuf>,
    /// Supported host platforms (`linux`, `mac`, `windows`). Empty means all.
    pub platforms: Vec<String>,
    /// Engines this app can run in. Empty means all.
    pub engines: Vec<String>,
    /// Context fields that must be present for the bundle to load.
    pub requires_context: Vec<String>,
    /// Framework instances the bundle depends on.
    pub frameworks: Vec<String>,
    /// Minimum runtime version required by the bundle.
    pub minimum_core_version: Option<String>,
    /// Configuration schema keyed by setting name.
    pub schema: BTreeMap<String, SettingSection>,
}

impl Default for BundleSection {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            version: "0.0.0".to_owned(),
            dev: false,
            shared: false,
            description: None,
            icon: None,
            platforms: Vec::new(),
            engines: Vec::new(),
            requires_context: Vec::new(),
            frameworks: Vec::new(),
            minimum_core_version: None,
            schema: BTreeMap::new(),
        }
    }
}

/// The declared type of a configuration setting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingKind {
    /// Any string.
    #[default]
    #[serde(rename = "string")]
    Str,
    /// Signed integer.
    Int,
    /// Floating point number (integers are accepted).
    Float,
    /// Boolean.
    Bool,
    /// Array of values.
    List,
    /// Table of values.
    Dict,
    /// Filesystem path (string).
    Path,
    /// No type check.
    Any,
}

/// Declaration of a single setting in a bundle schema.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingSection {
    /// Declared type.
    #[serde(rename = "type")]
    pub kind: SettingKind,
    /// Default value. A setting without a default is required.
    pub default: Option<serde_json::Value>,
    /// Human readable description.
    pub description: Option<String>,
}

// ---------------------------------------------------------------------------
// Environments
// ---------------------------------------------------------------------------

/// A named configuration scope: engines, their apps and frameworks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentSection {
    /// Human readable description.
    pub description: Option<String>,
    /// Engine instances keyed by instance name.
    pub engines: BTreeMap<String, EngineSection>,
    /// Framework instances keyed by instance name.
    pub frameworks: BTreeMap<String, FrameworkSection>,
}

/// An engine instance inside an environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// Bundle catalog entry implementing this engine.
    pub bundle: String,
    /// Engine settings.
    pub settings: SettingsTable,
    /// Apps in declared load order.
    pub apps: Vec<AppSection>,
}

/// An app instance inside an engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSection {
    /// Instance name, unique within the engine.
    pub instance: String,
    /// Bundle catalog entry implementing this app.
    pub bundle: String,
    /// App settings.
    pub settings: SettingsTable,
}

/// A framework instance inside an environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameworkSection {
    /// Bundle catalog entry implementing this framework.
    pub bundle: String,
    /// Framework settings.
    pub settings: SettingsTable,
}

/// Maps contexts onto an environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorSection {
    /// Environment selected when this selector matches.
    pub environment: String,
    /// Context fields that must all be present.
    pub requires: Vec<String>,
    /// Required entity type of the context entity, if any.
    pub entity_type: Option<String>,
}

/// Context field names understood by `requires` and `requires_context`.
pub const CONTEXT_FIELDS: &[&str] = &["project", "entity", "step", "task", "user"];

/// Platform names understood by `platforms`.
pub const PLATFORMS: &[&str] = &["linux", "mac", "windows"];
