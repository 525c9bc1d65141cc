//! Logging configuration and setup.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing::Subscriber;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt as tfmt, layer::SubscriberExt, reload};

use crate::error::{TelemetryError, TelemetryResult};
use crate::sink::{LogSink, SinkId, SinkLayer, SinkRegistry};

fn init_err<E: fmt::Display>(e: E) -> TelemetryError {
    TelemetryError::InitError(e.to_string())
}

/// Level used while global debug logging is on.
const DEBUG_LEVEL: &str = "debug";

/// File rotation strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileRotation {
    /// Rotate daily.
    #[default]
    Daily,
    /// Rotate hourly.
    Hourly,
    /// Never rotate.
    Never,
}

impl From<FileRotation> for Rotation {
    fn from(rotation: FileRotation) -> Self {
        match rotation {
            FileRotation::Daily => Rotation::DAILY,
            FileRotation::Hourly => Rotation::HOURLY,
            FileRotation::Never => Rotation::NEVER,
        }
    }
}

/// Log format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable multi-line format.
    #[default]
    Pretty,
    /// Compact single-line format.
    Compact,
    /// JSON lines.
    Json,
    /// Default `tracing-subscriber` format.
    Full,
}

impl LogFormat {
    /// Parse a format name as written in the config file.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "pretty" => Some(Self::Pretty),
            "compact" => Some(Self::Compact),
            "json" => Some(Self::Json),
            "full" => Some(Self::Full),
            _ => None,
        }
    }
}

/// Log output target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogTarget {
    /// Standard output.
    Stdout,
    /// Standard error.
    #[default]
    Stderr,
    /// Rolling files in the given directory.
    File(PathBuf),
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Base level filter (e.g., "info", "debug").
    #[serde(default = "default_level")]
    pub level: String,
    /// Output format.
    #[serde(default)]
    pub format: LogFormat,
    /// Output target.
    #[serde(default)]
    pub target: LogTarget,
    /// File name prefix for [`LogTarget::File`].
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,
    /// Rotation for [`LogTarget::File`].
    #[serde(default)]
    pub rotation: FileRotation,
    /// Whether to include timestamps.
    #[serde(default = "default_true")]
    pub timestamps: bool,
    /// Whether to use ANSI colors.
    #[serde(default = "default_true")]
    pub ansi: bool,
    /// Directive overrides (e.g., `trellis_runtime=trace`).
    #[serde(default)]
    pub directives: Vec<String>,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_file_prefix() -> String {
    "trellis".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::default(),
            target: LogTarget::default(),
            file_prefix: default_file_prefix(),
            rotation: FileRotation::default(),
            timestamps: true,
            ansi: true,
            directives: Vec::new(),
        }
    }
}

impl LogConfig {
    /// Create a new log config with the specified level.
    #[must_use]
    pub fn new(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            ..Default::default()
        }
    }

    /// Set the log format.
    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Set the log target.
    #[must_use]
    pub fn with_target(mut self, target: LogTarget) -> Self {
        self.target = target;
        self
    }

    /// Log to rolling files in `directory`. Disables ANSI colors.
    #[must_use]
    pub fn with_file_logging(mut self, directory: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        self.target = LogTarget::File(directory.into());
        self.file_prefix = prefix.into();
        self.ansi = false;
        self
    }

    /// Add a directive override.
    #[must_use]
    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    /// Disable timestamps.
    #[must_use]
    pub fn without_timestamps(mut self) -> Self {
        self.timestamps = false;
        self
    }

    /// Disable ANSI colors.
    #[must_use]
    pub fn without_ansi(mut self) -> Self {
        self.ansi = false;
        self
    }

    /// The directory log files are written to, if logging to files.
    #[must_use]
    pub fn log_folder(&self) -> Option<&Path> {
        match &self.target {
            LogTarget::File(dir) => Some(dir),
            LogTarget::Stdout | LogTarget::Stderr => None,
        }
    }

    /// Build the env filter for the given base level.
    pub(crate) fn build_filter_with_level(&self, level: &str) -> TelemetryResult<EnvFilter> {
        let mut filter =
            EnvFilter::try_new(level).map_err(|e| TelemetryError::ConfigError(e.to_string()))?;

        for directive in &self.directives {
            filter = filter.add_directive(directive.parse().map_err(
                |e: tracing_subscriber::filter::ParseError| TelemetryError::ConfigError(e.to_string()),
            )?);
        }

        Ok(filter)
    }

    /// Build the env filter from the configured level.
    pub(crate) fn build_filter(&self) -> TelemetryResult<EnvFilter> {
        self.build_filter_with_level(&self.level)
    }

    fn writer(&self) -> TelemetryResult<BoxMakeWriter> {
        Ok(match &self.target {
            LogTarget::Stdout => BoxMakeWriter::new(std::io::stdout),
            LogTarget::Stderr => BoxMakeWriter::new(std::io::stderr),
            LogTarget::File(dir) => {
                std::fs::create_dir_all(dir).map_err(|e| {
                    TelemetryError::ConfigError(format!("failed to create log directory: {e}"))
                })?;
                BoxMakeWriter::new(RollingFileAppender::new(
                    self.rotation.into(),
                    dir,
                    &self.file_prefix,
                ))
            },
        })
    }
}

#[cfg(feature = "config")]
impl From<&trellis_config::LoggingSection> for LogConfig {
    fn from(section: &trellis_config::LoggingSection) -> Self {
        let mut config = LogConfig::new(section.level.clone())
            .with_format(LogFormat::from_name(&section.format).unwrap_or_default());
        if let Some(dir) = &section.directory {
            config = config.with_file_logging(dir.clone(), default_file_prefix());
        }
        config.directives.clone_from(&section.directives);
        config
    }
}

fn fmt_layer<S>(config: &LogConfig, writer: BoxMakeWriter) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let base = tfmt::layer().with_writer(writer).with_ansi(config.ansi);
    match (config.format, config.timestamps) {
        (LogFormat::Pretty, true) => base.pretty().boxed(),
        (LogFormat::Pretty, false) => base.pretty().without_time().boxed(),
        (LogFormat::Compact, true) => base.compact().boxed(),
        (LogFormat::Compact, false) => base.compact().without_time().boxed(),
        (LogFormat::Json, true) => base.json().boxed(),
        (LogFormat::Json, false) => base.json().without_time().boxed(),
        (LogFormat::Full, true) => base.boxed(),
        (LogFormat::Full, false) => base.without_time().boxed(),
    }
}

type ReloadFn = Box<dyn Fn(EnvFilter) -> Result<(), String> + Send + Sync>;

struct HandleInner {
    config: LogConfig,
    sinks: Arc<SinkRegistry>,
    reload: Option<ReloadFn>,
    debug: AtomicBool,
}

/// Control surface over the installed logging stack.
///
/// Cloning is cheap; all clones share the same filter and sink set.
#[derive(Clone)]
pub struct LogHandle {
    inner: Arc<HandleInner>,
}

impl fmt::Debug for LogHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogHandle")
            .field("level", &self.inner.config.level)
            .field("global_debug", &self.global_debug())
            .field("sinks", &self.inner.sinks)
            .finish_non_exhaustive()
    }
}

impl LogHandle {
    /// A handle that is not connected to any installed subscriber.
    ///
    /// Sinks attached here only receive events if [`sink_layer`](Self::sink_layer)
    /// is installed by the caller. Toggling debug only updates the flag.
    #[must_use]
    pub fn detached(config: LogConfig) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                config,
                sinks: Arc::new(SinkRegistry::new()),
                reload: None,
                debug: AtomicBool::new(false),
            }),
        }
    }

    /// The configuration this handle was created from.
    #[must_use]
    pub fn config(&self) -> &LogConfig {
        &self.inner.config
    }

    /// Whether global debug logging is currently on.
    #[must_use]
    pub fn global_debug(&self) -> bool {
        self.inner.debug.load(Ordering::SeqCst)
    }

    /// Switch the global filter between `debug` and the configured level.
    ///
    /// # Errors
    ///
    /// Returns an error if the filter cannot be built or swapped in.
    pub fn set_global_debug(&self, enabled: bool) -> TelemetryResult<()> {
        if let Some(reload) = &self.inner.reload {
            let filter = if enabled {
                self.inner.config.build_filter_with_level(DEBUG_LEVEL)?
            } else {
                self.inner.config.build_filter()?
            };
            reload(filter).map_err(TelemetryError::ReloadError)?;
        }
        self.inner.debug.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    /// Route every log event to `sink` until it is detached.
    pub fn attach_sink(&self, sink: Arc<dyn LogSink>) -> SinkId {
        self.inner.sinks.attach(sink)
    }

    /// Stop routing events to a sink. Returns `false` if it was not attached.
    pub fn detach_sink(&self, id: SinkId) -> bool {
        self.inner.sinks.detach(id)
    }

    /// Number of sinks currently attached.
    #[must_use]
    pub fn sink_count(&self) -> usize {
        self.inner.sinks.len()
    }

    /// A layer feeding this handle's sinks, for callers building their own
    /// subscriber.
    #[must_use]
    pub fn sink_layer(&self) -> SinkLayer {
        SinkLayer::new(Arc::clone(&self.inner.sinks))
    }

    /// The directory log files are written to, if logging to files.
    #[must_use]
    pub fn log_folder(&self) -> Option<PathBuf> {
        self.inner.config.log_folder().map(Path::to_path_buf)
    }
}

/// Install the global subscriber described by `config`.
///
/// The returned handle controls the filter and the attachable sinks.
///
/// # Errors
///
/// Returns an error if the configuration is invalid or a global subscriber
/// is already installed.
pub fn setup_logging(config: &LogConfig) -> TelemetryResult<LogHandle> {
    let (filter, reload_handle) = reload::Layer::new(config.build_filter()?);
    let sinks = Arc::new(SinkRegistry::new());

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer(config, config.writer()?))
        .with(SinkLayer::new(Arc::clone(&sinks)))
        .try_init()
        .map_err(init_err)?;

    let reload: ReloadFn = Box::new(move |filter| reload_handle.reload(filter).map_err(|e| e.to_string()));
    Ok(LogHandle {
        inner: Arc::new(HandleInner {
            config: config.clone(),
            sinks,
            reload: Some(reload),
            debug: AtomicBool::new(false),
        }),
    })
}

/// Set up default logging (info level, stderr, pretty format).
///
/// # Errors
///
/// Returns an error if logging cannot be initialized.
pub fn setup_default_logging() -> TelemetryResult<LogHandle> {
    setup_logging(&LogConfig::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::LogRecord;
    use std::sync::Mutex;

    #[test]
    fn test_log_config_default() {
        let config = LogConfig::default();
        assert_eq!(config.level, "info");
        assert_eq!(config.format, LogFormat::Pretty);
        assert!(config.timestamps);
        assert!(config.log_folder().is_none());
    }

    #[test]
    fn test_log_config_builder() {
        let config = LogConfig::new("debug")
            .with_format(LogFormat::Json)
            .without_timestamps()
            .with_directive("trellis_runtime=trace");

        assert_eq!(config.level, "debug");
        assert_eq!(config.format, LogFormat::Json);
        assert!(!config.timestamps);
        assert_eq!(config.directives, vec!["trellis_runtime=trace"]);
    }

    #[test]
    fn test_file_logging_sets_folder_and_disables_ansi() {
        let config = LogConfig::default().with_file_logging("/var/log/trellis", "engine");
        assert_eq!(config.log_folder(), Some(Path::new("/var/log/trellis")));
        assert_eq!(config.file_prefix, "engine");
        assert!(!config.ansi);
    }

    #[test]
    fn test_build_filter_invalid() {
        let config = LogConfig::new("debug").with_directive("[invalid=syntax");
        assert!(config.build_filter().is_err());
    }

    #[test]
    fn test_writer_creates_log_directory() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("nested").join("logs");
        let config = LogConfig::default().with_file_logging(&logs, "trellis");
        assert!(config.writer().is_ok());
        assert!(logs.is_dir());
    }

    #[test]
    fn test_detached_handle_toggles_debug_flag() {
        let handle = LogHandle::detached(LogConfig::default());
        assert!(!handle.global_debug());
        handle.set_global_debug(true).unwrap();
        assert!(handle.global_debug());
        handle.clone().set_global_debug(false).unwrap();
        assert!(!handle.global_debug());
    }

    #[test]
    fn test_detached_handle_sink_layer() {
        #[derive(Default)]
        struct Collect(Mutex<Vec<LogRecord>>);
        impl LogSink for Collect {
            fn emit(&self, record: &LogRecord) {
                self.0.lock().unwrap().push(record.clone());
            }
        }

        let handle = LogHandle::detached(LogConfig::default());
        let sink = Arc::new(Collect::default());
        let id = handle.attach_sink(Arc::clone(&sink) as Arc<dyn LogSink>);
        assert_eq!(handle.sink_count(), 1);

        let subscriber = tracing_subscriber::registry().with(handle.sink_layer());
        tracing::subscriber::with_default(subscriber, || tracing::info!("hello"));
        assert_eq!(sink.0.lock().unwrap().len(), 1);

        assert!(handle.detach_sink(id));
        assert_eq!(handle.sink_count(), 0);
    }

    #[cfg(feature = "config")]
    #[test]
    fn test_from_logging_section() {
        let section = trellis_config::LoggingSection {
            level: "warn".into(),
            format: "compact".into(),
            directory: Some(PathBuf::from("/tmp/trellis-logs")),
            directives: vec!["trellis_runtime=debug".into()],
        };
        let config = LogConfig::from(&section);
        assert_eq!(config.level, "warn");
        assert_eq!(config.format, LogFormat::Compact);
        assert_eq!(config.log_folder(), Some(Path::new("/tmp/trellis-logs")));
        assert_eq!(config.directives, vec!["trellis_runtime=debug"]);
    }
}
