//! Scripted bundles and recording doubles.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use trellis_runtime::{
    App, AppContext, CommandAction, CommandProperties, Context, DescriptorError, DescriptorResolver, Engine,
    EngineBackend, Environment, MetricEvent, MetricsTransport, PanelProperties, RuntimeResult,
};
use trellis_telemetry::{LogRecord, LogSink};

/// Ordered record of lifecycle calls made on scripted bundles.
///
/// Clones share the same entries.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    /// Append an entry.
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).push(entry.into());
    }

    /// Snapshot of all entries in call order.
    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Number of entries equal to `entry`.
    #[must_use]
    pub fn count(&self, entry: &str) -> usize {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| *e == entry)
            .count()
    }

    /// Position of the first entry equal to `entry`.
    #[must_use]
    pub fn position(&self, entry: &str) -> Option<usize> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .position(|e| e == entry)
    }

    /// Forget all entries.
    pub fn clear(&self) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

// ---------------------------------------------------------------------------
// Apps
// ---------------------------------------------------------------------------

/// What a [`ScriptedApp`] does during its lifecycle.
#[derive(Debug, Clone, Default)]
pub struct AppScript {
    /// Commands registered from `init_app`. Each returns `"<instance> <name>"`.
    pub commands: Vec<String>,
    /// Command kind applied to every registered command.
    pub kind: Option<String>,
    /// Panel registered from `init_app`.
    pub panel: Option<String>,
    /// Whether the app supports in-place context changes.
    pub reusable: bool,
    /// Fail `init_app` after registering commands and panels.
    pub fail_init: bool,
    /// Fail `post_engine_init`.
    pub fail_post_engine_init: bool,
    /// Fail `post_context_change`.
    pub fail_post_change: bool,
    /// Panic in `destroy_app`.
    pub panic_on_destroy: bool,
}

impl AppScript {
    /// A script that does nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `names` as commands during init.
    #[must_use]
    pub fn with_commands(mut self, names: &[&str]) -> Self {
        self.commands = names.iter().map(|n| (*n).to_owned()).collect();
        self
    }

    /// Tag every command with `kind`.
    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    /// Register a panel during init.
    #[must_use]
    pub fn with_panel(mut self, panel: impl Into<String>) -> Self {
        self.panel = Some(panel.into());
        self
    }

    /// Support in-place context changes.
    #[must_use]
    pub fn reusable(mut self) -> Self {
        self.reusable = true;
        self
    }

    /// Fail initialization.
    #[must_use]
    pub fn failing_init(mut self) -> Self {
        self.fail_init = true;
        self
    }

    /// Fail `post_context_change`.
    #[must_use]
    pub fn failing_post_change(mut self) -> Self {
        self.fail_post_change = true;
        self
    }

    /// Panic in `destroy_app`.
    #[must_use]
    pub fn panicking_on_destroy(mut self) -> Self {
        self.panic_on_destroy = true;
        self
    }
}

/// An [`App`] driven by an [`AppScript`], journaling every call.
///
/// Entries: `init <instance>`, `post_engine_init <instance>`,
/// `pre_change <instance>`, `post_change <instance> <context>` and
/// `destroy <instance>`.
#[derive(Debug)]
pub struct ScriptedApp {
    instance: String,
    script: AppScript,
    journal: Journal,
}

impl ScriptedApp {
    /// Create an app for `instance`.
    #[must_use]
    pub fn new(instance: impl Into<String>, script: AppScript, journal: Journal) -> Self {
        Self {
            instance: instance.into(),
            script,
            journal,
        }
    }
}

impl App for ScriptedApp {
    fn init_app(&self, ctx: &AppContext<'_>) -> anyhow::Result<()> {
        self.journal.push(format!("init {}", self.instance));
        for name in &self.script.commands {
            let label = format!("{} {name}", self.instance);
            let mut properties = CommandProperties::new();
            if let Some(kind) = &self.script.kind {
                properties = properties.with_kind(kind.clone());
            }
            ctx.register_command(
                name,
                CommandAction::standard(move || Ok(Value::String(label.clone()))),
                properties,
            )?;
        }
        if let Some(panel) = &self.script.panel {
            ctx.register_panel(panel, Arc::new(|| Ok(())), PanelProperties::new())?;
        }
        if self.script.fail_init {
            anyhow::bail!("{} could not reach the server", self.instance);
        }
        Ok(())
    }

    fn post_engine_init(&self, _ctx: &AppContext<'_>) -> anyhow::Result<()> {
        self.journal.push(format!("post_engine_init {}", self.instance));
        if self.script.fail_post_engine_init {
            anyhow::bail!("menu not ready");
        }
        Ok(())
    }

    fn context_change_allowed(&self) -> bool {
        self.script.reusable
    }

    fn pre_context_change(&self, _old: &Context, _new: &Context) -> anyhow::Result<()> {
        self.journal.push(format!("pre_change {}", self.instance));
        Ok(())
    }

    fn post_context_change(&self, _old: &Context, new: &Context) -> anyhow::Result<()> {
        self.journal.push(format!("post_change {} {new}", self.instance));
        if self.script.fail_post_change {
            anyhow::bail!("stale cache");
        }
        Ok(())
    }

    fn destroy_app(&self) -> anyhow::Result<()> {
        self.journal.push(format!("destroy {}", self.instance));
        if self.script.panic_on_destroy {
            panic!("widget already deleted");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Engines
// ---------------------------------------------------------------------------

/// What a [`ScriptedBackend`] does during its lifecycle.
#[derive(Clone, Default)]
pub struct BackendScript {
    /// Allow in-place context changes.
    pub allow_change: bool,
    /// Fail `pre_app_init`.
    pub fail_pre_app_init: bool,
    /// Fail `post_app_init`.
    pub fail_post_app_init: bool,
    /// Forbid metrics dispatch.
    pub block_metrics: bool,
    /// Sink attached to the logging pipeline while the engine runs.
    pub sink: Option<Arc<dyn LogSink>>,
}

impl std::fmt::Debug for BackendScript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendScript")
            .field("allow_change", &self.allow_change)
            .field("fail_pre_app_init", &self.fail_pre_app_init)
            .field("fail_post_app_init", &self.fail_post_app_init)
            .field("block_metrics", &self.block_metrics)
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

impl BackendScript {
    /// Allow in-place context changes.
    #[must_use]
    pub fn switching(mut self) -> Self {
        self.allow_change = true;
        self
    }

    /// Fail `pre_app_init`.
    #[must_use]
    pub fn failing_pre_app_init(mut self) -> Self {
        self.fail_pre_app_init = true;
        self
    }

    /// Mirror log output into `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = Some(sink);
        self
    }
}

/// An [`EngineBackend`] driven by a [`BackendScript`].
///
/// Entries: `pre_app_init`, `post_app_init`, `engine pre_change`,
/// `engine post_change` and `destroy_engine`.
#[derive(Debug)]
pub struct ScriptedBackend {
    script: BackendScript,
    journal: Journal,
}

impl ScriptedBackend {
    /// Create a backend.
    #[must_use]
    pub fn new(script: BackendScript, journal: Journal) -> Self {
        Self { script, journal }
    }
}

impl EngineBackend for ScriptedBackend {
    fn pre_app_init(&self, _engine: &Engine) -> anyhow::Result<()> {
        self.journal.push("pre_app_init");
        if self.script.fail_pre_app_init {
            anyhow::bail!("host application missing");
        }
        Ok(())
    }

    fn post_app_init(&self, _engine: &Engine) -> anyhow::Result<()> {
        self.journal.push("post_app_init");
        if self.script.fail_post_app_init {
            anyhow::bail!("menu bar unavailable");
        }
        Ok(())
    }

    fn pre_context_change(&self, _old: &Context, _new: &Context) -> anyhow::Result<()> {
        self.journal.push("engine pre_change");
        Ok(())
    }

    fn post_context_change(&self, _old: &Context, _new: &Context) -> anyhow::Result<()> {
        self.journal.push("engine post_change");
        Ok(())
    }

    fn destroy_engine(&self) -> anyhow::Result<()> {
        self.journal.push("destroy_engine");
        Ok(())
    }

    fn context_change_allowed(&self) -> bool {
        self.script.allow_change
    }

    fn metrics_dispatch_allowed(&self) -> bool {
        !self.script.block_metrics
    }

    fn log_sink(&self) -> Option<Arc<dyn LogSink>> {
        self.script.sink.clone()
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// A [`DescriptorResolver`] over prebuilt environments, picked by the
/// context's project id.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    environments: Vec<(i64, Arc<Environment>)>,
}

impl StaticResolver {
    /// A resolver knowing no environments.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `environment` for contexts whose project id is `project_id`.
    #[must_use]
    pub fn with_environment(mut self, project_id: i64, environment: Arc<Environment>) -> Self {
        self.environments.push((project_id, environment));
        self
    }
}

impl DescriptorResolver for StaticResolver {
    fn pick_environment(&self, context: &Context) -> RuntimeResult<Option<String>> {
        Ok(context
            .project
            .as_ref()
            .and_then(|p| self.environments.iter().find(|(id, _)| *id == p.id))
            .map(|(_, env)| env.name.clone()))
    }

    fn environment(&self, name: &str, _context: &Context) -> RuntimeResult<Arc<Environment>> {
        self.environments
            .iter()
            .find(|(_, env)| env.name == name)
            .map(|(_, env)| Arc::clone(env))
            .ok_or_else(|| DescriptorError::NotFound(format!("environment '{name}'")).into())
    }
}

// ---------------------------------------------------------------------------
// Telemetry
// ---------------------------------------------------------------------------

/// A [`MetricsTransport`] keeping every batch it was handed.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    batches: Mutex<Vec<Vec<MetricEvent>>>,
    offline: AtomicBool,
}

impl RecordingTransport {
    /// A transport accepting every batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject batches while `offline` is set.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of batches accepted.
    #[must_use]
    pub fn batch_count(&self) -> usize {
        self.batches.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Every accepted event, in dispatch order.
    #[must_use]
    pub fn events(&self) -> Vec<MetricEvent> {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .flatten()
            .cloned()
            .collect()
    }

    /// Actions of the accepted user activity events.
    #[must_use]
    pub fn actions(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                MetricEvent::UserActivity { action, .. } => Some(action),
                MetricEvent::UserAttribute { .. } => None,
            })
            .collect()
    }
}

impl MetricsTransport for RecordingTransport {
    fn send(&self, batch: &[MetricEvent]) -> anyhow::Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            anyhow::bail!("metrics endpoint unreachable");
        }
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(batch.to_vec());
        Ok(())
    }
}

/// A [`LogSink`] keeping every record it receives.
#[derive(Debug, Default)]
pub struct RecordingSink {
    records: Mutex<Vec<LogRecord>>,
}

impl RecordingSink {
    /// An empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the received records.
    #[must_use]
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Whether any record's message contains `needle`.
    #[must_use]
    pub fn saw(&self, needle: &str) -> bool {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|r| r.message.contains(needle))
    }
}

impl LogSink for RecordingSink {
    fn emit(&self, record: &LogRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
    }
}
