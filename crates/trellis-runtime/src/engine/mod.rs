//! The engine: root runtime instance hosting apps for one session.
//!
//! An engine is built by [`Runtime::start_engine`](crate::Runtime::start_engine),
//! loads the apps its environment declares, keeps them in step with context
//! changes and tears everything down on [`Engine::destroy`].
//!
//! The engine state sits behind a single mutex that is never held while
//! component code runs, so apps may call back into the engine from any hook.

mod load;
mod transition;

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde_json::Value;
use tracing::{debug, error, info, warn};
use trellis_telemetry::SinkId;
use uuid::Uuid;

use crate::CORE_VERSION;
use crate::app::{AppContext, AppInstance};
use crate::backend::EngineBackend;
use crate::command::{Command, CommandAction, CommandMatch, CommandProperties, CommandRegistry, CommandSelector};
use crate::context::Context;
use crate::descriptor::{Descriptor, Settings};
use crate::environment::Environment;
use crate::error::{RuntimeError, RuntimeResult, guarded, panic_message};
use crate::framework::{FrameworkInstance, SharedFrameworks, destroy_owned};
use crate::metrics::{MetricEvent, MetricsDispatcher};
use crate::panel::{Panel, PanelCallback, PanelProperties, PanelRegistry};
use crate::pool::BundlePool;
use crate::runtime::{Services, WeakRuntime};

/// Lifecycle state of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineState {
    /// Built, nothing loaded yet.
    Uninitialized,
    /// Start sequence in progress.
    ComponentsLoading,
    /// Running.
    Ready,
    /// Context change in progress.
    Transitioning,
    /// Torn down. Terminal.
    Destroyed,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::ComponentsLoading => "loading components",
            Self::Ready => "ready",
            Self::Transitioning => "changing context",
            Self::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// What the runtime resolved before building an engine.
pub(crate) struct EngineSeed {
    pub(crate) instance_name: String,
    pub(crate) descriptor: Arc<Descriptor>,
    pub(crate) backend: Box<dyn EngineBackend>,
    pub(crate) context: Context,
    pub(crate) environment: Arc<Environment>,
    pub(crate) settings: Settings,
    pub(crate) frameworks: Vec<Arc<FrameworkInstance>>,
    pub(crate) shared_frameworks: SharedFrameworks,
}

struct EngineInner {
    state: EngineState,
    context: Context,
    environment: Arc<Environment>,
    settings: Settings,
    frameworks: Vec<Arc<FrameworkInstance>>,
    apps: IndexMap<String, Arc<AppInstance>>,
    commands: CommandRegistry,
    panels: PanelRegistry,
    pool: BundlePool,
    initializing: Option<Arc<AppInstance>>,
}

/// A running engine.
pub struct Engine {
    instance_name: String,
    session_id: Uuid,
    started_at: DateTime<Utc>,
    descriptor: Arc<Descriptor>,
    backend: Box<dyn EngineBackend>,
    services: Arc<Services>,
    runtime: WeakRuntime,
    shared_frameworks: SharedFrameworks,
    inner: Mutex<EngineInner>,
    sink: Mutex<Option<SinkId>>,
    dispatcher: Mutex<Option<MetricsDispatcher>>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("instance_name", &self.instance_name)
            .field("bundle", &self.descriptor.name)
            .field("session_id", &self.session_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.descriptor.name, self.descriptor.version)
    }
}

impl Engine {
    pub(crate) fn new(seed: EngineSeed, services: Arc<Services>, runtime: WeakRuntime) -> Self {
        let commands = CommandRegistry::new(seed.instance_name.clone(), services.metrics.clone());
        Self {
            instance_name: seed.instance_name,
            session_id: Uuid::new_v4(),
            started_at: Utc::now(),
            descriptor: seed.descriptor,
            backend: seed.backend,
            services,
            runtime,
            shared_frameworks: seed.shared_frameworks,
            inner: Mutex::new(EngineInner {
                state: EngineState::Uninitialized,
                context: seed.context,
                environment: seed.environment,
                settings: seed.settings,
                frameworks: seed.frameworks,
                apps: IndexMap::new(),
                commands,
                panels: PanelRegistry::new(),
                pool: BundlePool::new(),
                initializing: None,
            }),
            sink: Mutex::new(None),
            dispatcher: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EngineInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: EngineState) {
        let mut inner = self.lock();
        if inner.state != EngineState::Destroyed {
            inner.state = state;
        }
    }

    fn destroyed(&self) -> RuntimeError {
        RuntimeError::AlreadyDestroyed(self.instance_name.clone())
    }

    // ---------------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------------

    /// Instance name from the environment.
    #[must_use]
    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    /// Bundle name of the engine.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// Bundle version of the engine.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.descriptor.version
    }

    /// Engine descriptor.
    #[must_use]
    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    /// Unique id of this engine run.
    #[must_use]
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// When the engine was built.
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        self.lock().state
    }

    /// Whether the engine was torn down.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.state() == EngineState::Destroyed
    }

    /// Current context.
    #[must_use]
    pub fn context(&self) -> Context {
        self.lock().context.clone()
    }

    /// Current environment.
    #[must_use]
    pub fn environment(&self) -> Arc<Environment> {
        Arc::clone(&self.lock().environment)
    }

    /// Validated engine settings.
    #[must_use]
    pub fn settings(&self) -> Settings {
        self.lock().settings.clone()
    }

    /// A single engine setting.
    #[must_use]
    pub fn setting(&self, key: &str) -> Option<Value> {
        self.lock().settings.get(key).cloned()
    }

    /// The engine backend.
    #[must_use]
    pub fn backend(&self) -> &dyn EngineBackend {
        self.backend.as_ref()
    }

    /// Frameworks attached to the engine itself.
    #[must_use]
    pub fn frameworks(&self) -> Vec<Arc<FrameworkInstance>> {
        self.lock().frameworks.clone()
    }

    /// Shared framework instances of this engine.
    #[must_use]
    pub fn shared_frameworks(&self) -> &SharedFrameworks {
        &self.shared_frameworks
    }

    /// Active apps in load order.
    #[must_use]
    pub fn apps(&self) -> Vec<Arc<AppInstance>> {
        self.lock().apps.values().cloned().collect()
    }

    /// An active app by instance name.
    #[must_use]
    pub fn app(&self, instance: &str) -> Option<Arc<AppInstance>> {
        self.lock().apps.get(instance).cloned()
    }

    /// Registered command names in discovery order.
    #[must_use]
    pub fn command_names(&self) -> Vec<String> {
        self.lock().commands.names()
    }

    /// A registered command.
    #[must_use]
    pub fn command(&self, name: &str) -> Option<Command> {
        self.lock().commands.get(name).cloned()
    }

    /// Every registered command with its name, in discovery order.
    #[must_use]
    pub fn commands(&self) -> Vec<(String, Command)> {
        self.lock()
            .commands
            .iter()
            .map(|(name, command)| (name.clone(), command.clone()))
            .collect()
    }

    /// A registered panel.
    #[must_use]
    pub fn panel(&self, id: &str) -> Option<Panel> {
        self.lock().panels.get(id).cloned()
    }

    /// Registered panel ids.
    #[must_use]
    pub fn panel_ids(&self) -> Vec<String> {
        self.lock().panels.iter().map(|p| p.id.clone()).collect()
    }

    /// The pooled app stored for `location` and `instance`.
    #[must_use]
    pub fn pooled_app(&self, location: &Path, instance: &str) -> Option<Arc<AppInstance>> {
        self.lock().pool.get_app(location, instance)
    }

    /// Number of pooled apps.
    #[must_use]
    pub fn pooled_app_count(&self) -> usize {
        self.lock().pool.app_count()
    }

    // ---------------------------------------------------------------------
    // Registration
    // ---------------------------------------------------------------------

    /// Register a command. Returns the name it was stored under, which
    /// carries an owner prefix when the name collides.
    ///
    /// Commands owned by an app inherit its description and icon unless
    /// `properties` sets them.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::AlreadyDestroyed`] after teardown.
    pub fn register_command(
        &self,
        name: &str,
        action: CommandAction,
        mut properties: CommandProperties,
    ) -> RuntimeResult<String> {
        if let Some(app) = &properties.app {
            let descriptor = app.descriptor();
            if properties.description.is_none() {
                properties.description.clone_from(&descriptor.description);
            }
            if properties.icon.is_none() {
                properties.icon.clone_from(&descriptor.icon);
            }
        }

        let mut inner = self.lock();
        if inner.state == EngineState::Destroyed {
            return Err(self.destroyed());
        }
        let key = inner.commands.register(name, action, properties);
        debug!(engine = %self.instance_name, command = %key, "registered command");
        Ok(key)
    }

    /// Register a panel for the app currently initializing. Returns the
    /// panel id.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::NotInInitPhase`] when no app is initializing.
    pub fn register_panel(
        &self,
        panel_name: &str,
        callback: PanelCallback,
        properties: PanelProperties,
    ) -> RuntimeResult<String> {
        let mut inner = self.lock();
        if inner.state == EngineState::Destroyed {
            return Err(self.destroyed());
        }
        let Some(app) = inner.initializing.clone() else {
            return Err(RuntimeError::NotInInitPhase(panel_name.to_owned()));
        };
        let id = inner
            .panels
            .register(app.instance_name(), panel_name, callback, properties);
        debug!(engine = %self.instance_name, app = %app.instance_name(), panel = %id, "registered panel");
        Ok(id)
    }

    /// Commands matching `selectors`. See [`CommandRegistry::match_selectors`].
    #[must_use]
    pub fn match_commands(&self, selectors: &[CommandSelector]) -> Vec<CommandMatch> {
        self.lock().commands.match_selectors(selectors)
    }

    // ---------------------------------------------------------------------
    // Main thread
    // ---------------------------------------------------------------------

    /// Run `f` on the main thread and return its result. Runs in place when
    /// no bridge is configured.
    ///
    /// A worker thread calling this blocks until the main thread serviced
    /// the request; it deadlocks if the main thread waits on that worker.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::MainThreadUnavailable`] if the bridge's pump
    /// was dropped.
    pub fn execute_in_main_thread<F, T>(&self, f: F) -> RuntimeResult<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        match &self.services.bridge {
            Some(bridge) => bridge.invoke(f),
            None => Ok(f()),
        }
    }

    /// Queue `f` for the main thread without waiting. Runs in place when no
    /// bridge is configured. Panics in `f` are logged.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::MainThreadUnavailable`] if the bridge's pump
    /// was dropped.
    pub fn async_execute_in_main_thread<F>(&self, f: F) -> RuntimeResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if let Some(bridge) = &self.services.bridge {
            return bridge.invoke_async(f);
        }
        if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
            error!(
                engine = %self.instance_name,
                panic = %panic_message(payload.as_ref()),
                "asynchronous main thread invocation panicked"
            );
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Metrics
    // ---------------------------------------------------------------------

    /// Queue a usage metric for the engine.
    pub fn log_metric(&self, action: &str) {
        if let Some(queue) = &self.services.metrics {
            queue.push(MetricEvent::user_activity(
                self.name(),
                format!("{} {action}", self.name()),
            ));
        }
    }

    /// Queue a user attribute metric.
    pub fn log_user_attribute_metric(&self, name: &str, value: &str) {
        if let Some(queue) = &self.services.metrics {
            queue.push(MetricEvent::user_attribute(name, value));
        }
    }

    // ---------------------------------------------------------------------
    // Start
    // ---------------------------------------------------------------------

    pub(crate) fn initialize(&self) -> RuntimeResult<()> {
        info!(
            engine = %self.instance_name,
            bundle = %self.descriptor.name,
            version = %self.descriptor.version,
            session = %self.session_id,
            "starting engine"
        );
        self.attach_log_sink();
        if self.setting("debug_logging").and_then(|v| v.as_bool()) == Some(true) {
            self.set_global_debug(true);
        }
        self.set_state(EngineState::ComponentsLoading);

        if let Err(e) = guarded(&self.instance_name, "pre_app_init", || self.backend.pre_app_init(self)) {
            self.teardown();
            return Err(RuntimeError::Init(e.to_string()));
        }

        self.load_apps(None);
        self.run_post_engine_inits();

        if let Err(e) = guarded(&self.instance_name, "post_app_init", || self.backend.post_app_init(self)) {
            self.teardown();
            return Err(RuntimeError::Init(e.to_string()));
        }

        if let Err(e) = guarded("core", "engine_init", || self.services.hooks.engine_init(self)) {
            error!(engine = %self.instance_name, error = %e, "core hook failed");
        }

        self.log_metric("Init");
        self.log_user_attribute_metric("trellis core version", CORE_VERSION);
        self.log_user_attribute_metric(&format!("{} version", self.name()), self.version());
        self.start_metrics_dispatcher();

        self.set_state(EngineState::Ready);
        let inner = self.lock();
        info!(
            engine = %self.instance_name,
            apps = inner.apps.len(),
            commands = inner.commands.len(),
            "engine ready"
        );
        Ok(())
    }

    fn attach_log_sink(&self) {
        let (Some(log), Some(sink)) = (&self.services.log, self.backend.log_sink()) else {
            return;
        };
        let id = log.attach_sink(sink);
        debug!(engine = %self.instance_name, sink = %id, "attached log sink");
        *self.sink.lock().unwrap_or_else(PoisonError::into_inner) = Some(id);
    }

    fn detach_log_sink(&self) {
        let id = self.sink.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let (Some(log), Some(id)) = (&self.services.log, id) {
            log.detach_sink(id);
        }
    }

    fn has_log_sink(&self) -> bool {
        self.sink.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    fn set_global_debug(&self, enabled: bool) {
        if let Some(log) = &self.services.log
            && let Err(e) = log.set_global_debug(enabled)
        {
            warn!(engine = %self.instance_name, error = %e, "cannot change the log level");
        }
    }

    fn start_metrics_dispatcher(&self) {
        let (Some(queue), Some(transport)) = (&self.services.metrics, &self.services.transport) else {
            return;
        };
        if !self.backend.metrics_dispatch_allowed() {
            debug!(engine = %self.instance_name, "engine does not allow metrics dispatch");
            return;
        }
        match MetricsDispatcher::start(queue.clone(), Arc::clone(transport), &self.services.metrics_settings) {
            Ok(dispatcher) => {
                *self.dispatcher.lock().unwrap_or_else(PoisonError::into_inner) = Some(dispatcher);
            },
            Err(e) => warn!(engine = %self.instance_name, error = %e, "cannot start metrics dispatcher"),
        }
    }

    /// Whether the metrics dispatcher runs.
    #[must_use]
    pub fn is_dispatching_metrics(&self) -> bool {
        self.dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(MetricsDispatcher::is_running)
    }

    fn run_post_engine_inits(&self) {
        for app in self.apps() {
            let result = guarded(app.instance_name(), "post_engine_init", || {
                app.behavior().post_engine_init(&AppContext::new(self, &app))
            });
            app.set_init_incomplete(result.is_err());
            if let Err(e) = result {
                error!(
                    engine = %self.instance_name,
                    app = %app.instance_name(),
                    error = %e,
                    "app is loaded but may not be fully initialized"
                );
            }
        }
    }

    /// Engine-owned commands: debug toggle, log folder and reload.
    fn register_builtin_commands(&self) {
        let menu = || CommandProperties::new().with_kind("context_menu");
        let mut builtins: Vec<(&str, CommandAction, CommandProperties)> = Vec::new();

        if let Some(log) = self.services.log.clone()
            && self.has_log_sink()
        {
            builtins.push((
                "Toggle Debug Logging",
                CommandAction::standard(move || {
                    let enabled = !log.global_debug();
                    log.set_global_debug(enabled)?;
                    info!(enabled, "debug logging toggled");
                    Ok(Value::Bool(enabled))
                }),
                menu().with_short_name("toggle_debug"),
            ));
        }

        if let Some(log) = self.services.log.clone()
            && log.log_folder().is_some()
        {
            builtins.push((
                "Open Log Folder",
                CommandAction::standard(move || {
                    let folder = log.log_folder().map(|p| p.display().to_string());
                    info!(folder = ?folder, "log folder");
                    Ok(folder.map_or(Value::Null, Value::String))
                }),
                menu().with_short_name("open_log_folder"),
            ));
        }

        if self.lock().apps.values().any(|app| app.descriptor().dev) {
            let runtime = self.runtime.clone();
            builtins.push((
                "Reload and Restart",
                CommandAction::standard(move || {
                    let runtime = runtime
                        .upgrade()
                        .ok_or_else(|| anyhow::anyhow!("the runtime is gone"))?;
                    let engine = runtime.restart_engine(None)?;
                    Ok(Value::String(engine.instance_name().to_owned()))
                }),
                menu().with_short_name("restart"),
            ));
        }

        for (name, action, properties) in builtins {
            if let Err(e) = self.register_command(name, action, properties) {
                warn!(engine = %self.instance_name, command = name, error = %e, "cannot register command");
            }
        }
    }

    // ---------------------------------------------------------------------
    // Teardown
    // ---------------------------------------------------------------------

    /// Tear the engine down and clear the runtime slot.
    ///
    /// Component failures during teardown are logged and never interrupt it.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::AlreadyDestroyed`] on a second call.
    pub fn destroy(&self) -> RuntimeResult<()> {
        if self.teardown() {
            Ok(())
        } else {
            Err(self.destroyed())
        }
    }

    /// Destroy an app and the frameworks it owns. Failures are logged.
    fn retire_app(&self, app: &AppInstance) {
        destroy_owned(&app.replace_frameworks(Vec::new()));
        if let Err(e) = guarded(app.instance_name(), "destroy_app", || app.behavior().destroy_app()) {
            error!(engine = %self.instance_name, app = %app.instance_name(), error = %e, "app failed to shut down");
        }
    }

    /// Returns `false` if the engine was already destroyed.
    fn teardown(&self) -> bool {
        let (frameworks, apps) = {
            let mut inner = self.lock();
            if inner.state == EngineState::Destroyed {
                return false;
            }
            inner.state = EngineState::Destroyed;
            inner.initializing = None;

            let mut apps: Vec<Arc<AppInstance>> = inner.apps.values().cloned().collect();
            let pooled: Vec<Arc<AppInstance>> = inner
                .pool
                .app_keys()
                .filter_map(|key| inner.pool.get(key))
                .collect();
            for app in pooled {
                if !apps.iter().any(|a| Arc::ptr_eq(a, &app)) {
                    apps.push(app);
                }
            }
            (std::mem::take(&mut inner.frameworks), apps)
        };
        info!(engine = %self.instance_name, "destroying engine");

        destroy_owned(&frameworks);
        self.shared_frameworks.destroy_all();

        for app in &apps {
            self.retire_app(app);
        }

        if let Err(e) = guarded(&self.instance_name, "destroy_engine", || self.backend.destroy_engine()) {
            error!(engine = %self.instance_name, error = %e, "engine failed to shut down");
        }

        if let Some(runtime) = self.runtime.upgrade() {
            runtime.release(self);
        }
        if let Err(e) = guarded("core", "clear_caches", || {
            self.services.hooks.clear_caches();
            Ok(())
        }) {
            error!(engine = %self.instance_name, error = %e, "core hook failed");
        }

        {
            let mut inner = self.lock();
            inner.apps.clear();
            inner.commands.clear();
            inner.panels.clear();
            inner.pool.clear();
        }

        if let Some(mut dispatcher) = self.dispatcher.lock().unwrap_or_else(PoisonError::into_inner).take() {
            dispatcher.stop();
        }
        info!(engine = %self.instance_name, session = %self.session_id, "engine destroyed");
        self.detach_log_sink();
        true
    }
}

#[cfg(test)]
mod tests;
