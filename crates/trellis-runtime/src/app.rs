//! Apps: the components an engine loads.
//!
//! An [`App`] is the behavior written by a bundle author. The engine wraps
//! it in an [`AppInstance`] carrying the instance name, descriptor, settings
//! and context the app runs with. Instances are shared through `Arc`: the
//! active app map and the bundle pool may hold the same instance.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde_json::Value;

use crate::command::{CommandAction, CommandProperties};
use crate::context::Context;
use crate::descriptor::{Descriptor, Settings};
use crate::engine::Engine;
use crate::error::RuntimeResult;
use crate::framework::FrameworkInstance;
use crate::panel::{PanelCallback, PanelProperties};
use crate::pool::PoolKey;

/// Behavior of an app bundle.
pub trait App: Send + Sync {
    /// Initialize the app. Commands and panels are registered here.
    ///
    /// # Errors
    ///
    /// A failure skips the app; anything it registered is removed.
    fn init_app(&self, ctx: &AppContext<'_>) -> anyhow::Result<()>;

    /// Called once every app of the engine is initialized.
    ///
    /// # Errors
    ///
    /// A failure is logged; the app stays loaded but is flagged as not
    /// fully initialized.
    fn post_engine_init(&self, _ctx: &AppContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Whether the app can follow a context change without being rebuilt.
    fn context_change_allowed(&self) -> bool {
        false
    }

    /// Before the engine switches context.
    ///
    /// # Errors
    ///
    /// Failures are logged.
    fn pre_context_change(&self, _old: &Context, _new: &Context) -> anyhow::Result<()> {
        Ok(())
    }

    /// After the app was moved to the new context in place.
    ///
    /// # Errors
    ///
    /// A failure makes the engine rebuild the app from scratch.
    fn post_context_change(&self, _old: &Context, _new: &Context) -> anyhow::Result<()> {
        Ok(())
    }

    /// Release resources at engine teardown.
    ///
    /// # Errors
    ///
    /// Failures are logged.
    fn destroy_app(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A loaded app.
pub struct AppInstance {
    instance_name: String,
    engine_name: String,
    descriptor: RwLock<Arc<Descriptor>>,
    settings: RwLock<Settings>,
    context: RwLock<Context>,
    frameworks: Mutex<Vec<Arc<FrameworkInstance>>>,
    init_incomplete: AtomicBool,
    behavior: Box<dyn App>,
}

impl fmt::Debug for AppInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppInstance")
            .field("instance_name", &self.instance_name)
            .field("engine", &self.engine_name)
            .field("bundle", &self.descriptor().name)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for AppInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.instance_name, self.descriptor().name)
    }
}

impl AppInstance {
    pub(crate) fn new(
        instance_name: impl Into<String>,
        engine_name: impl Into<String>,
        descriptor: Arc<Descriptor>,
        settings: Settings,
        context: Context,
        behavior: Box<dyn App>,
    ) -> Self {
        Self {
            instance_name: instance_name.into(),
            engine_name: engine_name.into(),
            descriptor: RwLock::new(descriptor),
            settings: RwLock::new(settings),
            context: RwLock::new(context),
            frameworks: Mutex::new(Vec::new()),
            init_incomplete: AtomicBool::new(false),
            behavior,
        }
    }

    /// Instance name from the environment.
    #[must_use]
    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    /// Instance name of the engine that loaded the app.
    #[must_use]
    pub fn engine_name(&self) -> &str {
        &self.engine_name
    }

    /// Current descriptor.
    #[must_use]
    pub fn descriptor(&self) -> Arc<Descriptor> {
        Arc::clone(&self.descriptor.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Current validated settings.
    #[must_use]
    pub fn settings(&self) -> Settings {
        self.settings.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// A single setting.
    #[must_use]
    pub fn setting(&self, key: &str) -> Option<Value> {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// The context the app currently runs in.
    #[must_use]
    pub fn context(&self) -> Context {
        self.context.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Frameworks attached to the app.
    #[must_use]
    pub fn frameworks(&self) -> Vec<Arc<FrameworkInstance>> {
        self.frameworks.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Whether `post_engine_init` failed for this app.
    #[must_use]
    pub fn is_init_incomplete(&self) -> bool {
        self.init_incomplete.load(Ordering::SeqCst)
    }

    /// Whether the app can follow context changes in place.
    #[must_use]
    pub fn supports_context_change(&self) -> bool {
        self.behavior.context_change_allowed()
    }

    /// The app behavior.
    #[must_use]
    pub fn behavior(&self) -> &dyn App {
        self.behavior.as_ref()
    }

    /// Bundle pool key: install location and instance name.
    #[must_use]
    pub fn pool_key(&self) -> PoolKey {
        PoolKey::new(self.install_location(), self.instance_name.clone())
    }

    /// Install location of the current descriptor.
    #[must_use]
    pub fn install_location(&self) -> PathBuf {
        self.descriptor().location.clone()
    }

    pub(crate) fn update(&self, descriptor: Arc<Descriptor>, settings: Settings, context: Context) {
        *self.descriptor.write().unwrap_or_else(PoisonError::into_inner) = descriptor;
        *self.settings.write().unwrap_or_else(PoisonError::into_inner) = settings;
        *self.context.write().unwrap_or_else(PoisonError::into_inner) = context;
    }

    pub(crate) fn set_init_incomplete(&self, incomplete: bool) {
        self.init_incomplete.store(incomplete, Ordering::SeqCst);
    }

    pub(crate) fn replace_frameworks(&self, frameworks: Vec<Arc<FrameworkInstance>>) -> Vec<Arc<FrameworkInstance>> {
        std::mem::replace(
            &mut *self.frameworks.lock().unwrap_or_else(PoisonError::into_inner),
            frameworks,
        )
    }
}

/// What an app sees of the engine while one of its hooks runs.
pub struct AppContext<'a> {
    engine: &'a Engine,
    app: &'a Arc<AppInstance>,
}

impl fmt::Debug for AppContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppContext")
            .field("engine", &self.engine.instance_name())
            .field("app", &self.app.instance_name())
            .finish()
    }
}

impl<'a> AppContext<'a> {
    pub(crate) fn new(engine: &'a Engine, app: &'a Arc<AppInstance>) -> Self {
        Self { engine, app }
    }

    /// The hosting engine.
    #[must_use]
    pub fn engine(&self) -> &'a Engine {
        self.engine
    }

    /// The app instance.
    #[must_use]
    pub fn app(&self) -> &'a Arc<AppInstance> {
        self.app
    }

    /// Shorthand for the app's instance name.
    #[must_use]
    pub fn instance_name(&self) -> &str {
        self.app.instance_name()
    }

    /// Shorthand for the app's settings.
    #[must_use]
    pub fn settings(&self) -> Settings {
        self.app.settings()
    }

    /// Shorthand for the app's context.
    #[must_use]
    pub fn context(&self) -> Context {
        self.app.context()
    }

    /// Register a command owned by this app. Returns the registered name.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::AlreadyDestroyed`](crate::RuntimeError::AlreadyDestroyed)
    /// if the engine was torn down.
    pub fn register_command(
        &self,
        name: &str,
        action: CommandAction,
        properties: CommandProperties,
    ) -> RuntimeResult<String> {
        self.engine
            .register_command(name, action, properties.owned_by(Arc::clone(self.app)))
    }

    /// Register a panel. Only valid while the app initializes.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::NotInInitPhase`](crate::RuntimeError::NotInInitPhase)
    /// outside of `init_app`.
    pub fn register_panel(
        &self,
        panel_name: &str,
        callback: PanelCallback,
        properties: PanelProperties,
    ) -> RuntimeResult<String> {
        self.engine.register_panel(panel_name, callback, properties)
    }
}
