//! The process-wide engine slot.
//!
//! A [`Runtime`] owns the services engines are built from (resolver, loader,
//! validator, hooks, logging, metrics, main-thread bridge) and holds at most
//! one running [`Engine`]. The host creates it once and passes it around;
//! there is no ambient global.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError, Weak};

use tracing::{debug, error, info};
use trellis_config::Config;
use trellis_telemetry::LogHandle;

use crate::CORE_VERSION;
use crate::backend::BundleLoader;
use crate::bridge::MainThreadBridge;
use crate::context::Context;
use crate::descriptor::Settings;
use crate::engine::{Engine, EngineSeed};
use crate::error::{RuntimeError, RuntimeResult, guarded};
use crate::framework::{FrameworkFactory, InertFrameworkFactory, SharedFrameworks, setup_frameworks};
use crate::hooks::{CoreHooks, NoopHooks};
use crate::metrics::{MetricsQueue, MetricsSettings, MetricsTransport};
use crate::resolver::{ConfigResolver, DescriptorResolver};
use crate::validation::{
    CurrentPlatform, HostPlatform, SchemaValidator, SettingsValidator, validate_context, validate_platform,
};

/// Everything an engine needs from its surroundings.
pub(crate) struct Services {
    pub(crate) resolver: Arc<dyn DescriptorResolver>,
    pub(crate) loader: Arc<dyn BundleLoader>,
    pub(crate) validator: Arc<dyn SettingsValidator>,
    pub(crate) platform: Arc<dyn HostPlatform>,
    pub(crate) frameworks: Arc<dyn FrameworkFactory>,
    pub(crate) hooks: Arc<dyn CoreHooks>,
    pub(crate) log: Option<LogHandle>,
    pub(crate) metrics: Option<MetricsQueue>,
    pub(crate) metrics_settings: MetricsSettings,
    pub(crate) transport: Option<Arc<dyn MetricsTransport>>,
    pub(crate) bridge: Option<MainThreadBridge>,
}

/// Builder for [`Runtime`].
pub struct RuntimeBuilder {
    resolver: Arc<dyn DescriptorResolver>,
    loader: Arc<dyn BundleLoader>,
    validator: Arc<dyn SettingsValidator>,
    platform: Arc<dyn HostPlatform>,
    frameworks: Arc<dyn FrameworkFactory>,
    hooks: Arc<dyn CoreHooks>,
    log: Option<LogHandle>,
    metrics_settings: MetricsSettings,
    transport: Option<Arc<dyn MetricsTransport>>,
    bridge: Option<MainThreadBridge>,
}

impl fmt::Debug for RuntimeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeBuilder")
            .field("metrics_settings", &self.metrics_settings)
            .field("has_transport", &self.transport.is_some())
            .field("has_bridge", &self.bridge.is_some())
            .finish_non_exhaustive()
    }
}

impl RuntimeBuilder {
    /// Start from a configuration file: descriptors come from a
    /// [`ConfigResolver`] and metrics tunables from its `[runtime]` section.
    #[must_use]
    pub fn from_config(config: &Config, loader: Arc<dyn BundleLoader>) -> Self {
        Runtime::builder(Arc::new(ConfigResolver::new(config.clone())), loader)
            .with_metrics_settings(MetricsSettings::from(&config.runtime))
    }

    /// Replace the [`SchemaValidator`].
    #[must_use]
    pub fn with_validator(mut self, validator: Arc<dyn SettingsValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// Replace the [`CurrentPlatform`].
    #[must_use]
    pub fn with_platform(mut self, platform: Arc<dyn HostPlatform>) -> Self {
        self.platform = platform;
        self
    }

    /// Replace the [`InertFrameworkFactory`].
    #[must_use]
    pub fn with_framework_factory(mut self, factory: Arc<dyn FrameworkFactory>) -> Self {
        self.frameworks = factory;
        self
    }

    /// Install process-level hooks.
    #[must_use]
    pub fn with_hooks(mut self, hooks: Arc<dyn CoreHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Metrics tunables.
    #[must_use]
    pub fn with_metrics_settings(mut self, settings: MetricsSettings) -> Self {
        self.metrics_settings = settings;
        self
    }

    /// Where metric batches go. Without one, events are queued but never sent.
    #[must_use]
    pub fn with_metrics_transport(mut self, transport: Arc<dyn MetricsTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Route main-thread invocations through `bridge`. Without one they run
    /// in place on the calling thread.
    #[must_use]
    pub fn with_main_thread_bridge(mut self, bridge: MainThreadBridge) -> Self {
        self.bridge = Some(bridge);
        self
    }

    /// The handle returned by `setup_logging`, enabling the debug toggle and
    /// engine log sinks.
    #[must_use]
    pub fn with_log_handle(mut self, log: LogHandle) -> Self {
        self.log = Some(log);
        self
    }

    /// Build the runtime.
    #[must_use]
    pub fn build(self) -> Runtime {
        let metrics = self
            .metrics_settings
            .enabled
            .then(|| MetricsQueue::new(self.metrics_settings.queue_capacity));
        let services = Services {
            resolver: self.resolver,
            loader: self.loader,
            validator: self.validator,
            platform: self.platform,
            frameworks: self.frameworks,
            hooks: self.hooks,
            log: self.log,
            metrics,
            metrics_settings: self.metrics_settings,
            transport: self.transport,
            bridge: self.bridge,
        };
        Runtime {
            inner: Arc::new(RuntimeInner {
                services: Arc::new(services),
                current: Mutex::new(None),
                start_lock: Mutex::new(()),
            }),
        }
    }
}

struct RuntimeInner {
    services: Arc<Services>,
    current: Mutex<Option<Arc<Engine>>>,
    start_lock: Mutex<()>,
}

/// Owner of the single running engine.
///
/// Cloning is cheap; clones share the slot.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("current", &self.current_engine().map(|e| e.instance_name().to_owned()))
            .finish_non_exhaustive()
    }
}

/// An app entry found by [`Runtime::find_app_settings`].
#[derive(Debug, Clone, PartialEq)]
pub struct AppSettingsMatch {
    /// Engine instance declaring the app.
    pub engine_instance: String,
    /// App instance name.
    pub app_instance: String,
    /// Validated settings.
    pub settings: Settings,
}

impl Runtime {
    /// Begin building a runtime around a resolver and a loader.
    #[must_use]
    pub fn builder(resolver: Arc<dyn DescriptorResolver>, loader: Arc<dyn BundleLoader>) -> RuntimeBuilder {
        RuntimeBuilder {
            resolver,
            loader,
            validator: Arc::new(SchemaValidator),
            platform: Arc::new(CurrentPlatform),
            frameworks: Arc::new(InertFrameworkFactory),
            hooks: Arc::new(NoopHooks),
            log: None,
            metrics_settings: MetricsSettings::default(),
            transport: None,
            bridge: None,
        }
    }

    /// The running engine, if any.
    #[must_use]
    pub fn current_engine(&self) -> Option<Arc<Engine>> {
        self.slot().clone()
    }

    /// The log handle engines use.
    #[must_use]
    pub fn log_handle(&self) -> Option<&LogHandle> {
        self.inner.services.log.as_ref()
    }

    /// The metrics queue, when metrics are enabled.
    #[must_use]
    pub fn metrics_queue(&self) -> Option<&MetricsQueue> {
        self.inner.services.metrics.as_ref()
    }

    /// The main-thread bridge, when one is configured.
    #[must_use]
    pub fn main_thread_bridge(&self) -> Option<&MainThreadBridge> {
        self.inner.services.bridge.as_ref()
    }

    /// Start engine `name` in `context` and make it the running engine.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Init`] if an engine is already running, the
    /// engine cannot be located or checked, or its start hooks fail, and
    /// [`RuntimeError::Config`] if its settings do not validate.
    pub fn start_engine(&self, name: &str, context: Context) -> RuntimeResult<Arc<Engine>> {
        let _start = self.lock_start()?;
        if let Some(current) = self.current_engine() {
            return Err(RuntimeError::Init(format!(
                "engine '{}' is already running, destroy it before starting '{name}'",
                current.instance_name()
            )));
        }
        self.launch(name, context, None)
    }

    /// Destroy the running engine and start it again in `context`, or in
    /// its current context when `None`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Init`] if no engine is running, plus anything
    /// [`start_engine`](Self::start_engine) returns.
    pub fn restart_engine(&self, context: Option<Context>) -> RuntimeResult<Arc<Engine>> {
        let _start = self.lock_start()?;
        let current = self
            .current_engine()
            .ok_or_else(|| RuntimeError::Init("no engine is running".to_owned()))?;
        let name = current.instance_name().to_owned();
        let previous = current.context();
        let context = context.unwrap_or_else(|| previous.clone());

        info!(engine = %name, context = %context, "restarting engine");
        current.destroy()?;
        drop(current);
        self.launch(&name, context, Some(previous))
    }

    /// Install location of engine `name` in the environment of `context`.
    ///
    /// # Errors
    ///
    /// Returns an error if the environment cannot be resolved.
    pub fn engine_path(&self, name: &str, context: &Context) -> RuntimeResult<Option<PathBuf>> {
        let resolver = &self.inner.services.resolver;
        let Some(env_name) = resolver.pick_environment(context)? else {
            return Ok(None);
        };
        let environment = resolver.environment(&env_name, context)?;
        Ok(environment.engine(name).map(|e| e.descriptor.location.clone()))
    }

    /// Settings of every `app_bundle` instance declared under an
    /// `engine_bundle` engine in the environment of `context`. Entries whose
    /// settings do not validate are left out.
    ///
    /// # Errors
    ///
    /// Returns an error if the environment cannot be resolved.
    pub fn find_app_settings(
        &self,
        engine_bundle: &str,
        app_bundle: &str,
        context: &Context,
        engine_instance: Option<&str>,
    ) -> RuntimeResult<Vec<AppSettingsMatch>> {
        let services = &self.inner.services;
        let Some(env_name) = services.resolver.pick_environment(context)? else {
            return Ok(Vec::new());
        };
        let environment = services.resolver.environment(&env_name, context)?;

        let mut found = Vec::new();
        for (instance, engine) in &environment.engines {
            if engine.descriptor.name != engine_bundle || engine_instance.is_some_and(|wanted| wanted != instance) {
                continue;
            }
            for app in engine.apps.iter().filter(|a| a.descriptor.name == app_bundle) {
                match services
                    .validator
                    .validate(&app.instance, &app.descriptor.schema, &app.settings, context)
                {
                    Ok(settings) => found.push(AppSettingsMatch {
                        engine_instance: instance.clone(),
                        app_instance: app.instance.clone(),
                        settings,
                    }),
                    Err(e) => debug!(engine = %instance, app = %app.instance, error = %e, "skipping app with invalid settings"),
                }
            }
        }
        Ok(found)
    }

    pub(crate) fn downgrade(&self) -> WeakRuntime {
        WeakRuntime(Arc::downgrade(&self.inner))
    }

    /// Empty the slot if it holds `engine`.
    pub(crate) fn release(&self, engine: &Engine) {
        let mut slot = self.slot();
        if slot.as_ref().is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), engine)) {
            *slot = None;
            debug!(engine = %engine.instance_name(), "engine slot cleared");
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<Arc<Engine>>> {
        self.inner.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_start(&self) -> RuntimeResult<MutexGuard<'_, ()>> {
        match self.inner.start_lock.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => Err(RuntimeError::Init("another engine start is in progress".to_owned())),
        }
    }

    fn launch(&self, name: &str, context: Context, previous: Option<Context>) -> RuntimeResult<Arc<Engine>> {
        let services = &self.inner.services;

        let env_name = services.resolver.pick_environment(&context)?.ok_or_else(|| {
            RuntimeError::Init(format!(
                "cannot determine an environment for context ({context}), the context is not sufficiently detailed"
            ))
        })?;
        let environment = services
            .resolver
            .environment(&env_name, &context)
            .map_err(|e| RuntimeError::Init(format!("cannot load environment '{env_name}': {e}")))?;
        let entry = environment.engine(name).ok_or_else(|| {
            RuntimeError::Init(format!("engine '{name}' is not configured in environment '{env_name}'"))
        })?;
        let descriptor = Arc::clone(&entry.descriptor);

        descriptor
            .ensure_local()
            .and_then(|()| descriptor.check_version_constraints(CORE_VERSION))
            .map_err(|e| RuntimeError::Init(e.to_string()))?;
        validate_context(&descriptor, &context)
            .and_then(|()| validate_platform(services.platform.as_ref(), &descriptor))
            .map_err(|e| RuntimeError::Init(e.to_string()))?;
        let settings = services
            .validator
            .validate(name, &descriptor.schema, &entry.settings, &context)?;

        let backend = guarded(name, "load_engine", || services.loader.load_engine(&descriptor, name))
            .map_err(|e| RuntimeError::Init(e.to_string()))?;
        let shared_frameworks = SharedFrameworks::default();
        let frameworks = match setup_frameworks(
            name,
            &descriptor,
            &environment,
            services.frameworks.as_ref(),
            &shared_frameworks,
        ) {
            Ok(frameworks) => frameworks,
            Err(e) => {
                shared_frameworks.destroy_all();
                return Err(RuntimeError::Init(e.to_string()));
            },
        };

        if let Err(e) = guarded("core", "pre_context_change", || {
            services.hooks.pre_context_change(previous.as_ref(), &context)
        }) {
            error!(error = %e, "core hook failed");
        }

        let engine = Arc::new(Engine::new(
            EngineSeed {
                instance_name: name.to_owned(),
                descriptor,
                backend,
                context: context.clone(),
                environment: Arc::clone(&environment),
                settings,
                frameworks,
                shared_frameworks,
            },
            Arc::clone(services),
            self.downgrade(),
        ));
        engine.initialize()?;
        *self.slot() = Some(Arc::clone(&engine));

        if let Err(e) = guarded("core", "post_context_change", || {
            services.hooks.post_context_change(previous.as_ref(), &context)
        }) {
            error!(error = %e, "core hook failed");
        }
        Ok(engine)
    }
}

/// Non-owning handle to a [`Runtime`], held by its engines.
#[derive(Clone, Default)]
pub(crate) struct WeakRuntime(Weak<RuntimeInner>);

impl WeakRuntime {
    pub(crate) fn upgrade(&self) -> Option<Runtime> {
        self.0.upgrade().map(|inner| Runtime { inner })
    }
}
