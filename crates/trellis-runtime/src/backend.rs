//! Engine backends and bundle loading.
//!
//! A [`BundleLoader`] turns resolved descriptors into behavior: an
//! [`EngineBackend`] for the engine bundle and an [`App`] for each app
//! bundle. [`FactoryLoader`] is a loader assembled from closures keyed by
//! bundle name.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use trellis_telemetry::LogSink;

use crate::app::App;
use crate::context::Context;
use crate::descriptor::Descriptor;
use crate::engine::Engine;

/// Host-specific behavior of an engine.
///
/// Every hook defaults to a no-op. Capabilities are declared explicitly:
/// an engine supports in-place context changes only if
/// [`context_change_allowed`](Self::context_change_allowed) says so, and
/// mirrors log output into its host only if [`log_sink`](Self::log_sink)
/// returns a sink.
pub trait EngineBackend: Send + Sync {
    /// Before any app is loaded.
    ///
    /// # Errors
    ///
    /// A failure aborts engine start.
    fn pre_app_init(&self, _engine: &Engine) -> anyhow::Result<()> {
        Ok(())
    }

    /// After all apps are loaded and their post-init ran.
    ///
    /// # Errors
    ///
    /// A failure aborts engine start.
    fn post_app_init(&self, _engine: &Engine) -> anyhow::Result<()> {
        Ok(())
    }

    /// Before apps are switched to a new context.
    ///
    /// # Errors
    ///
    /// Failures are logged.
    fn pre_context_change(&self, _old: &Context, _new: &Context) -> anyhow::Result<()> {
        Ok(())
    }

    /// After apps were switched to a new context.
    ///
    /// # Errors
    ///
    /// Failures are logged.
    fn post_context_change(&self, _old: &Context, _new: &Context) -> anyhow::Result<()> {
        Ok(())
    }

    /// Release engine resources. Called once at teardown.
    ///
    /// # Errors
    ///
    /// Failures are logged.
    fn destroy_engine(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Whether the engine can switch context without restarting.
    fn context_change_allowed(&self) -> bool {
        false
    }

    /// Whether usage metrics may be dispatched while this engine runs.
    fn metrics_dispatch_allowed(&self) -> bool {
        true
    }

    /// Sink receiving every log record while the engine runs.
    fn log_sink(&self) -> Option<Arc<dyn LogSink>> {
        None
    }
}

/// Instantiates engine and app bundles.
pub trait BundleLoader: Send + Sync {
    /// Create the backend of an engine bundle.
    ///
    /// # Errors
    ///
    /// Returns an error if the bundle cannot be loaded.
    fn load_engine(&self, descriptor: &Descriptor, instance: &str) -> anyhow::Result<Box<dyn EngineBackend>>;

    /// Create the behavior of an app bundle.
    ///
    /// # Errors
    ///
    /// Returns an error if the bundle cannot be loaded.
    fn load_app(&self, descriptor: &Descriptor, instance: &str) -> anyhow::Result<Box<dyn App>>;
}

type EngineFactory = Box<dyn Fn(&Descriptor, &str) -> anyhow::Result<Box<dyn EngineBackend>> + Send + Sync>;
type AppFactory = Box<dyn Fn(&Descriptor, &str) -> anyhow::Result<Box<dyn App>> + Send + Sync>;

/// A [`BundleLoader`] dispatching on bundle name.
#[derive(Default)]
pub struct FactoryLoader {
    engines: HashMap<String, EngineFactory>,
    apps: HashMap<String, AppFactory>,
}

impl fmt::Debug for FactoryLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut engines: Vec<&String> = self.engines.keys().collect();
        let mut apps: Vec<&String> = self.apps.keys().collect();
        engines.sort();
        apps.sort();
        f.debug_struct("FactoryLoader")
            .field("engines", &engines)
            .field("apps", &apps)
            .finish()
    }
}

impl FactoryLoader {
    /// An empty loader.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the factory of an engine bundle.
    #[must_use]
    pub fn with_engine<F>(mut self, bundle: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&Descriptor, &str) -> anyhow::Result<Box<dyn EngineBackend>> + Send + Sync + 'static,
    {
        self.engines.insert(bundle.into(), Box::new(factory));
        self
    }

    /// Register the factory of an app bundle.
    #[must_use]
    pub fn with_app<F>(mut self, bundle: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&Descriptor, &str) -> anyhow::Result<Box<dyn App>> + Send + Sync + 'static,
    {
        self.apps.insert(bundle.into(), Box::new(factory));
        self
    }
}

impl BundleLoader for FactoryLoader {
    fn load_engine(&self, descriptor: &Descriptor, instance: &str) -> anyhow::Result<Box<dyn EngineBackend>> {
        let factory = self
            .engines
            .get(&descriptor.name)
            .ok_or_else(|| anyhow::anyhow!("no engine factory registered for bundle '{}'", descriptor.name))?;
        factory(descriptor, instance)
    }

    fn load_app(&self, descriptor: &Descriptor, instance: &str) -> anyhow::Result<Box<dyn App>> {
        let factory = self
            .apps
            .get(&descriptor.name)
            .ok_or_else(|| anyhow::anyhow!("no app factory registered for bundle '{}'", descriptor.name))?;
        factory(descriptor, instance)
    }
}
