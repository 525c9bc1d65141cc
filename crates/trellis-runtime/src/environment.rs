//! Environments: the configuration scope selected for a context.

use std::sync::Arc;

use indexmap::IndexMap;

use crate::descriptor::{Descriptor, Settings};

/// An app instance declared for an engine.
#[derive(Debug, Clone, PartialEq)]
pub struct AppEntry {
    /// Instance name, unique within the engine.
    pub instance: String,
    /// Bundle implementing the app.
    pub descriptor: Arc<Descriptor>,
    /// Raw settings.
    pub settings: Settings,
}

impl AppEntry {
    /// Declare an app instance without settings.
    #[must_use]
    pub fn new(instance: impl Into<String>, descriptor: Arc<Descriptor>) -> Self {
        Self {
            instance: instance.into(),
            descriptor,
            settings: Settings::new(),
        }
    }

    /// Set the raw settings.
    #[must_use]
    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }
}

/// An engine instance declared in an environment.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineEntry {
    /// Instance name.
    pub instance: String,
    /// Bundle implementing the engine.
    pub descriptor: Arc<Descriptor>,
    /// Raw engine settings.
    pub settings: Settings,
    /// Apps in declared load order.
    pub apps: Vec<AppEntry>,
}

impl EngineEntry {
    /// Declare an engine instance without settings or apps.
    #[must_use]
    pub fn new(instance: impl Into<String>, descriptor: Arc<Descriptor>) -> Self {
        Self {
            instance: instance.into(),
            descriptor,
            settings: Settings::new(),
            apps: Vec::new(),
        }
    }

    /// Set the raw settings.
    #[must_use]
    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Append an app to the load order.
    #[must_use]
    pub fn with_app(mut self, app: AppEntry) -> Self {
        self.apps.push(app);
        self
    }

    /// Look up an app instance.
    #[must_use]
    pub fn app(&self, instance: &str) -> Option<&AppEntry> {
        self.apps.iter().find(|a| a.instance == instance)
    }
}

/// A framework instance available to the bundles of an environment.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameworkEntry {
    /// Instance name.
    pub instance: String,
    /// Bundle implementing the framework.
    pub descriptor: Arc<Descriptor>,
    /// Raw settings.
    pub settings: Settings,
}

impl FrameworkEntry {
    /// Declare a framework instance without settings.
    #[must_use]
    pub fn new(instance: impl Into<String>, descriptor: Arc<Descriptor>) -> Self {
        Self {
            instance: instance.into(),
            descriptor,
            settings: Settings::new(),
        }
    }
}

/// A named configuration scope.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Environment {
    /// Environment name.
    pub name: String,
    /// Human readable description.
    pub description: Option<String>,
    /// Engine instances keyed by instance name.
    pub engines: IndexMap<String, EngineEntry>,
    /// Framework instances keyed by instance name.
    pub frameworks: IndexMap<String, FrameworkEntry>,
}

impl Environment {
    /// An empty environment.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Add an engine instance.
    #[must_use]
    pub fn with_engine(mut self, engine: EngineEntry) -> Self {
        self.engines.insert(engine.instance.clone(), engine);
        self
    }

    /// Add a framework instance.
    #[must_use]
    pub fn with_framework(mut self, framework: FrameworkEntry) -> Self {
        self.frameworks.insert(framework.instance.clone(), framework);
        self
    }

    /// Look up an engine instance.
    #[must_use]
    pub fn engine(&self, instance: &str) -> Option<&EngineEntry> {
        self.engines.get(instance)
    }

    /// Look up a framework instance.
    #[must_use]
    pub fn framework(&self, instance: &str) -> Option<&FrameworkEntry> {
        self.frameworks.get(instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_and_order() {
        let app = Arc::new(Descriptor::new("tk-multi-publish", "/b/publish"));
        let env = Environment::new("project").with_engine(
            EngineEntry::new("tk-desktop", Arc::new(Descriptor::new("tk-desktop", "/b/desktop")))
                .with_app(AppEntry::new("publish", Arc::clone(&app)))
                .with_app(AppEntry::new("loader", app)),
        );

        let engine = env.engine("tk-desktop").unwrap();
        let order: Vec<&str> = engine.apps.iter().map(|a| a.instance.as_str()).collect();
        assert_eq!(order, vec!["publish", "loader"]);
        assert!(engine.app("loader").is_some());
        assert!(env.engine("tk-maya").is_none());
        assert!(env.framework("tk-framework-qt").is_none());
    }
}
