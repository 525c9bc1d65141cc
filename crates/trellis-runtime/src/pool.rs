//! The bundle pool: app instances and their commands kept across context
//! changes.
//!
//! The pool never evicts. An app that is not active in the current context
//! stays pooled so that switching back to a context using it can reuse the
//! instance instead of running its initialization again.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexMap;

use crate::app::AppInstance;
use crate::command::Command;

/// Pool key of an app instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolKey {
    /// Install location of the app bundle.
    pub location: PathBuf,
    /// Instance name of the app.
    pub instance: String,
}

impl PoolKey {
    /// Build a key.
    #[must_use]
    pub fn new(location: impl Into<PathBuf>, instance: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            instance: instance.into(),
        }
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.instance, self.location.display())
    }
}

/// Persistent app and command pool of an engine.
#[derive(Default)]
pub struct BundlePool {
    apps: IndexMap<PoolKey, Arc<AppInstance>>,
    commands: IndexMap<PoolKey, Vec<(String, Command)>>,
}

impl fmt::Debug for BundlePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BundlePool")
            .field("apps", &self.apps.keys().collect::<Vec<_>>())
            .field("commands", &self.command_count())
            .finish()
    }
}

impl BundlePool {
    /// An empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the app stored under `key`.
    pub fn upsert(&mut self, key: PoolKey, app: Arc<AppInstance>) {
        self.apps.insert(key, app);
    }

    /// The app stored under `key`.
    #[must_use]
    pub fn get(&self, key: &PoolKey) -> Option<Arc<AppInstance>> {
        self.apps.get(key).cloned()
    }

    /// Convenience lookup by location and instance name.
    #[must_use]
    pub fn get_app(&self, location: &Path, instance: &str) -> Option<Arc<AppInstance>> {
        self.get(&PoolKey::new(location, instance))
    }

    /// Number of pooled apps.
    #[must_use]
    pub fn app_count(&self) -> usize {
        self.apps.len()
    }

    /// Pooled app keys in insertion order.
    pub fn app_keys(&self) -> impl Iterator<Item = &PoolKey> {
        self.apps.keys()
    }

    /// Remove the app stored under `key` along with its commands.
    pub fn remove(&mut self, key: &PoolKey) -> Option<Arc<AppInstance>> {
        self.commands.shift_remove(key);
        self.apps.shift_remove(key)
    }

    /// Record the commands `app` currently has with their registered names,
    /// replacing whatever was recorded for its pool key.
    pub fn store_commands(&mut self, app: &AppInstance, commands: Vec<(String, Command)>) {
        self.commands.insert(app.pool_key(), commands);
    }

    /// Recorded commands owned by `app`, in registration order.
    #[must_use]
    pub fn commands_of(&self, app: &Arc<AppInstance>) -> Vec<(String, Command)> {
        self.commands
            .get(&app.pool_key())
            .into_iter()
            .flatten()
            .filter(|(_, c)| c.app().is_some_and(|owner| Arc::ptr_eq(owner, app)))
            .cloned()
            .collect()
    }

    /// Number of recorded commands.
    #[must_use]
    pub fn command_count(&self) -> usize {
        self.commands.values().map(Vec::len).sum()
    }

    /// Drop everything. Only used at engine teardown.
    pub(crate) fn clear(&mut self) {
        self.apps.clear();
        self.commands.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{App, AppContext};
    use crate::command::{CommandAction, CommandProperties, CommandRegistry};
    use crate::context::Context;
    use crate::descriptor::{Descriptor, Settings};

    struct Noop;
    impl App for Noop {
        fn init_app(&self, _ctx: &AppContext<'_>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn app(instance: &str, location: &str) -> Arc<AppInstance> {
        Arc::new(AppInstance::new(
            instance,
            "tk-desktop",
            Arc::new(Descriptor::new("tk-multi-publish", location)),
            Settings::new(),
            Context::empty(),
            Box::new(Noop),
        ))
    }

    #[test]
    fn test_upsert_and_get() {
        let mut pool = BundlePool::new();
        let a = app("publish", "/b/publish");
        pool.upsert(a.pool_key(), Arc::clone(&a));

        let found = pool.get_app(Path::new("/b/publish"), "publish").unwrap();
        assert!(Arc::ptr_eq(&found, &a));
        assert!(pool.get_app(Path::new("/b/publish"), "publish-alt").is_none());
        assert!(pool.get_app(Path::new("/b/publish-v2"), "publish").is_none());
    }

    #[test]
    fn test_upsert_replaces() {
        let mut pool = BundlePool::new();
        let first = app("publish", "/b/publish");
        let second = app("publish", "/b/publish");
        pool.upsert(first.pool_key(), first);
        pool.upsert(second.pool_key(), Arc::clone(&second));

        assert_eq!(pool.app_count(), 1);
        assert!(Arc::ptr_eq(&pool.get(&second.pool_key()).unwrap(), &second));
    }

    #[test]
    fn test_commands_of_filters_by_identity() {
        let a = app("publish", "/b/publish");
        let rebuilt = app("publish", "/b/publish");
        let mut registry = CommandRegistry::new("tk-desktop", None);
        let noop = || CommandAction::standard(|| Ok(serde_json::Value::Null));
        registry.register("Publish...", noop(), CommandProperties::new().owned_by(Arc::clone(&a)));

        let mut pool = BundlePool::new();
        pool.store_commands(&a, registry.owned_by(&a));

        let owned = pool.commands_of(&a);
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].0, "Publish...");
        assert!(pool.commands_of(&rebuilt).is_empty());
    }

    #[test]
    fn test_store_commands_forgets_renamed_keys() {
        let a = app("publish", "/b/publish");
        let b = app("loader", "/b/loader");
        let mut registry = CommandRegistry::new("tk-desktop", None);
        let noop = || CommandAction::standard(|| Ok(serde_json::Value::Null));
        let mut pool = BundlePool::new();

        registry.register("Foo", noop(), CommandProperties::new().owned_by(Arc::clone(&a)));
        pool.store_commands(&a, registry.owned_by(&a));
        registry.register("Foo", noop(), CommandProperties::new().owned_by(Arc::clone(&b)));
        pool.store_commands(&a, registry.owned_by(&a));

        let keys: Vec<String> = pool.commands_of(&a).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["publish:Foo"]);
    }

    #[test]
    fn test_same_name_from_another_app_keeps_both() {
        let a = app("publish", "/b/publish");
        let b = app("other", "/b/other");
        let mut registry = CommandRegistry::new("tk-desktop", None);
        let noop = || CommandAction::standard(|| Ok(serde_json::Value::Null));
        let mut pool = BundlePool::new();

        registry.register("Foo", noop(), CommandProperties::new().owned_by(Arc::clone(&a)));
        pool.store_commands(&a, registry.owned_by(&a));
        registry.clear();
        registry.register("Foo", noop(), CommandProperties::new().owned_by(Arc::clone(&b)));
        pool.store_commands(&b, registry.owned_by(&b));

        assert_eq!(pool.commands_of(&a).len(), 1);
        assert_eq!(pool.commands_of(&b).len(), 1);
        assert_eq!(pool.command_count(), 2);
    }

    #[test]
    fn test_remove_drops_app_and_commands() {
        let a = app("publish", "/b/publish");
        let mut registry = CommandRegistry::new("tk-desktop", None);
        registry.register(
            "Publish...",
            CommandAction::standard(|| Ok(serde_json::Value::Null)),
            CommandProperties::new().owned_by(Arc::clone(&a)),
        );
        let mut pool = BundlePool::new();
        pool.upsert(a.pool_key(), Arc::clone(&a));
        pool.store_commands(&a, registry.owned_by(&a));

        assert!(pool.remove(&a.pool_key()).is_some());
        assert_eq!(pool.app_count(), 0);
        assert_eq!(pool.command_count(), 0);
    }
}
