//! Command registry.
//!
//! Commands form a single flat namespace exposed to the host. When two
//! owners register the same name, both entries are renamed to
//! `"<owner>:<name>"` and every later registration of that name is prefixed
//! the same way, so no registration silently overwrites another owner's.
//!
//! Registration order is preserved: lookups and matching return commands in
//! the order they were discovered.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;
use tracing::{debug, warn};

use crate::app::AppInstance;
use crate::metrics::{MetricEvent, MetricsQueue};

/// Signature of a standard command callback.
pub type StandardFn = dyn Fn() -> anyhow::Result<Value> + Send + Sync;

/// Signature of a legacy multi-select callback: entity type and entity ids.
pub type MultiSelectFn = dyn Fn(&str, &[i64]) -> anyhow::Result<Value> + Send + Sync;

/// The callable part of a command.
///
/// The calling convention is chosen by the registrant.
#[derive(Clone)]
pub enum CommandAction {
    /// Called without arguments.
    Standard(Arc<StandardFn>),
    /// Called with the selected entity type and ids.
    LegacyMultiSelect(Arc<MultiSelectFn>),
}

impl fmt::Debug for CommandAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Standard(_) => f.write_str("CommandAction::Standard"),
            Self::LegacyMultiSelect(_) => f.write_str("CommandAction::LegacyMultiSelect"),
        }
    }
}

impl CommandAction {
    /// Wrap a no-argument callback.
    pub fn standard<F>(f: F) -> Self
    where
        F: Fn() -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self::Standard(Arc::new(f))
    }

    /// Wrap a multi-select callback.
    pub fn legacy_multi_select<F>(f: F) -> Self
    where
        F: Fn(&str, &[i64]) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self::LegacyMultiSelect(Arc::new(f))
    }

    /// Whether this is a multi-select callback.
    #[must_use]
    pub fn is_legacy_multi_select(&self) -> bool {
        matches!(self, Self::LegacyMultiSelect(_))
    }

    /// Run the command without a selection.
    ///
    /// # Errors
    ///
    /// Returns whatever the callback returns.
    pub fn invoke(&self) -> anyhow::Result<Value> {
        self.invoke_with_selection("", &[])
    }

    /// Run the command for a selection. Standard callbacks ignore it.
    ///
    /// # Errors
    ///
    /// Returns whatever the callback returns.
    pub fn invoke_with_selection(&self, entity_type: &str, entity_ids: &[i64]) -> anyhow::Result<Value> {
        match self {
            Self::Standard(f) => f(),
            Self::LegacyMultiSelect(f) => f(entity_type, entity_ids),
        }
    }

    fn with_usage_metric(&self, queue: MetricsQueue, module: String, action: String) -> Self {
        match self {
            Self::Standard(f) => {
                let f = Arc::clone(f);
                Self::Standard(Arc::new(move || {
                    queue.push(MetricEvent::user_activity(module.clone(), action.clone()));
                    f()
                }))
            },
            Self::LegacyMultiSelect(f) => {
                let f = Arc::clone(f);
                Self::LegacyMultiSelect(Arc::new(move |entity_type: &str, ids: &[i64]| {
                    queue.push(MetricEvent::user_activity(module.clone(), action.clone()));
                    f(entity_type, ids)
                }))
            },
        }
    }
}

/// Metadata of a command.
#[derive(Clone, Default)]
pub struct CommandProperties {
    /// Owning app. Commands without one are owned by the engine.
    pub app: Option<Arc<AppInstance>>,
    /// Human readable description.
    pub description: Option<String>,
    /// Icon path.
    pub icon: Option<PathBuf>,
    /// Classification such as `context_menu`.
    pub kind: Option<String>,
    /// Stable identifier chosen by the registrant.
    pub short_name: Option<String>,
    /// Owner name prepended after a collision. Set by the registry.
    pub prefix: Option<String>,
    /// Whether the action uses the multi-select convention. Set by the registry.
    pub legacy_multi_select: bool,
    /// Free-form extra properties.
    pub extra: IndexMap<String, Value>,
}

impl fmt::Debug for CommandProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandProperties")
            .field("app", &self.app.as_ref().map(|a| a.instance_name().to_owned()))
            .field("description", &self.description)
            .field("kind", &self.kind)
            .field("short_name", &self.short_name)
            .field("prefix", &self.prefix)
            .field("legacy_multi_select", &self.legacy_multi_select)
            .finish_non_exhaustive()
    }
}

impl CommandProperties {
    /// Empty properties.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the owning app.
    #[must_use]
    pub fn owned_by(mut self, app: Arc<AppInstance>) -> Self {
        self.app = Some(app);
        self
    }

    /// Set the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set the icon.
    #[must_use]
    pub fn with_icon(mut self, icon: impl Into<PathBuf>) -> Self {
        self.icon = Some(icon.into());
        self
    }

    /// Set the classification.
    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    /// Set the short name.
    #[must_use]
    pub fn with_short_name(mut self, short_name: impl Into<String>) -> Self {
        self.short_name = Some(short_name.into());
        self
    }

    /// Add a free-form property.
    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// A registered command.
#[derive(Debug, Clone)]
pub struct Command {
    name: String,
    owner: String,
    action: CommandAction,
    callback: CommandAction,
    properties: CommandProperties,
}

impl Command {
    /// The name the command was registered with, before any prefixing.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Instance name of the owning app, or of the engine.
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// The owning app, if any.
    #[must_use]
    pub fn app(&self) -> Option<&Arc<AppInstance>> {
        self.properties.app.as_ref()
    }

    /// Metadata.
    #[must_use]
    pub fn properties(&self) -> &CommandProperties {
        &self.properties
    }

    /// The callback as registered, without the usage metric wrapper.
    #[must_use]
    pub fn action(&self) -> &CommandAction {
        &self.action
    }

    /// The callback to run: records usage, then calls the action.
    #[must_use]
    pub fn callback(&self) -> &CommandAction {
        &self.callback
    }

    /// Run the command without a selection.
    ///
    /// # Errors
    ///
    /// Returns whatever the callback returns.
    pub fn invoke(&self) -> anyhow::Result<Value> {
        self.callback.invoke()
    }

    fn same_owner(&self, app: Option<&Arc<AppInstance>>) -> bool {
        match (self.app(), app) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

/// Selects commands by owner and name. An empty name selects every command
/// of the owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSelector {
    /// Owner instance name.
    pub app_instance: String,
    /// Command name, or empty for all.
    pub name: String,
}

impl CommandSelector {
    /// Select one named command of an owner.
    #[must_use]
    pub fn new(app_instance: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            app_instance: app_instance.into(),
            name: name.into(),
        }
    }

    /// Select every command of an owner.
    #[must_use]
    pub fn all_of(app_instance: impl Into<String>) -> Self {
        Self::new(app_instance, "")
    }
}

/// A command returned by [`CommandRegistry::match_selectors`].
#[derive(Debug, Clone)]
pub struct CommandMatch {
    /// Owner instance name.
    pub app_instance: String,
    /// Registered (possibly prefixed) name.
    pub name: String,
    /// The callback to run.
    pub callback: CommandAction,
}

fn prefixed(owner: &str, name: &str) -> String {
    format!("{owner}:{name}")
}

/// The active commands of an engine.
pub struct CommandRegistry {
    engine_name: String,
    commands: IndexMap<String, Command>,
    needs_prefixing: HashSet<String>,
    metrics: Option<MetricsQueue>,
}

impl fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("engine", &self.engine_name)
            .field("commands", &self.commands.keys().collect::<Vec<_>>())
            .field("needs_prefixing", &self.needs_prefixing)
            .finish_non_exhaustive()
    }
}

impl CommandRegistry {
    /// An empty registry. Engine-owned commands are prefixed with
    /// `engine_name`; callbacks record usage into `metrics` when given.
    #[must_use]
    pub fn new(engine_name: impl Into<String>, metrics: Option<MetricsQueue>) -> Self {
        Self {
            engine_name: engine_name.into(),
            commands: IndexMap::new(),
            needs_prefixing: HashSet::new(),
            metrics,
        }
    }

    /// Register a command. Returns the name it was stored under.
    pub fn register(&mut self, name: &str, action: CommandAction, mut properties: CommandProperties) -> String {
        let owner = properties
            .app
            .as_ref()
            .map_or_else(|| self.engine_name.clone(), |a| a.instance_name().to_owned());
        properties.legacy_multi_select = action.is_legacy_multi_select();

        let (key, prefix) = self.claim(name, &owner, properties.app.as_ref());
        properties.prefix = prefix;
        let command = self.build(name, owner, action, properties);
        self.commands.insert(key.clone(), command);
        key
    }

    /// Pick the key `owner` stores `name` under, together with its prefix.
    ///
    /// An entry of another owner already holding `name` is renamed in place
    /// and the name is marked for prefixing.
    fn claim(&mut self, name: &str, owner: &str, app: Option<&Arc<AppInstance>>) -> (String, Option<String>) {
        let candidate = if self.needs_prefixing.contains(name) {
            prefixed(owner, name)
        } else {
            name.to_owned()
        };
        if let Some(existing) = self.commands.get(&candidate)
            && existing.same_owner(app)
        {
            debug!(command = %candidate, owner = %owner, "replacing command");
            let prefix = existing.properties.prefix.clone();
            return (candidate, prefix);
        }

        if let Some((index, _, mut existing)) = self.commands.shift_remove_full(name) {
            let existing_owner = existing.owner.clone();
            let renamed = prefixed(&existing_owner, name);
            debug!(command = name, renamed = %renamed, "command name collision, prefixing existing entry");
            existing.properties.prefix = Some(existing_owner);
            self.commands.shift_insert(index, renamed, existing);
            self.needs_prefixing.insert(name.to_owned());
        }

        if self.needs_prefixing.contains(name) {
            (prefixed(owner, name), Some(owner.to_owned()))
        } else {
            (name.to_owned(), None)
        }
    }

    fn build(&self, name: &str, owner: String, action: CommandAction, properties: CommandProperties) -> Command {
        let callback = match &self.metrics {
            Some(queue) => action.with_usage_metric(queue.clone(), owner.clone(), format!("'{name}'")),
            None => action.clone(),
        };
        Command {
            name: name.to_owned(),
            owner,
            action,
            callback,
            properties,
        }
    }

    /// Put back a command taken from the bundle pool. Returns the name it
    /// was stored under.
    ///
    /// Collisions are handled as in [`register`](Self::register), so a
    /// restored command never replaces another owner's entry.
    pub fn restore(&mut self, mut command: Command) -> String {
        let (key, prefix) = self.claim(&command.name, &command.owner, command.properties.app.as_ref());
        command.properties.prefix = prefix;
        self.commands.insert(key.clone(), command);
        key
    }

    /// Remove every command owned by `app`. Returns the removed names.
    pub fn remove_owned_by(&mut self, app: &Arc<AppInstance>) -> Vec<String> {
        let mut removed = Vec::new();
        self.commands.retain(|key, command| {
            let owned = command.app().is_some_and(|owner| Arc::ptr_eq(owner, app));
            if owned {
                removed.push(key.clone());
            }
            !owned
        });
        removed
    }

    /// Commands owned by `app` with their registered names, in discovery
    /// order.
    #[must_use]
    pub fn owned_by(&self, app: &Arc<AppInstance>) -> Vec<(String, Command)> {
        self.commands
            .iter()
            .filter(|(_, c)| c.app().is_some_and(|owner| Arc::ptr_eq(owner, app)))
            .map(|(k, c)| (k.clone(), c.clone()))
            .collect()
    }

    /// Look up a command by registered name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Command> {
        self.commands.get(name)
    }

    /// Whether a name is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    /// Whether later registrations of `name` are prefixed.
    #[must_use]
    pub fn needs_prefixing(&self, name: &str) -> bool {
        self.needs_prefixing.contains(name)
    }

    /// Registered names in discovery order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.commands.keys().cloned().collect()
    }

    /// Iterate `(name, command)` in discovery order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Command)> {
        self.commands.iter()
    }

    /// Number of commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether no command is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Remove every command. Collision markers are kept.
    pub fn clear(&mut self) {
        self.commands.clear();
    }

    /// Commands matching `selectors`, in selector order then discovery order.
    ///
    /// Only app-owned commands are matched. Selectors that match nothing are
    /// logged and skipped.
    #[must_use]
    pub fn match_selectors(&self, selectors: &[CommandSelector]) -> Vec<CommandMatch> {
        let mut matches = Vec::new();
        for selector in selectors {
            let before = matches.len();
            for (key, command) in &self.commands {
                if command.app().is_none() || command.owner != selector.app_instance {
                    continue;
                }
                if selector.name.is_empty() || command.name == selector.name || *key == selector.name {
                    matches.push(CommandMatch {
                        app_instance: command.owner.clone(),
                        name: key.clone(),
                        callback: command.callback.clone(),
                    });
                }
            }
            if matches.len() == before {
                warn!(
                    app = %selector.app_instance,
                    command = %selector.name,
                    "no command matches selector"
                );
            }
        }
        matches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{App, AppContext};
    use crate::context::Context;
    use crate::descriptor::{Descriptor, Settings};
    use serde_json::json;

    struct Noop;
    impl App for Noop {
        fn init_app(&self, _ctx: &AppContext<'_>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn app(instance: &str) -> Arc<AppInstance> {
        Arc::new(AppInstance::new(
            instance,
            "tk-desktop",
            Arc::new(Descriptor::new(format!("tk-{instance}"), format!("/b/{instance}"))),
            Settings::new(),
            Context::empty(),
            Box::new(Noop),
        ))
    }

    fn returning(value: &'static str) -> CommandAction {
        CommandAction::standard(move || Ok(json!(value)))
    }

    fn owned(app: &Arc<AppInstance>) -> CommandProperties {
        CommandProperties::new().owned_by(Arc::clone(app))
    }

    #[test]
    fn test_free_name_inserted_directly() {
        let mut registry = CommandRegistry::new("tk-desktop", None);
        let a = app("a");
        assert_eq!(registry.register("Foo", returning("a"), owned(&a)), "Foo");
        assert_eq!(registry.names(), vec!["Foo"]);
        assert!(registry.get("Foo").unwrap().properties().prefix.is_none());
    }

    #[test]
    fn test_collisions_prefix_every_owner() {
        let mut registry = CommandRegistry::new("tk-desktop", None);
        let (a, b, c) = (app("A"), app("B"), app("C"));

        registry.register("Foo", returning("a"), owned(&a));
        assert_eq!(registry.register("Foo", returning("b"), owned(&b)), "B:Foo");
        assert_eq!(registry.register("Foo", returning("c"), owned(&c)), "C:Foo");

        assert_eq!(registry.names(), vec!["A:Foo", "B:Foo", "C:Foo"]);
        assert_eq!(
            registry.get("A:Foo").unwrap().properties().prefix.as_deref(),
            Some("A")
        );
        assert_eq!(registry.get("A:Foo").unwrap().invoke().unwrap(), json!("a"));
        assert_eq!(registry.get("C:Foo").unwrap().invoke().unwrap(), json!("c"));
        assert!(registry.needs_prefixing("Foo"));
    }

    #[test]
    fn test_same_owner_reregistration_replaces() {
        let mut registry = CommandRegistry::new("tk-desktop", None);
        let a = app("A");
        registry.register("Foo", returning("old"), owned(&a));
        registry.register("Foo", returning("new"), owned(&a));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("Foo").unwrap().invoke().unwrap(), json!("new"));
        assert!(!registry.needs_prefixing("Foo"));
    }

    #[test]
    fn test_unowned_registrations_are_prefixed_with_engine() {
        let mut registry = CommandRegistry::new("tk-desktop", None);
        let a = app("A");
        registry.register("Reload", returning("a"), owned(&a));
        let key = registry.register("Reload", returning("engine"), CommandProperties::new());
        assert_eq!(key, "tk-desktop:Reload");
        assert_eq!(registry.names(), vec!["A:Reload", "tk-desktop:Reload"]);

        // A later unowned registration of a marked name is prefixed too.
        let b = app("B");
        registry.register("Sync", returning("engine"), CommandProperties::new());
        registry.register("Sync", returning("b"), owned(&b));
        assert!(registry.contains("tk-desktop:Sync"));
        assert!(registry.contains("B:Sync"));
        assert!(!registry.contains("Sync"));
    }

    #[test]
    fn test_collision_keeps_discovery_order() {
        let mut registry = CommandRegistry::new("tk-desktop", None);
        let (a, b) = (app("A"), app("B"));
        registry.register("Foo", returning("a"), owned(&a));
        registry.register("Bar", returning("a"), owned(&a));
        registry.register("Foo", returning("b"), owned(&b));
        assert_eq!(registry.names(), vec!["A:Foo", "Bar", "B:Foo"]);
    }

    #[test]
    fn test_legacy_flag_set_from_variant() {
        let mut registry = CommandRegistry::new("tk-desktop", None);
        let a = app("A");
        registry.register(
            "Bulk Publish",
            CommandAction::legacy_multi_select(|entity_type, ids| Ok(json!({"type": entity_type, "count": ids.len()}))),
            owned(&a),
        );
        registry.register("About", returning("a"), owned(&a));

        let bulk = registry.get("Bulk Publish").unwrap();
        assert!(bulk.properties().legacy_multi_select);
        assert_eq!(
            bulk.callback().invoke_with_selection("Shot", &[1, 2]).unwrap(),
            json!({"type": "Shot", "count": 2})
        );
        assert!(!registry.get("About").unwrap().properties().legacy_multi_select);
    }

    #[test]
    fn test_callback_records_usage_metric() {
        let queue = MetricsQueue::new(10);
        let mut registry = CommandRegistry::new("tk-desktop", Some(queue.clone()));
        let a = app("publish");
        registry.register("Publish...", returning("done"), owned(&a));

        assert!(queue.is_empty());
        let result = registry.get("Publish...").unwrap().invoke().unwrap();
        assert_eq!(result, json!("done"));

        let events = queue.drain(10);
        assert_eq!(events.len(), 1);
        match &events[0] {
            MetricEvent::UserActivity { module, action, .. } => {
                assert_eq!(module, "publish");
                assert_eq!(action, "'Publish...'");
            },
            other => panic!("unexpected: {other:?}"),
        }

        // The raw action does not record.
        registry.get("Publish...").unwrap().action().invoke().unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_match_selectors() {
        let mut registry = CommandRegistry::new("tk-desktop", None);
        let (a, b) = (app("A"), app("B"));
        registry.register("Foo", returning("a"), owned(&a));
        registry.register("Bar", returning("b"), owned(&b));
        registry.register("Baz", returning("a"), owned(&a));
        registry.register("Foo", returning("b"), owned(&b));

        let all_a = registry.match_selectors(&[CommandSelector::all_of("A")]);
        let names: Vec<&str> = all_a.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["A:Foo", "Baz"]);
        assert!(all_a.iter().all(|m| m.app_instance == "A"));

        let picked = registry.match_selectors(&[
            CommandSelector::new("B", "Foo"),
            CommandSelector::new("A", "Baz"),
            CommandSelector::new("C", ""),
        ]);
        let names: Vec<&str> = picked.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["B:Foo", "Baz"]);
    }

    #[test]
    fn test_remove_owned_by_and_restore() {
        let mut registry = CommandRegistry::new("tk-desktop", None);
        let (a, b) = (app("A"), app("B"));
        registry.register("Foo", returning("a"), owned(&a));
        registry.register("Bar", returning("b"), owned(&b));

        let saved = registry.get("Foo").unwrap().clone();
        assert_eq!(registry.remove_owned_by(&a), vec!["Foo"]);
        assert_eq!(registry.names(), vec!["Bar"]);

        assert_eq!(registry.restore(saved), "Foo");
        assert!(registry.contains("Foo"));
    }

    #[test]
    fn test_restore_prefixes_on_collision() {
        let mut registry = CommandRegistry::new("tk-desktop", None);
        let (a, b) = (app("A"), app("B"));
        registry.register("Foo", returning("a"), owned(&a));
        let saved = registry.get("Foo").unwrap().clone();
        registry.clear();
        registry.register("Foo", returning("b"), owned(&b));

        assert_eq!(registry.restore(saved), "A:Foo");
        assert_eq!(registry.names(), vec!["B:Foo", "A:Foo"]);
        assert_eq!(registry.get("B:Foo").unwrap().invoke().unwrap(), json!("b"));
        assert_eq!(registry.get("A:Foo").unwrap().properties().prefix.as_deref(), Some("A"));
        assert!(registry.needs_prefixing("Foo"));
    }

    #[test]
    fn test_selectors_skip_engine_commands() {
        let mut registry = CommandRegistry::new("tk-desktop", None);
        let a = app("A");
        registry.register("Foo", returning("a"), owned(&a));
        registry.register("Toggle Debug Logging", returning("engine"), CommandProperties::new());

        assert!(registry.match_selectors(&[CommandSelector::all_of("tk-desktop")]).is_empty());
        assert_eq!(registry.match_selectors(&[CommandSelector::all_of("A")]).len(), 1);
    }

    #[test]
    fn test_clear_keeps_collision_markers() {
        let mut registry = CommandRegistry::new("tk-desktop", None);
        let (a, b) = (app("A"), app("B"));
        registry.register("Foo", returning("a"), owned(&a));
        registry.register("Foo", returning("b"), owned(&b));
        registry.clear();
        assert!(registry.is_empty());

        assert_eq!(registry.register("Foo", returning("a"), owned(&a)), "A:Foo");
    }
}
