//! Panel registry.
//!
//! Apps register panels while they initialize. Each panel gets a stable id
//! derived from the app instance name and the panel name.

use std::fmt;
use std::sync::{Arc, LazyLock};

use indexmap::IndexMap;
use regex::Regex;
use serde_json::Value;

/// Callback creating or showing a panel.
pub type PanelCallback = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

/// Free-form panel properties.
pub type PanelProperties = IndexMap<String, Value>;

/// Compose the id of a panel: `"<instance>_<panel>"`, non-word characters
/// replaced by `_`, lowercased.
#[must_use]
pub fn panel_id(app_instance: &str, panel_name: &str) -> String {
    static NON_WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\W").expect("invalid regex"));
    let raw = format!("{app_instance}_{panel_name}");
    NON_WORD.replace_all(&raw, "_").to_lowercase()
}

/// A registered panel.
#[derive(Clone)]
pub struct Panel {
    /// Panel id.
    pub id: String,
    /// Instance name of the registering app.
    pub owner: String,
    /// Callback creating the panel.
    pub callback: PanelCallback,
    /// Free-form properties.
    pub properties: PanelProperties,
}

impl fmt::Debug for Panel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Panel")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("properties", &self.properties)
            .finish_non_exhaustive()
    }
}

/// Panels of an engine keyed by id, in registration order.
#[derive(Debug, Clone, Default)]
pub struct PanelRegistry {
    panels: IndexMap<String, Panel>,
}

impl PanelRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a panel for `owner`. Re-registering an id replaces it.
    pub fn register(
        &mut self,
        owner: &str,
        panel_name: &str,
        callback: PanelCallback,
        properties: PanelProperties,
    ) -> String {
        let id = panel_id(owner, panel_name);
        self.panels.insert(id.clone(), Panel {
            id: id.clone(),
            owner: owner.to_owned(),
            callback,
            properties,
        });
        id
    }

    /// Look up a panel.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Panel> {
        self.panels.get(id)
    }

    /// Remove every panel of `owner`.
    pub fn remove_owned_by(&mut self, owner: &str) -> Vec<String> {
        let mut removed = Vec::new();
        self.panels.retain(|id, panel| {
            let owned = panel.owner == owner;
            if owned {
                removed.push(id.clone());
            }
            !owned
        });
        removed
    }

    /// Iterate panels in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Panel> {
        self.panels.values()
    }

    /// Number of panels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.panels.len()
    }

    /// Whether no panel is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.panels.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.panels.clear();
    }
}
