//! Execution context.
//!
//! A [`Context`] is an immutable value describing where work is logically
//! happening. It decides which environment, and so which bundles and
//! settings, apply. Two contexts are equal when all of their fields are.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A reference to a production tracking entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entity {
    /// Entity type (e.g. `Shot`, `Asset`, `Project`).
    #[serde(rename = "type")]
    pub kind: String,
    /// Entity id.
    pub id: i64,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Entity {
    /// Create an entity reference without a display name.
    #[must_use]
    pub fn new(kind: impl Into<String>, id: i64) -> Self {
        Self {
            kind: kind.into(),
            id,
            name: None,
        }
    }

    /// Set the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} {}", self.kind, name),
            None => write!(f, "{} #{}", self.kind, self.id),
        }
    }
}

/// The individual fields of a [`Context`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextField {
    /// The project.
    Project,
    /// The entity (shot, asset, ...).
    Entity,
    /// The pipeline step.
    Step,
    /// The task.
    Task,
    /// The user.
    User,
}

impl ContextField {
    /// All fields in display order.
    pub const ALL: [ContextField; 5] = [
        ContextField::Project,
        ContextField::Entity,
        ContextField::Step,
        ContextField::Task,
        ContextField::User,
    ];

    /// Parse a field name as written in configuration.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "project" => Some(Self::Project),
            "entity" => Some(Self::Entity),
            "step" => Some(Self::Step),
            "task" => Some(Self::Task),
            "user" => Some(Self::User),
            _ => None,
        }
    }

    /// The configuration name of this field.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::Entity => "entity",
            Self::Step => "step",
            Self::Task => "task",
            Self::User => "user",
        }
    }
}

impl fmt::Display for ContextField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where execution is logically happening.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Context {
    /// The project.
    pub project: Option<Entity>,
    /// The entity (shot, asset, ...).
    pub entity: Option<Entity>,
    /// The pipeline step.
    pub step: Option<Entity>,
    /// The task.
    pub task: Option<Entity>,
    /// The user.
    pub user: Option<Entity>,
}

impl Context {
    /// A context with no fields set.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Set the project.
    #[must_use]
    pub fn with_project(mut self, project: Entity) -> Self {
        self.project = Some(project);
        self
    }

    /// Set the entity.
    #[must_use]
    pub fn with_entity(mut self, entity: Entity) -> Self {
        self.entity = Some(entity);
        self
    }

    /// Set the pipeline step.
    #[must_use]
    pub fn with_step(mut self, step: Entity) -> Self {
        self.step = Some(step);
        self
    }

    /// Set the task.
    #[must_use]
    pub fn with_task(mut self, task: Entity) -> Self {
        self.task = Some(task);
        self
    }

    /// Set the user.
    #[must_use]
    pub fn with_user(mut self, user: Entity) -> Self {
        self.user = Some(user);
        self
    }

    /// The value of a field.
    #[must_use]
    pub fn field(&self, field: ContextField) -> Option<&Entity> {
        match field {
            ContextField::Project => self.project.as_ref(),
            ContextField::Entity => self.entity.as_ref(),
            ContextField::Step => self.step.as_ref(),
            ContextField::Task => self.task.as_ref(),
            ContextField::User => self.user.as_ref(),
        }
    }

    /// Whether a field is set.
    #[must_use]
    pub fn has(&self, field: ContextField) -> bool {
        self.field(field).is_some()
    }

    /// The type of the context entity, if any.
    #[must_use]
    pub fn entity_type(&self) -> Option<&str> {
        self.entity.as_ref().map(|e| e.kind.as_str())
    }

    /// Whether no field is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        ContextField::ALL.iter().all(|f| !self.has(*f))
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("empty context");
        }
        // Most specific field first.
        let parts: Vec<String> = [&self.task, &self.step, &self.entity, &self.project]
            .into_iter()
            .flatten()
            .map(ToString::to_string)
            .collect();
        if parts.is_empty() {
            return f.write_str("user context");
        }
        f.write_str(&parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shot_context() -> Context {
        Context::empty()
            .with_project(Entity::new("Project", 65).with_name("Big Buck Bunny"))
            .with_entity(Entity::new("Shot", 1184).with_name("bunny_010_0010"))
    }

    #[test]
    fn test_equality_is_structural() {
        assert_eq!(shot_context(), shot_context());
        assert_ne!(shot_context(), Context::empty());
    }

    #[test]
    fn test_has_and_entity_type() {
        let ctx = shot_context();
        assert!(ctx.has(ContextField::Project));
        assert!(!ctx.has(ContextField::Task));
        assert_eq!(ctx.entity_type(), Some("Shot"));
        assert!(Context::empty().is_empty());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            shot_context().to_string(),
            "Shot bunny_010_0010, Project Big Buck Bunny"
        );
        assert_eq!(Context::empty().to_string(), "empty context");
    }

    #[test]
    fn test_field_names_round_trip() {
        for field in ContextField::ALL {
            assert_eq!(ContextField::from_name(field.name()), Some(field));
        }
        assert_eq!(ContextField::from_name("sequence"), None);
    }

    #[test]
    fn test_serde_uses_type_key() {
        let json = serde_json::to_value(Entity::new("Asset", 3)).unwrap();
        assert_eq!(json["type"], "Asset");
        assert!(json.get("name").is_none());
    }
}
