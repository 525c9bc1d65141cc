//! Bundle descriptors.
//!
//! A [`Descriptor`] is the resolved metadata of an engine, app or framework
//! bundle: where it is installed, what it declares it needs, and the schema
//! its settings must satisfy.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;

pub use trellis_config::SettingKind;

use crate::context::ContextField;
use crate::error::DescriptorError;

/// Validated or raw settings of a bundle instance.
pub type Settings = serde_json::Map<String, Value>;

/// Declaration of a single setting.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SettingSpec {
    /// Declared type.
    pub kind: SettingKind,
    /// Default value. A setting without a default is required.
    pub default: Option<Value>,
    /// Human readable description.
    pub description: Option<String>,
}

impl SettingSpec {
    /// A required setting of the given type.
    #[must_use]
    pub fn required(kind: SettingKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    /// An optional setting with a default value.
    #[must_use]
    pub fn with_default(kind: SettingKind, default: Value) -> Self {
        Self {
            kind,
            default: Some(default),
            description: None,
        }
    }
}

/// Ordered configuration schema keyed by setting name.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SettingsSchema(IndexMap<String, SettingSpec>);

impl SettingsSchema {
    /// An empty schema.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a setting declaration.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, spec: SettingSpec) -> Self {
        self.0.insert(key.into(), spec);
        self
    }

    /// Look up a setting declaration.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&SettingSpec> {
        self.0.get(key)
    }

    /// Iterate declarations in declared order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &SettingSpec)> {
        self.0.iter()
    }

    /// Number of declared settings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the schema declares nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, SettingSpec)> for SettingsSchema {
    fn from_iter<I: IntoIterator<Item = (String, SettingSpec)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Resolved metadata of a bundle.
#[derive(Debug, Clone, PartialEq)]
pub struct Descriptor {
    /// Bundle name.
    pub name: String,
    /// Bundle version.
    pub version: String,
    /// Install location.
    pub location: PathBuf,
    /// Whether the bundle is materially present at its location.
    pub exists_local: bool,
    /// Development checkout.
    pub dev: bool,
    /// For frameworks: one instance shared by every bundle of an engine.
    pub shared: bool,
    /// Human readable description.
    pub description: Option<String>,
    /// Icon path.
    pub icon: Option<PathBuf>,
    /// Settings schema.
    pub schema: SettingsSchema,
    /// Supported host platforms. Empty means all.
    pub supported_platforms: Vec<String>,
    /// Engines an app can run in. Empty means all.
    pub supported_engines: Vec<String>,
    /// Context fields that must be set.
    pub required_context: Vec<ContextField>,
    /// Framework instance names the bundle depends on.
    pub frameworks: Vec<String>,
    /// Minimum runtime version.
    pub minimum_core_version: Option<String>,
}

impl Descriptor {
    /// A local descriptor with version `0.0.0` and no requirements.
    #[must_use]
    pub fn new(name: impl Into<String>, location: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            version: "0.0.0".to_owned(),
            location: location.into(),
            exists_local: true,
            dev: false,
            shared: false,
            description: None,
            icon: None,
            schema: SettingsSchema::new(),
            supported_platforms: Vec::new(),
            supported_engines: Vec::new(),
            required_context: Vec::new(),
            frameworks: Vec::new(),
            minimum_core_version: None,
        }
    }

    /// Set the version.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Set the schema.
    #[must_use]
    pub fn with_schema(mut self, schema: SettingsSchema) -> Self {
        self.schema = schema;
        self
    }

    /// Set the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Declare required context fields.
    #[must_use]
    pub fn requiring(mut self, fields: impl IntoIterator<Item = ContextField>) -> Self {
        self.required_context = fields.into_iter().collect();
        self
    }

    /// Declare framework dependencies.
    #[must_use]
    pub fn with_frameworks<S: Into<String>>(mut self, frameworks: impl IntoIterator<Item = S>) -> Self {
        self.frameworks = frameworks.into_iter().map(Into::into).collect();
        self
    }

    /// Mark whether the bundle is present on disk.
    #[must_use]
    pub fn local(mut self, exists: bool) -> Self {
        self.exists_local = exists;
        self
    }

    /// Mark as a development checkout.
    #[must_use]
    pub fn dev(mut self) -> Self {
        self.dev = true;
        self
    }

    /// Mark a framework as shared.
    #[must_use]
    pub fn shared(mut self) -> Self {
        self.shared = true;
        self
    }

    /// Install location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.location
    }

    /// Whether the bundle is materially present.
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.exists_local
    }

    /// Ensure the bundle is present on disk.
    ///
    /// # Errors
    ///
    /// Returns [`DescriptorError::MissingManifest`] if it is not.
    pub fn ensure_local(&self) -> Result<(), DescriptorError> {
        if self.exists_local {
            Ok(())
        } else {
            Err(DescriptorError::MissingManifest {
                name: self.name.clone(),
                path: self.location.clone(),
            })
        }
    }

    /// Check the declared minimum runtime version against `core_version`.
    ///
    /// # Errors
    ///
    /// Returns [`DescriptorError::VersionConstraints`] listing every failed
    /// constraint.
    pub fn check_version_constraints(&self, core_version: &str) -> Result<(), DescriptorError> {
        let mut reasons = Vec::new();
        if let Some(minimum) = &self.minimum_core_version {
            match (parse_version(minimum), parse_version(core_version)) {
                (Some(required), Some(current)) if current < required => reasons.push(format!(
                    "Requires a minimum core version of {minimum} but currently installed version is {core_version}."
                )),
                (None, _) => reasons.push(format!("Invalid minimum core version '{minimum}'.")),
                (_, None) => reasons.push(format!("Invalid core version '{core_version}'.")),
                _ => {},
            }
        }
        if reasons.is_empty() {
            Ok(())
        } else {
            Err(DescriptorError::VersionConstraints { reasons })
        }
    }
}

fn parse_version(raw: &str) -> Option<semver::Version> {
    semver::Version::parse(raw.trim().trim_start_matches('v')).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_schema_keeps_declared_order() {
        let schema = SettingsSchema::new()
            .with("zeta", SettingSpec::required(SettingKind::Str))
            .with("alpha", SettingSpec::with_default(SettingKind::Bool, json!(false)));
        let keys: Vec<&String> = schema.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["zeta", "alpha"]);
        assert_eq!(schema.len(), 2);
    }

    #[test]
    fn test_ensure_local() {
        let d = Descriptor::new("tk-multi-publish", "/bundles/publish");
        assert!(d.ensure_local().is_ok());

        let err = d.local(false).ensure_local().unwrap_err();
        assert!(matches!(err, DescriptorError::MissingManifest { .. }));
        assert!(err.to_string().contains("/bundles/publish"));
    }

    #[test]
    fn test_version_constraints() {
        let mut d = Descriptor::new("tk-maya", "/bundles/maya");
        assert!(d.check_version_constraints("0.1.0").is_ok());

        d.minimum_core_version = Some("v0.2.0".into());
        assert!(d.check_version_constraints("0.2.0").is_ok());
        assert!(d.check_version_constraints("1.0.0").is_ok());

        let err = d.check_version_constraints("0.1.1").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Requires a minimum core version of v0.2.0 but currently installed version is 0.1.1."
        );
    }

    #[test]
    fn test_invalid_minimum_version_is_reported() {
        let mut d = Descriptor::new("tk-maya", "/bundles/maya");
        d.minimum_core_version = Some("latest".into());
        assert!(matches!(
            d.check_version_constraints("0.1.0"),
            Err(DescriptorError::VersionConstraints { .. })
        ));
    }

    #[test]
    fn test_descriptor_equality_covers_location() {
        let a = Descriptor::new("tk-desktop", "/bundles/v1");
        let b = Descriptor::new("tk-desktop", "/bundles/v2");
        assert_ne!(a, b);
        assert_eq!(a.clone(), a);
    }
}
