//! Descriptor resolution.
//!
//! The runtime never reads bundle metadata itself. It asks a
//! [`DescriptorResolver`] which environment applies to a context and what
//! that environment contains. [`ConfigResolver`] answers from a
//! [`trellis_config::Config`].

use std::sync::Arc;

use tracing::debug;
use trellis_config::{BundleSection, Config, SelectorSection};

use crate::context::{Context, ContextField};
use crate::descriptor::{Descriptor, SettingSpec, SettingsSchema};
use crate::environment::{AppEntry, EngineEntry, Environment, FrameworkEntry};
use crate::error::{DescriptorError, RuntimeResult};

/// Source of environments and descriptors.
pub trait DescriptorResolver: Send + Sync {
    /// Pick the environment for a context, or `None` if the context does
    /// not carry enough information to decide.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be read.
    fn pick_environment(&self, context: &Context) -> RuntimeResult<Option<String>>;

    /// Resolve a named environment.
    ///
    /// # Errors
    ///
    /// Returns [`DescriptorError::NotFound`] for unknown environments.
    fn environment(&self, name: &str, context: &Context) -> RuntimeResult<Arc<Environment>>;
}

/// A [`DescriptorResolver`] backed by a parsed configuration file.
#[derive(Debug, Clone)]
pub struct ConfigResolver {
    config: Arc<Config>,
}

impl ConfigResolver {
    /// Wrap a validated configuration.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// The underlying configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn descriptor(&self, bundle: &str) -> RuntimeResult<Arc<Descriptor>> {
        let section = self
            .config
            .bundles
            .get(bundle)
            .ok_or_else(|| DescriptorError::NotFound(format!("bundle '{bundle}'")))?;
        Ok(Arc::new(descriptor_from_section(bundle, section)))
    }
}

fn descriptor_from_section(name: &str, section: &BundleSection) -> Descriptor {
    let schema: SettingsSchema = section
        .schema
        .iter()
        .map(|(key, s)| {
            (key.clone(), SettingSpec {
                kind: s.kind,
                default: s.default.clone(),
                description: s.description.clone(),
            })
        })
        .collect();

    Descriptor {
        name: name.to_owned(),
        version: section.version.clone(),
        location: section.path.clone(),
        exists_local: section.path.exists(),
        dev: section.dev,
        shared: section.shared,
        description: section.description.clone(),
        icon: section.icon.clone(),
        schema,
        supported_platforms: section.platforms.clone(),
        supported_engines: section.engines.clone(),
        required_context: section
            .requires_context
            .iter()
            .filter_map(|f| ContextField::from_name(f))
            .collect(),
        frameworks: section.frameworks.clone(),
        minimum_core_version: section.minimum_core_version.clone(),
    }
}

fn selector_matches(selector: &SelectorSection, context: &Context) -> bool {
    let fields_present = selector
        .requires
        .iter()
        .all(|f| ContextField::from_name(f).is_some_and(|field| context.has(field)));
    let entity_matches = selector
        .entity_type
        .as_deref()
        .is_none_or(|kind| context.entity_type() == Some(kind));
    fields_present && entity_matches
}

impl DescriptorResolver for ConfigResolver {
    fn pick_environment(&self, context: &Context) -> RuntimeResult<Option<String>> {
        if self.config.selectors.is_empty() && self.config.environments.len() == 1 {
            return Ok(self.config.environments.keys().next().cloned());
        }
        let picked = self
            .config
            .selectors
            .iter()
            .find(|s| selector_matches(s, context))
            .map(|s| s.environment.clone());
        debug!(context = %context, environment = ?picked, "picked environment");
        Ok(picked)
    }

    fn environment(&self, name: &str, _context: &Context) -> RuntimeResult<Arc<Environment>> {
        let section = self
            .config
            .environments
            .get(name)
            .ok_or_else(|| DescriptorError::NotFound(format!("environment '{name}'")))?;

        let mut env = Environment::new(name);
        env.description.clone_from(&section.description);

        for (instance, fw) in &section.frameworks {
            let mut entry = FrameworkEntry::new(instance.clone(), self.descriptor(&fw.bundle)?);
            entry.settings.clone_from(&fw.settings);
            env = env.with_framework(entry);
        }

        for (instance, engine) in &section.engines {
            let mut entry = EngineEntry::new(instance.clone(), self.descriptor(&engine.bundle)?)
                .with_settings(engine.settings.clone());
            for app in &engine.apps {
                entry = entry.with_app(
                    AppEntry::new(app.instance.clone(), self.descriptor(&app.bundle)?)
                        .with_settings(app.settings.clone()),
                );
            }
            env = env.with_engine(entry);
        }

        Ok(Arc::new(env))
    }
}
