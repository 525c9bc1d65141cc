//! Frameworks: shared dependency modules of engines and apps.
//!
//! A bundle lists the framework instances it needs. They are set up before
//! the bundle itself is initialized. Shared frameworks are created once per
//! engine and handed to every bundle that asks for them; the others belong
//! to the bundle that caused their creation.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use indexmap::IndexMap;
use tracing::{debug, error};

use crate::descriptor::{Descriptor, Settings};
use crate::environment::{Environment, FrameworkEntry};
use crate::error::{RuntimeError, RuntimeResult, guarded};

/// Behavior of a framework bundle.
pub trait Framework: Send + Sync {
    /// Release resources. Called once at teardown.
    ///
    /// # Errors
    ///
    /// Failures are logged and do not interrupt teardown.
    fn destroy_framework(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Creates framework behaviors from their environment entries.
pub trait FrameworkFactory: Send + Sync {
    /// Instantiate the framework described by `entry`.
    ///
    /// # Errors
    ///
    /// Returns an error if the framework cannot be created.
    fn create(&self, entry: &FrameworkEntry) -> anyhow::Result<Box<dyn Framework>>;
}

/// Framework without behavior.
#[derive(Debug, Clone, Copy, Default)]
pub struct InertFramework;

impl Framework for InertFramework {}

/// Factory producing [`InertFramework`]s for every entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct InertFrameworkFactory;

impl FrameworkFactory for InertFrameworkFactory {
    fn create(&self, _entry: &FrameworkEntry) -> anyhow::Result<Box<dyn Framework>> {
        Ok(Box::new(InertFramework))
    }
}

/// A running framework instance.
pub struct FrameworkInstance {
    instance_name: String,
    descriptor: Arc<Descriptor>,
    settings: Settings,
    behavior: Box<dyn Framework>,
}

impl fmt::Debug for FrameworkInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameworkInstance")
            .field("instance_name", &self.instance_name)
            .field("bundle", &self.descriptor.name)
            .field("shared", &self.descriptor.shared)
            .finish_non_exhaustive()
    }
}

impl FrameworkInstance {
    /// Instance name from the environment.
    #[must_use]
    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    /// Bundle descriptor.
    #[must_use]
    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    /// Settings from the environment.
    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Whether the instance is shared across the bundles of an engine.
    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.descriptor.shared
    }

    /// The framework behavior.
    #[must_use]
    pub fn behavior(&self) -> &dyn Framework {
        self.behavior.as_ref()
    }

    fn destroy(&self) {
        debug!(framework = %self.instance_name, "destroying framework");
        if let Err(e) = guarded(&self.instance_name, "destroy_framework", || {
            self.behavior.destroy_framework()
        }) {
            error!(framework = %self.instance_name, error = %e, "framework failed to shut down");
        }
    }
}

/// The shared framework instances of one engine.
#[derive(Default)]
pub struct SharedFrameworks {
    instances: Mutex<IndexMap<String, Arc<FrameworkInstance>>>,
}

impl fmt::Debug for SharedFrameworks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self
            .instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        f.debug_struct("SharedFrameworks").field("instances", &names).finish()
    }
}

impl SharedFrameworks {
    /// Number of live shared instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instances.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no shared instance is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Destroy every shared instance.
    pub(crate) fn destroy_all(&self) {
        let drained: Vec<Arc<FrameworkInstance>> = {
            let mut instances = self.instances.lock().unwrap_or_else(PoisonError::into_inner);
            instances.drain(..).map(|(_, fw)| fw).collect()
        };
        for fw in drained {
            fw.destroy();
        }
    }
}

/// Set up every framework `descriptor` requires on behalf of `owner`.
///
/// # Errors
///
/// Returns [`RuntimeError::Config`] if a framework is not declared in the
/// environment, or a [`RuntimeError::ComponentFault`] if creating one fails.
/// Instances created before the failure are destroyed.
pub(crate) fn setup_frameworks(
    owner: &str,
    descriptor: &Descriptor,
    environment: &Environment,
    factory: &dyn FrameworkFactory,
    shared: &SharedFrameworks,
) -> RuntimeResult<Vec<Arc<FrameworkInstance>>> {
    let mut attached = Vec::with_capacity(descriptor.frameworks.len());

    for name in &descriptor.frameworks {
        let result = attach_framework(owner, name, environment, factory, shared);
        match result {
            Ok(fw) => attached.push(fw),
            Err(e) => {
                destroy_owned(&attached);
                return Err(e);
            },
        }
    }
    Ok(attached)
}

fn attach_framework(
    owner: &str,
    name: &str,
    environment: &Environment,
    factory: &dyn FrameworkFactory,
    shared: &SharedFrameworks,
) -> RuntimeResult<Arc<FrameworkInstance>> {
    let entry = environment.framework(name).ok_or_else(|| RuntimeError::Config {
        bundle: owner.to_owned(),
        keys: vec![name.to_owned()],
        message: format!(
            "requires framework '{name}' which is not declared in environment '{}'",
            environment.name
        ),
    })?;

    if entry.descriptor.shared
        && let Some(existing) = shared
            .instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
    {
        debug!(owner, framework = name, "reusing shared framework");
        return Ok(Arc::clone(existing));
    }

    let behavior = guarded(name, "create_framework", || factory.create(entry))?;
    let instance = Arc::new(FrameworkInstance {
        instance_name: name.to_owned(),
        descriptor: Arc::clone(&entry.descriptor),
        settings: entry.settings.clone(),
        behavior,
    });
    debug!(owner, framework = name, shared = instance.is_shared(), "framework created");

    if instance.is_shared() {
        shared
            .instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_owned(), Arc::clone(&instance));
    }
    Ok(instance)
}

/// Destroy the non-shared instances of a list. Shared ones are left to
/// [`SharedFrameworks::destroy_all`].
pub(crate) fn destroy_owned(frameworks: &[Arc<FrameworkInstance>]) {
    for fw in frameworks.iter().filter(|fw| !fw.is_shared()) {
        fw.destroy();
    }
}
