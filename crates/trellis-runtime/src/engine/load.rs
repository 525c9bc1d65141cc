//! App loading: validation, pool reuse and construction.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::Engine;
use crate::CORE_VERSION;
use crate::app::{AppContext, AppInstance};
use crate::context::Context;
use crate::descriptor::Settings;
use crate::environment::{AppEntry, Environment};
use crate::error::{RuntimeError, RuntimeResult, guarded};
use crate::framework::{destroy_owned, setup_frameworks};
use crate::pool::PoolKey;
use crate::validation::{validate_context, validate_engine_support, validate_platform};

/// Outcome of trying to move a pooled app to a new context.
enum Reuse {
    Reused(Arc<AppInstance>),
    Unavailable,
    /// The pooled app failed to update and was taken out of the pool.
    Failed(Arc<AppInstance>),
}

impl Engine {
    /// Populate the active app map from the environment.
    ///
    /// With `previous` set, pooled apps supporting context changes are moved
    /// to the current context in place instead of being rebuilt. An app that
    /// fails any step is skipped; the others still load. Previously active
    /// apps that are neither active again nor pooled are destroyed.
    pub(super) fn load_apps(&self, previous: Option<&Context>) {
        let (environment, context, mut outgoing) = {
            let mut inner = self.lock();
            inner.commands.clear();
            let outgoing: Vec<Arc<AppInstance>> = std::mem::take(&mut inner.apps).into_values().collect();
            (Arc::clone(&inner.environment), inner.context.clone(), outgoing)
        };

        match environment.engine(&self.instance_name) {
            Some(engine_entry) => {
                for entry in &engine_entry.apps {
                    self.load_app(entry, &context, &environment, previous, &mut outgoing);
                }
            },
            None => warn!(
                engine = %self.instance_name,
                environment = %environment.name,
                "engine is not declared in the environment, no apps to load"
            ),
        }

        let stale: Vec<Arc<AppInstance>> = {
            let inner = self.lock();
            outgoing
                .into_iter()
                .filter(|app| {
                    let active = inner.apps.values().any(|a| Arc::ptr_eq(a, app));
                    let pooled = inner.pool.get(&app.pool_key()).is_some_and(|p| Arc::ptr_eq(&p, app));
                    !active && !pooled
                })
                .collect()
        };
        for app in &stale {
            debug!(engine = %self.instance_name, app = %app.instance_name(), "destroying replaced app");
            self.retire_app(app);
        }

        self.register_builtin_commands();

        let inner = self.lock();
        info!(
            engine = %self.instance_name,
            environment = %environment.name,
            apps = inner.apps.len(),
            commands = inner.commands.len(),
            pooled = inner.pool.app_count(),
            retired = stale.len(),
            "apps loaded"
        );
    }

    fn load_app(
        &self,
        entry: &AppEntry,
        context: &Context,
        environment: &Environment,
        previous: Option<&Context>,
        outgoing: &mut Vec<Arc<AppInstance>>,
    ) {
        let Some(settings) = self.check_app(entry, context, environment) else {
            return;
        };

        let reused = match previous {
            Some(old) => self.reuse_app(entry, &settings, context, environment, old),
            None => Reuse::Unavailable,
        };
        let app = match reused {
            Reuse::Reused(app) => app,
            Reuse::Failed(broken) => {
                outgoing.retain(|a| !Arc::ptr_eq(a, &broken));
                self.retire_app(&broken);
                match self.construct_app(entry, settings, context, environment) {
                    Some(app) => app,
                    None => return,
                }
            },
            Reuse::Unavailable => match self.construct_app(entry, settings, context, environment) {
                Some(app) => app,
                None => return,
            },
        };

        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.apps.insert(entry.instance.clone(), Arc::clone(&app));
        if app.supports_context_change() {
            inner.pool.upsert(app.pool_key(), app);
        }
        // A collision may have renamed commands of apps loaded earlier.
        for loaded in inner.apps.values().filter(|a| a.supports_context_change()) {
            inner.pool.store_commands(loaded, inner.commands.owned_by(loaded));
        }
    }

    /// Run every check an app must pass. Returns its validated settings.
    fn check_app(&self, entry: &AppEntry, context: &Context, environment: &Environment) -> Option<Settings> {
        let descriptor = &entry.descriptor;
        if let Err(e) = descriptor.ensure_local() {
            error!(engine = %self.instance_name, app = %entry.instance, error = %e, "cannot start app");
            return None;
        }

        let checked = descriptor
            .check_version_constraints(CORE_VERSION)
            .map_err(RuntimeError::from)
            .and_then(|()| validate_context(descriptor, context))
            .and_then(|()| validate_platform(self.services.platform.as_ref(), descriptor))
            .and_then(|()| validate_engine_support(descriptor, self.name()))
            .and_then(|()| {
                self.services
                    .validator
                    .validate(&entry.instance, &descriptor.schema, &entry.settings, context)
            });

        match checked {
            Ok(settings) => Some(settings),
            Err(e) => {
                error!(
                    engine = %self.instance_name,
                    app = %entry.instance,
                    environment = %environment.name,
                    error = %e,
                    "app configuration error, it will not be loaded"
                );
                None
            },
        }
    }

    /// Move a pooled app to the current context.
    fn reuse_app(
        &self,
        entry: &AppEntry,
        settings: &Settings,
        context: &Context,
        environment: &Environment,
        previous: &Context,
    ) -> Reuse {
        let key = PoolKey::new(entry.descriptor.location.clone(), entry.instance.clone());
        let Some(app) = self.lock().pool.get(&key) else {
            return Reuse::Unavailable;
        };
        if !app.supports_context_change() {
            return Reuse::Unavailable;
        }

        app.update(Arc::clone(&entry.descriptor), settings.clone(), context.clone());
        let outcome = self.refresh_frameworks(&app, entry, environment).and_then(|()| {
            self.restore_commands(&app);
            guarded(app.instance_name(), "post_context_change", || {
                app.behavior().post_context_change(previous, context)
            })
        });

        match outcome {
            Ok(()) => {
                debug!(engine = %self.instance_name, app = %app.instance_name(), context = %context, "app reused");
                Reuse::Reused(app)
            },
            Err(e) => {
                let removed = {
                    let mut inner = self.lock();
                    inner.pool.remove(&key);
                    inner.commands.remove_owned_by(&app)
                };
                warn!(
                    engine = %self.instance_name,
                    app = %app.instance_name(),
                    error = %e,
                    removed_commands = removed.len(),
                    "app failed to change context and will be restarted"
                );
                Reuse::Failed(app)
            },
        }
    }

    fn refresh_frameworks(&self, app: &AppInstance, entry: &AppEntry, environment: &Environment) -> RuntimeResult<()> {
        let fresh = setup_frameworks(
            app.instance_name(),
            &entry.descriptor,
            environment,
            self.services.frameworks.as_ref(),
            &self.shared_frameworks,
        )?;
        destroy_owned(&app.replace_frameworks(fresh));
        Ok(())
    }

    fn restore_commands(&self, app: &Arc<AppInstance>) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        for (key, command) in inner.pool.commands_of(app) {
            let restored = inner.commands.restore(command);
            if restored != key {
                debug!(
                    engine = %self.instance_name,
                    command = %key,
                    restored = %restored,
                    "command restored under a new name"
                );
            }
        }
    }

    /// Build an app from scratch and run its initialization.
    fn construct_app(
        &self,
        entry: &AppEntry,
        settings: Settings,
        context: &Context,
        environment: &Environment,
    ) -> Option<Arc<AppInstance>> {
        let instance = entry.instance.as_str();
        let behavior = match guarded(instance, "load_app", || {
            self.services.loader.load_app(&entry.descriptor, instance)
        }) {
            Ok(behavior) => behavior,
            Err(e) => {
                error!(engine = %self.instance_name, app = %instance, error = %e, "app failed to load");
                return None;
            },
        };

        let app = Arc::new(AppInstance::new(
            instance,
            self.instance_name.clone(),
            Arc::clone(&entry.descriptor),
            settings,
            context.clone(),
            behavior,
        ));

        match setup_frameworks(
            instance,
            &entry.descriptor,
            environment,
            self.services.frameworks.as_ref(),
            &self.shared_frameworks,
        ) {
            Ok(frameworks) => {
                app.replace_frameworks(frameworks);
            },
            Err(e) => {
                error!(engine = %self.instance_name, app = %instance, error = %e, "app frameworks failed to load");
                return None;
            },
        }

        self.lock().initializing = Some(Arc::clone(&app));
        let result = guarded(instance, "init_app", || app.behavior().init_app(&AppContext::new(self, &app)));
        self.lock().initializing = None;

        if let Err(e) = result {
            let (commands, panels) = {
                let mut inner = self.lock();
                (inner.commands.remove_owned_by(&app), inner.panels.remove_owned_by(instance))
            };
            destroy_owned(&app.replace_frameworks(Vec::new()));
            error!(
                engine = %self.instance_name,
                app = %instance,
                location = %entry.descriptor.location.display(),
                error = %e,
                removed_commands = commands.len(),
                removed_panels = panels.len(),
                "app failed to initialize, it will not be loaded"
            );
            return None;
        }

        debug!(engine = %self.instance_name, app = %instance, "app initialized");
        Some(app)
    }
}
