//! In-place context changes.

use tracing::{debug, error, info, warn};

use std::sync::Arc;

use super::{Engine, EngineState};
use crate::context::Context;
use crate::descriptor::Settings;
use crate::environment::Environment;
use crate::error::{RuntimeError, RuntimeResult, guarded};

/// What a context change moves the engine to.
struct Transition {
    environment: Arc<Environment>,
    /// `None` keeps the current engine settings.
    settings: Option<Settings>,
}

impl Engine {
    /// Switch the engine to `new_context` without restarting it.
    ///
    /// Apps that support context changes are reused from the bundle pool;
    /// the others are rebuilt. Failures inside app or engine hooks are
    /// logged and do not stop the transition.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::UnsupportedTransition`] if the engine does not
    /// allow context changes, is not ready, or would resolve to a different
    /// engine bundle in the new context. Resolution errors propagate. In every
    /// error case the engine is left untouched.
    pub fn change_context(&self, new_context: Context) -> RuntimeResult<()> {
        let old_context = {
            let mut inner = self.lock();
            match inner.state {
                EngineState::Ready => {},
                EngineState::Destroyed => return Err(self.destroyed()),
                other => {
                    return Err(RuntimeError::UnsupportedTransition(format!(
                        "engine '{}' is {other}",
                        self.instance_name
                    )));
                },
            }
            inner.state = EngineState::Transitioning;
            inner.context.clone()
        };

        let Transition { environment, settings } = match self.prepare_transition(&old_context, &new_context) {
            Ok(Some(transition)) => transition,
            Ok(None) => {
                self.set_state(EngineState::Ready);
                return Ok(());
            },
            Err(e) => {
                self.set_state(EngineState::Ready);
                return Err(e);
            },
        };

        info!(engine = %self.instance_name, from = %old_context, to = %new_context, "changing context");

        self.report(guarded("core", "pre_context_change", || {
            self.services.hooks.pre_context_change(Some(&old_context), &new_context)
        }));
        self.report(guarded(&self.instance_name, "pre_context_change", || {
            self.backend.pre_context_change(&old_context, &new_context)
        }));
        for app in self.apps() {
            self.report(guarded(app.instance_name(), "pre_context_change", || {
                app.behavior().pre_context_change(&old_context, &new_context)
            }));
        }

        {
            let mut inner = self.lock();
            inner.environment = environment;
            inner.context = new_context.clone();
            if let Some(settings) = settings {
                inner.settings = settings;
            }
        }
        self.load_apps(Some(&old_context));

        self.report(guarded(&self.instance_name, "post_context_change", || {
            self.backend.post_context_change(&old_context, &new_context)
        }));
        self.report(guarded("core", "post_context_change", || {
            self.services.hooks.post_context_change(Some(&old_context), &new_context)
        }));
        self.run_post_engine_inits();

        self.set_state(EngineState::Ready);
        Ok(())
    }

    /// Check that the engine can move to `new_context` and resolve what it
    /// moves to. `None` means the context is unchanged.
    fn prepare_transition(&self, old_context: &Context, new_context: &Context) -> RuntimeResult<Option<Transition>> {
        if !self.backend.context_change_allowed() {
            debug!(engine = %self.instance_name, "engine does not allow context changes");
            return Err(RuntimeError::UnsupportedTransition(format!(
                "engine '{}' does not allow context changes",
                self.instance_name
            )));
        }
        if new_context == old_context {
            debug!(engine = %self.instance_name, context = %new_context, "context unchanged");
            return Ok(None);
        }

        let resolver = &self.services.resolver;
        let env_name = resolver.pick_environment(new_context)?.ok_or_else(|| {
            RuntimeError::Init(format!("cannot determine an environment for context ({new_context})"))
        })?;
        let environment = resolver.environment(&env_name, new_context)?;
        let entry = environment.engine(&self.instance_name).ok_or_else(|| {
            RuntimeError::Init(format!(
                "engine '{}' is not configured in environment '{env_name}'",
                self.instance_name
            ))
        })?;
        if *entry.descriptor != *self.descriptor {
            debug!(
                engine = %self.instance_name,
                from = %old_context,
                to = %new_context,
                "engine descriptors differ between contexts"
            );
            return Err(RuntimeError::UnsupportedTransition(format!(
                "engine '{}' resolves to a different bundle in context ({new_context})",
                self.instance_name
            )));
        }
        let settings = match self
            .services
            .validator
            .validate(&self.instance_name, &entry.descriptor.schema, &entry.settings, new_context)
        {
            Ok(settings) => Some(settings),
            Err(e) => {
                warn!(engine = %self.instance_name, error = %e, "keeping current engine settings");
                None
            },
        };
        Ok(Some(Transition { environment, settings }))
    }

    fn report(&self, result: RuntimeResult<()>) {
        if let Err(e) = result {
            error!(engine = %self.instance_name, error = %e, "hook failed during context change");
        }
    }
}
