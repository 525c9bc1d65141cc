//! Process-level hooks fired around engine lifecycle events.

use crate::context::Context;
use crate::engine::Engine;

/// Host callbacks invoked by the runtime.
///
/// Every method defaults to a no-op. Errors are logged by the runtime and
/// never abort the operation that fired the hook.
pub trait CoreHooks: Send + Sync {
    /// Before the active context changes. `current` is `None` when no
    /// engine is running yet.
    ///
    /// # Errors
    ///
    /// Failures are logged.
    fn pre_context_change(&self, _current: Option<&Context>, _next: &Context) -> anyhow::Result<()> {
        Ok(())
    }

    /// After the active context changed.
    ///
    /// # Errors
    ///
    /// Failures are logged.
    fn post_context_change(&self, _previous: Option<&Context>, _current: &Context) -> anyhow::Result<()> {
        Ok(())
    }

    /// After an engine finished initializing.
    ///
    /// # Errors
    ///
    /// Failures are logged.
    fn engine_init(&self, _engine: &Engine) -> anyhow::Result<()> {
        Ok(())
    }

    /// During teardown: drop anything cached for the engine being destroyed.
    fn clear_caches(&self) {}
}

/// Hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl CoreHooks for NoopHooks {}
