//! Runtime error types.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while resolving or checking a bundle descriptor.
#[derive(Debug, Error)]
pub enum DescriptorError {
    /// No bundle or environment with this name is known.
    #[error("Descriptor not found: {0}")]
    NotFound(String),

    /// The bundle is declared but not present at its install location.
    #[error("Bundle '{name}' does not exist on disk at {}", path.display())]
    MissingManifest {
        /// Bundle name.
        name: String,
        /// Expected install location.
        path: PathBuf,
    },

    /// IO error while inspecting a bundle.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The bundle cannot run with the installed runtime.
    #[error("{}", reasons.join(" "))]
    VersionConstraints {
        /// One human readable sentence per failed constraint.
        reasons: Vec<String>,
    },
}

/// Errors that can occur in the bundle runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The engine could not be constructed.
    #[error("Engine initialization failed: {0}")]
    Init(String),

    /// Settings do not match the schema of a bundle.
    #[error("Configuration error for '{bundle}': {message}")]
    Config {
        /// Engine or app instance whose settings are invalid.
        bundle: String,
        /// Offending setting keys.
        keys: Vec<String>,
        /// Description of every problem found.
        message: String,
    },

    /// The engine cannot switch to the requested context in place.
    #[error("Context change not supported: {0}")]
    UnsupportedTransition(String),

    /// A panel was registered outside of an app's initialization.
    #[error("Panels can only be registered during app initialization: {0}")]
    NotInInitPhase(String),

    /// Component code failed or panicked.
    #[error("{component} failed during {operation}: {message}")]
    ComponentFault {
        /// Engine, app or framework instance name.
        component: String,
        /// Operation in progress (e.g. `init_app`).
        operation: String,
        /// Error or panic message.
        message: String,
    },

    /// Descriptor resolution or check failed.
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),

    /// The main thread no longer services invocations.
    #[error("Main thread is not available")]
    MainThreadUnavailable,

    /// The engine has been torn down.
    #[error("Engine '{0}' has been destroyed")]
    AlreadyDestroyed(String),
}

impl RuntimeError {
    /// Build a [`RuntimeError::ComponentFault`].
    pub fn fault(
        component: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::ComponentFault {
            component: component.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Best effort rendering of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_owned()
    }
}

/// Run component code, turning both errors and panics into
/// [`RuntimeError::ComponentFault`].
pub(crate) fn guarded<T>(
    component: &str,
    operation: &str,
    f: impl FnOnce() -> anyhow::Result<T>,
) -> RuntimeResult<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(RuntimeError::fault(component, operation, format!("{e:#}"))),
        Err(payload) => Err(RuntimeError::fault(
            component,
            operation,
            format!("panicked: {}", panic_message(payload.as_ref())),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_constraints_joins_reasons() {
        let err = DescriptorError::VersionConstraints {
            reasons: vec!["Requires core 2.0.".into(), "Requires engine 1.5.".into()],
        };
        assert_eq!(err.to_string(), "Requires core 2.0. Requires engine 1.5.");
    }

    #[test]
    fn test_guarded_converts_error() {
        let result: RuntimeResult<()> = guarded("publish", "init_app", || anyhow::bail!("no shotgun"));
        match result {
            Err(RuntimeError::ComponentFault {
                component,
                operation,
                message,
            }) => {
                assert_eq!(component, "publish");
                assert_eq!(operation, "init_app");
                assert_eq!(message, "no shotgun");
            },
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_guarded_catches_panic() {
        let result: RuntimeResult<()> = guarded("publish", "destroy_app", || panic!("boom"));
        let err = result.unwrap_err();
        assert!(err.to_string().contains("panicked: boom"));
    }

    #[test]
    fn test_guarded_passes_value_through() {
        assert_eq!(guarded("a", "b", || Ok(7)).unwrap(), 7);
    }
}
