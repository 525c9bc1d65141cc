//! Prelude module - commonly used types for convenient import.
//!
//! Use `use trellis_runtime::prelude::*;` to import all essential types.

// Errors
pub use crate::{RuntimeError, RuntimeResult};

// Runtime and engine
pub use crate::{Engine, EngineState, Runtime, RuntimeBuilder};

// Bundles
pub use crate::{App, AppContext, BundleLoader, EngineBackend, FactoryLoader};

// Context
pub use crate::{Context, Entity};

// Commands
pub use crate::{CommandAction, CommandProperties, CommandSelector};

// Main thread
pub use crate::{MainThreadBridge, MainThreadPump};
