//! Prelude module - commonly used types for convenient import.
//!
//! Use `use trellis_telemetry::prelude::*;` to import all essential types.

// Errors
pub use crate::{TelemetryError, TelemetryResult};

// Logging
pub use crate::{LogConfig, LogFormat, LogHandle, LogTarget, setup_logging};

// Sinks
pub use crate::{LogRecord, LogSink, SinkId};
