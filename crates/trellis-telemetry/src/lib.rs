//! Trellis Telemetry - logging for the trellis bundle runtime.
//!
//! This crate provides:
//! - Configurable logging setup with multiple formats and targets
//! - A [`LogHandle`] to toggle global debug logging at runtime
//! - Attachable [`LogSink`]s so an engine can mirror log output into its host
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use trellis_telemetry::{LogConfig, LogFormat, LogRecord, LogSink, setup_logging};
//!
//! struct Console;
//!
//! impl LogSink for Console {
//!     fn emit(&self, record: &LogRecord) {
//!         eprintln!("[{}] {}", record.level, record.message);
//!     }
//! }
//!
//! # fn main() -> Result<(), trellis_telemetry::TelemetryError> {
//! let handle = setup_logging(&LogConfig::new("info").with_format(LogFormat::Compact))?;
//! let sink = handle.attach_sink(Arc::new(Console));
//! tracing::info!("engine started");
//! handle.set_global_debug(true)?;
//! handle.detach_sink(sink);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod prelude;

mod error;
mod logging;
mod sink;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::{
    FileRotation, LogConfig, LogFormat, LogHandle, LogTarget, setup_default_logging, setup_logging,
};
pub use sink::{LogRecord, LogSink, SinkId, SinkLayer, SinkRegistry};
