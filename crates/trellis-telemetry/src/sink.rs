//! Attachable log sinks.
//!
//! A [`SinkLayer`] is installed once in the subscriber stack. Engines attach
//! and detach their own [`LogSink`] at runtime; every event that passes the
//! global filter is forwarded to all attached sinks.

use std::fmt;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

/// A single log event as seen by a sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Severity.
    pub level: Level,
    /// Event target (usually the module path).
    pub target: String,
    /// Rendered message followed by any structured fields as `key=value`.
    pub message: String,
}

/// Receiver of log records, typically a host-side log console.
///
/// Implementations must not emit `tracing` events from [`emit`](Self::emit):
/// the record would be routed straight back into the sink.
pub trait LogSink: Send + Sync {
    /// Handle one record.
    fn emit(&self, record: &LogRecord);
}

/// Identifier of an attached sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SinkId(u64);

impl fmt::Display for SinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sink-{}", self.0)
    }
}

/// The set of currently attached sinks.
#[derive(Default)]
pub struct SinkRegistry {
    next_id: AtomicU64,
    sinks: RwLock<Vec<(SinkId, Arc<dyn LogSink>)>>,
}

impl SinkRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a sink. It receives every record until detached.
    pub fn attach(&self, sink: Arc<dyn LogSink>) -> SinkId {
        let id = SinkId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.sinks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, sink));
        id
    }

    /// Detach a sink. Returns `false` if it was not attached.
    pub fn detach(&self, id: SinkId) -> bool {
        let mut sinks = self.sinks.write().unwrap_or_else(PoisonError::into_inner);
        let before = sinks.len();
        sinks.retain(|(sink_id, _)| *sink_id != id);
        sinks.len() != before
    }

    /// Number of attached sinks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sinks.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no sink is attached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forward a record to every attached sink.
    pub fn dispatch(&self, record: &LogRecord) {
        // Snapshot so sinks run without the lock held.
        let sinks: Vec<Arc<dyn LogSink>> = self
            .sinks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, sink)| Arc::clone(sink))
            .collect();
        for sink in sinks {
            sink.emit(record);
        }
    }
}

impl fmt::Debug for SinkRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkRegistry")
            .field("sink_count", &self.len())
            .finish_non_exhaustive()
    }
}

/// `tracing-subscriber` layer forwarding events to a [`SinkRegistry`].
#[derive(Debug, Clone)]
pub struct SinkLayer {
    sinks: Arc<SinkRegistry>,
}

impl SinkLayer {
    /// Create a layer bound to the given registry.
    #[must_use]
    pub fn new(sinks: Arc<SinkRegistry>) -> Self {
        Self { sinks }
    }
}

impl<S: Subscriber> Layer<S> for SinkLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if self.sinks.is_empty() {
            return;
        }
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let metadata = event.metadata();
        let record = LogRecord {
            level: *metadata.level(),
            target: metadata.target().to_owned(),
            message: visitor.finish(),
        };
        self.sinks.dispatch(&record);
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields
        } else {
            format!("{} {}", self.message, self.fields)
        }
    }

    fn push_field(&mut self, name: &str, value: fmt::Arguments<'_>) {
        if !self.fields.is_empty() {
            self.fields.push(' ');
        }
        let _ = write!(self.fields, "{name}={value}");
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_owned();
        } else {
            self.push_field(field.name(), format_args!("{value}"));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.push_field(field.name(), format_args!("{value:?}"));
        }
    }
}
