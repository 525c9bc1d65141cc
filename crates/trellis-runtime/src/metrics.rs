//! Usage metrics.
//!
//! Engines and command wrappers push [`MetricEvent`]s into a bounded
//! [`MetricsQueue`]. A [`MetricsDispatcher`] worker thread drains the queue
//! in batches into a [`MetricsTransport`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};
use trellis_config::RuntimeSection;

/// A single usage event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MetricEvent {
    /// Something was done by the user.
    UserActivity {
        /// Engine or app the activity belongs to.
        module: String,
        /// What happened.
        action: String,
        /// When it happened.
        timestamp: DateTime<Utc>,
    },
    /// A property of the user's setup.
    UserAttribute {
        /// Attribute name.
        name: String,
        /// Attribute value.
        value: String,
        /// When it was recorded.
        timestamp: DateTime<Utc>,
    },
}

impl MetricEvent {
    /// A user activity event stamped now.
    #[must_use]
    pub fn user_activity(module: impl Into<String>, action: impl Into<String>) -> Self {
        Self::UserActivity {
            module: module.into(),
            action: action.into(),
            timestamp: Utc::now(),
        }
    }

    /// A user attribute event stamped now.
    #[must_use]
    pub fn user_attribute(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::UserAttribute {
            name: name.into(),
            value: value.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Bounded FIFO of pending events. When full, the oldest event is dropped.
#[derive(Debug, Clone)]
pub struct MetricsQueue {
    events: Arc<Mutex<VecDeque<MetricEvent>>>,
    capacity: usize,
}

impl MetricsQueue {
    /// A queue holding at most `capacity` events (at least one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1024)))),
            capacity,
        }
    }

    /// Append an event. Returns `true` if an older event had to be dropped.
    pub fn push(&self, event: MetricEvent) -> bool {
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        let dropped = if events.len() >= self.capacity {
            events.pop_front();
            true
        } else {
            false
        };
        events.push_back(event);
        dropped
    }

    /// Remove and return up to `max` of the oldest events.
    pub fn drain(&self, max: usize) -> Vec<MetricEvent> {
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        let n = max.min(events.len());
        events.drain(..n).collect()
    }

    /// Number of pending events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of pending events.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Destination of metric batches.
pub trait MetricsTransport: Send + Sync {
    /// Deliver one batch.
    ///
    /// # Errors
    ///
    /// Failures are logged by the dispatcher; the batch is not retried.
    fn send(&self, batch: &[MetricEvent]) -> anyhow::Result<()>;
}

/// Metrics tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSettings {
    /// Whether events are recorded at all.
    pub enabled: bool,
    /// Queue capacity.
    pub queue_capacity: usize,
    /// Maximum events per transport call.
    pub batch_size: usize,
    /// Pause between two polls of an empty queue.
    pub poll_interval: Duration,
    /// How long stopping waits for the worker to finish.
    pub flush_timeout: Duration,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self::from(&RuntimeSection::default())
    }
}

impl From<&RuntimeSection> for MetricsSettings {
    fn from(section: &RuntimeSection) -> Self {
        Self {
            enabled: section.metrics_enabled,
            queue_capacity: section.metrics_queue_capacity,
            batch_size: section.metrics_batch_size,
            poll_interval: Duration::from_millis(section.metrics_poll_interval_ms),
            flush_timeout: Duration::from_millis(section.metrics_flush_timeout_ms),
        }
    }
}

/// Background worker draining a [`MetricsQueue`].
#[derive(Debug)]
pub struct MetricsDispatcher {
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    flush_timeout: Duration,
}

impl MetricsDispatcher {
    /// Start the worker thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn start(
        queue: MetricsQueue,
        transport: Arc<dyn MetricsTransport>,
        settings: &MetricsSettings,
    ) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = Arc::clone(&stop);
        let batch_size = settings.batch_size.max(1);
        let poll_interval = settings.poll_interval;

        let worker = std::thread::Builder::new()
            .name("trellis-metrics".into())
            .spawn(move || {
                debug!("metrics dispatcher running");
                while !worker_stop.load(Ordering::SeqCst) {
                    if dispatch_pending(&queue, transport.as_ref(), batch_size) == 0 {
                        std::thread::park_timeout(poll_interval);
                    }
                }
                // Final flush of whatever was queued before the stop request.
                dispatch_pending(&queue, transport.as_ref(), batch_size);
                debug!("metrics dispatcher stopped");
            })?;

        Ok(Self {
            stop,
            worker: Some(worker),
            flush_timeout: settings.flush_timeout,
        })
    }

    /// Whether the worker thread is still alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Ask the worker to flush and exit, waiting at most the flush timeout.
    ///
    /// Returns `true` if the worker finished in time. A worker that does not
    /// finish is detached.
    pub fn stop(&mut self) -> bool {
        let Some(worker) = self.worker.take() else {
            return true;
        };
        self.stop.store(true, Ordering::SeqCst);
        worker.thread().unpark();

        let started = Instant::now();
        while !worker.is_finished() {
            if started.elapsed() >= self.flush_timeout {
                warn!(
                    timeout_ms = self.flush_timeout.as_millis(),
                    "metrics dispatcher did not stop in time, detaching it"
                );
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        if worker.join().is_err() {
            warn!("metrics dispatcher panicked");
        }
        true
    }
}

impl Drop for MetricsDispatcher {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = &self.worker {
            worker.thread().unpark();
        }
    }
}

/// Send everything currently queued. Returns the number of events taken.
fn dispatch_pending(queue: &MetricsQueue, transport: &dyn MetricsTransport, batch_size: usize) -> usize {
    let mut taken = 0usize;
    loop {
        let batch = queue.drain(batch_size);
        if batch.is_empty() {
            return taken;
        }
        taken = taken.saturating_add(batch.len());
        if let Err(e) = transport.send(&batch) {
            warn!(error = %e, events = batch.len(), "failed to send metrics batch");
        }
    }
}
