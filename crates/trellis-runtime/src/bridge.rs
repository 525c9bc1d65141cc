//! Main-thread invocation bridge.
//!
//! Host toolkits usually require UI work on one designated thread. A
//! [`MainThreadBridge`] lets any thread run a closure on that thread. The
//! thread that created the bridge owns the matching [`MainThreadPump`] and
//! must drain it from its event loop.
//!
//! A synchronous [`invoke`](MainThreadBridge::invoke) from a worker thread
//! blocks until the main thread ran the closure. If the main thread is
//! itself blocked waiting on that worker, both deadlock: callers must not
//! invoke synchronously from a thread the main thread waits on. Synchronous
//! invocation must not be used from inside an async runtime either.

use std::fmt;
use std::marker::PhantomData;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, ThreadId};

use tokio::sync::{mpsc, oneshot};
use tracing::error;

use crate::error::{RuntimeError, RuntimeResult, panic_message};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Handle used to run closures on the main thread. Cheap to clone.
#[derive(Clone)]
pub struct MainThreadBridge {
    main: ThreadId,
    sender: mpsc::UnboundedSender<Job>,
    handoff: Arc<Mutex<()>>,
}

impl fmt::Debug for MainThreadBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MainThreadBridge")
            .field("main", &self.main)
            .field("closed", &self.sender.is_closed())
            .finish_non_exhaustive()
    }
}

impl MainThreadBridge {
    /// Create a bridge whose main thread is the current thread.
    #[must_use]
    pub fn new() -> (Self, MainThreadPump) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let bridge = Self {
            main: thread::current().id(),
            sender,
            handoff: Arc::new(Mutex::new(())),
        };
        let pump = MainThreadPump {
            receiver,
            _not_send: PhantomData,
        };
        (bridge, pump)
    }

    /// Whether the caller runs on the main thread.
    #[must_use]
    pub fn is_main_thread(&self) -> bool {
        thread::current().id() == self.main
    }

    /// Whether the pump was dropped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Run `f` on the main thread and return its result.
    ///
    /// On the main thread `f` runs immediately. Elsewhere the caller blocks
    /// until the pump ran it. A panic in `f` is resumed in the caller.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::MainThreadUnavailable`] if the pump is gone.
    pub fn invoke<F, T>(&self, f: F) -> RuntimeResult<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.is_main_thread() {
            return Ok(f());
        }

        let (tx, rx) = oneshot::channel::<thread::Result<T>>();
        let job: Job = Box::new(move || {
            let _ = tx.send(catch_unwind(AssertUnwindSafe(f)));
        });

        let outcome = {
            let _handoff = self.handoff.lock().unwrap_or_else(PoisonError::into_inner);
            self.sender
                .send(job)
                .map_err(|_| RuntimeError::MainThreadUnavailable)?;
            rx.blocking_recv()
        };

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(payload)) => resume_unwind(payload),
            Err(_) => Err(RuntimeError::MainThreadUnavailable),
        }
    }

    /// Queue `f` for the main thread and return immediately.
    ///
    /// The caller never observes the outcome. A panic in `f` is logged on the
    /// main thread.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::MainThreadUnavailable`] if the pump is gone.
    pub fn invoke_async<F>(&self, f: F) -> RuntimeResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let job: Job = Box::new(move || {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
                error!(
                    panic = %panic_message(payload.as_ref()),
                    "asynchronous main thread invocation panicked"
                );
            }
        });
        self.sender
            .send(job)
            .map_err(|_| RuntimeError::MainThreadUnavailable)
    }
}

/// Main-thread side of a [`MainThreadBridge`]. Not `Send`: it stays on the
/// thread that created the bridge.
pub struct MainThreadPump {
    receiver: mpsc::UnboundedReceiver<Job>,
    _not_send: PhantomData<*const ()>,
}

impl fmt::Debug for MainThreadPump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MainThreadPump")
            .field("pending", &self.receiver.len())
            .finish()
    }
}

impl MainThreadPump {
    /// Run every queued invocation. Returns how many ran.
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0usize;
        while let Ok(job) = self.receiver.try_recv() {
            job();
            ran = ran.saturating_add(1);
        }
        ran
    }

    /// Run invocations until every bridge clone is dropped.
    pub fn run_until_closed(&mut self) {
        while let Some(job) = self.receiver.blocking_recv() {
            job();
        }
    }

    /// Number of queued invocations.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }
}
