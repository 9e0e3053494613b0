//! The private async runtime behind every outlet, inlet and resolver.
//!
//! The public API is blocking so it can be called from any thread, async or
//! not.  Each public object owns an [`IoRuntime`] that runs its sockets, and
//! blocking calls hand a future to it with [`IoRuntime::call`], waiting on a
//! cancellable [`WaitSlot`] for the answer.
//!
//! # Why not `Runtime::block_on`? (for beginners)
//!
//! `block_on` panics when called from inside another Tokio runtime, which
//! is exactly where an application using `#[tokio::main]` would call us.
//! Waiting on a condition variable works from any thread.  Dropping a
//! runtime from async context panics for the same reason, so
//! [`IoRuntime`]'s `Drop` switches to `shutdown_background` there.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use labstream_core::cancellation::{
    Cancellable, CancellableOperation, RegistryRef, WaitOutcome, WaitSlot,
};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;
use tracing::debug;

/// How long a dropped runtime waits for its tasks outside async context.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Why [`IoRuntime::call`] returned without a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupted {
    TimedOut,
    Cancelled,
}

/// A small multi-threaded Tokio runtime owned by one public object.
pub struct IoRuntime {
    runtime: Option<Runtime>,
    handle: Handle,
}

impl IoRuntime {
    /// Starts a runtime whose worker threads are named `labstream-{name}`.
    ///
    /// # Errors
    ///
    /// Propagates the OS error if the worker threads cannot be spawned.
    pub fn new(name: &str) -> std::io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name(format!("labstream-{name}"))
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        Ok(Self {
            runtime: Some(runtime),
            handle,
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Runs `future` on the runtime and blocks the calling thread until it
    /// completes, `deadline` passes, or an operation registered at `cancel`
    /// is cancelled.  The future is aborted if the caller stops waiting.
    ///
    /// # Errors
    ///
    /// [`Interrupted::TimedOut`] or [`Interrupted::Cancelled`].
    pub fn call<F>(
        &self,
        future: F,
        deadline: Option<Instant>,
        cancel: &RegistryRef,
    ) -> Result<F::Output, Interrupted>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let slot = Arc::new(WaitSlot::new(None::<F::Output>));
        let target: Arc<dyn Cancellable> = Arc::clone(&slot) as Arc<dyn Cancellable>;
        let operation = CancellableOperation::new(target);
        // A closed registry cancels the slot right here.
        operation.register_at_ref(cancel);

        let writer = Arc::clone(&slot);
        let task = self.handle.spawn(async move {
            let value = future.await;
            writer.update(|slot| *slot = Some(value));
        });

        let outcome = slot.wait_until(deadline, Option::is_some);
        task.abort();
        drop(operation);

        match outcome {
            WaitOutcome::Ready => slot.update(Option::take).ok_or(Interrupted::Cancelled),
            WaitOutcome::TimedOut => Err(Interrupted::TimedOut),
            WaitOutcome::Cancelled => Err(Interrupted::Cancelled),
        }
    }
}

impl Drop for IoRuntime {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            if Handle::try_current().is_ok() {
                runtime.shutdown_background();
            } else {
                runtime.shutdown_timeout(SHUTDOWN_GRACE);
            }
            debug!("I/O runtime shut down");
        }
    }
}

impl std::fmt::Debug for IoRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoRuntime").finish_non_exhaustive()
    }
}

/// `now + timeout`, or `None` ("forever") when that overflows.
pub fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}

/// Seconds as a [`Duration`], clamping negative and non-finite input.
pub fn seconds(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::try_from_secs_f64(value).unwrap_or(Duration::MAX)
    } else if value == f64::INFINITY {
        Duration::MAX
    } else {
        Duration::ZERO
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
