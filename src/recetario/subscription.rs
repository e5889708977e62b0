//! Cancellable handle for a live subscription.
//!
//! A subscription is a background task draining a change feed into a callback, plus
//! the cleanup that has to run when the consumer goes away (leaving the realtime
//! channel, resetting presence). Closing is idempotent and also happens on drop.

use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::BoxFuture;
use tokio::task::JoinHandle;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Shared open/closed flag guarding callback delivery.
///
/// Callbacks run while holding the gate, so once [`Gate::shut`] returns no callback is
/// running and none will start.
#[derive(Clone, Debug)]
pub(crate) struct Gate(Arc<Mutex<bool>>);

impl Gate {
    pub(crate) fn new() -> Self {
        Self(Arc::new(Mutex::new(true)))
    }

    /// Runs `f` if the gate is still open.
    pub(crate) fn run<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let open = lock(&self.0);
        if *open { Some(f()) } else { None }
    }

    pub(crate) fn is_open(&self) -> bool {
        *lock(&self.0)
    }

    /// Closes the gate. Returns `true` if it was open.
    pub(crate) fn shut(&self) -> bool {
        std::mem::replace(&mut *lock(&self.0), false)
    }
}

pub struct Subscription {
    name: String,
    gate: Gate,
    task: Mutex<Option<JoinHandle<()>>>,
    cleanup: Mutex<Option<BoxFuture<'static, ()>>>,
}

impl Subscription {
    pub(crate) fn new(
        name: impl Into<String>,
        gate: Gate,
        task: JoinHandle<()>,
        cleanup: BoxFuture<'static, ()>,
    ) -> Self {
        Self {
            name: name.into(),
            gate,
            task: Mutex::new(Some(task)),
            cleanup: Mutex::new(Some(cleanup)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        !self.gate.is_open()
    }

    /// Stops delivery and runs the cleanup. Calling it again is a no-op.
    pub async fn close(&self) {
        if !self.gate.shut() {
            return;
        }
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
        let cleanup = lock(&self.cleanup).take();
        if let Some(cleanup) = cleanup {
            cleanup.await;
        }
        tracing::debug!(
            target: "recetario::subscription",
            "Closed subscription {}",
            self.name
        );
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.gate.shut() {
            return;
        }
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
        let Some(cleanup) = lock(&self.cleanup).take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(cleanup);
            }
            Err(_) => tracing::warn!(
                target: "recetario::subscription",
                "Subscription {} dropped outside a runtime, cleanup skipped",
                self.name
            ),
        }
    }
}
