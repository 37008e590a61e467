//! One-shot cancellation signal shared by a load operation and its workers.
//!
//! The flag is a single `AtomicBool` so the hot read path in workers is
//! lock-free. Cleanup callbacks sit behind a mutex and run exactly once, on
//! whichever thread performs the cancellation.

use log::{debug, error};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

type Cleanup = Box<dyn FnOnce() + Send + 'static>;

struct Inner {
    cancelled: AtomicBool,
    callbacks: Mutex<Vec<Cleanup>>,
}

/// Cooperative cancellation token.
///
/// Cloning is cheap and every clone observes the same flag.
///
/// # Example
/// ```
/// # use meshvault::core::cancel::CancellationToken;
/// let token = CancellationToken::new();
/// let worker_token = token.clone();
///
/// token.register_cleanup(|| println!("released read buffers"));
/// assert!(token.cancel());
/// assert!(worker_token.is_cancelled());
/// assert!(!token.cancel()); // second call is a no-op
/// ```
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Non-blocking cancellation check.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Cancel the token.
    ///
    /// Returns `true` if this call performed the cancellation, `false` if the
    /// token was already cancelled. Registered callbacks run in registration
    /// order; a panicking callback is logged and the rest still run.
    pub fn cancel(&self) -> bool {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return false;
        }

        let callbacks = std::mem::take(
            &mut *self.inner.callbacks.lock().unwrap_or_else(|e| e.into_inner()),
        );
        debug!("Cancellation requested, running {} cleanup callbacks", callbacks.len());

        for (idx, callback) in callbacks.into_iter().enumerate() {
            run_cleanup(idx, callback);
        }
        true
    }

    /// Register a callback to run on cancellation.
    ///
    /// If the token is already cancelled the callback runs immediately on the
    /// calling thread.
    pub fn register_cleanup<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut callbacks = self.inner.callbacks.lock().unwrap_or_else(|e| e.into_inner());
            // Flag is checked under the lock: cancel() sets the flag before it
            // takes the list, so a push seen here is always drained by it.
            if !self.is_cancelled() {
                callbacks.push(Box::new(f));
                return;
            }
        }
        run_cleanup(usize::MAX, Box::new(f));
    }

    /// Number of callbacks waiting for cancellation
    pub fn pending_callbacks(&self) -> usize {
        self.inner.callbacks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

fn run_cleanup(idx: usize, callback: Cleanup) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
        let msg = panic_message(payload.as_ref());
        if idx == usize::MAX {
            error!("Late cleanup callback panicked: {}", msg);
        } else {
            error!("Cleanup callback #{} panicked: {}", idx, msg);
        }
    }
}

/// Extract a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
