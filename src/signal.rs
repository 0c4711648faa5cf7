//! One-shot broadcast cancellation signal.
//!
//! A [`CancellationSignal`] starts unset and is set at most once. Observers
//! either poll [`CancellationSignal::is_cancelled`], await
//! [`CancellationSignal::cancelled`], or register a callback. Registering
//! after the signal is already set runs the callback immediately, so there
//! is no window where a late subscriber waits forever.
//!
//! # Example
//!
//! ```ignore
//! let signal = ctx.request_aborted();
//! signal.register(|| tracing::info!("request aborted"));
//! signal.cancelled().await;
//! ```

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::Notify;

type Callback = Box<dyn FnOnce() + Send + 'static>;

struct SignalState {
    cancelled: bool,
    next_id: u64,
    callbacks: Vec<(u64, Callback)>,
}

struct Inner {
    state: Mutex<SignalState>,
    notify: Notify,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, SignalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared one-shot cancellation signal.
///
/// `CancellationSignal` is `Clone`; all clones observe the same flag.
#[derive(Clone)]
pub struct CancellationSignal {
    inner: Arc<Inner>,
}

impl CancellationSignal {
    /// Create a new, unset signal.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(SignalState {
                    cancelled: false,
                    next_id: 0,
                    callbacks: Vec::new(),
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Whether the signal has been set.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().cancelled
    }

    /// Set the signal.
    ///
    /// Returns `true` for the call that actually set it. Callbacks run on the
    /// calling thread, in registration order, after the internal lock is
    /// released.
    ///
    /// # Panics
    ///
    /// A panicking callback does not stop the others. Once every callback
    /// has run, the first panic is resumed.
    pub(crate) fn cancel(&self) -> bool {
        let callbacks = {
            let mut state = self.inner.lock();
            if state.cancelled {
                return false;
            }
            state.cancelled = true;
            std::mem::take(&mut state.callbacks)
        };

        self.inner.notify.notify_waiters();
        let mut first_panic = None;
        for (_, callback) in callbacks {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
                first_panic.get_or_insert(payload);
            }
        }
        if let Some(payload) = first_panic {
            panic::resume_unwind(payload);
        }
        true
    }

    /// Register a callback to run when the signal is set.
    ///
    /// If the signal is already set the callback runs before this returns.
    pub fn register<F>(&self, callback: F) -> Registration
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.inner.lock();
        if state.cancelled {
            drop(state);
            callback();
            return Registration {
                signal: Weak::new(),
                id: None,
            };
        }

        let id = state.next_id;
        state.next_id += 1;
        state.callbacks.push((id, Box::new(callback)));

        Registration {
            signal: Arc::downgrade(&self.inner),
            id: Some(id),
        }
    }

    /// Wait until the signal is set. Returns immediately if it already is.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Enlist before checking the flag so a concurrent cancel is not missed.
        notified.as_mut().enable();

        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for CancellationSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationSignal")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Handle to a registered callback.
///
/// Dropping it keeps the callback registered; call [`Registration::unregister`]
/// to remove it.
#[derive(Debug)]
pub struct Registration {
    signal: Weak<Inner>,
    id: Option<u64>,
}

impl Registration {
    /// Remove the callback. Returns `false` if it already ran or was removed.
    pub fn unregister(self) -> bool {
        let (Some(inner), Some(id)) = (self.signal.upgrade(), self.id) else {
            return false;
        };

        let mut state = inner.lock();
        let before = state.callbacks.len();
        state.callbacks.retain(|(entry, _)| *entry != id);
        state.callbacks.len() != before
    }
}

impl fmt::Debug for Inner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inner").finish_non_exhaustive()
    }
}
