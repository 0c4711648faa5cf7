//! Helpers for the code driving a scenario.
//!
//! The harness core never times out on its own. Bounding a wait is the
//! driver's job, done with [`TimeoutExt`]; lining a handler up with the
//! driver is done with [`SyncPoint`].
//!
//! # Example
//!
//! ```ignore
//! let headers_seen = SyncPoint::new();
//! let gate = headers_seen.clone();
//! let server = TestServer::builder()
//!     .handler(move |ctx| {
//!         let gate = gate.clone();
//!         async move {
//!             ctx.flush_headers().await?;
//!             gate.wait().default_timeout().await?;
//!             ctx.abort();
//!             Ok(())
//!         }
//!     })
//!     .build()?;
//! ```

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::time::Timeout;

use crate::config::DEFAULT_TIMEOUT_MS;
use crate::error::{HarnessError, Result};
use crate::signal::CancellationSignal;

/// Bound applied by [`TimeoutExt::default_timeout`].
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(DEFAULT_TIMEOUT_MS);

/// Bounded waits for any future.
pub trait TimeoutExt: Future + Sized {
    /// Fail with [`HarnessError::Timeout`] if not ready within `limit`.
    fn timeout_after(self, limit: Duration) -> Bounded<Self> {
        Bounded {
            inner: Box::pin(tokio::time::timeout(limit, self)),
            limit,
        }
    }

    /// [`timeout_after`](Self::timeout_after) with [`DEFAULT_TIMEOUT`].
    fn default_timeout(self) -> Bounded<Self> {
        self.timeout_after(DEFAULT_TIMEOUT)
    }
}

impl<F: Future> TimeoutExt for F {}

/// Future returned by [`TimeoutExt`] methods.
#[must_use = "futures do nothing unless awaited"]
pub struct Bounded<F> {
    inner: Pin<Box<Timeout<F>>>,
    limit: Duration,
}

impl<F: Future> Future for Bounded<F> {
    type Output = Result<F::Output>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let limit = self.limit;
        self.inner
            .as_mut()
            .poll(cx)
            .map(|result| result.map_err(|_| HarnessError::Timeout(limit)))
    }
}

/// A one-shot rendezvous between driver and handler.
///
/// Setting it wakes every current and future waiter; setting it again has
/// no effect.
#[derive(Debug, Clone, Default)]
pub struct SyncPoint {
    signal: CancellationSignal,
}

impl SyncPoint {
    /// Create an unset sync point.
    pub fn new() -> Self {
        Self::default()
    }

    /// Release all waiters. Returns `false` if already set.
    pub fn set(&self) -> bool {
        self.signal.cancel()
    }

    /// Whether [`set`](Self::set) has been called.
    #[inline]
    pub fn is_set(&self) -> bool {
        self.signal.is_cancelled()
    }

    /// Wait until the point is set.
    pub async fn wait(&self) {
        self.signal.cancelled().await
    }
}
