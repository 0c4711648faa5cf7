//! Request lifetime: the abort coordinator.
//!
//! [`AbortCoordinator::abort`] is the only cancellation trigger. It always
//! sets the cancellation signal first and only then moves the channel into
//! its aborted terminal state, so a handler whose write just failed with
//! [`StreamClosed`](crate::HarnessError::StreamClosed) finds the signal set.

use std::panic::{self, AssertUnwindSafe};

use crate::channel::{BodyReceiver, CloseOutcome, ResponseSender};
use crate::signal::CancellationSignal;

/// Aborts exactly one in-flight request.
///
/// `AbortCoordinator` is `Clone`; every clone aborts the same request and
/// calling [`abort`](Self::abort) any number of times has the effect of
/// calling it once.
#[derive(Debug, Clone)]
pub struct AbortCoordinator {
    request_id: u64,
    signal: CancellationSignal,
    request_body: BodyReceiver,
    response: ResponseSender,
}

impl AbortCoordinator {
    pub(crate) fn new(
        request_id: u64,
        signal: CancellationSignal,
        request_body: BodyReceiver,
        response: ResponseSender,
    ) -> Self {
        Self {
            request_id,
            signal,
            request_body,
            response,
        }
    }

    /// Abort the request.
    ///
    /// If no response byte was committed the response is suppressed and the
    /// client observes a connection-level abort; otherwise the response is
    /// truncated after the bytes already committed. Once the response has
    /// completed this only fires the signal.
    ///
    /// # Panics
    ///
    /// Resumes the panic of a registered callback, after the channel has
    /// been settled.
    pub fn abort(&self) -> CloseOutcome {
        let first = match panic::catch_unwind(AssertUnwindSafe(|| self.signal.cancel())) {
            Ok(first) => first,
            Err(payload) => {
                self.request_body.abort();
                let outcome = self.response.abort();
                tracing::debug!(
                    request_id = self.request_id,
                    ?outcome,
                    "abort callback panicked, response settled"
                );
                panic::resume_unwind(payload);
            }
        };

        self.request_body.abort();
        let outcome = self.response.abort();

        if first {
            match outcome {
                CloseOutcome::Suppressed => tracing::debug!(
                    request_id = self.request_id,
                    "request aborted before headers, response suppressed"
                ),
                CloseOutcome::Truncated { buffered } => tracing::debug!(
                    request_id = self.request_id,
                    buffered,
                    "request aborted after headers, response truncated"
                ),
                other => tracing::debug!(
                    request_id = self.request_id,
                    outcome = ?other,
                    "abort had no effect on the response"
                ),
            }
        }

        outcome
    }

    /// Whether [`abort`](Self::abort) has been called.
    #[inline]
    pub fn is_aborted(&self) -> bool {
        self.signal.is_cancelled()
    }

    /// The signal fired by [`abort`](Self::abort).
    #[inline]
    pub fn signal(&self) -> &CancellationSignal {
        &self.signal
    }
}
