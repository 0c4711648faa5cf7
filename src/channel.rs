//! In-memory duplex transport between a virtual client and a virtual server.
//!
//! A channel is two independent byte pipes plus a one-way "headers
//! committed" latch on the response side:
//!
//! ```text
//!              BodySender ──► request pipe ──► BodyReceiver
//! TestClient                                               Handler
//!          ResponseReceiver ◄── response pipe ◄── ResponseSender
//!                               + head latch
//! ```
//!
//! All response-side state (head, latch, buffered chunks, terminal state)
//! sits behind one mutex, so the abort decision in `ResponseSender::abort`
//! and the commit performed by [`ResponseSender::write`] can never
//! interleave.
//!
//! # Flow control
//!
//! The response pipe accepts writes while fewer than `buffer_limit` bytes
//! are waiting to be read (`0` disables the limit). A write arriving at a
//! full pipe suspends until the client drains it or the pipe terminates.
//! There is no internal timeout.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};
use tokio::sync::Notify;

use crate::error::{AbortStage, HarnessError, RequestAborted, Result};

/// Default response buffer limit in bytes.
pub const DEFAULT_RESPONSE_BUFFER_LIMIT: usize = 64 * 1024;

/// What a close actually did to the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Response ended cleanly.
    Completed,
    /// Nothing had been committed; the client sees a connection failure.
    Suppressed,
    /// Headers were committed; `buffered` bytes were still waiting to be
    /// read and remain visible before the error.
    Truncated { buffered: usize },
    /// The pipe had already been aborted.
    AlreadyAborted,
    /// The response had already completed; an abort is a no-op.
    AlreadyComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamEnd {
    Completed,
    Aborted,
}

/// Status line and headers of a response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    status: StatusCode,
    headers: HeaderMap,
}

impl ResponseHead {
    fn new() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
        }
    }

    /// Response status code.
    #[inline]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Response headers.
    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

/// Buffered chunks of one pipe direction.
#[derive(Debug, Default)]
struct PipeState {
    chunks: VecDeque<Bytes>,
    buffered: usize,
    end: Option<StreamEnd>,
}

impl PipeState {
    fn push(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        self.buffered += data.len();
        self.chunks.push_back(data);
    }

    fn pop(&mut self) -> Option<Bytes> {
        let chunk = self.chunks.pop_front()?;
        self.buffered -= chunk.len();
        Some(chunk)
    }

    fn has_room(&self, limit: usize) -> bool {
        limit == 0 || self.buffered < limit
    }
}

#[derive(Debug)]
struct ResponseState {
    head: ResponseHead,
    headers_committed: bool,
    receiver_dropped: bool,
    body: PipeState,
}

#[derive(Debug)]
struct Shared<S> {
    state: Mutex<S>,
    /// Woken when data or a terminal state becomes readable.
    readable: Notify,
    /// Woken when buffer space frees up or the pipe terminates.
    writable: Notify,
}

impl<S> Shared<S> {
    fn new(state: S) -> Self {
        Self {
            state: Mutex::new(state),
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, S> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wake_all(&self) {
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }
}

/// Create a connected channel.
///
/// `response_buffer_limit` bounds how many unread response bytes may be
/// buffered before writes suspend (`0` = unbounded).
pub fn duplex(response_buffer_limit: usize) -> (ServerEnd, ClientEnd) {
    let request = Arc::new(Shared::new(PipeState::default()));
    let response = Arc::new(Shared::new(ResponseState {
        head: ResponseHead::new(),
        headers_committed: false,
        receiver_dropped: false,
        body: PipeState::default(),
    }));

    let server = ServerEnd {
        request_body: BodyReceiver {
            shared: request.clone(),
        },
        response: ResponseSender {
            shared: response.clone(),
            limit: response_buffer_limit,
        },
    };
    let client = ClientEnd {
        request_body: BodySender { shared: request },
        response: ResponseReceiver { shared: response },
    };

    (server, client)
}

/// Server half: reads the request body, writes the response.
#[derive(Debug)]
pub struct ServerEnd {
    pub request_body: BodyReceiver,
    pub response: ResponseSender,
}

/// Client half: writes the request body, reads the response.
#[derive(Debug)]
pub struct ClientEnd {
    pub request_body: BodySender,
    pub response: ResponseReceiver,
}

// ============================================================================
// Request direction
// ============================================================================

/// Client-side writer of the request body. The request pipe is unbounded.
#[derive(Debug)]
pub struct BodySender {
    shared: Arc<Shared<PipeState>>,
}

impl BodySender {
    /// Append a chunk to the request body.
    pub fn send(&self, data: Bytes) -> Result<()> {
        let mut state = self.shared.lock();
        match state.end {
            Some(StreamEnd::Aborted) => return Err(HarnessError::StreamClosed),
            Some(StreamEnd::Completed) => {
                return Err(HarnessError::ChannelMisuse("request body already finished"))
            }
            None => state.push(data),
        }
        drop(state);
        self.shared.readable.notify_waiters();
        Ok(())
    }

    /// Mark the request body as complete.
    pub fn finish(&self) -> Result<()> {
        let mut state = self.shared.lock();
        match state.end {
            Some(StreamEnd::Aborted) => return Err(HarnessError::StreamClosed),
            Some(StreamEnd::Completed) => {
                return Err(HarnessError::ChannelMisuse("request body already finished"))
            }
            None => state.end = Some(StreamEnd::Completed),
        }
        drop(state);
        self.shared.readable.notify_waiters();
        Ok(())
    }
}

/// Server-side reader of the request body.
#[derive(Debug, Clone)]
pub struct BodyReceiver {
    shared: Arc<Shared<PipeState>>,
}

impl BodyReceiver {
    /// Next chunk of the request body, `None` at the end.
    ///
    /// Fails with [`HarnessError::StreamClosed`] once the request was aborted.
    pub async fn chunk(&self) -> Result<Option<Bytes>> {
        loop {
            let notified = self.shared.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.shared.lock();
                if state.end == Some(StreamEnd::Aborted) {
                    return Err(HarnessError::StreamClosed);
                }
                if let Some(chunk) = state.pop() {
                    return Ok(Some(chunk));
                }
                if state.end == Some(StreamEnd::Completed) {
                    return Ok(None);
                }
            }

            notified.await;
        }
    }

    /// Read the whole remaining request body.
    pub async fn to_bytes(&self) -> Result<Bytes> {
        let mut body = Vec::new();
        while let Some(chunk) = self.chunk().await? {
            body.extend_from_slice(&chunk);
        }
        Ok(Bytes::from(body))
    }

    /// Cut the request pipe. Pending chunks are dropped.
    pub(crate) fn abort(&self) {
        let mut state = self.shared.lock();
        if state.end != Some(StreamEnd::Aborted) {
            state.chunks.clear();
            state.buffered = 0;
            state.end = Some(StreamEnd::Aborted);
        }
        drop(state);
        self.shared.wake_all();
    }
}

// ============================================================================
// Response direction
// ============================================================================

/// Server-side writer of the response.
///
/// Cheap to clone; all clones feed the same pipe.
#[derive(Debug, Clone)]
pub struct ResponseSender {
    shared: Arc<Shared<ResponseState>>,
    limit: usize,
}

impl ResponseSender {
    /// Whether headers have been committed.
    #[inline]
    pub fn has_started(&self) -> bool {
        self.shared.lock().headers_committed
    }

    /// Current status code.
    pub fn status(&self) -> StatusCode {
        self.shared.lock().head.status
    }

    /// Set the status code. Fails once headers are committed.
    pub fn set_status(&self, status: StatusCode) -> Result<()> {
        let mut state = self.shared.lock();
        if state.headers_committed {
            return Err(HarnessError::HeadersSent);
        }
        state.head.status = status;
        Ok(())
    }

    /// Insert a response header. Fails once headers are committed.
    pub fn insert_header(&self, name: HeaderName, value: HeaderValue) -> Result<()> {
        let mut state = self.shared.lock();
        if state.headers_committed {
            return Err(HarnessError::HeadersSent);
        }
        state.head.headers.insert(name, value);
        Ok(())
    }

    /// Insert a header unless headers are already committed.
    ///
    /// Returns whether the header was inserted. Never fails with
    /// [`HarnessError::HeadersSent`].
    pub(crate) fn insert_header_if_unstarted(&self, name: HeaderName, value: HeaderValue) -> bool {
        let mut state = self.shared.lock();
        if state.headers_committed {
            return false;
        }
        state.head.headers.insert(name, value);
        true
    }

    /// Commit headers without any body. Idempotent while the response is open.
    pub fn flush_headers(&self) -> Result<()> {
        let mut state = self.shared.lock();
        match state.body.end {
            Some(StreamEnd::Aborted) => return Err(HarnessError::StreamClosed),
            Some(StreamEnd::Completed) => {
                return Err(HarnessError::ChannelMisuse("flush after response completed"))
            }
            None => {}
        }
        if state.headers_committed {
            return Ok(());
        }
        state.headers_committed = true;
        drop(state);
        self.shared.readable.notify_waiters();
        Ok(())
    }

    /// Append body bytes, committing headers on the first call.
    ///
    /// A zero-length write still commits headers. Suspends while the pipe is
    /// at its buffer limit.
    pub async fn write(&self, data: Bytes) -> Result<()> {
        loop {
            let notified = self.shared.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.shared.lock();
                match state.body.end {
                    Some(StreamEnd::Aborted) => return Err(HarnessError::StreamClosed),
                    Some(StreamEnd::Completed) => {
                        return Err(HarnessError::ChannelMisuse("write after response completed"))
                    }
                    None => {}
                }

                if state.receiver_dropped || state.body.has_room(self.limit) {
                    state.headers_committed = true;
                    if !state.receiver_dropped {
                        state.body.push(data);
                    }
                    drop(state);
                    self.shared.readable.notify_waiters();
                    return Ok(());
                }
            }

            notified.await;
        }
    }

    /// End the response cleanly, committing headers if nothing was written.
    ///
    /// After an abort this is a no-op reporting
    /// [`CloseOutcome::AlreadyAborted`]; completing twice is misuse.
    pub fn complete(&self) -> Result<CloseOutcome> {
        let mut state = self.shared.lock();
        let outcome = match state.body.end {
            Some(StreamEnd::Completed) => {
                return Err(HarnessError::ChannelMisuse("response already completed"))
            }
            Some(StreamEnd::Aborted) => CloseOutcome::AlreadyAborted,
            None => {
                state.headers_committed = true;
                state.body.end = Some(StreamEnd::Completed);
                CloseOutcome::Completed
            }
        };
        drop(state);

        self.shared.wake_all();
        Ok(outcome)
    }

    /// Terminate the response abnormally.
    ///
    /// The read of the headers latch and the transition happen under one
    /// lock, so a concurrent [`write`](Self::write) lands either entirely
    /// before the decision (and is delivered) or entirely after it (and
    /// fails with [`HarnessError::StreamClosed`]).
    pub(crate) fn abort(&self) -> CloseOutcome {
        let mut state = self.shared.lock();
        let outcome = match state.body.end {
            Some(StreamEnd::Completed) => CloseOutcome::AlreadyComplete,
            Some(StreamEnd::Aborted) => CloseOutcome::AlreadyAborted,
            None => {
                state.body.end = Some(StreamEnd::Aborted);
                if state.headers_committed {
                    CloseOutcome::Truncated {
                        buffered: state.body.buffered,
                    }
                } else {
                    state.body.chunks.clear();
                    state.body.buffered = 0;
                    CloseOutcome::Suppressed
                }
            }
        };
        drop(state);

        self.shared.wake_all();
        outcome
    }
}

/// Client-side reader of the response.
#[derive(Debug)]
pub struct ResponseReceiver {
    shared: Arc<Shared<ResponseState>>,
}

impl ResponseReceiver {
    /// Wait for the response head.
    ///
    /// Fails with the canonical abort error if the response was aborted
    /// before any header was committed.
    pub async fn head(&self) -> Result<ResponseHead> {
        loop {
            let notified = self.shared.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.shared.lock();
                if state.headers_committed {
                    return Ok(state.head.clone());
                }
                if state.body.end == Some(StreamEnd::Aborted) {
                    return Err(HarnessError::Aborted(RequestAborted::new(
                        AbortStage::BeforeHeaders,
                    )));
                }
            }

            notified.await;
        }
    }

    /// Next chunk of the response body, `None` on a clean end.
    ///
    /// After a post-headers abort, every chunk committed before the abort is
    /// returned first; the read after that fails instead of reporting EOF.
    pub async fn read(&self) -> Result<Option<Bytes>> {
        loop {
            let notified = self.shared.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.shared.lock();
                if let Some(chunk) = state.body.pop() {
                    drop(state);
                    self.shared.writable.notify_waiters();
                    return Ok(Some(chunk));
                }
                match state.body.end {
                    Some(StreamEnd::Completed) => return Ok(None),
                    Some(StreamEnd::Aborted) if state.headers_committed => {
                        return Err(HarnessError::BodyRead(RequestAborted::new(
                            AbortStage::DuringBody,
                        )))
                    }
                    Some(StreamEnd::Aborted) => {
                        return Err(HarnessError::Aborted(RequestAborted::new(
                            AbortStage::BeforeHeaders,
                        )))
                    }
                    None => {}
                }
            }

            notified.await;
        }
    }
}

impl Drop for ResponseReceiver {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.receiver_dropped = true;
        state.body.chunks.clear();
        state.body.buffered = 0;
        drop(state);
        self.shared.writable.notify_waiters();
    }
}
