//! Client side of the harness.
//!
//! [`TestClient`] issues requests against a [`TestServer`] and hands back a
//! [`ClientResponse`]. Underneath, a [`ClientReader`] walks the response
//! through its states:
//!
//! ```text
//! Idle ─► AwaitingHeaders ─┬─► HeadersReceived ─► ReadingBody ─┬─► Complete
//!                          │                                   └─► AbortedMidBody
//!                          └─► AbortedBeforeHeaders
//! ```
//!
//! Every terminal state is final: reading again replays the same result.
//!
//! # Example
//!
//! ```ignore
//! let client = server.client();
//! let mut response = client
//!     .get("/")
//!     .completion(CompletionMode::HeadersRead)
//!     .send()
//!     .await?
//!     .error_for_status()?;
//!
//! while let Some(chunk) = response.chunk().await? {
//!     println!("{} bytes", chunk.len());
//! }
//! ```

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use http::{HeaderMap, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::channel::{ResponseHead, ResponseReceiver};
use crate::error::{AbortStage, HarnessError, RequestAborted, Result};
use crate::server::TestServer;

/// When `send` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionMode {
    /// As soon as the response head is observable.
    HeadersRead,
    /// After the whole body has been received.
    ///
    /// A mid-body abort then fails `send`, and the chunks received so far
    /// are not returned; [`RequestAborted::bytes_received`] reports how many
    /// bytes arrived intact. Use `HeadersRead` to consume them.
    #[default]
    ContentRead,
}

/// Position of a [`ClientReader`] in the response lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    AwaitingHeaders,
    HeadersReceived,
    ReadingBody,
    Complete,
    AbortedBeforeHeaders,
    AbortedMidBody,
}

/// Terminal result of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    AbortedBeforeHeaders,
    AbortedDuringBody,
}

impl ClientState {
    /// Whether no further transition is possible.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.outcome().is_some()
    }

    /// The outcome, once terminal.
    pub fn outcome(&self) -> Option<Outcome> {
        match self {
            ClientState::Complete => Some(Outcome::Success),
            ClientState::AbortedBeforeHeaders => Some(Outcome::AbortedBeforeHeaders),
            ClientState::AbortedMidBody => Some(Outcome::AbortedDuringBody),
            _ => None,
        }
    }
}

/// Consumes one response from the channel and tracks its state.
#[derive(Debug)]
pub struct ClientReader {
    receiver: ResponseReceiver,
    state: ClientState,
    head: Option<ResponseHead>,
    bytes_received: usize,
}

impl ClientReader {
    /// Create a reader in the `Idle` state.
    pub fn new(receiver: ResponseReceiver) -> Self {
        Self {
            receiver,
            state: ClientState::Idle,
            head: None,
            bytes_received: 0,
        }
    }

    /// Current state.
    #[inline]
    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Body bytes received so far.
    #[inline]
    pub fn bytes_received(&self) -> usize {
        self.bytes_received
    }

    /// Wait for the response head.
    ///
    /// Fails with [`HarnessError::Aborted`] when the application aborted
    /// before committing headers.
    pub async fn await_head(&mut self) -> Result<ResponseHead> {
        if let Some(head) = &self.head {
            return Ok(head.clone());
        }
        if self.state == ClientState::AbortedBeforeHeaders {
            return Err(self.replay_failure());
        }

        self.state = ClientState::AwaitingHeaders;
        match self.receiver.head().await {
            Ok(head) => {
                self.state = ClientState::HeadersReceived;
                self.head = Some(head.clone());
                Ok(head)
            }
            Err(e) => {
                if e.is_abort() {
                    tracing::debug!("Response aborted before headers");
                    self.state = ClientState::AbortedBeforeHeaders;
                }
                Err(e)
            }
        }
    }

    /// Next body chunk, `None` once the body completed.
    ///
    /// Fails with [`HarnessError::BodyRead`] when the application aborted
    /// after headers; chunks returned before that are intact.
    pub async fn read_body(&mut self) -> Result<Option<Bytes>> {
        match self.state {
            ClientState::Idle | ClientState::AwaitingHeaders => {
                return Err(HarnessError::ChannelMisuse(
                    "body read before response headers",
                ))
            }
            ClientState::Complete => return Ok(None),
            ClientState::AbortedBeforeHeaders | ClientState::AbortedMidBody => {
                return Err(self.replay_failure())
            }
            ClientState::HeadersReceived | ClientState::ReadingBody => {}
        }

        self.state = ClientState::ReadingBody;
        match self.receiver.read().await {
            Ok(Some(chunk)) => {
                self.bytes_received += chunk.len();
                Ok(Some(chunk))
            }
            Ok(None) => {
                self.state = ClientState::Complete;
                Ok(None)
            }
            Err(e) if e.is_abort() => {
                tracing::debug!(
                    bytes_received = self.bytes_received,
                    "Response aborted during body"
                );
                self.state = ClientState::AbortedMidBody;
                Err(self.replay_failure())
            }
            Err(e) => Err(e),
        }
    }

    fn replay_failure(&self) -> HarnessError {
        match self.state {
            ClientState::AbortedMidBody => HarnessError::BodyRead(
                RequestAborted::new(AbortStage::DuringBody)
                    .with_bytes_received(self.bytes_received),
            ),
            _ => HarnessError::Aborted(RequestAborted::new(AbortStage::BeforeHeaders)),
        }
    }
}

/// A response whose head has been received.
#[derive(Debug)]
pub struct ClientResponse {
    head: ResponseHead,
    reader: ClientReader,
    buffered: VecDeque<Bytes>,
}

impl ClientResponse {
    fn new(head: ResponseHead, reader: ClientReader) -> Self {
        Self {
            head,
            reader,
            buffered: VecDeque::new(),
        }
    }

    /// Response status code.
    #[inline]
    pub fn status(&self) -> StatusCode {
        self.head.status()
    }

    /// Response headers.
    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        self.head.headers()
    }

    /// State of the underlying reader.
    #[inline]
    pub fn state(&self) -> ClientState {
        self.reader.state()
    }

    /// Outcome, once the response reached a terminal state.
    #[inline]
    pub fn outcome(&self) -> Option<Outcome> {
        self.reader.state().outcome()
    }

    /// Fail with [`HarnessError::Status`] unless the status is 2xx.
    pub fn error_for_status(self) -> Result<Self> {
        if self.status().is_success() {
            Ok(self)
        } else {
            Err(HarnessError::Status(self.status()))
        }
    }

    /// Next body chunk, `None` at the end.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        if let Some(chunk) = self.buffered.pop_front() {
            return Ok(Some(chunk));
        }
        self.reader.read_body().await
    }

    /// Read the rest of the body.
    pub async fn bytes(mut self) -> Result<Bytes> {
        let mut body = BytesMut::new();
        while let Some(chunk) = self.chunk().await? {
            body.extend_from_slice(&chunk);
        }
        Ok(body.freeze())
    }

    /// Read the rest of the body as UTF-8 (lossy).
    pub async fn text(self) -> Result<String> {
        let body = self.bytes().await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    /// Read the rest of the body as JSON.
    pub async fn json<T: DeserializeOwned>(self) -> Result<T> {
        let body = self.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Pull the entire body off the channel, keeping it for later reads.
    async fn buffer_body(&mut self) -> Result<()> {
        while let Some(chunk) = self.reader.read_body().await? {
            self.buffered.push_back(chunk);
        }
        Ok(())
    }
}

/// Client bound to one [`TestServer`].
#[derive(Clone)]
pub struct TestClient {
    server: TestServer,
}

impl TestClient {
    pub(crate) fn new(server: TestServer) -> Self {
        Self { server }
    }

    /// Start a request with an arbitrary method.
    pub fn request(&self, method: Method, uri: &str) -> RequestBuilder {
        RequestBuilder {
            client: self.clone(),
            builder: http::Request::builder().method(method).uri(uri),
            body: Bytes::new(),
            mode: CompletionMode::default(),
            error: None,
        }
    }

    /// Start a GET request.
    pub fn get(&self, uri: &str) -> RequestBuilder {
        self.request(Method::GET, uri)
    }

    /// Start a POST request.
    pub fn post(&self, uri: &str) -> RequestBuilder {
        self.request(Method::POST, uri)
    }

    /// Send a request and wait according to `mode`.
    ///
    /// A pre-headers abort fails with [`HarnessError::Aborted`]. In
    /// [`CompletionMode::ContentRead`] a mid-body abort also fails here,
    /// as [`HarnessError::BodyRead`].
    pub async fn send_request(
        &self,
        request: http::Request<Bytes>,
        mode: CompletionMode,
    ) -> Result<ClientResponse> {
        let receiver = self.server.dispatch(request)?;

        let mut reader = ClientReader::new(receiver);
        let head = reader.await_head().await?;
        let mut response = ClientResponse::new(head, reader);

        if mode == CompletionMode::ContentRead {
            response.buffer_body().await?;
        }
        Ok(response)
    }
}

/// Builder for one request.
pub struct RequestBuilder {
    client: TestClient,
    builder: http::request::Builder,
    body: Bytes,
    mode: CompletionMode,
    error: Option<HarnessError>,
}

impl RequestBuilder {
    /// Add a request header.
    pub fn header<K, V>(mut self, key: K, value: V) -> Self
    where
        K: TryInto<HeaderName>,
        <K as TryInto<HeaderName>>::Error: Into<http::Error>,
        V: TryInto<HeaderValue>,
        <V as TryInto<HeaderValue>>::Error: Into<http::Error>,
    {
        self.builder = self.builder.header(key, value);
        self
    }

    /// Set the request body.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Set a JSON request body and `content-type`.
    pub fn json<T: Serialize>(mut self, payload: &T) -> Self {
        match serde_json::to_vec(payload) {
            Ok(data) => {
                self.body = Bytes::from(data);
                self.builder = self
                    .builder
                    .header(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            }
            Err(e) => self.error = Some(e.into()),
        }
        self
    }

    /// Choose when `send` returns.
    pub fn completion(mut self, mode: CompletionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Send the request.
    pub async fn send(self) -> Result<ClientResponse> {
        if let Some(e) = self.error {
            return Err(e);
        }
        let request = self.builder.body(self.body)?;
        self.client.send_request(request, self.mode).await
    }
}
