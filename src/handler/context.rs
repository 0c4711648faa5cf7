//! Request context for handlers.
//!
//! Provides:
//! - request head and body access
//! - response writing: `set_status`, `insert_header`, `flush_headers`,
//!   `write`, `write_json`, `complete`
//! - lifetime control: `abort` and the `request_aborted` signal
//!
//! # Example
//!
//! ```ignore
//! async fn partial_then_abort(ctx: RequestContext) -> HandlerResult {
//!     ctx.write("Hello World").await?;
//!     ctx.abort();
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use http::{HeaderMap, Method, StatusCode, Uri};
use serde::Serialize;

use crate::channel::{BodyReceiver, CloseOutcome, ResponseSender, ServerEnd};
use crate::config::HarnessConfig;
use crate::error::Result;
use crate::lifetime::AbortCoordinator;
use crate::signal::CancellationSignal;

/// Method, URI and headers of the incoming request.
#[derive(Debug, Clone)]
pub struct RequestHead {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
}

impl RequestHead {
    pub(crate) fn from_parts(parts: http::request::Parts) -> Self {
        Self {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
        }
    }

    /// Request method.
    #[inline]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Request URI.
    #[inline]
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Request headers.
    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

/// Context passed to request handlers.
///
/// # Thread Safety
///
/// `RequestContext` is `Clone` and can be moved into other tasks; every
/// clone refers to the same request, response and cancellation signal.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Request ID assigned by the server.
    request_id: u64,
    request: Arc<RequestHead>,
    body: BodyReceiver,
    response: ResponseSender,
    lifetime: AbortCoordinator,
    config: Arc<HarnessConfig>,
}

impl RequestContext {
    pub(crate) fn new(
        request_id: u64,
        request: RequestHead,
        server: ServerEnd,
        config: Arc<HarnessConfig>,
    ) -> Self {
        let lifetime = AbortCoordinator::new(
            request_id,
            CancellationSignal::new(),
            server.request_body.clone(),
            server.response.clone(),
        );

        Self {
            request_id,
            request: Arc::new(request),
            body: server.request_body,
            response: server.response,
            lifetime,
            config,
        }
    }

    /// Get the request ID.
    #[inline]
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Request method, URI and headers.
    #[inline]
    pub fn request(&self) -> &RequestHead {
        &self.request
    }

    /// Request method.
    #[inline]
    pub fn method(&self) -> &Method {
        self.request.method()
    }

    /// Request URI.
    #[inline]
    pub fn uri(&self) -> &Uri {
        self.request.uri()
    }

    /// Streaming access to the request body.
    #[inline]
    pub fn body(&self) -> &BodyReceiver {
        &self.body
    }

    /// Read the whole request body.
    pub async fn read_body(&self) -> Result<Bytes> {
        self.body.to_bytes().await
    }

    /// Direct access to the response writer.
    #[inline]
    pub fn response(&self) -> &ResponseSender {
        &self.response
    }

    /// Whether response headers have been committed.
    #[inline]
    pub fn has_started(&self) -> bool {
        self.response.has_started()
    }

    /// Set the response status. Fails once the response has started.
    pub fn set_status(&self, status: StatusCode) -> Result<()> {
        self.response.set_status(status)
    }

    /// Insert a response header. Fails once the response has started.
    pub fn insert_header(&self, name: HeaderName, value: HeaderValue) -> Result<()> {
        self.response.insert_header(name, value)
    }

    /// Commit the response headers without a body.
    pub async fn flush_headers(&self) -> Result<()> {
        self.response.flush_headers()
    }

    /// Write body bytes, committing headers on the first call.
    pub async fn write(&self, data: impl Into<Bytes>) -> Result<()> {
        self.response.write(data.into()).await
    }

    /// Serialize `payload` as JSON and write it.
    ///
    /// Sets `content-type: application/json` if the response has not
    /// started yet.
    pub async fn write_json<T: Serialize>(&self, payload: &T) -> Result<()> {
        let data = serde_json::to_vec(payload)?;
        self.response
            .insert_header_if_unstarted(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.response.write(Bytes::from(data)).await
    }

    /// End the response before the handler returns.
    pub fn complete(&self) -> Result<CloseOutcome> {
        self.response.complete()
    }

    /// Abort the request. See [`AbortCoordinator::abort`].
    pub fn abort(&self) -> CloseOutcome {
        self.lifetime.abort()
    }

    /// Signal set when the request is aborted.
    #[inline]
    pub fn request_aborted(&self) -> &CancellationSignal {
        self.lifetime.signal()
    }

    /// The abort coordinator of this request.
    #[inline]
    pub fn lifetime(&self) -> &AbortCoordinator {
        &self.lifetime
    }

    /// Configuration of the hosting server.
    #[inline]
    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Create a context over a fresh channel, returning the client end too.
    #[cfg(test)]
    pub(crate) fn for_test() -> (Self, crate::channel::ClientEnd) {
        let config = HarnessConfig::default();
        let (server, client) = crate::channel::duplex(config.response_buffer_limit);
        let (parts, ()) = http::Request::new(()).into_parts();
        let ctx = Self::new(1, RequestHead::from_parts(parts), server, Arc::new(config));
        (ctx, client)
    }
}
