//! Test host: owns the handler and dispatches requests to it.
//!
//! The [`TestServerBuilder`] provides a fluent API for configuring the
//! handler and harness settings. Each request sent through a
//! [`TestClient`] is dispatched as follows:
//! 1. Create a duplex channel
//! 2. Feed the request body into the request pipe
//! 3. Spawn the handler with a fresh [`RequestContext`]
//! 4. When the handler returns, complete the response (or report the failure)
//!
//! # Example
//!
//! ```ignore
//! use request_lifetime::{RequestContext, TestServer};
//!
//! let server = TestServer::builder()
//!     .handler(|ctx: RequestContext| async move {
//!         ctx.write("Hello World").await
//!     })
//!     .build()?;
//!
//! let response = server.client().get("/").send().await?;
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use http::StatusCode;

use crate::channel::{duplex, ResponseReceiver};
use crate::client::TestClient;
use crate::config::HarnessConfig;
use crate::error::{HarnessError, Result};
use crate::handler::{handler_fn, Handler, HandlerResult, RequestContext, RequestHead};

/// Builder for configuring and creating a [`TestServer`].
pub struct TestServerBuilder {
    handler: Option<Arc<dyn Handler>>,
    config: HarnessConfig,
}

impl TestServerBuilder {
    /// Create a new builder with default configuration.
    pub fn new() -> Self {
        Self {
            handler: None,
            config: HarnessConfig::default(),
        }
    }

    /// Register the request handler.
    pub fn handler<F, Fut>(self, handler: F) -> Self
    where
        F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.service(handler_fn(handler))
    }

    /// Register a [`Handler`] implementation.
    pub fn service<H: Handler>(mut self, handler: H) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: HarnessConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the response buffer limit in bytes (0 = unbounded).
    ///
    /// Default: 64 KiB
    pub fn response_buffer_limit(mut self, limit: usize) -> Self {
        self.config.response_buffer_limit = limit;
        self
    }

    /// Set the chunk size used to feed request bodies.
    ///
    /// Default: 16 KiB
    pub fn request_body_chunk_size(mut self, size: usize) -> Self {
        self.config.request_body_chunk_size = size;
        self
    }

    /// Report handler failures in the body of the 500 response.
    pub fn debug_build(mut self, enabled: bool) -> Self {
        self.config.debug_build = enabled;
        self
    }

    /// Validate the configuration and build the server.
    pub fn build(self) -> Result<TestServer> {
        let handler = self
            .handler
            .ok_or_else(|| HarnessError::Config("no handler registered".to_string()))?;
        self.config.validate()?;

        Ok(TestServer {
            inner: Arc::new(ServerInner {
                handler,
                config: Arc::new(self.config),
                next_request_id: AtomicU64::new(1),
            }),
        })
    }
}

impl Default for TestServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct ServerInner {
    handler: Arc<dyn Handler>,
    config: Arc<HarnessConfig>,
    next_request_id: AtomicU64,
}

/// In-process host for one handler.
///
/// Cheap to clone. Requests must be sent from within a Tokio runtime.
#[derive(Clone)]
pub struct TestServer {
    inner: Arc<ServerInner>,
}

impl TestServer {
    /// Create a new server builder.
    pub fn builder() -> TestServerBuilder {
        TestServerBuilder::new()
    }

    /// Configuration the server was built with.
    pub fn config(&self) -> &HarnessConfig {
        &self.inner.config
    }

    /// Create a client bound to this server.
    pub fn client(&self) -> TestClient {
        TestClient::new(self.clone())
    }

    /// Start one request and return the client's view of the response.
    pub(crate) fn dispatch(&self, request: http::Request<Bytes>) -> Result<ResponseReceiver> {
        let request_id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (server_end, client_end) = duplex(self.inner.config.response_buffer_limit);

        let (parts, body) = request.into_parts();
        let chunk_size = self.inner.config.request_body_chunk_size;
        let mut offset = 0;
        while offset < body.len() {
            let end = (offset + chunk_size).min(body.len());
            client_end.request_body.send(body.slice(offset..end))?;
            offset = end;
        }
        client_end.request_body.finish()?;

        let ctx = RequestContext::new(
            request_id,
            RequestHead::from_parts(parts),
            server_end,
            self.inner.config.clone(),
        );

        tracing::debug!(
            request_id,
            method = %ctx.method(),
            uri = %ctx.uri(),
            "Dispatching request"
        );
        tokio::spawn(run_request(self.inner.handler.clone(), ctx));

        Ok(client_end.response)
    }
}

/// Run the handler to completion and settle the response.
async fn run_request(handler: Arc<dyn Handler>, ctx: RequestContext) {
    let request_id = ctx.request_id();

    // Spawned separately so a panic surfaces as a JoinError.
    let failure = match tokio::spawn(handler.call(ctx.clone())).await {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(e) => Some(e.to_string()),
    };

    let Some(message) = failure else {
        match ctx.complete() {
            Ok(outcome) => tracing::debug!(request_id, ?outcome, "Request finished"),
            Err(HarnessError::ChannelMisuse(_)) => {
                tracing::debug!(request_id, "Request finished, response completed by handler")
            }
            Err(e) => tracing::warn!(request_id, error = %e, "Failed to complete response"),
        }
        return;
    };

    if ctx.lifetime().is_aborted() {
        // The abort may have unwound before reaching the channel.
        let outcome = ctx.abort();
        tracing::debug!(request_id, error = %message, ?outcome, "Handler exited after abort");
        return;
    }

    tracing::error!(request_id, error = %message, "Handler error");

    match ctx.set_status(StatusCode::INTERNAL_SERVER_ERROR) {
        Ok(()) => {
            if ctx.config().debug_build {
                if let Err(e) = ctx.write(message).await {
                    tracing::debug!(request_id, error = %e, "Could not report handler error");
                }
            }
            if let Err(e) = ctx.complete() {
                tracing::debug!(request_id, error = %e, "Could not complete error response");
            }
        }
        // Response already started: the client can only learn of the
        // failure through a truncated body.
        Err(_) => {
            ctx.abort();
        }
    }
}
