//! Handler module - the application side of a request.
//!
//! Provides:
//! - [`Handler`] - the per-request entry point
//! - [`RequestContext`] - request data, response writer, and the lifetime
//!   controls (abort + cancellation signal)
//!
//! # Example
//!
//! ```ignore
//! use request_lifetime::{handler_fn, RequestContext};
//!
//! let handler = handler_fn(|ctx: RequestContext| async move {
//!     ctx.write("Hello World").await?;
//!     ctx.abort();
//!     ctx.request_aborted().cancelled().await;
//!     Ok(())
//! });
//! ```

mod context;
mod service;

pub use context::{RequestContext, RequestHead};
pub use service::{handler_fn, BoxFuture, FnHandler, Handler, HandlerResult};
