//! # request-lifetime
//!
//! In-process HTTP request lifecycle harness.
//!
//! A [`TestServer`] hosts one handler; a [`TestClient`] sends requests to it
//! over an in-memory duplex channel. The handler may abort its request at
//! any point through [`RequestContext::abort`], and the harness guarantees
//! the abort is observed on both ends:
//!
//! - the handler sees its [`CancellationSignal`] set, and any later write
//!   fails with [`HarnessError::StreamClosed`];
//! - the client sees `"The application aborted the request."`, either when
//!   awaiting the response head (nothing was committed yet) or on the body
//!   read after the last committed byte.
//!
//! ## Architecture
//!
//! - **channel**: duplex byte pipes with a headers-committed latch
//! - **signal**: one-shot broadcast cancellation signal
//! - **lifetime**: abort coordinator (atomic suppress-or-truncate decision)
//! - **handler**: handler entry point and request context
//! - **server** / **client**: test host and client reader
//!
//! ## Example
//!
//! ```ignore
//! use request_lifetime::{CompletionMode, RequestContext, TestServer, ABORT_MESSAGE};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = TestServer::builder()
//!         .handler(|ctx: RequestContext| async move {
//!             ctx.write("Hello World").await?;
//!             ctx.abort();
//!             Ok(())
//!         })
//!         .build()?;
//!
//!     let mut response = server
//!         .client()
//!         .get("/")
//!         .completion(CompletionMode::HeadersRead)
//!         .send()
//!         .await?;
//!
//!     while let Ok(Some(chunk)) = response.chunk().await {
//!         println!("{:?}", chunk);
//!     }
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod config;
pub mod driver;
pub mod error;
pub mod handler;
pub mod lifetime;
pub mod signal;

mod client;
mod server;

pub use channel::{CloseOutcome, ResponseHead};
pub use client::{
    ClientReader, ClientResponse, ClientState, CompletionMode, Outcome, RequestBuilder, TestClient,
};
pub use config::HarnessConfig;
pub use error::{AbortStage, HarnessError, RequestAborted, Result, ABORT_MESSAGE};
pub use handler::{handler_fn, Handler, HandlerResult, RequestContext, RequestHead};
pub use lifetime::AbortCoordinator;
pub use server::{TestServer, TestServerBuilder};
pub use signal::{CancellationSignal, Registration};
