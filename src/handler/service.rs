//! The handler entry point.
//!
//! A handler is invoked once per request with a [`RequestContext`] and
//! returns when it is done. Plain async closures become handlers through
//! [`handler_fn`].

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

use super::RequestContext;
use crate::error::Result;

/// Result type for handler functions.
pub type HandlerResult = Result<()>;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Application logic under test.
pub trait Handler: Send + Sync + 'static {
    /// Handle one request.
    fn call(&self, ctx: RequestContext) -> BoxFuture<'static, HandlerResult>;
}

/// Adapter turning an async function into a [`Handler`].
pub struct FnHandler<F, Fut>
where
    F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> Handler for FnHandler<F, Fut>
where
    F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, ctx: RequestContext) -> BoxFuture<'static, HandlerResult> {
        Box::pin((self.handler)(ctx))
    }
}

/// Wrap an async function as a [`Handler`].
pub fn handler_fn<F, Fut>(handler: F) -> FnHandler<F, Fut>
where
    F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    FnHandler {
        handler,
        _phantom: PhantomData,
    }
}
