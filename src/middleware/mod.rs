//! Middleware layer.
//!
//! Middleware wraps the handler and is the right place for cross-cutting
//! concerns: tracing, request-id injection, authentication checks. Each one
//! receives a [`Next`] and decides whether the rest of the chain runs:
//!
//! ```text
//! M1.intercept ──next.run──▶ M2.intercept ──next.run──▶ handler.handle
//!      ◀──────── return ────────     ◀──────── return ────────
//! ```
//!
//! Dropping `next` without calling [`Next::run`] short-circuits the request;
//! the response as written so far is what the client gets.
//!
//! Built-in middleware:
//! - [`trace::RequestTrace`]: per-request span with method, path, status, latency

pub mod trace;

use std::sync::Arc;

use crate::error::BoxError;
use crate::handler::{ComponentConfig, Handler};
use crate::request::Request;
use crate::response::Response;

/// A shared, type-erased middleware.
pub type BoxedMiddleware = Arc<dyn Middleware>;

pub trait Middleware: Send + Sync + 'static {
    /// Runs once at container start.
    fn init(&self, _config: &ComponentConfig) -> Result<(), BoxError> {
        Ok(())
    }

    fn intercept(&self, req: &mut Request, res: &mut Response, next: Next<'_>) -> Result<(), BoxError>;

    fn destroy(&self) {}
}

impl<M: Middleware + ?Sized> Middleware for Arc<M> {
    fn init(&self, config: &ComponentConfig) -> Result<(), BoxError> {
        (**self).init(config)
    }

    fn intercept(&self, req: &mut Request, res: &mut Response, next: Next<'_>) -> Result<(), BoxError> {
        (**self).intercept(req, res, next)
    }

    fn destroy(&self) {
        (**self).destroy()
    }
}

/// The rest of the chain after the current middleware.
///
/// Consumed by [`run`](Next::run), so the downstream chain runs at most once
/// per middleware.
pub struct Next<'a> {
    remaining: &'a [BoxedMiddleware],
    handler: &'a dyn Handler,
}

impl Next<'_> {
    /// Invokes the next middleware, or the handler once none remain.
    pub fn run(self, req: &mut Request, res: &mut Response) -> Result<(), BoxError> {
        match self.remaining.split_first() {
            Some((current, rest)) => {
                current.intercept(req, res, Next { remaining: rest, handler: self.handler })
            }
            None => self.handler.handle(req, res),
        }
    }

    /// Middleware still to run, the caller excluded.
    pub fn remaining(&self) -> usize {
        self.remaining.len()
    }
}

/// The ordered middleware for one request plus the handler at its end.
pub(crate) struct Chain {
    middleware: Vec<BoxedMiddleware>,
    handler: Arc<dyn Handler>,
}

impl Chain {
    pub(crate) fn new(middleware: Vec<BoxedMiddleware>, handler: Arc<dyn Handler>) -> Self {
        Self { middleware, handler }
    }

    pub(crate) fn len(&self) -> usize {
        self.middleware.len()
    }

    pub(crate) fn run(&self, req: &mut Request, res: &mut Response) -> Result<(), BoxError> {
        Next { remaining: &self.middleware, handler: &*self.handler }.run(req, res)
    }
}

// ── Closures ─────────────────────────────────────────────────────────────────

/// Newtype that turns a plain function or closure into a [`Middleware`].
pub struct FnMiddleware<F>(F);

/// Wraps `f` as a [`Middleware`] with no-op `init` and `destroy`.
pub fn middleware_fn<F>(f: F) -> FnMiddleware<F>
where
    F: Fn(&mut Request, &mut Response, Next<'_>) -> Result<(), BoxError> + Send + Sync + 'static,
{
    FnMiddleware(f)
}

impl<F> Middleware for FnMiddleware<F>
where
    F: Fn(&mut Request, &mut Response, Next<'_>) -> Result<(), BoxError> + Send + Sync + 'static,
{
    fn intercept(&self, req: &mut Request, res: &mut Response, next: Next<'_>) -> Result<(), BoxError> {
        (self.0)(req, res, next)
    }
}
