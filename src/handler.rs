//! Handler trait and type erasure.
//!
//! # How handlers are stored
//!
//! The registry holds handlers of *different* types in one table, so every
//! handler is stored as a trait object behind an `Arc`:
//!
//! ```text
//! fn hello(req, res) -> Result<(), BoxError> { … }   ← user writes this
//!        ↓ handler_fn(hello)
//! FnHandler(hello)                                   ← zero-cost wrapper
//!        ↓ ctx.add_handler("hello", …)
//! Arc<dyn Handler>                                   ← stored as BoxedHandler
//!        ↓
//! handler.handle(&mut req, &mut res)                 ← one vtable dispatch
//! ```
//!
//! Handlers run on a blocking worker thread, one call per request, and may be
//! called concurrently: keep per-request state in the request, not in `self`.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::BoxError;
use crate::request::Request;
use crate::response::Response;

/// A shared, type-erased handler.
pub type BoxedHandler = Arc<dyn Handler>;

/// Name and init parameters handed to a component's `init`.
#[derive(Clone, Debug, Default)]
pub struct ComponentConfig {
    name: String,
    params: BTreeMap<String, String>,
}

impl ComponentConfig {
    pub(crate) fn new(name: &str, params: BTreeMap<String, String>) -> Self {
        Self { name: name.to_owned(), params }
    }

    /// The name the component was registered under.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn init_parameter(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// Parameter names in sorted order.
    pub fn init_parameter_names(&self) -> impl Iterator<Item = &str> {
        self.params.keys().map(String::as_str)
    }
}

// ── Public Handler trait ──────────────────────────────────────────────────────

/// Produces the response for every request routed to it.
///
/// `init` runs once before the first `handle` (at container start for
/// non-negative load priorities, otherwise on the first matching request).
/// An `init` error keeps the handler out of service. `destroy` runs once at
/// shutdown, and only for handlers that were initialized.
pub trait Handler: Send + Sync + 'static {
    fn init(&self, _config: &ComponentConfig) -> Result<(), BoxError> {
        Ok(())
    }

    fn handle(&self, req: &mut Request, res: &mut Response) -> Result<(), BoxError>;

    fn destroy(&self) {}
}

impl<H: Handler + ?Sized> Handler for Arc<H> {
    fn init(&self, config: &ComponentConfig) -> Result<(), BoxError> {
        (**self).init(config)
    }

    fn handle(&self, req: &mut Request, res: &mut Response) -> Result<(), BoxError> {
        (**self).handle(req, res)
    }

    fn destroy(&self) {
        (**self).destroy()
    }
}

// ── Concrete wrapper ──────────────────────────────────────────────────────────

/// Newtype that turns a plain function or closure into a [`Handler`].
pub struct FnHandler<F>(F);

/// Wraps `f` as a [`Handler`] with no-op `init` and `destroy`.
///
/// ```rust,ignore
/// ctx.add_handler("hello", handler_fn(|req, res| {
///     let name = req.parameter("name").unwrap_or("world").to_owned();
///     write!(res.writer()?, "Hello,{name}!")?;
///     Ok(())
/// }));
/// ```
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(&mut Request, &mut Response) -> Result<(), BoxError> + Send + Sync + 'static,
{
    FnHandler(f)
}

impl<F> Handler for FnHandler<F>
where
    F: Fn(&mut Request, &mut Response) -> Result<(), BoxError> + Send + Sync + 'static,
{
    fn handle(&self, req: &mut Request, res: &mut Response) -> Result<(), BoxError> {
        (self.0)(req, res)
    }
}
