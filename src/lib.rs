//! # hearth
//!
//! A small servlet-style HTTP application container.
//!
//! ## The contract
//!
//! hyper accepts sockets and parses HTTP. hearth does what happens between the
//! parsed request and the bytes on the wire:
//!
//! - **Routing**: exact, `*.ext`, `/prefix/*` and `/` patterns, most specific
//!   wins, independent of registration order
//! - **Middleware chains**: URL-matched and handler-scoped interceptors around
//!   every handler
//! - **Sessions**: cookie-bound, concurrent, swept on a timer
//! - **Response lifecycle**: buffering, the commit point after which headers
//!   freeze, and fixed-length vs chunked framing
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::fmt::Write as _;
//! use std::sync::Arc;
//!
//! use hearth::{ContainerConfig, ContentType, Context, Server, handler_fn};
//!
//! #[tokio::main]
//! async fn main() -> hearth::Result<()> {
//!     let mut ctx = Context::new(ContainerConfig::default())?;
//!     ctx.add_handler("hello", handler_fn(|req, res| {
//!         let name = req.parameter("name").unwrap_or("world").to_owned();
//!         res.set_content_type(ContentType::Text);
//!         write!(res.writer()?, "Hello,{name}!")?;
//!         Ok(())
//!     }))?
//!     .add_mapping(["/hello"])?;
//!     ctx.init()?;
//!
//!     Server::bind("0.0.0.0:3000")?.serve(Arc::new(ctx)).await
//! }
//! ```
//!
//! Handlers are synchronous: the transport runs each request on a blocking
//! worker thread, so a handler may block on I/O without stalling the
//! connection tasks.

mod config;
mod context;
mod cookie;
mod error;
mod exchange;
mod handler;
mod pattern;
mod registry;
mod request;
mod response;
mod session;

pub mod builtin;
pub mod manifest;
pub mod middleware;
pub mod observer;
pub mod server;

pub use config::ContainerConfig;
pub use context::Context;
pub use cookie::Cookie;
pub use error::{BoxError, Error, Result};
pub use exchange::{Exchange, Framing, Recorded, RecordingExchange};
pub use handler::{BoxedHandler, ComponentConfig, FnHandler, Handler, handler_fn};
pub use manifest::{Components, Manifest};
pub use middleware::{BoxedMiddleware, FnMiddleware, Middleware, Next, middleware_fn};
pub use pattern::{Mapping, MappingTable, Tier, UrlPattern};
pub use registry::{HandlerRegistration, LAZY, MiddlewareRegistration};
pub use request::{AuthScheme, DispatchKind, Request};
pub use response::{BodyStream, BodyWriter, ContentType, Response};
pub use server::Server;
pub use session::{Session, SessionManager};
