//! The dispatch engine.
//!
//! A [`Context`] owns everything one mounted application needs: handler and
//! middleware registrations, the session manager, observers, context-scoped
//! parameters and attributes. It is assembled with `&mut` methods, frozen by
//! [`init`](Context::init), then shared as `Arc<Context>` between transport
//! threads:
//!
//! ```text
//! Context::new ─▶ add_handler / add_middleware ─▶ init ─▶ Arc ─▶ handle … handle ─▶ shutdown
//! ```
//!
//! Per request, [`handle`](Context::handle) strips the mount path, resolves
//! the most specific handler, builds the middleware chain (URL-matched
//! middleware by specificity, then handler-scoped middleware by name), runs
//! it, and always finishes the response, whatever the chain did.

use std::any::Any;
use std::net::SocketAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use http::StatusCode;
use tracing::{debug, error, info, trace, warn};

use crate::builtin;
use crate::config::ContainerConfig;
use crate::error::{BoxError, Error, Result};
use crate::exchange::Exchange;
use crate::handler::Handler;
use crate::middleware::{Chain, Middleware};
use crate::observer::{AttributeEvent, AttributeScope, AttributeValue, Observers};
use crate::registry::{HandlerRegistration, HandlerRegistry, InitParams, MiddlewareRegistration, MiddlewareRegistry};
use crate::request::{Request, SessionLink};
use crate::response::{Response, ResponseSettings};
use crate::session::SessionManager;

/// One mounted application.
pub struct Context {
    config: ContainerConfig,
    handlers: HandlerRegistry,
    middleware: MiddlewareRegistry,
    sessions: Arc<SessionManager>,
    observers: Arc<Observers>,
    init_params: InitParams,
    attributes: DashMap<String, AttributeValue>,
    settings: Arc<ResponseSettings>,
    initialized: bool,
    shut_down: AtomicBool,
}

impl Context {
    /// A context with no registrations yet. Fails if `config` is invalid.
    pub fn new(config: ContainerConfig) -> Result<Self> {
        config.validate()?;
        let observers = Arc::new(Observers::default());
        let sessions = Arc::new(SessionManager::new(
            config.session_timeout_secs,
            config.sweep_interval(),
            Arc::clone(&observers),
        ));
        let settings = Arc::new(ResponseSettings {
            buffer_size: config.buffer_size,
            server_info: config.server_info.as_str().into(),
            encoding: config.response_encoding.as_str().into(),
            cookie_name: config.session_cookie_name.as_str().into(),
            cookie_path: config.context_path.as_str().into(),
        });
        Ok(Self {
            config,
            handlers: HandlerRegistry::default(),
            middleware: MiddlewareRegistry::default(),
            sessions,
            observers,
            init_params: InitParams::default(),
            attributes: DashMap::new(),
            settings,
            initialized: false,
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    pub fn context_path(&self) -> &str {
        &self.config.context_path
    }

    pub fn display_name(&self) -> Option<&str> {
        self.config.display_name.as_deref()
    }

    /// Observer lists. Observers may be added at any time before shutdown.
    pub fn observers(&self) -> &Observers {
        &self.observers
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    // ── Registration ─────────────────────────────────────────────────────────

    /// Registers `handler` under `name`. Reusing a name replaces the earlier
    /// registration.
    pub fn add_handler(&mut self, name: &str, handler: impl Handler) -> Result<HandlerRegistration<'_>> {
        self.handlers.register(name, Arc::new(handler))
    }

    /// The registration for `name`, for further configuration.
    pub fn handler_registration(&mut self, name: &str) -> Option<HandlerRegistration<'_>> {
        self.handlers.registration(name)
    }

    pub fn add_middleware(&mut self, name: &str, middleware: impl Middleware) -> Result<MiddlewareRegistration<'_>> {
        self.middleware.register(name, Arc::new(middleware))
    }

    pub fn middleware_registration(&mut self, name: &str) -> Option<MiddlewareRegistration<'_>> {
        self.middleware.registration(name)
    }

    pub fn handler_names(&self) -> impl Iterator<Item = &str> {
        self.handlers.entries().map(|e| e.name())
    }

    pub fn middleware_names(&self) -> impl Iterator<Item = &str> {
        self.middleware.entries().map(|e| e.name())
    }

    // ── Context parameters and attributes ────────────────────────────────────

    /// `Ok(false)` if `name` is already set. Fails once initialized.
    pub fn set_init_parameter(&mut self, name: &str, value: &str) -> Result<bool> {
        if self.initialized {
            return Err(Error::AlreadyInitialized);
        }
        Ok(self.init_params.set(name, value))
    }

    pub fn init_parameter(&self, name: &str) -> Option<&str> {
        self.init_params.get(name)
    }

    pub fn init_parameter_names(&self) -> impl Iterator<Item = &str> {
        self.init_params.names()
    }

    pub fn attribute(&self, name: &str) -> Option<AttributeValue> {
        self.attributes.get(name).map(|v| Arc::clone(v.value()))
    }

    pub fn attribute_as<T: Send + Sync + 'static>(&self, name: &str) -> Option<Arc<T>> {
        self.attribute(name)?.downcast::<T>().ok()
    }

    pub fn attribute_names(&self) -> Vec<String> {
        self.attributes.iter().map(|e| e.key().clone()).collect()
    }

    pub fn set_attribute(&self, name: impl Into<String>, value: AttributeValue) {
        let name = name.into();
        // The map guard is released before observers run.
        let old = self.attributes.insert(name.clone(), Arc::clone(&value));
        match old {
            Some(old) => self.observers.attribute_replaced(&context_event(&name, &old)),
            None => self.observers.attribute_added(&context_event(&name, &value)),
        }
    }

    pub fn remove_attribute(&self, name: &str) -> Option<AttributeValue> {
        let (_, removed) = self.attributes.remove(name)?;
        self.observers.attribute_removed(&context_event(name, &removed));
        Some(removed)
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Freezes registrations, initializes eager handlers (ascending priority,
    /// ties by name) and every middleware, then starts the session sweep.
    ///
    /// The first `init` failure aborts startup with [`Error::Initialization`].
    pub fn init(&mut self) -> Result<()> {
        if self.initialized {
            return Err(Error::AlreadyInitialized);
        }
        self.handlers.seal();
        self.middleware.seal();

        for entry in self.handlers.eager() {
            entry.ensure_initialized().inspect_err(|e| error!(error = %e, "handler init failed"))?;
        }

        for entry in self.middleware.entries() {
            for name in entry.handler_names() {
                if !self.handlers.contains(name) {
                    warn!(middleware = entry.name(), handler = %name, "middleware scoped to unknown handler");
                }
            }
        }
        self.middleware
            .init_all()
            .inspect_err(|e| error!(error = %e, "middleware init failed"))?;

        self.sessions.start_sweeper();
        self.initialized = true;
        info!(
            context_path = %self.config.context_path,
            handlers = self.handlers.entries().count(),
            middleware = self.middleware.entries().count(),
            "context initialized"
        );
        Ok(())
    }

    /// Stops the session sweep, invalidates every session, then destroys
    /// middleware and handlers. Only the first call does anything.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(context_path = %self.config.context_path, "context shutting down");
        self.sessions.shutdown(self.config.shutdown_grace()).await;
        self.middleware.destroy_all();
        for entry in self.handlers.entries() {
            entry.destroy();
        }
        self.observers.clear();
        info!("context stopped");
    }

    // ── Dispatch ─────────────────────────────────────────────────────────────

    /// Serves one request, writing the response to `exchange`.
    ///
    /// Never fails: routing misses become a 404, handler errors and panics
    /// are logged, and the exchange is always closed before returning.
    pub fn handle(&self, raw: http::Request<Bytes>, remote_addr: Option<SocketAddr>, exchange: impl Exchange + 'static) {
        let link = Arc::new(SessionLink::new(Arc::clone(&self.sessions)));
        let mut req = Request::new(
            raw,
            remote_addr,
            self.config.mount_prefix(),
            &self.config.session_cookie_name,
            Arc::clone(&link),
            Arc::clone(&self.observers),
        );
        req.set_character_encoding(self.config.request_encoding.as_str());
        let cookie_domain = req.server_name().map(str::to_owned);
        let mut res = Response::new(Box::new(exchange), link, Arc::clone(&self.settings), cookie_domain);

        if !self.initialized || self.shut_down.load(Ordering::Acquire) {
            warn!(path = %req.path(), "context not serving; rejecting request");
            if let Err(e) = builtin::unavailable(&mut res) {
                debug!(error = %e, "failed to send 503");
            }
            return;
        }
        self.process(&mut req, &mut res);
    }

    fn process(&self, req: &mut Request, res: &mut Response) {
        self.observers.request_initialized(req);

        match catch_unwind(AssertUnwindSafe(|| self.dispatch(req, res))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(path = %req.path(), error = %e, "request failed");
                internal_error(res);
            }
            Err(panic) => {
                error!(path = %req.path(), panic = panic_message(&*panic), "handler panicked");
                internal_error(res);
            }
        }

        if let Err(e) = res.finish() {
            debug!(path = %req.path(), error = %e, "failed to finish response");
        }
        self.observers.request_destroyed(req);
    }

    fn dispatch(&self, req: &mut Request, res: &mut Response) -> std::result::Result<(), BoxError> {
        let Some(path) = self.strip_mount(req.path()) else {
            return Ok(builtin::not_found(res)?);
        };
        let Some(entry) = self.handlers.resolve(&path) else {
            trace!(path = %path, "no handler mapped");
            return Ok(builtin::not_found(res)?);
        };
        entry.ensure_initialized()?;

        let chain = Chain::new(self.middleware.chain_for(&path, entry.name()), Arc::clone(entry.handler()));
        trace!(path = %path, handler = entry.name(), middleware = chain.len(), "dispatching");
        chain.run(req, res)
    }

    /// The path below the mount point; `None` when the request lies outside it.
    fn strip_mount(&self, path: &str) -> Option<String> {
        let prefix = self.config.mount_prefix();
        let rest = path.strip_prefix(prefix)?;
        match rest {
            "" => Some("/".to_owned()),
            _ if rest.starts_with('/') => Some(rest.to_owned()),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("context_path", &self.config.context_path)
            .field("initialized", &self.initialized)
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

fn context_event<'a>(name: &'a str, value: &'a AttributeValue) -> AttributeEvent<'a> {
    AttributeEvent { scope: AttributeScope::Context, name, value, session_id: None }
}

// Best effort: once committed the client keeps whatever was already sent.
fn internal_error(res: &mut Response) {
    if !res.is_committed() {
        let _ = res.send_error(StatusCode::INTERNAL_SERVER_ERROR, "500 INTERNAL SERVER ERROR!");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mounted(path: &str) -> Context {
        Context::new(ContainerConfig { context_path: path.to_owned(), ..ContainerConfig::default() }).unwrap()
    }

    #[test]
    fn strip_mount_at_root() {
        let ctx = mounted("/");
        assert_eq!(ctx.strip_mount("/").as_deref(), Some("/"));
        assert_eq!(ctx.strip_mount("/a/b").as_deref(), Some("/a/b"));
    }

    #[test]
    fn strip_mount_below_prefix() {
        let ctx = mounted("/shop");
        assert_eq!(ctx.strip_mount("/shop").as_deref(), Some("/"));
        assert_eq!(ctx.strip_mount("/shop/cart").as_deref(), Some("/cart"));
        assert_eq!(ctx.strip_mount("/shopping"), None);
        assert_eq!(ctx.strip_mount("/other"), None);
    }

    #[test]
    fn init_parameters_freeze_after_init() {
        let mut ctx = mounted("/");
        assert!(ctx.set_init_parameter("a", "1").unwrap());
        assert!(!ctx.set_init_parameter("a", "2").unwrap());
        ctx.init().unwrap();
        assert!(matches!(ctx.set_init_parameter("b", "1"), Err(Error::AlreadyInitialized)));
        assert_eq!(ctx.init_parameter("a"), Some("1"));
        assert!(matches!(ctx.init(), Err(Error::AlreadyInitialized)));
    }

    #[test]
    fn panic_payloads_are_readable() {
        let boxed: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(&*boxed), "static");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(&*boxed), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(&*boxed), "non-string panic payload");
    }
}
