//! Declarative component manifests.
//!
//! A manifest lists handlers and middleware by *kind*; a [`Components`] table
//! maps each kind to a constructor. Applying the manifest registers one
//! instance per block on a [`Context`]:
//!
//! ```toml
//! [context_params]
//! greeting = "Hello"
//!
//! [[handler]]
//! name = "hello"
//! kind = "hello"
//! mappings = ["/hello"]
//! load_priority = 1
//!
//! [handler.init_params]
//! punctuation = "!"
//!
//! [[middleware]]
//! name = "trace"
//! kind = "request_trace"
//! url_patterns = ["/*"]
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::builtin;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::handler::{BoxedHandler, Handler};
use crate::middleware::trace::RequestTrace;
use crate::middleware::{BoxedMiddleware, Middleware};
use crate::registry::LAZY;

type HandlerFactory = Box<dyn Fn() -> BoxedHandler + Send + Sync>;
type MiddlewareFactory = Box<dyn Fn() -> BoxedMiddleware + Send + Sync>;

/// Named constructors for the kinds a manifest may reference.
#[derive(Default)]
pub struct Components {
    handlers: HashMap<String, HandlerFactory>,
    middleware: HashMap<String, MiddlewareFactory>,
}

impl Components {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// A table with the built-in kinds: `not_found`, `liveness` (handlers)
    /// and `request_trace` (middleware).
    pub fn with_builtins() -> Self {
        Self::new()
            .handler("not_found", || builtin::NotFound)
            .handler("liveness", || builtin::Liveness)
            .middleware("request_trace", || RequestTrace)
    }

    /// Registers a handler constructor under `kind`, replacing any earlier one.
    pub fn handler<H, F>(mut self, kind: &str, make: F) -> Self
    where
        H: Handler,
        F: Fn() -> H + Send + Sync + 'static,
    {
        self.handlers
            .insert(kind.to_owned(), Box::new(move || Arc::new(make()) as BoxedHandler));
        self
    }

    pub fn middleware<M, F>(mut self, kind: &str, make: F) -> Self
    where
        M: Middleware,
        F: Fn() -> M + Send + Sync + 'static,
    {
        self.middleware
            .insert(kind.to_owned(), Box::new(move || Arc::new(make()) as BoxedMiddleware));
        self
    }

    fn make_handler(&self, kind: &str) -> Result<BoxedHandler> {
        self.handlers
            .get(kind)
            .map(|make| make())
            .ok_or_else(|| Error::Manifest(format!("unknown handler kind `{kind}`")))
    }

    fn make_middleware(&self, kind: &str) -> Result<BoxedMiddleware> {
        self.middleware
            .get(kind)
            .map(|make| make())
            .ok_or_else(|| Error::Manifest(format!("unknown middleware kind `{kind}`")))
    }
}

/// One `[[handler]]` block.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HandlerBlock {
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub mappings: Vec<String>,
    #[serde(default)]
    pub init_params: BTreeMap<String, String>,
    /// Negative (the default) initializes on first use.
    #[serde(default = "lazy")]
    pub load_priority: i32,
}

fn lazy() -> i32 {
    LAZY
}

/// One `[[middleware]]` block.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MiddlewareBlock {
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub url_patterns: Vec<String>,
    #[serde(default)]
    pub handler_names: Vec<String>,
    #[serde(default)]
    pub init_params: BTreeMap<String, String>,
}

/// A parsed manifest.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Manifest {
    pub context_params: BTreeMap<String, String>,
    #[serde(rename = "handler")]
    pub handlers: Vec<HandlerBlock>,
    #[serde(rename = "middleware")]
    pub middleware: Vec<MiddlewareBlock>,
}

impl Manifest {
    pub fn from_toml_str(src: &str) -> Result<Self> {
        toml::from_str(src).map_err(|e| Error::Manifest(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let src = std::fs::read_to_string(path)?;
        Self::from_toml_str(&src)
    }

    /// Registers every block on `ctx`.
    ///
    /// Stops at the first unknown kind or malformed pattern. Duplicate init
    /// parameters keep the first value and are logged.
    pub fn apply(&self, ctx: &mut Context, components: &Components) -> Result<()> {
        for (name, value) in &self.context_params {
            if !ctx.set_init_parameter(name, value)? {
                warn!(param = %name, "context parameter already set; keeping the first value");
            }
        }

        for block in &self.handlers {
            let handler = components.make_handler(&block.kind)?;
            let mut reg = ctx.add_handler(&block.name, handler)?;
            reg.add_mapping(&block.mappings)?.set_load_priority(block.load_priority)?;
            for conflict in reg.set_init_parameters(&block.init_params)? {
                warn!(handler = %block.name, param = %conflict, "duplicate init parameter ignored");
            }
            debug!(handler = %block.name, kind = %block.kind, "handler registered from manifest");
        }

        for block in &self.middleware {
            let middleware = components.make_middleware(&block.kind)?;
            let mut reg = ctx.add_middleware(&block.name, middleware)?;
            reg.add_mapping_for_patterns(&block.url_patterns)?
                .add_mapping_for_handler_names(&block.handler_names)?;
            for conflict in reg.set_init_parameters(&block.init_params)? {
                warn!(middleware = %block.name, param = %conflict, "duplicate init parameter ignored");
            }
            debug!(middleware = %block.name, kind = %block.kind, "middleware registered from manifest");
        }
        Ok(())
    }
}
