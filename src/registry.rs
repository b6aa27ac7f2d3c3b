//! Handler and middleware registrations.
//!
//! Registrations are collected while the [`Context`](crate::Context) is being
//! assembled, then frozen by `init()`: the URL mappings are compiled into
//! [`MappingTable`]s and every later mutation fails with
//! [`Error::AlreadyInitialized`].

use std::collections::{BTreeMap, BTreeSet, btree_map};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{BoxError, Error, Result};
use crate::handler::{BoxedHandler, ComponentConfig};
use crate::middleware::BoxedMiddleware;
use crate::pattern::{MappingTable, UrlPattern};

/// Startup priority for handlers initialized on first use.
pub const LAZY: i32 = -1;

// ── Init parameters ──────────────────────────────────────────────────────────

/// First-write-wins string parameters.
#[derive(Clone, Debug, Default)]
pub(crate) struct InitParams(BTreeMap<String, String>);

impl InitParams {
    /// `false` if `name` was already set; the existing value is kept.
    pub(crate) fn set(&mut self, name: &str, value: &str) -> bool {
        if self.0.contains_key(name) {
            return false;
        }
        self.0.insert(name.to_owned(), value.to_owned());
        true
    }

    /// Sets every new key and returns the ones that were already present.
    pub(crate) fn set_all<I, K, V>(&mut self, params: I) -> Vec<String>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        params
            .into_iter()
            .filter(|(k, v)| !self.set(k.as_ref(), v.as_ref()))
            .map(|(k, _)| k.as_ref().to_owned())
            .collect()
    }

    pub(crate) fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub(crate) fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    fn config(&self, name: &str) -> ComponentConfig {
        ComponentConfig::new(name, self.0.clone())
    }
}

fn parse_all<I, S>(patterns: I) -> Result<Vec<UrlPattern>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    patterns.into_iter().map(|p| UrlPattern::parse(p.as_ref())).collect()
}

// ── Handlers ─────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum InitState {
    Pending,
    Ready,
    Failed,
    Destroyed,
}

pub(crate) struct HandlerEntry {
    name: String,
    handler: BoxedHandler,
    patterns: Vec<UrlPattern>,
    params: InitParams,
    load_priority: i32,
    state: Mutex<InitState>,
}

impl HandlerEntry {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn handler(&self) -> &BoxedHandler {
        &self.handler
    }

    pub(crate) fn is_initialized(&self) -> bool {
        *self.state.lock() == InitState::Ready
    }

    /// Runs `init` exactly once, however many threads race here.
    ///
    /// A failed init is not retried: later calls fail straight away.
    pub(crate) fn ensure_initialized(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            InitState::Ready => Ok(()),
            InitState::Failed => Err(self.failed("init failed earlier".into())),
            InitState::Destroyed => Err(self.failed("handler has been destroyed".into())),
            InitState::Pending => match self.handler.init(&self.params.config(&self.name)) {
                Ok(()) => {
                    *state = InitState::Ready;
                    debug!(handler = %self.name, "handler initialized");
                    Ok(())
                }
                Err(source) => {
                    *state = InitState::Failed;
                    Err(self.failed(source))
                }
            },
        }
    }

    pub(crate) fn destroy(&self) {
        let mut state = self.state.lock();
        if *state == InitState::Ready {
            self.handler.destroy();
            debug!(handler = %self.name, "handler destroyed");
        }
        *state = InitState::Destroyed;
    }

    fn failed(&self, source: BoxError) -> Error {
        Error::Initialization { component: self.name.clone(), source }
    }
}

/// Named handlers and the compiled URL table that routes to them.
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    entries: BTreeMap<String, Arc<HandlerEntry>>,
    table: MappingTable<Arc<HandlerEntry>>,
    sealed: bool,
}

impl HandlerRegistry {
    pub(crate) fn register(&mut self, name: &str, handler: BoxedHandler) -> Result<HandlerRegistration<'_>> {
        if self.sealed {
            return Err(Error::AlreadyInitialized);
        }
        let entry = HandlerEntry {
            name: name.to_owned(),
            handler,
            patterns: Vec::new(),
            params: InitParams::default(),
            load_priority: LAZY,
            state: Mutex::new(InitState::Pending),
        };
        let entry = match self.entries.entry(name.to_owned()) {
            btree_map::Entry::Occupied(mut slot) => {
                warn!(handler = name, "handler registered twice; the later registration wins");
                slot.insert(Arc::new(entry));
                slot.into_mut()
            }
            btree_map::Entry::Vacant(slot) => slot.insert(Arc::new(entry)),
        };
        Ok(HandlerRegistration { entry, sealed: false })
    }

    pub(crate) fn registration(&mut self, name: &str) -> Option<HandlerRegistration<'_>> {
        let sealed = self.sealed;
        let entry = self.entries.get_mut(name)?;
        Some(HandlerRegistration { entry, sealed })
    }

    pub(crate) fn get(&self, name: &str) -> Option<&Arc<HandlerEntry>> {
        self.entries.get(name)
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Handlers with a non-negative priority, ascending, ties by name.
    pub(crate) fn eager(&self) -> Vec<Arc<HandlerEntry>> {
        let mut eager: Vec<_> = self
            .entries
            .values()
            .filter(|e| e.load_priority >= 0)
            .cloned()
            .collect();
        // BTreeMap order already sorts by name; the sort is stable.
        eager.sort_by_key(|e| e.load_priority);
        eager
    }

    /// Compiles the URL table and freezes the registry.
    pub(crate) fn seal(&mut self) {
        let mut table = MappingTable::new();
        for entry in self.entries.values() {
            for pattern in &entry.patterns {
                table.insert(pattern.clone(), entry.name.clone(), Arc::clone(entry));
            }
        }
        self.table = table;
        self.sealed = true;
    }

    pub(crate) fn resolve(&self, path: &str) -> Option<&Arc<HandlerEntry>> {
        self.table.resolve(path).map(|m| &m.target)
    }

    /// Every entry in name order.
    pub(crate) fn entries(&self) -> impl Iterator<Item = &Arc<HandlerEntry>> {
        self.entries.values()
    }
}

/// Handle for configuring one handler before the container starts.
pub struct HandlerRegistration<'a> {
    entry: &'a mut Arc<HandlerEntry>,
    sealed: bool,
}

impl HandlerRegistration<'_> {
    pub fn name(&self) -> &str {
        &self.entry.name
    }

    pub fn mappings(&self) -> impl Iterator<Item = &str> {
        self.entry.patterns.iter().map(UrlPattern::as_str)
    }

    pub fn load_priority(&self) -> i32 {
        self.entry.load_priority
    }

    pub fn init_parameter(&self, name: &str) -> Option<&str> {
        self.entry.params.get(name)
    }

    pub fn init_parameter_names(&self) -> impl Iterator<Item = &str> {
        self.entry.params.names()
    }

    /// Maps the handler at every pattern. Either all patterns are added or,
    /// if one is malformed, none are.
    pub fn add_mapping<I, S>(&mut self, patterns: I) -> Result<&mut Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let parsed = parse_all(patterns)?;
        self.entry_mut()?.patterns.extend(parsed);
        Ok(self)
    }

    /// `Ok(false)` if the parameter was already set.
    pub fn set_init_parameter(&mut self, name: &str, value: &str) -> Result<bool> {
        Ok(self.entry_mut()?.params.set(name, value))
    }

    /// Sets every new parameter; returns the names that were already set.
    pub fn set_init_parameters<I, K, V>(&mut self, params: I) -> Result<Vec<String>>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        Ok(self.entry_mut()?.params.set_all(params))
    }

    /// Non-negative priorities are initialized at startup in ascending order;
    /// negative ones on first use.
    pub fn set_load_priority(&mut self, priority: i32) -> Result<&mut Self> {
        self.entry_mut()?.load_priority = priority;
        Ok(self)
    }

    fn entry_mut(&mut self) -> Result<&mut HandlerEntry> {
        if self.sealed {
            return Err(Error::AlreadyInitialized);
        }
        // Entries are only shared once the registry is sealed.
        Arc::get_mut(self.entry).ok_or(Error::AlreadyInitialized)
    }
}

// ── Middleware ───────────────────────────────────────────────────────────────

pub(crate) struct MiddlewareEntry {
    name: String,
    middleware: BoxedMiddleware,
    patterns: Vec<UrlPattern>,
    handler_names: Vec<String>,
    params: InitParams,
    initialized: AtomicBool,
}

impl MiddlewareEntry {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn handler_names(&self) -> &[String] {
        &self.handler_names
    }
}

/// Named middleware plus the compiled lookup structures built at seal time.
#[derive(Default)]
pub(crate) struct MiddlewareRegistry {
    entries: BTreeMap<String, MiddlewareEntry>,
    url_table: MappingTable<BoxedMiddleware>,
    by_handler: BTreeMap<String, Vec<(String, BoxedMiddleware)>>,
    sealed: bool,
}

impl MiddlewareRegistry {
    pub(crate) fn register(&mut self, name: &str, middleware: BoxedMiddleware) -> Result<MiddlewareRegistration<'_>> {
        if self.sealed {
            return Err(Error::AlreadyInitialized);
        }
        let entry = MiddlewareEntry {
            name: name.to_owned(),
            middleware,
            patterns: Vec::new(),
            handler_names: Vec::new(),
            params: InitParams::default(),
            initialized: AtomicBool::new(false),
        };
        let entry = match self.entries.entry(name.to_owned()) {
            btree_map::Entry::Occupied(mut slot) => {
                warn!(middleware = name, "middleware registered twice; the later registration wins");
                slot.insert(entry);
                slot.into_mut()
            }
            btree_map::Entry::Vacant(slot) => slot.insert(entry),
        };
        Ok(MiddlewareRegistration { entry, sealed: false })
    }

    pub(crate) fn registration(&mut self, name: &str) -> Option<MiddlewareRegistration<'_>> {
        let sealed = self.sealed;
        let entry = self.entries.get_mut(name)?;
        Some(MiddlewareRegistration { entry, sealed })
    }

    /// Runs every `init` in name order. Stops at the first failure.
    pub(crate) fn init_all(&self) -> Result<()> {
        for entry in self.entries.values() {
            if entry.initialized.load(Ordering::Acquire) {
                continue;
            }
            entry
                .middleware
                .init(&entry.params.config(&entry.name))
                .map_err(|source| Error::Initialization { component: entry.name.clone(), source })?;
            entry.initialized.store(true, Ordering::Release);
            debug!(middleware = %entry.name, "middleware initialized");
        }
        Ok(())
    }

    /// Compiles the lookup tables and freezes the registry.
    pub(crate) fn seal(&mut self) {
        let mut url_table = MappingTable::new();
        let mut by_handler: BTreeMap<String, Vec<(String, BoxedMiddleware)>> = BTreeMap::new();
        for entry in self.entries.values() {
            for pattern in &entry.patterns {
                url_table.insert(pattern.clone(), entry.name.clone(), Arc::clone(&entry.middleware));
            }
            for handler in &entry.handler_names {
                // Entries iterate in name order, so each list is sorted by name.
                by_handler
                    .entry(handler.clone())
                    .or_default()
                    .push((entry.name.clone(), Arc::clone(&entry.middleware)));
            }
        }
        self.url_table = url_table;
        self.by_handler = by_handler;
        self.sealed = true;
    }

    /// The middleware for one request: URL matches by specificity, then the
    /// ones scoped to `handler` by name. Each middleware appears once.
    pub(crate) fn chain_for(&self, path: &str, handler: &str) -> Vec<BoxedMiddleware> {
        let mut seen = BTreeSet::new();
        let url_matched = self.url_table.matching(path).map(|m| (m.owner.as_str(), &m.target));
        let scoped = self
            .by_handler
            .get(handler)
            .into_iter()
            .flatten()
            .map(|(name, mw)| (name.as_str(), mw));
        url_matched
            .chain(scoped)
            .filter(|(name, _)| seen.insert(*name))
            .map(|(_, mw)| Arc::clone(mw))
            .collect()
    }

    /// Calls `destroy` on every initialized middleware, in reverse name order.
    pub(crate) fn destroy_all(&self) {
        for entry in self.entries.values().rev() {
            if entry.initialized.swap(false, Ordering::AcqRel) {
                entry.middleware.destroy();
                debug!(middleware = %entry.name, "middleware destroyed");
            }
        }
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = &MiddlewareEntry> {
        self.entries.values()
    }
}

/// Handle for configuring one middleware before the container starts.
pub struct MiddlewareRegistration<'a> {
    entry: &'a mut MiddlewareEntry,
    sealed: bool,
}

impl MiddlewareRegistration<'_> {
    pub fn name(&self) -> &str {
        &self.entry.name
    }

    pub fn url_pattern_mappings(&self) -> impl Iterator<Item = &str> {
        self.entry.patterns.iter().map(UrlPattern::as_str)
    }

    pub fn handler_name_mappings(&self) -> impl Iterator<Item = &str> {
        self.entry.handler_names.iter().map(String::as_str)
    }

    pub fn init_parameter(&self, name: &str) -> Option<&str> {
        self.entry.params.get(name)
    }

    /// Runs the middleware for every request whose path matches a pattern.
    pub fn add_mapping_for_patterns<I, S>(&mut self, patterns: I) -> Result<&mut Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let parsed = parse_all(patterns)?;
        self.entry_mut()?.patterns.extend(parsed);
        Ok(self)
    }

    /// Runs the middleware for every request routed to one of `handlers`.
    pub fn add_mapping_for_handler_names<I, S>(&mut self, handlers: I) -> Result<&mut Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let entry = self.entry_mut()?;
        for name in handlers {
            let name = name.as_ref();
            if !entry.handler_names.iter().any(|n| n == name) {
                entry.handler_names.push(name.to_owned());
            }
        }
        Ok(self)
    }

    pub fn set_init_parameter(&mut self, name: &str, value: &str) -> Result<bool> {
        Ok(self.entry_mut()?.params.set(name, value))
    }

    pub fn set_init_parameters<I, K, V>(&mut self, params: I) -> Result<Vec<String>>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        Ok(self.entry_mut()?.params.set_all(params))
    }

    fn entry_mut(&mut self) -> Result<&mut MiddlewareEntry> {
        if self.sealed {
            return Err(Error::AlreadyInitialized);
        }
        Ok(self.entry)
    }
}
