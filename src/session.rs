//! Server-side sessions and their expiry sweep.
//!
//! # Lifecycle
//!
//! ```text
//! create_session() ──▶ new ──touch(id)──▶ active ──┬── invalidate()
//!                                                  ├── idle > max_inactive (sweep)
//!                                                  └── container shutdown
//!                                                          ▼
//!                                                     invalidated (terminal)
//! ```
//!
//! The table is a [`DashMap`] so request threads and the sweep can insert,
//! look up and remove concurrently. Neither side ever holds a shard guard
//! while taking a session's own lock in the opposite order: the sweep reads
//! session state under the shard guard, but invalidation drops the session
//! lock before touching the table.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::observer::{AttributeEvent, AttributeScope, AttributeValue, Observers};

/// One client's server-side state.
///
/// Shared as `Arc<Session>` between the manager and every request currently
/// carrying its id. Once invalidated, every attribute operation and
/// [`is_new`](Session::is_new) fail with [`Error::InvalidatedSession`].
pub struct Session {
    state: RwLock<SessionState>,
    created: SystemTime,
    table: Weak<Shared>,
}

struct SessionState {
    id: String,
    last_accessed: Instant,
    last_accessed_wall: SystemTime,
    /// Seconds; `<= 0` never expires.
    max_inactive: i64,
    is_new: bool,
    invalidated: bool,
    attributes: HashMap<String, AttributeValue>,
}

impl SessionState {
    fn is_expired(&self, now: Instant) -> bool {
        self.max_inactive > 0
            && now.saturating_duration_since(self.last_accessed)
                > Duration::from_secs(self.max_inactive.unsigned_abs())
    }
}

impl Session {
    pub fn id(&self) -> String {
        self.state.read().id.clone()
    }

    pub fn creation_time(&self) -> SystemTime {
        self.created
    }

    pub fn last_accessed_time(&self) -> SystemTime {
        self.state.read().last_accessed_wall
    }

    pub fn max_inactive_interval(&self) -> i64 {
        self.state.read().max_inactive
    }

    /// Seconds of inactivity before the sweep invalidates this session.
    /// Zero or negative disables expiry.
    pub fn set_max_inactive_interval(&self, seconds: i64) {
        self.state.write().max_inactive = seconds;
    }

    pub fn is_valid(&self) -> bool {
        !self.state.read().invalidated
    }

    /// `true` until the client sends the assigned id back.
    pub fn is_new(&self) -> Result<bool> {
        let state = self.state.read();
        if state.invalidated {
            return Err(Error::InvalidatedSession);
        }
        Ok(state.is_new)
    }

    pub fn attribute(&self, name: &str) -> Result<Option<AttributeValue>> {
        let state = self.state.read();
        if state.invalidated {
            return Err(Error::InvalidatedSession);
        }
        Ok(state.attributes.get(name).cloned())
    }

    /// Typed convenience over [`attribute`](Session::attribute).
    pub fn attribute_as<T: Send + Sync + 'static>(&self, name: &str) -> Result<Option<Arc<T>>> {
        Ok(self.attribute(name)?.and_then(|v| v.downcast::<T>().ok()))
    }

    pub fn attribute_names(&self) -> Result<Vec<String>> {
        let state = self.state.read();
        if state.invalidated {
            return Err(Error::InvalidatedSession);
        }
        Ok(state.attributes.keys().cloned().collect())
    }

    pub fn set_attribute(&self, name: impl Into<String>, value: AttributeValue) -> Result<()> {
        let name = name.into();
        let (id, old) = {
            let mut state = self.state.write();
            if state.invalidated {
                return Err(Error::InvalidatedSession);
            }
            let old = state.attributes.insert(name.clone(), Arc::clone(&value));
            (state.id.clone(), old)
        };
        if let Some(observers) = self.observers() {
            match &old {
                Some(old) => observers.attribute_replaced(&self.event(&name, old, &id)),
                None => observers.attribute_added(&self.event(&name, &value, &id)),
            }
        }
        Ok(())
    }

    pub fn remove_attribute(&self, name: &str) -> Result<Option<AttributeValue>> {
        let (id, removed) = {
            let mut state = self.state.write();
            if state.invalidated {
                return Err(Error::InvalidatedSession);
            }
            (state.id.clone(), state.attributes.remove(name))
        };
        if let (Some(observers), Some(value)) = (self.observers(), &removed) {
            observers.attribute_removed(&self.event(name, value, &id));
        }
        Ok(removed)
    }

    /// Invalidates the session and unbinds it from the manager.
    /// Calling it again is a no-op.
    pub fn invalidate(&self) {
        if let Some(released) = self.mark_invalidated(|_| true) {
            self.release(released);
        }
    }

    /// Invalidates only if the session is still idle past its limit at `now`,
    /// judged under the write lock so a concurrent touch wins.
    fn invalidate_if_expired(&self, now: Instant) -> bool {
        match self.mark_invalidated(|state| state.is_expired(now)) {
            Some(released) => {
                self.release(released);
                true
            }
            None => false,
        }
    }

    // Flips the latch when `should` agrees; returns the id and the cleared
    // attributes on the first call.
    fn mark_invalidated(
        &self,
        should: impl FnOnce(&SessionState) -> bool,
    ) -> Option<(String, HashMap<String, AttributeValue>)> {
        let mut state = self.state.write();
        if state.invalidated || !should(&state) {
            return None;
        }
        state.invalidated = true;
        Some((state.id.clone(), std::mem::take(&mut state.attributes)))
    }

    // Runs with no session lock held.
    fn release(&self, (id, attributes): (String, HashMap<String, AttributeValue>)) {
        if let Some(shared) = self.table.upgrade() {
            shared.table.remove(&id);
            for (name, value) in &attributes {
                shared.observers.attribute_removed(&self.event(name, value, &id));
            }
            shared.observers.session_destroyed(self);
        }
        debug!(session = %id, "session invalidated");
    }

    fn access(&self, now: Instant) -> bool {
        let mut state = self.state.write();
        if state.invalidated || state.is_expired(now) {
            return false;
        }
        state.last_accessed = now;
        state.last_accessed_wall = SystemTime::now();
        state.is_new = false;
        true
    }

    fn observers(&self) -> Option<Arc<Observers>> {
        self.table.upgrade().map(|shared| Arc::clone(&shared.observers))
    }

    fn event<'a>(&self, name: &'a str, value: &'a AttributeValue, id: &'a str) -> AttributeEvent<'a> {
        AttributeEvent { scope: AttributeScope::Session, name, value, session_id: Some(id) }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("Session")
            .field("id", &state.id)
            .field("is_new", &state.is_new)
            .field("invalidated", &state.invalidated)
            .field("max_inactive", &state.max_inactive)
            .finish_non_exhaustive()
    }
}

struct Shared {
    table: DashMap<String, Arc<Session>>,
    observers: Arc<Observers>,
}

impl Shared {
    fn sweep(&self, now: Instant) -> usize {
        // Collect first: invalidation removes from the table, which must not
        // happen while this iterator holds a shard guard. The snapshot may be
        // stale by the time each candidate is invalidated, so expiry is
        // checked again.
        let candidates: Vec<Arc<Session>> = self
            .table
            .iter()
            .filter(|entry| entry.value().state.read().is_expired(now))
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        candidates.iter().filter(|session| session.invalidate_if_expired(now)).count()
    }
}

struct Sweeper {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Creates, looks up and expires sessions for one container.
pub struct SessionManager {
    shared: Arc<Shared>,
    default_max_inactive: i64,
    sweep_interval: Duration,
    sweeper: Mutex<Option<Sweeper>>,
}

impl SessionManager {
    pub fn new(default_max_inactive: i64, sweep_interval: Duration, observers: Arc<Observers>) -> Self {
        Self {
            shared: Arc::new(Shared { table: DashMap::new(), observers }),
            default_max_inactive,
            sweep_interval,
            sweeper: Mutex::new(None),
        }
    }

    /// Allocates a fresh session with `is_new == true`.
    pub fn create_session(&self) -> Arc<Session> {
        let now = Instant::now();
        let wall = SystemTime::now();
        let session = loop {
            match self.shared.table.entry(generate_id()) {
                Entry::Vacant(slot) => {
                    let session = Arc::new(Session {
                        state: RwLock::new(SessionState {
                            id: slot.key().clone(),
                            last_accessed: now,
                            last_accessed_wall: wall,
                            max_inactive: self.default_max_inactive,
                            is_new: true,
                            invalidated: false,
                            attributes: HashMap::new(),
                        }),
                        created: wall,
                        table: Arc::downgrade(&self.shared),
                    });
                    slot.insert(Arc::clone(&session));
                    break session;
                }
                Entry::Occupied(_) => continue,
            }
        };
        debug!(session = %session.id(), "session created");
        self.shared.observers.session_created(&session);
        session
    }

    /// Looks up `id` without marking it accessed.
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        let session = self.shared.table.get(id).map(|entry| Arc::clone(entry.value()))?;
        session.is_valid().then_some(session)
    }

    /// Records a client round-trip of `id`: refreshes the last-accessed time
    /// and clears `is_new`. Unknown, invalidated or already-expired ids
    /// return `None`; no session is created.
    pub fn touch(&self, id: &str) -> Option<Arc<Session>> {
        let session = self.get(id)?;
        if session.access(Instant::now()) {
            Some(session)
        } else {
            // Expired between sweeps: finish it now rather than reviving it.
            session.invalidate();
            None
        }
    }

    /// Invalidates `id` if it is still live. Unknown ids are ignored.
    pub fn invalidate(&self, id: &str) {
        if let Some(session) = self.get(id) {
            session.invalidate();
        }
    }

    /// Moves `session` to a new id, keeping its attributes. Returns the new id.
    pub fn change_session_id(&self, session: &Arc<Session>) -> Result<String> {
        if !session.is_valid() {
            return Err(Error::InvalidatedSession);
        }
        let old_id = session.id();
        let new_id = loop {
            match self.shared.table.entry(generate_id()) {
                Entry::Vacant(slot) => {
                    let id = slot.key().clone();
                    session.state.write().id = id.clone();
                    slot.insert(Arc::clone(session));
                    break id;
                }
                Entry::Occupied(_) => continue,
            }
        };
        self.shared.table.remove(&old_id);
        debug!(old = %old_id, new = %new_id, "session id rotated");
        self.shared.observers.session_id_changed(session, &old_id);
        Ok(new_id)
    }

    pub fn len(&self) -> usize {
        self.shared.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.table.is_empty()
    }

    /// Runs one expiry pass now. Returns how many sessions were invalidated.
    pub fn sweep_expired(&self) -> usize {
        self.shared.sweep(Instant::now())
    }

    /// Spawns the periodic sweep on the current tokio runtime.
    ///
    /// Does nothing if a sweep is already running. Without a runtime the
    /// sweep is skipped with a warning; sessions then expire only when a
    /// client presents a stale id.
    pub fn start_sweeper(&self) {
        let mut slot = self.sweeper.lock();
        if slot.is_some() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("no tokio runtime; periodic session sweep disabled");
            return;
        };

        let (stop, mut stopped) = watch::channel(false);
        let shared = Arc::downgrade(&self.shared);
        let period = self.sweep_interval;

        let task = runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = stopped.changed() => break,
                    _ = ticker.tick() => {
                        let Some(shared) = shared.upgrade() else { break };
                        trace!("checking for timed-out sessions");
                        let swept = shared.sweep(Instant::now());
                        if swept > 0 {
                            debug!(swept, "expired sessions invalidated");
                        }
                    }
                }
            }
        });

        *slot = Some(Sweeper { stop, task });
    }

    /// Stops the sweep, waiting up to `grace` before aborting it, then
    /// invalidates every remaining session.
    pub async fn shutdown(&self, grace: Duration) {
        let sweeper = self.sweeper.lock().take();
        if let Some(Sweeper { stop, mut task }) = sweeper {
            let _ = stop.send(true);
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                warn!(?grace, "session sweep did not stop in time; aborting");
                task.abort();
            }
        }
        self.invalidate_all();
    }

    /// Invalidates every session in the table, including ones created while
    /// this runs.
    pub fn invalidate_all(&self) {
        loop {
            let live: Vec<(String, Arc<Session>)> = self
                .shared
                .table
                .iter()
                .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
                .collect();
            if live.is_empty() {
                break;
            }
            for (id, session) in live {
                session.invalidate();
                // An entry whose session was already invalidated is not
                // removed by `invalidate`; drop it so the loop terminates.
                self.shared.table.remove_if(&id, |_, held| Arc::ptr_eq(held, &session));
            }
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get_mut().take() {
            sweeper.task.abort();
        }
    }
}

/// 128 random bits from the thread-local CSPRNG, hex encoded.
fn generate_id() -> String {
    let bytes: [u8; 16] = rand::thread_rng().r#gen();
    let mut id = String::with_capacity(32);
    for b in bytes {
        let _ = write!(id, "{b:02x}");
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(timeout: i64) -> SessionManager {
        SessionManager::new(timeout, Duration::from_secs(1), Arc::new(Observers::default()))
    }

    #[test]
    fn ids_are_32_hex_chars_and_distinct() {
        let a = generate_id();
        let b = generate_id();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn touch_clears_new_flag() {
        let sessions = manager(60);
        let session = sessions.create_session();
        assert!(session.is_new().unwrap());
        let touched = sessions.touch(&session.id()).unwrap();
        assert!(!touched.is_new().unwrap());
    }

    #[test]
    fn touch_unknown_is_none() {
        assert!(manager(60).touch("nope").is_none());
    }

    #[test]
    fn invalidated_session_rejects_attribute_access() {
        let sessions = manager(60);
        let session = sessions.create_session();
        session.set_attribute("user", Arc::new("ann".to_owned())).unwrap();
        session.invalidate();
        assert!(matches!(session.attribute("user"), Err(Error::InvalidatedSession)));
        assert!(matches!(session.is_new(), Err(Error::InvalidatedSession)));
        assert!(sessions.is_empty());
        session.invalidate();
    }

    #[test]
    fn change_id_keeps_attributes() {
        let sessions = manager(60);
        let session = sessions.create_session();
        let old = session.id();
        session.set_attribute("n", Arc::new(7u32)).unwrap();
        let new = sessions.change_session_id(&session).unwrap();
        assert_ne!(old, new);
        assert!(sessions.get(&old).is_none());
        let found = sessions.get(&new).unwrap();
        assert_eq!(*found.attribute_as::<u32>("n").unwrap().unwrap(), 7);
        assert_eq!(sessions.len(), 1);
    }

    #[test]
    fn sweep_spares_a_session_touched_after_the_scan() {
        let sessions = manager(10);
        let session = sessions.create_session();
        let created = session.state.read().last_accessed;
        let now = created + Duration::from_millis(10_500);
        let touched = created + Duration::from_millis(9_500);

        // The scan sees it idle...
        assert!(session.state.read().is_expired(now));
        // ...then a request stamped just before the scan refreshes it.
        assert!(session.access(touched));

        assert!(!session.invalidate_if_expired(now));
        assert_eq!(sessions.shared.sweep(now), 0);
        assert!(session.is_valid());

        assert_eq!(sessions.shared.sweep(touched + Duration::from_secs(11)), 1);
        assert!(!session.is_valid());
    }

    #[test]
    fn invalidate_all_drops_already_invalidated_entries() {
        let sessions = manager(60);
        let session = sessions.create_session();
        session.state.write().invalidated = true;

        sessions.invalidate_all();
        assert!(sessions.is_empty());
    }
}
