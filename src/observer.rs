//! Lifecycle and attribute observers.
//!
//! Observers are plain trait objects kept in registration order and invoked
//! synchronously at the mutation point. Every method has an empty default, so
//! an observer only overrides the events it cares about.
//!
//! A panicking observer is logged and skipped: the mutation that triggered the
//! event has already happened and is never rolled back.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::error;

use crate::request::Request;
use crate::session::Session;

/// A type-erased attribute value shared between requests.
pub type AttributeValue = Arc<dyn Any + Send + Sync>;

/// Where an attribute lives.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AttributeScope {
    Context,
    Request,
    Session,
}

/// One attribute mutation.
///
/// For replacements `value` is the *old* value, matching the convention that
/// the new value can always be read back from the owner.
pub struct AttributeEvent<'a> {
    pub scope: AttributeScope,
    pub name: &'a str,
    pub value: &'a AttributeValue,
    /// Id of the owning session, for [`AttributeScope::Session`].
    pub session_id: Option<&'a str>,
}

pub trait AttributeObserver: Send + Sync {
    fn attribute_added(&self, _event: &AttributeEvent<'_>) {}
    fn attribute_replaced(&self, _event: &AttributeEvent<'_>) {}
    fn attribute_removed(&self, _event: &AttributeEvent<'_>) {}
}

/// Notified around each request the [`Context`](crate::Context) dispatches.
pub trait RequestObserver: Send + Sync {
    fn request_initialized(&self, _req: &Request) {}
    fn request_destroyed(&self, _req: &Request) {}
}

pub trait SessionObserver: Send + Sync {
    fn session_created(&self, _session: &Session) {}
    fn session_destroyed(&self, _session: &Session) {}
    fn session_id_changed(&self, _session: &Session, _old_id: &str) {}
}

/// Ordered observer lists for one container.
#[derive(Default)]
pub struct Observers {
    attributes: RwLock<Vec<Arc<dyn AttributeObserver>>>,
    requests: RwLock<Vec<Arc<dyn RequestObserver>>>,
    sessions: RwLock<Vec<Arc<dyn SessionObserver>>>,
}

impl Observers {
    pub fn add_attribute_observer(&self, observer: Arc<dyn AttributeObserver>) {
        self.attributes.write().push(observer);
    }

    pub fn add_request_observer(&self, observer: Arc<dyn RequestObserver>) {
        self.requests.write().push(observer);
    }

    pub fn add_session_observer(&self, observer: Arc<dyn SessionObserver>) {
        self.sessions.write().push(observer);
    }

    pub(crate) fn attribute_added(&self, event: &AttributeEvent<'_>) {
        for o in snapshot(&self.attributes) {
            guarded("attribute_added", || o.attribute_added(event));
        }
    }

    pub(crate) fn attribute_replaced(&self, event: &AttributeEvent<'_>) {
        for o in snapshot(&self.attributes) {
            guarded("attribute_replaced", || o.attribute_replaced(event));
        }
    }

    pub(crate) fn attribute_removed(&self, event: &AttributeEvent<'_>) {
        for o in snapshot(&self.attributes) {
            guarded("attribute_removed", || o.attribute_removed(event));
        }
    }

    pub(crate) fn request_initialized(&self, req: &Request) {
        for o in snapshot(&self.requests) {
            guarded("request_initialized", || o.request_initialized(req));
        }
    }

    pub(crate) fn request_destroyed(&self, req: &Request) {
        for o in snapshot(&self.requests) {
            guarded("request_destroyed", || o.request_destroyed(req));
        }
    }

    pub(crate) fn session_created(&self, session: &Session) {
        for o in snapshot(&self.sessions) {
            guarded("session_created", || o.session_created(session));
        }
    }

    pub(crate) fn session_destroyed(&self, session: &Session) {
        for o in snapshot(&self.sessions) {
            guarded("session_destroyed", || o.session_destroyed(session));
        }
    }

    pub(crate) fn session_id_changed(&self, session: &Session, old_id: &str) {
        for o in snapshot(&self.sessions) {
            guarded("session_id_changed", || o.session_id_changed(session, old_id));
        }
    }

    pub(crate) fn clear(&self) {
        self.attributes.write().clear();
        self.requests.write().clear();
        self.sessions.write().clear();
    }
}

// Cloned out of the lock so an observer may register another observer
// without deadlocking on the write lock.
fn snapshot<T: ?Sized>(list: &RwLock<Vec<Arc<T>>>) -> Vec<Arc<T>> {
    list.read().clone()
}

fn guarded(event: &'static str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!(event, "observer panicked; continuing");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(AtomicUsize);

    impl AttributeObserver for Counting {
        fn attribute_added(&self, _event: &AttributeEvent<'_>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Exploding;

    impl AttributeObserver for Exploding {
        fn attribute_added(&self, _event: &AttributeEvent<'_>) {
            panic!("boom");
        }
    }

    #[test]
    fn panicking_observer_does_not_stop_the_rest() {
        let observers = Observers::default();
        let counter = Arc::new(Counting(AtomicUsize::new(0)));
        observers.add_attribute_observer(Arc::new(Exploding));
        observers.add_attribute_observer(counter.clone());

        let value: AttributeValue = Arc::new(1u32);
        observers.attribute_added(&AttributeEvent {
            scope: AttributeScope::Context,
            name: "k",
            value: &value,
            session_id: None,
        });
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }
}
