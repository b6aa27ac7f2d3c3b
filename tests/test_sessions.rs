//! Tests for session lifecycle, expiry and the background sweep.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use hearth::observer::{Observers, SessionObserver};
use hearth::{Error, Session, SessionManager};

#[derive(Default)]
struct Tally {
    created: AtomicUsize,
    destroyed: AtomicUsize,
    renamed: AtomicUsize,
}

impl SessionObserver for Tally {
    fn session_created(&self, _session: &Session) {
        self.created.fetch_add(1, Ordering::SeqCst);
    }
    fn session_destroyed(&self, _session: &Session) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }
    fn session_id_changed(&self, _session: &Session, _old_id: &str) {
        self.renamed.fetch_add(1, Ordering::SeqCst);
    }
}

fn manager(max_inactive: i64) -> (SessionManager, Arc<Tally>) {
    let tally = Arc::new(Tally::default());
    let observers = Arc::new(Observers::default());
    observers.add_session_observer(tally.clone());
    (SessionManager::new(max_inactive, Duration::from_secs(1), observers), tally)
}

#[test]
fn test_create_then_touch_round_trip() {
    let (sessions, tally) = manager(60);
    let session = sessions.create_session();
    assert!(session.is_new().unwrap());
    assert_eq!(session.max_inactive_interval(), 60);

    let touched = sessions.touch(&session.id()).unwrap();
    assert!(Arc::ptr_eq(&session, &touched));
    assert!(!session.is_new().unwrap());
    assert!(session.last_accessed_time() >= session.creation_time());
    assert_eq!(tally.created.load(Ordering::SeqCst), 1);
}

#[test]
fn test_touch_unknown_id_creates_nothing() {
    let (sessions, tally) = manager(60);
    assert!(sessions.touch("not-a-session").is_none());
    assert!(sessions.is_empty());
    assert_eq!(tally.created.load(Ordering::SeqCst), 0);
}

#[test]
fn test_invalidate_is_terminal_and_notifies_once() {
    let (sessions, tally) = manager(60);
    let session = sessions.create_session();
    let id = session.id();

    session.invalidate();
    session.invalidate();
    sessions.invalidate(&id);

    assert!(!session.is_valid());
    assert!(sessions.get(&id).is_none());
    assert!(sessions.touch(&id).is_none());
    assert!(matches!(session.attribute("x"), Err(Error::InvalidatedSession)));
    assert!(matches!(session.set_attribute("x", Arc::new(1u8)), Err(Error::InvalidatedSession)));
    assert_eq!(tally.destroyed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_change_id_moves_the_table_entry() {
    let (sessions, tally) = manager(60);
    let session = sessions.create_session();
    session.set_attribute("user", Arc::new(String::from("ann"))).unwrap();
    let old = session.id();

    let new = sessions.change_session_id(&session).unwrap();
    assert_ne!(old, new);
    assert!(sessions.get(&old).is_none());
    assert!(Arc::ptr_eq(&sessions.get(&new).unwrap(), &session));
    assert_eq!(*session.attribute_as::<String>("user").unwrap().unwrap(), "ann");
    assert_eq!(sessions.len(), 1);
    assert_eq!(tally.renamed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_concurrent_creation_yields_distinct_ids() {
    let (sessions, _) = manager(60);
    let sessions = Arc::new(sessions);

    let ids: Vec<String> = (0..8)
        .map(|_| {
            let sessions = Arc::clone(&sessions);
            thread::spawn(move || (0..50).map(|_| sessions.create_session().id()).collect::<Vec<_>>())
        })
        .collect::<Vec<_>>()
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();

    let distinct: HashSet<&String> = ids.iter().collect();
    assert_eq!(distinct.len(), 400);
    assert_eq!(sessions.len(), 400);
}

#[tokio::test(start_paused = true)]
async fn test_sweep_invalidates_idle_sessions() {
    let (sessions, tally) = manager(1);
    sessions.start_sweeper();
    let idle = sessions.create_session();
    let id = idle.id();

    tokio::time::sleep(Duration::from_secs(3)).await;

    assert!(!idle.is_valid());
    assert!(sessions.get(&id).is_none());
    assert_eq!(tally.destroyed.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_non_positive_timeout_never_expires() {
    let (sessions, _) = manager(1);
    sessions.start_sweeper();
    let forever = sessions.create_session();
    forever.set_max_inactive_interval(0);
    let also_forever = sessions.create_session();
    also_forever.set_max_inactive_interval(-5);

    tokio::time::sleep(Duration::from_secs(30)).await;

    assert!(forever.is_valid());
    assert!(also_forever.is_valid());
    assert!(sessions.touch(&forever.id()).is_some());
}

#[tokio::test(start_paused = true)]
async fn test_expired_session_is_not_revived_by_touch() {
    // Sweep never started: expiry is still enforced at access time.
    let (sessions, _) = manager(1);
    let session = sessions.create_session();

    tokio::time::advance(Duration::from_secs(5)).await;

    assert!(sessions.touch(&session.id()).is_none());
    assert!(!session.is_valid());
    assert_eq!(sessions.sweep_expired(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_active_session_survives_the_sweep() {
    let (sessions, _) = manager(2);
    sessions.start_sweeper();
    let session = sessions.create_session();

    for _ in 0..5 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(sessions.touch(&session.id()).is_some());
    }
    assert!(session.is_valid());
}

#[tokio::test]
async fn test_shutdown_invalidates_everything() {
    let (sessions, tally) = manager(60);
    sessions.start_sweeper();
    let a = sessions.create_session();
    let b = sessions.create_session();

    sessions.shutdown(Duration::from_secs(1)).await;

    assert!(!a.is_valid());
    assert!(!b.is_valid());
    assert!(sessions.is_empty());
    assert_eq!(tally.destroyed.load(Ordering::SeqCst), 2);
}

/// Opens one replacement session the first time any session is destroyed.
struct Respawner {
    sessions: std::sync::OnceLock<Arc<SessionManager>>,
    spawned: std::sync::atomic::AtomicBool,
    destroyed: AtomicUsize,
}

impl SessionObserver for Respawner {
    fn session_destroyed(&self, _session: &Session) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        if !self.spawned.swap(true, Ordering::SeqCst) {
            if let Some(sessions) = self.sessions.get() {
                sessions.create_session();
            }
        }
    }
}

#[test]
fn test_invalidate_all_catches_sessions_created_meanwhile() {
    let observer = Arc::new(Respawner {
        sessions: std::sync::OnceLock::new(),
        spawned: std::sync::atomic::AtomicBool::new(false),
        destroyed: AtomicUsize::new(0),
    });
    let observers = Arc::new(Observers::default());
    observers.add_session_observer(observer.clone());
    let sessions = Arc::new(SessionManager::new(60, Duration::from_secs(1), observers));
    let _ = observer.sessions.set(Arc::clone(&sessions));

    let first = sessions.create_session();
    sessions.invalidate_all();

    assert!(!first.is_valid());
    assert!(sessions.is_empty());
    assert_eq!(observer.destroyed.load(Ordering::SeqCst), 2);
}
