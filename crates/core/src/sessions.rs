//! Process-local session lifecycle.
//!
//! Sessions live only in memory; a restart drops every conversation. Each
//! session sits behind its own async lock, which a turn holds from admission
//! to reply so two messages on one session never interleave.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::domain::session::{Session, SessionId};

pub type SessionGuard = OwnedMutexGuard<Session>;

#[derive(Debug)]
pub struct SessionStore {
    context_limit: usize,
    sessions: Mutex<HashMap<SessionId, Arc<AsyncMutex<Session>>>>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(20)
    }
}

impl SessionStore {
    pub fn new(context_limit: usize) -> Self {
        Self { context_limit: context_limit.max(1), sessions: Mutex::new(HashMap::new()) }
    }

    /// Upper bound on rolling context entries kept per session.
    pub fn context_limit(&self) -> usize {
        self.context_limit
    }

    /// Returns a snapshot, creating an anonymous session on first access.
    pub async fn get_or_create(&self, id: &SessionId, now: DateTime<Utc>) -> Session {
        self.lock(id, now).await.clone()
    }

    /// Exclusive access to one session. The guard is owned so it can be held
    /// across the awaits of a whole turn.
    pub async fn lock(&self, id: &SessionId, now: DateTime<Utc>) -> SessionGuard {
        loop {
            let slot = self.slot(id, now);
            let guard = Arc::clone(&slot).lock_owned().await;
            if self.is_current(id, &slot) {
                return guard;
            }
            // swept while we were queued; start over with a fresh entry
            debug!(
                event_name = "session.lock_retry",
                session_id = %id,
                "session was evicted while waiting for its lock"
            );
        }
    }

    pub async fn with_lock<F, T>(&self, id: &SessionId, now: DateTime<Utc>, apply: F) -> T
    where
        F: FnOnce(&mut Session) -> T,
    {
        let mut guard = self.lock(id, now).await;
        apply(&mut guard)
    }

    /// Bumps `last_active_at` on an existing session; returns false when the
    /// session does not exist.
    pub async fn touch(&self, id: &SessionId, now: DateTime<Utc>) -> bool {
        let Some(slot) = lock_map(&self.sessions).get(id).cloned() else {
            return false;
        };
        slot.lock().await.touch(now);
        true
    }

    pub fn expire(&self, id: &SessionId) -> bool {
        let removed = lock_map(&self.sessions).remove(id).is_some();
        if removed {
            info!(event_name = "session.expired", session_id = %id, "session expired");
        }
        removed
    }

    /// Evicts sessions idle longer than `max_idle`. Sessions whose lock is
    /// currently held are mid-turn and are left alone.
    pub fn sweep_expired(&self, max_idle: Duration, now: DateTime<Utc>) -> usize {
        let cutoff = now - max_idle;
        let mut sessions = lock_map(&self.sessions);
        let before = sessions.len();
        sessions.retain(|_, slot| match slot.try_lock() {
            Ok(session) => !session.is_idle_since(cutoff),
            Err(_) => true,
        });
        let removed = before - sessions.len();
        if removed > 0 {
            info!(
                event_name = "session.sweep",
                removed,
                remaining = sessions.len(),
                "idle sessions evicted"
            );
        }
        removed
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        lock_map(&self.sessions).contains_key(id)
    }

    pub fn len(&self) -> usize {
        lock_map(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, id: &SessionId, now: DateTime<Utc>) -> Arc<AsyncMutex<Session>> {
        let mut sessions = lock_map(&self.sessions);
        let slot = sessions.entry(id.clone()).or_insert_with(|| {
            debug!(event_name = "session.created", session_id = %id, "session created");
            Arc::new(AsyncMutex::new(Session::new(id.clone(), now)))
        });
        Arc::clone(slot)
    }

    fn is_current(&self, id: &SessionId, slot: &Arc<AsyncMutex<Session>>) -> bool {
        lock_map(&self.sessions).get(id).is_some_and(|current| Arc::ptr_eq(current, slot))
    }
}

fn lock_map<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    use chrono::{DateTime, Duration, TimeZone, Utc};

    use super::SessionStore;
    use crate::domain::session::{AuthState, ContextEntry, Role, SessionId};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 30, 0).single().expect("valid timestamp")
    }

    fn id(raw: &str) -> SessionId {
        SessionId(raw.to_string())
    }

    #[tokio::test]
    async fn first_access_creates_an_anonymous_session() {
        let store = SessionStore::default();
        let session = store.get_or_create(&id("s-1"), t0()).await;

        assert_eq!(session.role, Role::Anonymous);
        assert_eq!(session.auth_state, AuthState::Anonymous);
        assert_eq!(session.created_at, t0());
        assert_eq!(store.len(), 1);

        let again = store.get_or_create(&id("s-1"), t0() + Duration::minutes(5)).await;
        assert_eq!(again.created_at, t0());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn mutations_through_with_lock_persist() {
        let store = SessionStore::new(2);
        for text in ["one", "two", "three"] {
            store
                .with_lock(&id("s-1"), t0(), |session| {
                    session.push_context(ContextEntry::user_message(text, t0()), 2);
                })
                .await;
        }

        let session = store.get_or_create(&id("s-1"), t0()).await;
        assert_eq!(session.context.len(), 2);
        assert_eq!(session.context[0].content, "two");
    }

    #[tokio::test(start_paused = true)]
    async fn second_lock_waits_for_the_first() {
        let store = Arc::new(SessionStore::default());
        let held = store.lock(&id("s-1"), t0()).await;

        let blocked =
            tokio::time::timeout(StdDuration::from_millis(50), store.lock(&id("s-1"), t0())).await;
        assert!(blocked.is_err(), "same session must not be lockable twice");

        let other =
            tokio::time::timeout(StdDuration::from_millis(50), store.lock(&id("s-2"), t0())).await;
        assert!(other.is_ok(), "distinct sessions are independent");

        drop(held);
        let released =
            tokio::time::timeout(StdDuration::from_millis(50), store.lock(&id("s-1"), t0())).await;
        assert!(released.is_ok());
    }

    #[tokio::test]
    async fn concurrent_turns_on_one_session_do_not_lose_updates() {
        let store = Arc::new(SessionStore::new(1_000));
        let tasks = (0..16)
            .map(|index| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    let mut session = store.lock(&id("shared"), t0()).await;
                    let entry = ContextEntry::user_message(format!("m{index}"), t0());
                    tokio::task::yield_now().await;
                    session.push_context(entry, 1_000);
                })
            })
            .collect::<Vec<_>>();
        for task in tasks {
            task.await.expect("task should not panic");
        }

        assert_eq!(store.get_or_create(&id("shared"), t0()).await.context.len(), 16);
    }

    #[tokio::test]
    async fn touch_only_moves_forward_and_ignores_unknown_ids() {
        let store = SessionStore::default();
        assert!(!store.touch(&id("ghost"), t0()).await);
        assert!(!store.contains(&id("ghost")));

        store.get_or_create(&id("s-1"), t0()).await;
        assert!(store.touch(&id("s-1"), t0() + Duration::minutes(10)).await);
        assert!(store.touch(&id("s-1"), t0() + Duration::minutes(1)).await);

        let session = store.get_or_create(&id("s-1"), t0()).await;
        assert_eq!(session.last_active_at, t0() + Duration::minutes(10));
    }

    #[tokio::test]
    async fn sweep_evicts_idle_sessions_but_skips_locked_ones() {
        let store = SessionStore::default();
        store.get_or_create(&id("idle"), t0()).await;
        store.get_or_create(&id("busy"), t0()).await;
        store.get_or_create(&id("fresh"), t0() + Duration::hours(23)).await;

        let busy = store.lock(&id("busy"), t0()).await;
        let removed = store.sweep_expired(Duration::hours(24), t0() + Duration::hours(25));
        assert_eq!(removed, 1);
        assert!(!store.contains(&id("idle")));
        assert!(store.contains(&id("busy")));
        assert!(store.contains(&id("fresh")));
        drop(busy);
    }

    #[tokio::test]
    async fn expire_removes_and_next_access_starts_over() {
        let store = SessionStore::default();
        store
            .with_lock(&id("s-1"), t0(), |session| session.role = Role::Customer)
            .await;
        assert!(store.expire(&id("s-1")));
        assert!(!store.expire(&id("s-1")));

        let fresh = store.get_or_create(&id("s-1"), t0() + Duration::hours(1)).await;
        assert_eq!(fresh.role, Role::Anonymous);
    }

    #[tokio::test]
    async fn lock_survives_eviction_while_queued() {
        let store = Arc::new(SessionStore::default());
        let held = store.lock(&id("s-1"), t0()).await;

        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                let mut session = store.lock(&id("s-1"), t0()).await;
                session.role = Role::Supplier;
            })
        };
        tokio::task::yield_now().await;

        store.expire(&id("s-1"));
        drop(held);
        waiter.await.expect("waiter should finish");

        let session = store.get_or_create(&id("s-1"), t0()).await;
        assert_eq!(session.role, Role::Supplier);
    }
}
