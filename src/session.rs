use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use ulid::Ulid;

/// A logged-in consumer. Issued by the request layer after
/// `verify_credentials` succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub token: Ulid,
    pub username: String,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn issue(username: String, ttl: TimeDelta, now: DateTime<Utc>) -> Self {
        Self {
            token: Ulid::new(),
            username,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Where sessions live. Injected into the request layer so the engine never
/// sees sessions and tests can swap the backing store.
pub trait SessionStore: Send + Sync {
    /// A live session for `token`. Never returns an expired one.
    fn get(&self, token: &Ulid, now: DateTime<Utc>) -> Option<Session>;
    fn set(&self, session: Session);
    /// Remove a session. Returns whether one existed.
    fn expire(&self, token: &Ulid) -> bool;
    /// Drop every expired session, returning how many were removed.
    fn purge_expired(&self, now: DateTime<Utc>) -> usize;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: DashMap<Ulid, Session>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for InMemorySessionStore {
    fn get(&self, token: &Ulid, now: DateTime<Utc>) -> Option<Session> {
        self.sessions
            .get(token)
            .map(|e| e.value().clone())
            .filter(|s| !s.is_expired(now))
    }

    fn set(&self, session: Session) {
        self.sessions.insert(session.token, session);
        metrics::gauge!(crate::observability::SESSIONS_ACTIVE).set(self.sessions.len() as f64);
    }

    fn expire(&self, token: &Ulid) -> bool {
        let removed = self.sessions.remove(token).is_some();
        metrics::gauge!(crate::observability::SESSIONS_ACTIVE).set(self.sessions.len() as f64);
        removed
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, s| !s.is_expired(now));
        let after = self.sessions.len();
        metrics::gauge!(crate::observability::SESSIONS_ACTIVE).set(after as f64);
        before.saturating_sub(after)
    }

    fn len(&self) -> usize {
        self.sessions.len()
    }
}
