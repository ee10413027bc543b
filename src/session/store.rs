//! In-memory session store

use super::{PendingLogin, Session, SessionStore};
use chrono::{Duration, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;

/// Pending logins older than this are discarded
const PENDING_LOGIN_TTL_SECS: i64 = 600;

/// Session store held in process memory
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    session: RwLock<Option<Session>>,
    pending: DashMap<String, PendingLogin>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of logins awaiting a callback
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self) -> Option<Session> {
        self.session.read().clone()
    }

    fn save(&self, session: Session) {
        *self.session.write() = Some(session);
    }

    fn clear(&self) {
        *self.session.write() = None;
        self.pending.clear();
    }

    fn save_pending(&self, state: &str, pending: PendingLogin) {
        let cutoff = Utc::now() - Duration::seconds(PENDING_LOGIN_TTL_SECS);
        self.pending.retain(|_, login| login.created_at > cutoff);
        self.pending.insert(state.to_string(), pending);
    }

    fn take_pending(&self, state: &str) -> Option<PendingLogin> {
        let (_, pending) = self.pending.remove(state)?;
        let cutoff = Utc::now() - Duration::seconds(PENDING_LOGIN_TTL_SECS);
        (pending.created_at > cutoff).then_some(pending)
    }
}
