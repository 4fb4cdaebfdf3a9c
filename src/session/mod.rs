//! Session registry and checkout
//!
//! Each client session owns one [`TransactionRouter`]. The store creates
//! the state on first access, checks a session out to at most one
//! operation at a time, and lets monitoring observe any session without
//! checking it out. Evicting a session destroys its router state; the
//! router is stateless across process restarts by design.

use crate::transaction::{RouterEnv, TransactionRouter};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// Logical session identifier carried by every client statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One client session and its router state.
pub struct Session {
    id: SessionId,
    router: TransactionRouter,
    checkout: Arc<Mutex<()>>,
}

impl Session {
    fn new(id: SessionId, env: Arc<RouterEnv>) -> Self {
        Self {
            id,
            router: TransactionRouter::new(id, env),
            checkout: Arc::new(Mutex::new(())),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The session's router. Observer access only unless the caller holds
    /// the session's checkout.
    pub fn router(&self) -> &TransactionRouter {
        &self.router
    }

    /// Whether some operation currently holds the session.
    pub fn is_checked_out(&self) -> bool {
        self.checkout.try_lock().is_err()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("checked_out", &self.is_checked_out())
            .finish()
    }
}

/// Exclusive hold of a session for the duration of one operation.
///
/// Dropping the guard checks the session back in and marks its
/// transaction inactive.
pub struct CheckedOutSession {
    session: Arc<Session>,
    _guard: OwnedMutexGuard<()>,
}

impl CheckedOutSession {
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn router(&self) -> &TransactionRouter {
        &self.session.router
    }
}

impl Drop for CheckedOutSession {
    fn drop(&mut self) {
        self.session.router.stash();
    }
}

/// Registry of live sessions, keyed by session id.
///
/// Backed by a sharded map, so checkout of one session never contends
/// with scans or with other sessions.
pub struct SessionStore {
    env: Arc<RouterEnv>,
    sessions: DashMap<SessionId, Arc<Session>>,
}

impl SessionStore {
    pub fn new(env: Arc<RouterEnv>) -> Self {
        Self {
            env,
            sessions: DashMap::new(),
        }
    }

    /// Check a session out for an operation, creating its state on first
    /// access. Waits until any operation holding the session finishes.
    pub async fn check_out(&self, id: SessionId) -> CheckedOutSession {
        let session = {
            let entry = self
                .sessions
                .entry(id)
                .or_insert_with(|| Arc::new(Session::new(id, Arc::clone(&self.env))));
            Arc::clone(entry.value())
        };
        let guard = Arc::clone(&session.checkout).lock_owned().await;
        CheckedOutSession {
            session,
            _guard: guard,
        }
    }

    /// Observer access to a session, without checkout.
    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Destroy a session's state. Returns false if the session is
    /// unknown.
    pub fn evict(&self, id: &SessionId) -> bool {
        self.sessions.remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Monitoring scan: one report per session with an initialized
    /// transaction.
    pub fn report_all(&self) -> Vec<Value> {
        self.sessions
            .iter()
            .filter_map(|entry| {
                let session = entry.value();
                session.router().report_state(session.is_checked_out())
            })
            .collect()
    }
}

impl fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStore")
            .field("sessions", &self.sessions.len())
            .finish()
    }
}
