//! Single-session arbitration
//!
//! At most one peer session is active per process. A second connection is
//! either rejected or kicks the incumbent, depending on the configured
//! policy. The manager only ever holds a capability handle to the active
//! session (`id` + `close`), never the session itself.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::config::SessionPolicy;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session already active")]
    AlreadyActive,
}

/// Coarse session state, advisory only — it feeds status reports and never
/// gates transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Point-in-time view of the manager.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub state: SessionState,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub session_id: String,
    pub last_active: DateTime<Utc>,
}

/// Capability handle the manager keeps for the active session.
///
/// `close` must be callable from any task and must not call back into the
/// manager synchronously — the kick path invokes it while holding the
/// manager lock. Releasing the slot goes through `release`, which retakes
/// the lock after `close` returns.
pub trait SessionHandle: Send + Sync {
    fn id(&self) -> &str;
    fn close(&self, reason: &str);
}

/// The one capability a session gets back: releasing its own slot.
/// Injected at session construction instead of a full manager reference.
pub trait Releaser: Send + Sync {
    fn release(&self, session_id: &str);
}

impl Releaser for SessionManager {
    fn release(&self, session_id: &str) {
        SessionManager::release(self, session_id)
    }
}

struct ManagerInner {
    state: SessionState,
    active: Option<Arc<dyn SessionHandle>>,
    last_active: DateTime<Utc>,
}

pub struct SessionManager {
    policy: SessionPolicy,
    inner: Mutex<ManagerInner>,
}

impl SessionManager {
    pub fn new(policy: SessionPolicy) -> Self {
        Self {
            policy,
            inner: Mutex::new(ManagerInner {
                state: SessionState::Disconnected,
                active: None,
                last_active: Utc::now(),
            }),
        }
    }

    /// Install `session` as the active one.
    ///
    /// With `RejectSecond` an existing incumbent wins and the call fails;
    /// with `KickPrevious` the incumbent is closed with
    /// `replaced_by_new_session` and the newcomer takes the slot.
    pub fn acquire(&self, session: Arc<dyn SessionHandle>) -> Result<(), SessionError> {
        let mut inner = self.inner.lock().expect("session manager lock");
        if let Some(active) = &inner.active {
            match self.policy {
                SessionPolicy::RejectSecond => return Err(SessionError::AlreadyActive),
                SessionPolicy::KickPrevious => active.close("replaced_by_new_session"),
            }
        }
        inner.active = Some(session);
        inner.state = SessionState::Connecting;
        inner.last_active = Utc::now();
        Ok(())
    }

    /// Clear the slot iff `session_id` matches the incumbent. A stale
    /// release from a kicked session is a no-op.
    pub fn release(&self, session_id: &str) {
        let mut inner = self.inner.lock().expect("session manager lock");
        if inner.active.as_ref().is_some_and(|a| a.id() == session_id) {
            inner.active = None;
            inner.state = SessionState::Disconnected;
            inner.last_active = Utc::now();
        }
    }

    pub fn set_state(&self, state: SessionState) {
        let mut inner = self.inner.lock().expect("session manager lock");
        inner.state = state;
        inner.last_active = Utc::now();
    }

    /// Stamp activity without changing state.
    pub fn touch(&self) {
        let mut inner = self.inner.lock().expect("session manager lock");
        inner.last_active = Utc::now();
    }

    pub fn snapshot(&self) -> Snapshot {
        let inner = self.inner.lock().expect("session manager lock");
        Snapshot {
            state: inner.state,
            session_id: inner
                .active
                .as_ref()
                .map(|a| a.id().to_string())
                .unwrap_or_default(),
            last_active: inner.last_active,
        }
    }
}
