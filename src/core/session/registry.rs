//! Process-wide session registry.
//!
//! Maps a telephony stream identifier to its call session. The registry is
//! an injected instance with explicit lifecycle (no ambient globals) so
//! tests can create isolated registries. One mutex serializes all three
//! operations against concurrent callers; no session state is ever locked
//! from here.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use super::{CallSession, SessionStatus};

/// Errors from registry registration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// A session is already registered under this stream id
    #[error("stream id already registered: {0}")]
    DuplicateId(String),

    /// The configured concurrent-session cap has been reached
    #[error("session capacity exceeded ({0} active)")]
    CapacityExceeded(usize),
}

/// Registry of active call sessions keyed by telephony stream id.
pub struct SessionRegistry {
    max_sessions: usize,
    inner: Mutex<HashMap<String, Arc<CallSession>>>,
}

impl SessionRegistry {
    /// Create a registry bounded at `max_sessions` concurrent entries.
    pub fn new(max_sessions: usize) -> Self {
        Self {
            max_sessions: max_sessions.max(1),
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Register a session. Capacity and duplicate checks happen before any
    /// slot is taken, so a rejected call has consumed no resources here.
    pub fn register(&self, id: &str, session: Arc<CallSession>) -> Result<(), RegistryError> {
        let mut sessions = self.inner.lock();
        if sessions.contains_key(id) {
            return Err(RegistryError::DuplicateId(id.to_string()));
        }
        if sessions.len() >= self.max_sessions {
            return Err(RegistryError::CapacityExceeded(sessions.len()));
        }
        sessions.insert(id.to_string(), session);
        tracing::info!(stream_id = id, active = sessions.len(), "session registered");
        Ok(())
    }

    /// Look up the session for a stream id.
    pub fn lookup(&self, id: &str) -> Option<Arc<CallSession>> {
        self.inner.lock().get(id).cloned()
    }

    /// Remove a session. Idempotent: removing an absent id is not an error.
    pub fn unregister(&self, id: &str) -> Option<Arc<CallSession>> {
        let removed = self.inner.lock().remove(id);
        if removed.is_some() {
            tracing::info!(stream_id = id, "session unregistered");
        }
        removed
    }

    /// Number of active sessions.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the registry has no active sessions.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Snapshot of every active session for the management surface.
    pub fn statuses(&self) -> Vec<SessionStatus> {
        self.inner.lock().values().map(|s| s.status()).collect()
    }
}
