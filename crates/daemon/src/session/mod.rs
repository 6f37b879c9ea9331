//! Session management module.
//!
//! Process backends, the session store with its durable journal, and the
//! binding between sessions and client connections.

pub mod backend;
pub mod binding;
pub mod journal;
pub mod store;

#[cfg(test)]
pub(crate) mod scripted;

use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

pub use backend::{
    detect_shell, BackendError, BackendEvent, BackendHandle, ExitStatus, ProcessBackend,
    PtyBackend, PtyHandle, SpawnSpec,
};
pub use binding::{ConnectionHandle, ConnectionId, ConnectionRegistry, ConnectionStats};
pub use journal::{JournalDir, RecordInfo, SessionMeta};
pub use store::{Handoff, SessionStore, SessionView, StoreConfig, StoreError};

/// Unique identifier for a session.
pub type SessionId = String;

/// Canonical form of a client-supplied session id, if it is a UUID.
pub fn parse_session_id(raw: &str) -> Option<SessionId> {
    Uuid::parse_str(raw).ok().map(|uuid| uuid.to_string())
}

/// Returns the current Unix timestamp in milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
