//! Session store.
//!
//! Single source of truth for session existence, state, ownership and the
//! output log. Every session sits behind its own mutex so different sessions
//! never contend; ownership changes and output forwarding happen under that
//! same mutex, which is what keeps a catch-up payload ahead of live output.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use protocol::{ErrorCode, ProtocolError, ServerEvent, SessionState, SessionSummary};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use uuid::Uuid;

use super::backend::{BackendError, BackendEvent, BackendHandle, ExitStatus, ProcessBackend, SpawnSpec};
use super::binding::{ConnectionHandle, ConnectionId};
use super::journal::{Journal, JournalDir, SessionMeta};
use super::{now_millis, SessionId};

/// Errors that can occur during store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The backend could not be spawned.
    #[error("failed to spawn session: {0}")]
    Spawn(#[source] BackendError),

    /// The backend rejected an operation.
    #[error("session {session_id}: {source}")]
    Backend {
        session_id: SessionId,
        #[source]
        source: BackendError,
    },

    /// Another connection owns the session.
    #[error("session {session_id} is owned by another connection")]
    OwnershipConflict {
        session_id: SessionId,
        owner: ConnectionId,
    },

    /// The caller does not own the session.
    #[error("session {0} is not owned by this connection")]
    NotOwner(SessionId),

    /// The session was not found.
    #[error("session not found: {0}")]
    UnknownSession(SessionId),

    /// The session's process is gone.
    #[error("session {0} is closed")]
    SessionClosed(SessionId),

    /// The identifier is in use or was used before.
    #[error("session id not available: {0}")]
    IdUnavailable(SessionId),

    /// Too many live sessions.
    #[error("session limit of {0} reached")]
    SessionLimit(usize),

    /// The journal was already closed.
    #[error("journal is closed")]
    JournalClosed,

    /// Journal I/O failed.
    #[error("journal I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Session metadata could not be encoded or decoded.
    #[error("session metadata error: {0}")]
    Meta(#[from] serde_json::Error),

    /// A journal frame could not be encoded.
    #[error("journal frame error: {0}")]
    Frame(#[from] ProtocolError),
}

/// Store tuning.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Journal output to disk.
    pub persist: bool,
    /// Buffered bytes that force a journal flush.
    pub flush_threshold: usize,
    /// Maximum live sessions, 0 for no limit.
    pub max_sessions: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            persist: true,
            flush_threshold: 64 * 1024,
            max_sessions: 0,
        }
    }
}

/// Externally visible state of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionView {
    pub state: SessionState,
    pub owner: Option<ConnectionId>,
}

/// What to send to a new owner as part of the ownership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handoff {
    /// Nothing.
    Silent,
    /// `session-created`, then any output produced so far.
    Created,
    /// `session-attached` carrying the whole log.
    Attached,
}

/// Result of closing a live session.
#[derive(Debug)]
pub struct Closed {
    pub previous_owner: Option<ConnectionHandle>,
    pub exit: Option<ExitStatus>,
}

/// Result of terminating a session.
#[derive(Debug)]
pub struct Terminated {
    pub previous_owner: Option<ConnectionHandle>,
    /// The backend was still running.
    pub was_live: bool,
}

/// Copy of a session's log and state.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub state: SessionState,
    pub log: Vec<u8>,
    pub exit: Option<ExitStatus>,
}

struct SessionSlot<H> {
    state: SessionState,
    backend: Option<H>,
    owner: Option<ConnectionHandle>,
    log: BytesMut,
    cols: u16,
    rows: u16,
    journal: Option<Journal>,
    degraded: bool,
    degraded_notified: bool,
    exit: Option<ExitStatus>,
}

impl<H> SessionSlot<H> {
    fn view(&self) -> SessionView {
        SessionView {
            state: self.state,
            owner: self.owner.as_ref().map(|o| o.id().clone()),
        }
    }

    fn owned_by(&self, connection_id: &ConnectionId) -> bool {
        self.owner
            .as_ref()
            .is_some_and(|owner| owner.id() == connection_id)
    }

    /// Tell the owner about journal degradation, once.
    fn notify_degraded(&mut self, session_id: &SessionId) {
        if !self.degraded || self.degraded_notified {
            return;
        }
        if let Some(owner) = &self.owner {
            owner.send(ServerEvent::error(
                ErrorCode::StoreIo,
                "session output is no longer being persisted",
                Some(session_id.clone()),
            ));
            self.degraded_notified = true;
        }
    }
}

/// One session.
pub struct SessionEntry<H> {
    id: SessionId,
    created_at: u64,
    view: watch::Sender<SessionView>,
    slot: Mutex<SessionSlot<H>>,
}

impl<H> SessionEntry<H> {
    fn new(id: SessionId, created_at: u64, slot: SessionSlot<H>) -> Self {
        let (view, _) = watch::channel(slot.view());
        Self {
            id,
            created_at,
            view,
            slot: Mutex::new(slot),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Creation time in milliseconds since the Unix epoch.
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Current state and owner, without waiting on the session lock.
    pub fn view(&self) -> SessionView {
        self.view.borrow().clone()
    }

    /// Watch state and owner changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionView> {
        self.view.subscribe()
    }

    fn publish(&self, slot: &SessionSlot<H>) {
        self.view.send_replace(slot.view());
    }

    fn summary(&self) -> Option<SessionSummary> {
        let view = self.view();
        (view.state != SessionState::Terminated).then(|| SessionSummary {
            session_id: self.id.clone(),
            created_at: self.created_at,
            state: view.state,
        })
    }
}

/// Registry of sessions backed by a process backend and optional journals.
pub struct SessionStore<B: ProcessBackend> {
    backend: Arc<B>,
    sessions: DashMap<SessionId, Arc<SessionEntry<B::Handle>>>,
    /// Ids that were terminated and must never be issued again.
    tombstones: DashSet<SessionId>,
    journals: Option<JournalDir>,
    config: StoreConfig,
    live: AtomicUsize,
}

impl<B: ProcessBackend> SessionStore<B> {
    /// Creates a store. `journals` is ignored unless `config.persist` is set.
    pub fn new(backend: B, journals: Option<JournalDir>, config: StoreConfig) -> Self {
        Self {
            backend: Arc::new(backend),
            sessions: DashMap::new(),
            tombstones: DashSet::new(),
            journals: if config.persist { journals } else { None },
            config,
            live: AtomicUsize::new(0),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Spawns a backend and registers a session with no owner.
    ///
    /// With `requested_id` the session takes that id, provided it was never
    /// issued before. Returns the backend's event stream; the caller must
    /// drain it.
    pub async fn create(
        &self,
        spec: SpawnSpec,
        requested_id: Option<SessionId>,
    ) -> Result<(Arc<SessionEntry<B::Handle>>, mpsc::UnboundedReceiver<BackendEvent>), StoreError> {
        let id = match requested_id {
            Some(id) => {
                if self.is_retired(&id) || self.sessions.contains_key(&id) {
                    return Err(StoreError::IdUnavailable(id));
                }
                id
            }
            None => Uuid::new_v4().to_string(),
        };

        self.reserve()?;

        let backend = Arc::clone(&self.backend);
        let spawn_spec = spec.clone();
        let spawned = tokio::task::spawn_blocking(move || backend.spawn(&spawn_spec)).await;
        let (handle, events) = match spawned {
            Ok(Ok(spawned)) => spawned,
            Ok(Err(e)) => {
                self.release_reservation();
                tracing::error!(session_id = %id, error = %e, "Failed to spawn session");
                return Err(StoreError::Spawn(e));
            }
            Err(e) => {
                self.release_reservation();
                return Err(StoreError::Spawn(BackendError::Spawn(e.to_string())));
            }
        };
        let pid = handle.pid();

        let created_at = now_millis();
        let entry = Arc::new(SessionEntry::new(
            id.clone(),
            created_at,
            SessionSlot {
                state: SessionState::Detached,
                backend: Some(handle),
                owner: None,
                log: BytesMut::new(),
                cols: spec.cols,
                rows: spec.rows,
                journal: None,
                degraded: false,
                degraded_notified: false,
                exit: None,
            },
        ));

        let inserted = match self.sessions.entry(id.clone()) {
            Entry::Vacant(vacant) if !self.is_retired(&id) => {
                vacant.insert(Arc::clone(&entry));
                true
            }
            _ => false,
        };
        if !inserted {
            // Lost a race for a requested id
            if let Some(handle) = entry.slot.lock().await.backend.take() {
                handle.kill();
            }
            self.release_reservation();
            return Err(StoreError::IdUnavailable(id));
        }

        if let Some(journals) = &self.journals {
            let meta = SessionMeta {
                id: id.clone(),
                created_at,
                cols: spec.cols,
                rows: spec.rows,
                shell: spec.shell.clone(),
            };
            let opened = journals.open(&meta, self.config.flush_threshold).await;
            let mut slot = entry.slot.lock().await;
            match opened {
                Ok(journal) => slot.journal = Some(journal),
                Err(e) => {
                    tracing::warn!(session_id = %id, error = %e, "Failed to open journal, session will not be persisted");
                    slot.degraded = true;
                }
            }
        }

        tracing::info!(
            session_id = %id,
            pid = ?pid,
            cols = spec.cols,
            rows = spec.rows,
            "Created new session"
        );

        Ok((entry, events))
    }

    /// Looks up a session. Never mutates.
    pub fn get(&self, id: &str) -> Option<Arc<SessionEntry<B::Handle>>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Whether an id was terminated and may not be used again.
    pub fn is_retired(&self, id: &str) -> bool {
        self.tombstones.contains(id)
    }

    /// Appends output and forwards it to the owner, if any.
    ///
    /// Returns the new log length, or `None` if the session is unknown or
    /// no longer live.
    pub async fn append(&self, id: &str, data: &[u8]) -> Option<usize> {
        let entry = self.get(id)?;
        let mut slot = entry.slot.lock().await;
        if !slot.state.has_backend() {
            return None;
        }

        slot.log.extend_from_slice(data);
        let offset = slot.log.len();

        let needs_flush = slot
            .journal
            .as_mut()
            .is_some_and(|journal| journal.append(data));
        if needs_flush {
            self.flush_slot(&entry.id, &mut slot).await;
        }

        if let Some(owner) = &slot.owner {
            owner.send(ServerEvent::TerminalOutput {
                session_id: entry.id.clone(),
                data: data.to_vec(),
            });
        }

        Some(offset)
    }

    /// Compare-and-set ownership.
    ///
    /// `Some(owner)` succeeds if the session is unowned or already owned by
    /// the same connection, and delivers `handoff` to the new owner before
    /// any later output. `None` clears ownership unconditionally.
    pub async fn set_owner(
        &self,
        id: &str,
        owner: Option<ConnectionHandle>,
        handoff: Handoff,
    ) -> Result<(), StoreError> {
        let entry = self
            .get(id)
            .ok_or_else(|| StoreError::UnknownSession(id.to_string()))?;
        let mut slot = entry.slot.lock().await;
        if !slot.state.has_backend() {
            return Err(StoreError::SessionClosed(entry.id.clone()));
        }

        let Some(owner) = owner else {
            slot.owner = None;
            slot.state = SessionState::Detached;
            entry.publish(&slot);
            return Ok(());
        };

        if let Some(current) = &slot.owner {
            if current.id() != owner.id() {
                return Err(StoreError::OwnershipConflict {
                    session_id: entry.id.clone(),
                    owner: current.id().clone(),
                });
            }
        }

        match handoff {
            Handoff::Silent => {}
            Handoff::Created => {
                owner.send(ServerEvent::SessionCreated {
                    session_id: entry.id.clone(),
                });
                if !slot.log.is_empty() {
                    owner.send(ServerEvent::TerminalOutput {
                        session_id: entry.id.clone(),
                        data: slot.log.to_vec(),
                    });
                }
            }
            Handoff::Attached => {
                owner.send(ServerEvent::SessionAttached {
                    session_id: entry.id.clone(),
                    log: slot.log.to_vec(),
                });
            }
        }

        tracing::debug!(session_id = %entry.id, connection_id = %owner.id(), "Session owner set");
        slot.owner = Some(owner);
        slot.state = SessionState::Active;
        slot.degraded_notified = false;
        slot.notify_degraded(&entry.id);
        entry.publish(&slot);
        Ok(())
    }

    /// Clears ownership if `connection_id` still owns the session.
    pub async fn release(&self, id: &str, connection_id: &ConnectionId) -> bool {
        let Some(entry) = self.get(id) else {
            return false;
        };
        let mut slot = entry.slot.lock().await;
        if !slot.owned_by(connection_id) {
            return false;
        }

        slot.owner = None;
        if slot.state.has_backend() {
            slot.state = SessionState::Detached;
        }
        entry.publish(&slot);
        tracing::debug!(session_id = %entry.id, connection_id = %connection_id, "Session detached");
        true
    }

    /// Writes owner input to the backend.
    pub async fn write_input(
        &self,
        id: &str,
        connection_id: &ConnectionId,
        data: &[u8],
    ) -> Result<(), StoreError> {
        let entry = self
            .get(id)
            .ok_or_else(|| StoreError::UnknownSession(id.to_string()))?;
        let slot = entry.slot.lock().await;
        let backend = Self::owned_backend(&entry.id, &slot, connection_id)?;
        backend.write(data).map_err(|source| StoreError::Backend {
            session_id: entry.id.clone(),
            source,
        })
    }

    /// Resizes the backend's terminal.
    pub async fn resize(
        &self,
        id: &str,
        connection_id: &ConnectionId,
        cols: u16,
        rows: u16,
    ) -> Result<(), StoreError> {
        let entry = self
            .get(id)
            .ok_or_else(|| StoreError::UnknownSession(id.to_string()))?;
        let mut slot = entry.slot.lock().await;
        Self::owned_backend(&entry.id, &slot, connection_id)?
            .resize(cols, rows)
            .map_err(|source| StoreError::Backend {
                session_id: entry.id.clone(),
                source,
            })?;
        slot.cols = cols;
        slot.rows = rows;
        Ok(())
    }

    fn owned_backend<'a>(
        id: &SessionId,
        slot: &'a SessionSlot<B::Handle>,
        connection_id: &ConnectionId,
    ) -> Result<&'a B::Handle, StoreError> {
        if !slot.state.has_backend() {
            return Err(StoreError::SessionClosed(id.clone()));
        }
        if !slot.owned_by(connection_id) {
            return Err(StoreError::NotOwner(id.clone()));
        }
        slot.backend
            .as_ref()
            .ok_or_else(|| StoreError::SessionClosed(id.clone()))
    }

    /// Kills the backend, moves the session to CLOSED and keeps the log.
    ///
    /// Returns `None` if the session is unknown or already closed, so each
    /// session is closed at most once.
    pub async fn close(&self, id: &str, exit: Option<ExitStatus>) -> Option<Closed> {
        let entry = self.get(id)?;
        let mut slot = entry.slot.lock().await;
        if !slot.state.has_backend() {
            return None;
        }

        if let Some(backend) = slot.backend.take() {
            backend.kill();
        }
        self.release_reservation();
        slot.state = SessionState::Closed;
        slot.exit = exit;
        let previous_owner = slot.owner.take();

        if let Some(mut journal) = slot.journal.take() {
            if let Err(e) = journal.close().await {
                tracing::warn!(session_id = %entry.id, error = %e, "Failed to flush journal on close");
            }
        }
        entry.publish(&slot);

        tracing::info!(session_id = %entry.id, exit = ?slot.exit, "Session closed");

        Some(Closed {
            previous_owner,
            exit: slot.exit.clone(),
        })
    }

    /// Closes the session if needed, then deletes its log and record.
    ///
    /// Idempotent: returns `None` when there was nothing to terminate.
    pub async fn terminate(&self, id: &str) -> Option<Terminated> {
        self.terminate_checked(id, None).await.ok().flatten()
    }

    /// Terminates on behalf of a connection, which must own the session
    /// while it is live. A closed session may be deleted by anyone.
    pub async fn terminate_owned(
        &self,
        id: &str,
        connection_id: &ConnectionId,
    ) -> Result<Option<Terminated>, StoreError> {
        self.terminate_checked(id, Some(connection_id)).await
    }

    async fn terminate_checked(
        &self,
        id: &str,
        requester: Option<&ConnectionId>,
    ) -> Result<Option<Terminated>, StoreError> {
        let Some(entry) = self.get(id) else {
            return Ok(None);
        };
        let mut slot = entry.slot.lock().await;
        if slot.state == SessionState::Terminated {
            return Ok(None);
        }
        if let Some(requester) = requester {
            if slot.state.has_backend() && !slot.owned_by(requester) {
                return Err(match &slot.owner {
                    Some(owner) => StoreError::OwnershipConflict {
                        session_id: entry.id.clone(),
                        owner: owner.id().clone(),
                    },
                    None => StoreError::NotOwner(entry.id.clone()),
                });
            }
        }

        let was_live = slot.state.has_backend();
        if let Some(backend) = slot.backend.take() {
            backend.kill();
        }
        if was_live {
            self.release_reservation();
        }
        let previous_owner = slot.owner.take();

        if let Some(mut journal) = slot.journal.take() {
            if let Err(e) = journal.close().await {
                tracing::warn!(session_id = %entry.id, error = %e, "Failed to flush journal before delete");
            }
        }

        slot.state = SessionState::Terminated;
        slot.log = BytesMut::new();
        entry.publish(&slot);

        self.tombstones.insert(entry.id.clone());
        self.sessions.remove(&entry.id);
        drop(slot);

        if let Some(journals) = &self.journals {
            if let Err(e) = journals.purge(&entry.id).await {
                tracing::warn!(session_id = %entry.id, error = %e, "Failed to retire session record");
            }
        }

        tracing::info!(session_id = %entry.id, "Session terminated");

        Ok(Some(Terminated {
            previous_owner,
            was_live,
        }))
    }

    /// Summaries of all non-terminated sessions, optionally only those
    /// owned by one connection.
    ///
    /// Membership is fixed when called; each state is read lazily from the
    /// session's published view, so listing never takes a session lock.
    pub fn list(&self, owner: Option<&ConnectionId>) -> impl Iterator<Item = SessionSummary> {
        let entries: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let owner = owner.cloned();

        entries.into_iter().filter(move |entry| match &owner {
            Some(owner) => entry.view().owner.as_ref() == Some(owner),
            None => true,
        })
        .filter_map(|entry| entry.summary())
    }

    /// Copy of a session's log and state.
    pub async fn snapshot(&self, id: &str) -> Option<Snapshot> {
        let entry = self.get(id)?;
        let slot = entry.slot.lock().await;
        Some(Snapshot {
            state: slot.state,
            log: slot.log.to_vec(),
            exit: slot.exit.clone(),
        })
    }

    /// Number of sessions with a running backend.
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Number of known sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Load persisted sessions as CLOSED entries.
    pub async fn recover(&self) -> Result<usize, StoreError> {
        let Some(journals) = &self.journals else {
            return Ok(0);
        };

        for id in journals.retired().await? {
            self.tombstones.insert(id);
        }

        let mut count = 0;
        for record in journals.load_all().await? {
            if self.sessions.contains_key(&record.id) || self.is_retired(&record.id) {
                continue;
            }
            let entry = Arc::new(SessionEntry::new(
                record.id.clone(),
                record.created_at,
                SessionSlot {
                    state: SessionState::Closed,
                    backend: None,
                    owner: None,
                    log: BytesMut::from(record.log.as_slice()),
                    cols: 0,
                    rows: 0,
                    journal: None,
                    degraded: false,
                    degraded_notified: false,
                    exit: None,
                },
            ));
            tracing::debug!(session_id = %record.id, bytes = record.log.len(), "Recovered session");
            self.sessions.insert(record.id, entry);
            count += 1;
        }

        tracing::info!(count, "Recovered persisted sessions");
        Ok(count)
    }

    /// Flush every buffered journal.
    pub async fn flush_all(&self) {
        let entries: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for entry in entries {
            let mut slot = entry.slot.lock().await;
            self.flush_slot(&entry.id, &mut slot).await;
        }
    }

    /// Close every live session. Returns how many were closed.
    pub async fn close_all(&self) -> usize {
        let ids: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        let mut closed = 0;
        for id in ids {
            if self.close(&id, None).await.is_some() {
                closed += 1;
            }
        }
        closed
    }

    async fn flush_slot(&self, id: &SessionId, slot: &mut SessionSlot<B::Handle>) {
        let Some(journal) = slot.journal.as_mut() else {
            return;
        };

        match journal.flush().await {
            Ok(()) => {
                if slot.degraded {
                    tracing::info!(session_id = %id, "Journal writes recovered");
                    slot.degraded = false;
                    slot.degraded_notified = false;
                }
            }
            Err(e) => {
                if !slot.degraded {
                    tracing::warn!(session_id = %id, error = %e, "Journal write failed, session is degraded");
                    slot.degraded = true;
                }
                slot.notify_degraded(id);
            }
        }
    }

    fn reserve(&self) -> Result<(), StoreError> {
        let max = self.config.max_sessions;
        let previous = self.live.fetch_add(1, Ordering::SeqCst);
        if max > 0 && previous >= max {
            self.live.fetch_sub(1, Ordering::SeqCst);
            return Err(StoreError::SessionLimit(max));
        }
        Ok(())
    }

    fn release_reservation(&self) {
        let _ = self
            .live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::scripted::ScriptedBackend;
    use tempfile::TempDir;

    fn store() -> SessionStore<ScriptedBackend> {
        SessionStore::new(ScriptedBackend::new(), None, StoreConfig::default())
    }

    fn spec() -> SpawnSpec {
        SpawnSpec::new("/bin/sh", 80, 30)
    }

    fn conn(id: &str) -> (ConnectionHandle, mpsc::Receiver<ServerEvent>) {
        ConnectionHandle::new(id.to_string())
    }

    #[tokio::test]
    async fn test_create_registers_detached_session() {
        let store = store();
        let (entry, _events) = store.create(spec(), None).await.unwrap();

        assert!(Uuid::parse_str(entry.id()).is_ok());
        assert_eq!(entry.view().state, SessionState::Detached);
        assert_eq!(store.live_count(), 1);
        assert!(store.get(entry.id()).is_some());
    }

    #[tokio::test]
    async fn test_create_spawn_failure() {
        let store = store();
        store.backend().fail_next_spawn();

        let result = store.create(spec(), None).await;
        assert!(matches!(result, Err(StoreError::Spawn(_))));
        assert!(store.is_empty());
        assert_eq!(store.live_count(), 0);
    }

    #[tokio::test]
    async fn test_session_limit() {
        let config = StoreConfig {
            max_sessions: 1,
            ..StoreConfig::default()
        };
        let store = SessionStore::new(ScriptedBackend::new(), None, config);

        let (entry, _events) = store.create(spec(), None).await.unwrap();
        assert!(matches!(
            store.create(spec(), None).await,
            Err(StoreError::SessionLimit(1))
        ));

        store.close(entry.id(), None).await.unwrap();
        assert!(store.create(spec(), None).await.is_ok());
    }

    #[tokio::test]
    async fn test_append_unknown_is_noop() {
        let store = store();
        assert_eq!(store.append("missing", b"data").await, None);
    }

    #[tokio::test]
    async fn test_append_returns_offsets_and_forwards() {
        let store = store();
        let (entry, _events) = store.create(spec(), None).await.unwrap();
        let (owner, mut rx) = conn("c1");
        store
            .set_owner(entry.id(), Some(owner), Handoff::Silent)
            .await
            .unwrap();

        assert_eq!(store.append(entry.id(), b"abc").await, Some(3));
        assert_eq!(store.append(entry.id(), b"de").await, Some(5));

        assert_eq!(
            rx.recv().await,
            Some(ServerEvent::TerminalOutput {
                session_id: entry.id().clone(),
                data: b"abc".to_vec()
            })
        );
        let snapshot = store.snapshot(entry.id()).await.unwrap();
        assert_eq!(snapshot.log, b"abcde");
    }

    #[tokio::test]
    async fn test_set_owner_conflict_keeps_prior_owner() {
        let store = store();
        let (entry, _events) = store.create(spec(), None).await.unwrap();
        let (first, _rx1) = conn("first");
        let (second, _rx2) = conn("second");

        store
            .set_owner(entry.id(), Some(first), Handoff::Silent)
            .await
            .unwrap();
        let result = store
            .set_owner(entry.id(), Some(second), Handoff::Attached)
            .await;

        assert!(matches!(
            result,
            Err(StoreError::OwnershipConflict { ref owner, .. }) if owner == "first"
        ));
        assert_eq!(entry.view().owner.as_deref(), Some("first"));
        assert_eq!(entry.view().state, SessionState::Active);
    }

    #[tokio::test]
    async fn test_set_owner_same_connection_is_allowed() {
        let store = store();
        let (entry, _events) = store.create(spec(), None).await.unwrap();
        let (owner, mut rx) = conn("c1");

        store
            .set_owner(entry.id(), Some(owner.clone()), Handoff::Silent)
            .await
            .unwrap();
        store.append(entry.id(), b"log").await;
        let _ = rx.recv().await;

        store
            .set_owner(entry.id(), Some(owner), Handoff::Attached)
            .await
            .unwrap();
        assert_eq!(
            rx.recv().await,
            Some(ServerEvent::SessionAttached {
                session_id: entry.id().clone(),
                log: b"log".to_vec()
            })
        );
    }

    #[tokio::test]
    async fn test_created_handoff_flushes_early_output() {
        let store = store();
        let (entry, _events) = store.create(spec(), None).await.unwrap();
        store.append(entry.id(), b"$ ").await;

        let (owner, mut rx) = conn("c1");
        store
            .set_owner(entry.id(), Some(owner), Handoff::Created)
            .await
            .unwrap();

        assert!(matches!(rx.recv().await, Some(ServerEvent::SessionCreated { .. })));
        assert!(matches!(
            rx.recv().await,
            Some(ServerEvent::TerminalOutput { data, .. }) if data == b"$ "
        ));
    }

    #[tokio::test]
    async fn test_set_owner_none_detaches() {
        let store = store();
        let (entry, _events) = store.create(spec(), None).await.unwrap();
        let (owner, _rx) = conn("c1");
        store
            .set_owner(entry.id(), Some(owner), Handoff::Silent)
            .await
            .unwrap();

        store
            .set_owner(entry.id(), None, Handoff::Silent)
            .await
            .unwrap();
        assert_eq!(
            entry.view(),
            SessionView {
                state: SessionState::Detached,
                owner: None
            }
        );
    }

    #[tokio::test]
    async fn test_release_only_by_owner() {
        let store = store();
        let (entry, _events) = store.create(spec(), None).await.unwrap();
        let (owner, _rx) = conn("c1");
        store
            .set_owner(entry.id(), Some(owner), Handoff::Silent)
            .await
            .unwrap();

        assert!(!store.release(entry.id(), &"c2".to_string()).await);
        assert!(store.release(entry.id(), &"c1".to_string()).await);
        assert_eq!(entry.view().state, SessionState::Detached);
    }

    #[tokio::test]
    async fn test_write_input_requires_owner() {
        let store = store();
        let (entry, _events) = store.create(spec(), None).await.unwrap();
        let (owner, _rx) = conn("c1");
        store
            .set_owner(entry.id(), Some(owner), Handoff::Silent)
            .await
            .unwrap();

        store
            .write_input(entry.id(), &"c1".to_string(), b"ls\n")
            .await
            .unwrap();
        assert!(matches!(
            store.write_input(entry.id(), &"c2".to_string(), b"rm\n").await,
            Err(StoreError::NotOwner(_))
        ));
        assert_eq!(store.backend().last().input(), b"ls\n");
    }

    #[tokio::test]
    async fn test_write_to_dead_backend() {
        let store = store();
        let (entry, _events) = store.create(spec(), None).await.unwrap();
        let (owner, _rx) = conn("c1");
        store
            .set_owner(entry.id(), Some(owner), Handoff::Silent)
            .await
            .unwrap();

        store.backend().last().crash_silently();
        assert!(matches!(
            store.write_input(entry.id(), &"c1".to_string(), b"ls\n").await,
            Err(StoreError::Backend {
                source: BackendError::Closed,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_resize_updates_backend() {
        let store = store();
        let (entry, _events) = store.create(spec(), None).await.unwrap();
        let (owner, _rx) = conn("c1");
        store
            .set_owner(entry.id(), Some(owner), Handoff::Silent)
            .await
            .unwrap();

        store
            .resize(entry.id(), &"c1".to_string(), 120, 40)
            .await
            .unwrap();
        assert_eq!(store.backend().last().size(), (120, 40));
    }

    #[tokio::test]
    async fn test_close_retains_log_and_freezes_it() {
        let store = store();
        let (entry, _events) = store.create(spec(), None).await.unwrap();
        let (owner, _rx) = conn("c1");
        store
            .set_owner(entry.id(), Some(owner), Handoff::Silent)
            .await
            .unwrap();
        store.append(entry.id(), b"kept").await;

        let closed = store
            .close(entry.id(), Some(ExitStatus::with_code(0)))
            .await
            .unwrap();
        assert_eq!(closed.previous_owner.unwrap().id(), "c1");
        assert_eq!(closed.exit, Some(ExitStatus::with_code(0)));
        assert_eq!(store.backend().last().kill_count(), 1);

        assert_eq!(
            entry.view(),
            SessionView {
                state: SessionState::Closed,
                owner: None
            }
        );
        assert_eq!(store.append(entry.id(), b"late").await, None);
        assert_eq!(store.snapshot(entry.id()).await.unwrap().log, b"kept");
        assert_eq!(store.live_count(), 0);

        // Second close is a no-op
        assert!(store.close(entry.id(), None).await.is_none());
    }

    #[tokio::test]
    async fn test_closed_session_cannot_be_owned() {
        let store = store();
        let (entry, _events) = store.create(spec(), None).await.unwrap();
        store.close(entry.id(), None).await.unwrap();

        let (owner, _rx) = conn("c1");
        assert!(matches!(
            store.set_owner(entry.id(), Some(owner), Handoff::Attached).await,
            Err(StoreError::SessionClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent_and_retires_id() {
        let store = store();
        let (entry, _events) = store.create(spec(), None).await.unwrap();
        let id = entry.id().clone();

        let terminated = store.terminate(&id).await.unwrap();
        assert!(terminated.was_live);
        assert!(store.terminate(&id).await.is_none());

        assert!(store.get(&id).is_none());
        assert!(store.is_retired(&id));
        assert_eq!(store.list(None).count(), 0);
        assert_eq!(entry.view().state, SessionState::Terminated);

        assert!(matches!(
            store.create(spec(), Some(id)).await,
            Err(StoreError::IdUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_terminate_owned_checks_owner_while_live() {
        let store = store();
        let (entry, _events) = store.create(spec(), None).await.unwrap();
        let (owner, _rx) = conn("c1");
        store
            .set_owner(entry.id(), Some(owner), Handoff::Silent)
            .await
            .unwrap();

        assert!(matches!(
            store.terminate_owned(entry.id(), &"c2".to_string()).await,
            Err(StoreError::OwnershipConflict { .. })
        ));
        assert_eq!(entry.view().state, SessionState::Active);

        // Once closed, any connection may delete it
        store.close(entry.id(), None).await.unwrap();
        let terminated = store
            .terminate_owned(entry.id(), &"c2".to_string())
            .await
            .unwrap()
            .unwrap();
        assert!(!terminated.was_live);
        assert!(terminated.previous_owner.is_none());
    }

    #[tokio::test]
    async fn test_create_with_requested_id() {
        let store = store();
        let id = Uuid::new_v4().to_string();

        let (entry, _events) = store.create(spec(), Some(id.clone())).await.unwrap();
        assert_eq!(entry.id(), &id);
        assert!(matches!(
            store.create(spec(), Some(id)).await,
            Err(StoreError::IdUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_list_with_owner_filter() {
        let store = store();
        let (a, _ea) = store.create(spec(), None).await.unwrap();
        let (b, _eb) = store.create(spec(), None).await.unwrap();
        let (c, _ec) = store.create(spec(), None).await.unwrap();
        let (owner, _rx) = conn("c1");
        store
            .set_owner(a.id(), Some(owner), Handoff::Silent)
            .await
            .unwrap();
        store.close(c.id(), None).await;

        let mut all: Vec<_> = store.list(None).collect();
        all.sort_by(|x, y| x.session_id.cmp(&y.session_id));
        assert_eq!(all.len(), 3);

        let owned: Vec<_> = store.list(Some(&"c1".to_string())).collect();
        assert_eq!(owned.len(), 1);
        assert_eq!(&owned[0].session_id, a.id());
        assert_eq!(owned[0].state, SessionState::Active);

        let b_state = all
            .iter()
            .find(|s| &s.session_id == b.id())
            .map(|s| s.state);
        assert_eq!(b_state, Some(SessionState::Detached));
    }

    #[tokio::test]
    async fn test_persisted_log_survives_restart() {
        let dir = TempDir::new().unwrap();
        let id;
        {
            let store = SessionStore::new(
                ScriptedBackend::new(),
                Some(JournalDir::new(dir.path())),
                StoreConfig::default(),
            );
            let (entry, _events) = store.create(spec(), None).await.unwrap();
            id = entry.id().clone();
            store.append(&id, b"before restart").await;
            store.close_all().await;
        }

        let store = SessionStore::new(
            ScriptedBackend::new(),
            Some(JournalDir::new(dir.path())),
            StoreConfig::default(),
        );
        assert_eq!(store.recover().await.unwrap(), 1);

        let snapshot = store.snapshot(&id).await.unwrap();
        assert_eq!(snapshot.state, SessionState::Closed);
        assert_eq!(snapshot.log, b"before restart");
    }

    #[tokio::test]
    async fn test_terminated_id_stays_retired_after_restart() {
        let dir = TempDir::new().unwrap();
        let id = Uuid::new_v4().to_string();
        {
            let store = SessionStore::new(
                ScriptedBackend::new(),
                Some(JournalDir::new(dir.path())),
                StoreConfig::default(),
            );
            store.create(spec(), Some(id.clone())).await.unwrap();
            store.terminate(&id).await.unwrap();
        }

        let store = SessionStore::new(
            ScriptedBackend::new(),
            Some(JournalDir::new(dir.path())),
            StoreConfig::default(),
        );
        assert_eq!(store.recover().await.unwrap(), 0);
        assert!(store.is_retired(&id));
        assert!(matches!(
            store.create(spec(), Some(id)).await,
            Err(StoreError::IdUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_threshold_flush_and_terminate_deletes_record() {
        let dir = TempDir::new().unwrap();
        let journals = JournalDir::new(dir.path());
        let config = StoreConfig {
            flush_threshold: 4,
            ..StoreConfig::default()
        };
        let store = SessionStore::new(ScriptedBackend::new(), Some(journals.clone()), config);
        let (entry, _events) = store.create(spec(), None).await.unwrap();

        store.append(entry.id(), b"12345").await;
        let on_disk = journals.load(entry.id()).await.unwrap();
        assert_eq!(on_disk.log, b"12345");

        store.terminate(entry.id()).await.unwrap();
        assert!(!journals.log_path(entry.id()).exists());
        assert!(!journals.meta_path(entry.id()).exists());
    }

    #[tokio::test]
    async fn test_flush_all_writes_buffered_output() {
        let dir = TempDir::new().unwrap();
        let journals = JournalDir::new(dir.path());
        let store = SessionStore::new(
            ScriptedBackend::new(),
            Some(journals.clone()),
            StoreConfig::default(),
        );
        let (entry, _events) = store.create(spec(), None).await.unwrap();
        store.append(entry.id(), b"buffered").await;

        assert!(journals.load(entry.id()).await.unwrap().log.is_empty());
        store.flush_all().await;
        assert_eq!(journals.load(entry.id()).await.unwrap().log, b"buffered");
    }

    #[tokio::test]
    async fn test_persist_disabled_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig {
            persist: false,
            ..StoreConfig::default()
        };
        let store = SessionStore::new(
            ScriptedBackend::new(),
            Some(JournalDir::new(dir.path())),
            config,
        );
        let (entry, _events) = store.create(spec(), None).await.unwrap();
        store.append(entry.id(), b"x").await;
        store.close_all().await;

        assert!(!dir.path().join("sessions").exists());
        assert_eq!(store.recover().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_journal_failure_degrades_once() {
        let dir = TempDir::new().unwrap();
        // A regular file where the sessions directory should be
        std::fs::write(dir.path().join("sessions"), b"").unwrap();
        let store = SessionStore::new(
            ScriptedBackend::new(),
            Some(JournalDir::new(dir.path())),
            StoreConfig::default(),
        );

        let (entry, _events) = store.create(spec(), None).await.unwrap();
        let (owner, mut rx) = conn("c1");
        store
            .set_owner(entry.id(), Some(owner), Handoff::Created)
            .await
            .unwrap();

        assert!(matches!(rx.recv().await, Some(ServerEvent::SessionCreated { .. })));
        match rx.recv().await {
            Some(ServerEvent::Error(err)) => assert_eq!(err.code, ErrorCode::StoreIo),
            other => panic!("expected store-io error, got {other:?}"),
        }

        // Session still works in memory
        assert_eq!(store.append(entry.id(), b"still here").await, Some(10));
        assert!(matches!(rx.recv().await, Some(ServerEvent::TerminalOutput { .. })));
        assert!(rx.try_recv().is_err());
    }
}
