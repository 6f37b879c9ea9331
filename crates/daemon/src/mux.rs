//! Session multiplexer.
//!
//! This module provides the `Multiplexer`, the protocol state machine that
//! receives client events from the gateway and drives the session store:
//! creating sessions, routing input and output, handing sessions over on
//! reattach, and cleaning up when a connection goes away.

use std::path::PathBuf;
use std::sync::Arc;

use protocol::{ClientEvent, ErrorCode, ServerEvent, SessionClosed, SessionSummary};
use tokio::sync::mpsc;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::config::{Config, DisconnectPolicy, ExitPolicy};
use crate::gate::{AuthorizationGate, ConnectionContext};
use crate::session::{
    parse_session_id, BackendError, BackendEvent, ConnectionHandle, ConnectionId,
    ConnectionRegistry, ExitStatus, Handoff, ProcessBackend, SessionId, SessionStore, SpawnSpec,
    StoreError,
};

/// Errors reported to the requesting connection.
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    /// Store or backend failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The request is malformed or not allowed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The connection was refused by the authorization gate.
    #[error("connection not permitted")]
    Unauthorized,
}

impl MuxError {
    /// Stable wire code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            MuxError::Store(e) => match e {
                StoreError::Spawn(_) => ErrorCode::SpawnError,
                StoreError::Backend { source, .. } => match source {
                    BackendError::Closed | BackendError::Io(_) => ErrorCode::BackendClosed,
                    BackendError::Resize(_) | BackendError::Spawn(_) => ErrorCode::InvalidRequest,
                },
                StoreError::OwnershipConflict { .. } | StoreError::NotOwner(_) => {
                    ErrorCode::OwnershipConflict
                }
                StoreError::UnknownSession(_) | StoreError::IdUnavailable(_) => {
                    ErrorCode::UnknownSession
                }
                StoreError::SessionClosed(_) => ErrorCode::BackendClosed,
                StoreError::SessionLimit(_) => ErrorCode::SessionLimit,
                StoreError::JournalClosed
                | StoreError::Io(_)
                | StoreError::Meta(_)
                | StoreError::Frame(_) => ErrorCode::StoreIo,
            },
            MuxError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            MuxError::Unauthorized => ErrorCode::Unauthorized,
        }
    }

    /// Convert the error to an `error` event.
    pub fn to_server_event(&self, session_id: Option<String>) -> ServerEvent {
        ServerEvent::error(self.code(), self.to_string(), session_id)
    }
}

/// Settings the multiplexer applies to every session.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    pub shell: String,
    pub shell_args: Vec<String>,
    pub cols: u16,
    pub rows: u16,
    pub cwd: Option<PathBuf>,
    pub term: String,
    pub disconnect_policy: DisconnectPolicy,
    pub on_exit: ExitPolicy,
    pub allow_client_ids: bool,
    /// Outbound queue length per connection.
    pub outbound_queue: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            shell: "/bin/sh".to_string(),
            shell_args: Vec::new(),
            cols: 80,
            rows: 30,
            cwd: None,
            term: "xterm-color".to_string(),
            disconnect_policy: DisconnectPolicy::Detach,
            on_exit: ExitPolicy::Retain,
            allow_client_ids: false,
            outbound_queue: crate::session::binding::DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl From<&Config> for MuxConfig {
    fn from(config: &Config) -> Self {
        Self {
            shell: config.session.default_shell.clone(),
            shell_args: config.session.shell_args.clone(),
            cols: config.session.default_cols,
            rows: config.session.default_rows,
            cwd: config.session_cwd(),
            term: config.session.term.clone(),
            disconnect_policy: config.session.disconnect_policy,
            on_exit: config.session.on_exit,
            allow_client_ids: config.session.allow_client_ids,
            outbound_queue: config.network.outbound_queue,
        }
    }
}

impl MuxConfig {
    fn spawn_spec(&self, cols: u16, rows: u16) -> SpawnSpec {
        let mut spec = SpawnSpec::new(self.shell.clone(), cols, rows);
        spec.args = self.shell_args.clone();
        spec.cwd = self.cwd.clone();
        spec.env.push(("TERM".to_string(), self.term.clone()));
        spec
    }
}

/// Protocol state machine tying connections to sessions.
pub struct Multiplexer<B: ProcessBackend> {
    store: Arc<SessionStore<B>>,
    connections: Arc<ConnectionRegistry>,
    gate: Arc<dyn AuthorizationGate>,
    config: MuxConfig,
}

impl<B: ProcessBackend> Multiplexer<B> {
    pub fn new(
        store: Arc<SessionStore<B>>,
        gate: Arc<dyn AuthorizationGate>,
        config: MuxConfig,
    ) -> Self {
        Self {
            store,
            connections: Arc::new(ConnectionRegistry::new()),
            gate,
            config,
        }
    }

    pub fn store(&self) -> &Arc<SessionStore<B>> {
        &self.store
    }

    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    /// Admit a new connection.
    ///
    /// Consults the authorization gate once. On success the connection is
    /// registered and the receiver of its outbound queue is returned.
    pub fn connect(
        &self,
        ctx: &ConnectionContext,
    ) -> Result<(ConnectionHandle, mpsc::Receiver<ServerEvent>), MuxError> {
        if !self.gate.allowed(ctx) {
            warn!(remote_addr = ?ctx.remote_addr, origin = ?ctx.origin, "Connection refused by authorization gate");
            return Err(MuxError::Unauthorized);
        }

        let id = Uuid::new_v4().to_string();
        let (handle, rx) = ConnectionHandle::with_capacity(id.clone(), self.config.outbound_queue);
        self.connections.register(handle.clone());
        info!(connection_id = %id, remote_addr = ?ctx.remote_addr, "Client connected");
        Ok((handle, rx))
    }

    /// Handle one client event. Failures are reported to the connection as
    /// `error` events.
    pub async fn dispatch(&self, conn: &ConnectionHandle, event: ClientEvent) {
        debug!(connection_id = %conn.id(), kind = event.kind(), "Dispatching event");
        let session_id = event.session_id().map(str::to_string);

        let result = match event {
            ClientEvent::CreateSession { cols, rows } => {
                self.create_session(conn, cols, rows).await
            }
            ClientEvent::AttachSession { session_id } => self.attach(conn, &session_id).await,
            ClientEvent::TerminalInput { session_id, data } => {
                self.input(conn, &session_id, &data).await
            }
            ClientEvent::ResizeTerminal {
                session_id,
                cols,
                rows,
            } => self.resize(conn, &session_id, cols, rows).await,
            ClientEvent::CloseSession { session_id } => {
                self.close_session(conn, &session_id).await
            }
            ClientEvent::GetSessions { all } => {
                self.list_sessions(conn, !all);
                Ok(())
            }
            ClientEvent::Ping { timestamp } => {
                conn.send(ServerEvent::Pong { timestamp });
                Ok(())
            }
        };

        if let Err(e) = result {
            debug!(connection_id = %conn.id(), session_id = ?session_id, error = %e, "Request failed");
            conn.send(e.to_server_event(session_id));
        }
    }

    /// Spawn a session owned by `conn`.
    pub async fn create_session(
        &self,
        conn: &ConnectionHandle,
        cols: Option<u16>,
        rows: Option<u16>,
    ) -> Result<(), MuxError> {
        let cols = cols.unwrap_or(self.config.cols);
        let rows = rows.unwrap_or(self.config.rows);
        if cols == 0 || rows == 0 {
            return Err(MuxError::InvalidRequest(format!(
                "terminal size must be at least 1x1, got {cols}x{rows}"
            )));
        }

        self.spawn_owned(conn, self.config.spawn_spec(cols, rows), None, Handoff::Created)
            .await
    }

    /// Take ownership of a session and receive its log.
    pub async fn attach(&self, conn: &ConnectionHandle, raw_id: &str) -> Result<(), MuxError> {
        let session_id = parse_session_id(raw_id)
            .ok_or_else(|| StoreError::UnknownSession(raw_id.to_string()))?;

        if self.store.get(&session_id).is_none() {
            if self.config.allow_client_ids && !self.store.is_retired(&session_id) {
                info!(connection_id = %conn.id(), session_id = %session_id, "Creating session for client-supplied id");
                let spec = self.config.spawn_spec(self.config.cols, self.config.rows);
                return self
                    .spawn_owned(conn, spec, Some(session_id), Handoff::Attached)
                    .await;
            }
            return Err(StoreError::UnknownSession(session_id).into());
        }

        match self
            .store
            .set_owner(&session_id, Some(conn.clone()), Handoff::Attached)
            .await
        {
            Ok(()) => {
                info!(connection_id = %conn.id(), session_id = %session_id, "Session attached");
                self.bind_or_abandon(conn.id(), &session_id).await;
                Ok(())
            }
            Err(StoreError::SessionClosed(_)) => {
                // Read-only replay of a finished session
                let snapshot = self
                    .store
                    .snapshot(&session_id)
                    .await
                    .ok_or_else(|| StoreError::UnknownSession(session_id.clone()))?;
                conn.send(ServerEvent::SessionAttached {
                    session_id: session_id.clone(),
                    log: snapshot.log,
                });
                conn.send(session_closed(
                    &session_id,
                    snapshot.exit.as_ref(),
                    "session is closed",
                ));
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Forward keystrokes to a session owned by `conn`.
    pub async fn input(
        &self,
        conn: &ConnectionHandle,
        raw_id: &str,
        data: &[u8],
    ) -> Result<(), MuxError> {
        let session_id = parse_session_id(raw_id)
            .ok_or_else(|| StoreError::UnknownSession(raw_id.to_string()))?;

        match self.store.write_input(&session_id, conn.id(), data).await {
            Err(StoreError::Backend {
                source: BackendError::Closed,
                ..
            }) => {
                // The exit notification has not arrived yet
                debug!(session_id = %session_id, "Write to exited backend, closing session");
                finish_session(
                    &self.store,
                    &self.connections,
                    self.config.on_exit,
                    &session_id,
                    None,
                    "process is no longer running",
                )
                .await;
                Ok(())
            }
            other => other.map_err(MuxError::from),
        }
    }

    /// Resize a session owned by `conn`.
    pub async fn resize(
        &self,
        conn: &ConnectionHandle,
        raw_id: &str,
        cols: u16,
        rows: u16,
    ) -> Result<(), MuxError> {
        if cols == 0 || rows == 0 {
            return Err(MuxError::InvalidRequest(format!(
                "terminal size must be at least 1x1, got {cols}x{rows}"
            )));
        }
        let session_id = parse_session_id(raw_id)
            .ok_or_else(|| StoreError::UnknownSession(raw_id.to_string()))?;

        debug!(session_id = %session_id, cols, rows, "Resizing session");
        self.store
            .resize(&session_id, conn.id(), cols, rows)
            .await
            .map_err(MuxError::from)
    }

    /// Kill a session and delete its log.
    ///
    /// A live session must be owned by `conn`; a closed one may be deleted
    /// by any connection. Closing an already deleted session is ignored.
    pub async fn close_session(
        &self,
        conn: &ConnectionHandle,
        raw_id: &str,
    ) -> Result<(), MuxError> {
        let session_id = parse_session_id(raw_id)
            .ok_or_else(|| StoreError::UnknownSession(raw_id.to_string()))?;

        match self.store.terminate_owned(&session_id, conn.id()).await? {
            Some(terminated) => {
                self.connections.unbind(conn.id(), &session_id);
                info!(
                    connection_id = %conn.id(),
                    session_id = %session_id,
                    was_live = terminated.was_live,
                    "Session closed by request"
                );
                conn.send(session_closed(&session_id, None, "session closed by request"));
                Ok(())
            }
            None if self.store.is_retired(&session_id) => {
                debug!(session_id = %session_id, "Ignoring close of deleted session");
                Ok(())
            }
            None => Err(StoreError::UnknownSession(session_id).into()),
        }
    }

    /// Reply with the current session list.
    pub fn list_sessions(&self, conn: &ConnectionHandle, owned_only: bool) {
        let sessions = self.summaries(owned_only.then(|| conn.id()));
        conn.send(ServerEvent::SessionsList { sessions });
    }

    /// Summaries of all sessions, oldest first.
    pub fn summaries(&self, owner: Option<&ConnectionId>) -> Vec<SessionSummary> {
        let mut sessions: Vec<_> = self.store.list(owner).collect();
        sessions.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        sessions
    }

    /// Tear down a connection.
    ///
    /// Releases or kills every session it owned, per the disconnect policy.
    /// Returns the number of sessions affected, or `None` if the connection
    /// was already gone.
    pub async fn disconnect(&self, connection_id: &ConnectionId) -> Option<usize> {
        let (handle, sessions) = self.connections.unregister(connection_id)?;
        handle.cancel_token().cancel();

        let mut affected = 0;
        for session_id in &sessions {
            if self.abandon(connection_id, session_id).await {
                affected += 1;
            }
        }

        info!(
            connection_id = %connection_id,
            sessions = affected,
            policy = ?self.config.disconnect_policy,
            "Client disconnected"
        );
        Some(affected)
    }

    /// Disconnect every client and close every live session.
    pub async fn shutdown(&self) -> usize {
        self.connections.cancel_all();
        self.store.close_all().await
    }

    async fn spawn_owned(
        &self,
        conn: &ConnectionHandle,
        spec: SpawnSpec,
        requested_id: Option<SessionId>,
        handoff: Handoff,
    ) -> Result<(), MuxError> {
        let (entry, events) = self.store.create(spec, requested_id).await?;
        let session_id = entry.id().clone();

        let owned = self
            .store
            .set_owner(&session_id, Some(conn.clone()), handoff)
            .await;

        // Output produced so far waits in the channel until the pump runs,
        // which keeps it behind the handoff
        self.spawn_pump(session_id.clone(), events);

        owned?;
        self.bind_or_abandon(conn.id(), &session_id).await;
        Ok(())
    }

    /// Record ownership in the registry. If the connection disconnected in
    /// the meantime, treat the session as abandoned by it.
    async fn bind_or_abandon(&self, connection_id: &ConnectionId, session_id: &SessionId) {
        if !self.connections.bind(connection_id, session_id) {
            debug!(connection_id = %connection_id, session_id = %session_id, "Connection gone before bind");
            self.abandon(connection_id, session_id).await;
        }
    }

    async fn abandon(&self, connection_id: &ConnectionId, session_id: &SessionId) -> bool {
        match self.config.disconnect_policy {
            DisconnectPolicy::Detach => self.store.release(session_id, connection_id).await,
            DisconnectPolicy::Kill => {
                match self.store.terminate_owned(session_id, connection_id).await {
                    Ok(Some(_)) => true,
                    Ok(None) => false,
                    Err(e) => {
                        debug!(session_id = %session_id, error = %e, "Session no longer owned, leaving it");
                        false
                    }
                }
            }
        }
    }

    fn spawn_pump(&self, session_id: SessionId, events: mpsc::UnboundedReceiver<BackendEvent>) {
        let span = tracing::info_span!("session", session_id = %session_id);
        tokio::spawn(
            pump_output(
                Arc::clone(&self.store),
                Arc::clone(&self.connections),
                self.config.on_exit,
                session_id,
                events,
            )
            .instrument(span),
        );
    }
}

/// Drain one backend: append every chunk, then close the session once the
/// process exits.
async fn pump_output<B: ProcessBackend>(
    store: Arc<SessionStore<B>>,
    connections: Arc<ConnectionRegistry>,
    on_exit: ExitPolicy,
    session_id: SessionId,
    mut events: mpsc::UnboundedReceiver<BackendEvent>,
) {
    let mut exit = None;
    while let Some(event) = events.recv().await {
        match event {
            BackendEvent::Data(data) => {
                if store.append(&session_id, &data).await.is_none() {
                    debug!("Dropping output for session that is no longer live");
                }
            }
            BackendEvent::Exit(status) => {
                exit = Some(status);
                break;
            }
        }
    }

    debug!(exit = ?exit, "Backend finished");
    finish_session(&store, &connections, on_exit, &session_id, exit, "process exited").await;
}

/// Move a session to CLOSED and tell its owner, once.
async fn finish_session<B: ProcessBackend>(
    store: &SessionStore<B>,
    connections: &ConnectionRegistry,
    on_exit: ExitPolicy,
    session_id: &SessionId,
    exit: Option<ExitStatus>,
    reason: &str,
) {
    let Some(closed) = store.close(session_id, exit).await else {
        return;
    };

    if let Some(owner) = closed.previous_owner {
        connections.unbind(owner.id(), session_id);
        owner.send(session_closed(session_id, closed.exit.as_ref(), reason));
    }

    if on_exit == ExitPolicy::Discard {
        store.terminate(session_id).await;
    }
}

fn session_closed(session_id: &SessionId, exit: Option<&ExitStatus>, reason: &str) -> ServerEvent {
    ServerEvent::SessionClosed(SessionClosed {
        session_id: session_id.clone(),
        exit_code: exit.and_then(|e| e.code),
        signal: exit.and_then(|e| e.signal.clone()),
        reason: Some(reason.to_string()),
    })
}
