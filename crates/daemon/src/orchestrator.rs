//! Daemon orchestrator for wiring together all components.
//!
//! This module provides the `DaemonOrchestrator` that builds the session
//! store, multiplexer, authorization gate and WebSocket gateway from the
//! configuration, recovers persisted sessions, and runs the gateway and the
//! periodic journal flush until stopped.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::gate;
use crate::gateway::{Gateway, GatewayConfig};
use crate::mux::{MuxConfig, Multiplexer};
use crate::session::{JournalDir, PtyBackend, SessionStore, StoreConfig};

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Starting up, initializing components.
    Starting,
    /// Running and accepting connections.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// Orchestrator state changed.
    StateChanged(OrchestratorState),
    /// Persisted sessions were loaded.
    SessionsRecovered { count: usize },
    /// The gateway is accepting connections.
    Listening { addr: SocketAddr },
    /// Error occurred.
    Error { message: String },
}

/// Daemon orchestrator that manages all subsystems.
pub struct DaemonOrchestrator {
    /// Configuration.
    config: Config,
    /// Current state.
    state: Arc<RwLock<OrchestratorState>>,
    /// Session multiplexer, which owns the store.
    mux: Arc<Multiplexer<PtyBackend>>,
    /// Background tasks (gateway, journal flush).
    tasks: TaskTracker,
    /// Address the gateway bound, once running.
    local_addr: Option<SocketAddr>,
    /// Cancellation token for graceful shutdown.
    shutdown_token: CancellationToken,
    /// Event sender.
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl DaemonOrchestrator {
    /// Creates a new daemon orchestrator.
    pub fn new(config: Config) -> Result<Self> {
        let store_config = StoreConfig {
            persist: config.store.persist,
            flush_threshold: config.store.flush_threshold_bytes,
            max_sessions: config.session.max_sessions,
        };
        let journals = JournalDir::new(&config.daemon.data_dir);
        debug!("Session journals at {:?}", journals.root());

        let store = Arc::new(SessionStore::new(
            PtyBackend::new(),
            Some(journals),
            store_config,
        ));
        let gate = gate::from_config(&config.security);
        let mux = Arc::new(Multiplexer::new(store, gate, MuxConfig::from(&config)));

        let (event_tx, _) = broadcast::channel(256);

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            mux,
            tasks: TaskTracker::new(),
            local_addr: None,
            shutdown_token: CancellationToken::new(),
            event_tx,
        })
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Returns a receiver for orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Starts the daemon orchestrator.
    ///
    /// Returns the address the gateway is listening on.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        info!("Starting daemon orchestrator...");

        match self.start_components().await {
            Ok(addr) => {
                *self.state.write().await = OrchestratorState::Running;
                self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Running));
                info!("Daemon orchestrator started successfully");
                Ok(addr)
            }
            Err(e) => {
                *self.state.write().await = OrchestratorState::Stopped;
                self.emit_event(OrchestratorEvent::Error {
                    message: format!("{:#}", e),
                });
                self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));
                Err(e)
            }
        }
    }

    async fn start_components(&mut self) -> Result<SocketAddr> {
        let recovered = self
            .mux
            .store()
            .recover()
            .await
            .context("Failed to recover persisted sessions")?;
        self.emit_event(OrchestratorEvent::SessionsRecovered { count: recovered });

        let bind_addr = self.config.bind_addr()?;
        let gateway = Gateway::bind(
            bind_addr,
            Arc::clone(&self.mux),
            GatewayConfig::from(&self.config.network),
        )
        .await
        .context("Failed to start WebSocket gateway")?;
        let addr = gateway.local_addr()?;
        self.local_addr = Some(addr);

        let shutdown = self.shutdown_token.child_token();
        let event_tx = self.event_tx.clone();
        self.tasks.spawn(async move {
            if let Err(e) = gateway.run(shutdown).await {
                error!("Gateway failed: {}", e);
                let _ = event_tx.send(OrchestratorEvent::Error {
                    message: e.to_string(),
                });
            }
        });
        self.emit_event(OrchestratorEvent::Listening { addr });

        if self.config.store.persist {
            self.spawn_flush_task();
            debug!("Started journal flush task");
        }

        Ok(addr)
    }

    fn spawn_flush_task(&self) {
        let mux = Arc::clone(&self.mux);
        let shutdown = self.shutdown_token.child_token();
        let period = Duration::from_millis(self.config.store.flush_interval_ms);

        self.tasks.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => mux.store().flush_all().await,
                }
            }
        });
    }

    /// Stops the daemon orchestrator gracefully.
    ///
    /// Disconnects every client, closes live sessions and flushes journals.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }
        self.emit_event(OrchestratorEvent::StateChanged(
            OrchestratorState::ShuttingDown,
        ));

        info!("Stopping daemon orchestrator...");

        // Signal shutdown to all tasks and wait for connections to tear down
        self.shutdown_token.cancel();
        self.tasks.close();
        self.tasks.wait().await;

        let closed = self.mux.shutdown().await;
        debug!("Closed {} live session(s)", closed);
        self.mux.store().flush_all().await;

        {
            let mut state = self.state.write().await;
            *state = OrchestratorState::Stopped;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));

        info!("Daemon orchestrator stopped");
        Ok(())
    }

    /// Emits an orchestrator event.
    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Returns the multiplexer.
    pub fn mux(&self) -> &Arc<Multiplexer<PtyBackend>> {
        &self.mux
    }

    /// Returns the gateway address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Returns the number of connected clients.
    pub fn connection_count(&self) -> usize {
        self.mux.connections().len()
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }
}
