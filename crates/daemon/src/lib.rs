//! # ShellMux Daemon Library
//!
//! This crate provides the daemon side of ShellMux: a multiplexer that owns
//! shell processes running on pseudo-terminals, lets remote clients drive
//! them over WebSocket, and keeps their output so a session survives a
//! dropped connection.
//!
//! ## Overview
//!
//! - **Process Backend**: spawns shells on PTYs through a narrow trait
//! - **Session Store**: session registry, ownership and a durable output journal
//! - **Connection Binding**: per-connection outbound queues and owned sessions
//! - **Multiplexer**: the protocol state machine between clients and sessions
//! - **Gateway**: WebSocket transport with an authorization gate
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Daemon Orchestrator                         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌───────────────────┐  ┌───────────────────────────────────┐  │
//! │  │ WebSocket Gateway │──│   Authorization Gate              │  │
//! │  └─────────┬─────────┘  └───────────────────────────────────┘  │
//! │            │                                                    │
//! │  ┌─────────┴──────────────────────────────────────────────────┐ │
//! │  │                      Multiplexer                           │ │
//! │  └─────────┬──────────────────────────────────┬───────────────┘ │
//! │  ┌─────────┴─────────┐  ┌─────────────────────┴─────────────┐  │
//! │  │ Connection Binding│  │ Session Store ── Journal          │  │
//! │  └───────────────────┘  └─────────────────────┬─────────────┘  │
//! │                         ┌─────────────────────┴─────────────┐  │
//! │                         │ Process Backend (PTY)             │  │
//! │                         └───────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use shellmux_daemon::{Config, DaemonOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let mut orchestrator = DaemonOrchestrator::new(config)?;
//!     let addr = orchestrator.start().await?;
//!     println!("listening on ws://{addr}");
//!
//!     // Wait for shutdown signal...
//!
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: Backends, session store, journal and connection binding
//! - [`mux`]: Protocol state machine
//! - [`gate`]: Connection admission
//! - [`gateway`]: WebSocket transport
//! - [`orchestrator`]: Main daemon coordinator
//! - [`pidfile`]: Single daemon per data directory

pub mod config;
pub mod gate;
pub mod gateway;
pub mod mux;
pub mod orchestrator;
pub mod pidfile;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

// Re-export config types for convenience
pub use config::{Config, ConfigError, DisconnectPolicy, ExitPolicy};

// Re-export session types for convenience
pub use session::{
    ConnectionHandle, ConnectionId, ConnectionRegistry, JournalDir, ProcessBackend, PtyBackend,
    SessionId, SessionStore, StoreConfig, StoreError,
};

pub use gate::{AllowAll, AuthorizationGate, ConnectionContext, OriginGate, TokenGate};
pub use gateway::{Gateway, GatewayConfig, GatewayError};
pub use mux::{MuxConfig, MuxError, Multiplexer};

// Re-export orchestrator types for convenience
pub use orchestrator::{DaemonOrchestrator, OrchestratorEvent, OrchestratorState};
