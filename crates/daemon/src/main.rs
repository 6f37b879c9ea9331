//! ShellMux Daemon
//!
//! Session multiplexer for remote shells over WebSocket.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use shellmux_daemon::config::{default_config_path, Config};
use shellmux_daemon::orchestrator::{DaemonOrchestrator, OrchestratorEvent};
use shellmux_daemon::pidfile::{running_pid, PidFile};
use shellmux_daemon::session::{parse_session_id, JournalDir, RecordInfo};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// ShellMux - remote shell session multiplexer.
#[derive(Parser, Debug)]
#[command(name = "shellmux")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the daemon.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the ShellMux daemon
    Start {
        /// Listen address, overriding the configuration
        #[arg(long, value_name = "ADDR")]
        bind: Option<String>,
    },

    /// Inspect persisted sessions
    #[command(subcommand)]
    Sessions(SessionsCommands),

    /// Configuration helpers
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Subcommands for session management.
#[derive(Subcommand, Debug, Clone)]
pub enum SessionsCommands {
    /// List persisted sessions
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Delete a persisted session record
    Purge {
        /// Session ID to delete
        session_id: String,
    },
}

/// Subcommands for configuration.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;

    // Apply environment variable overrides
    config.apply_env_overrides();

    if let Commands::Start { bind: Some(bind) } = &cli.command {
        config.network.bind_addr = bind.clone();
    }

    // Validate configuration
    config.validate()?;

    let _log_guard = init_logging(&config, cli.verbose)?;
    tracing::debug!("Using config file: {:?}", config_path);

    match cli.command {
        Commands::Start { .. } => run_daemon(config).await?,
        Commands::Sessions(cmd) => {
            let journals = JournalDir::new(&config.daemon.data_dir);
            match cmd {
                SessionsCommands::List { json } => {
                    let records = journals.records().await?;
                    if json {
                        println!("{}", serde_json::to_string_pretty(&records)?);
                    } else {
                        print_sessions_table(&records);
                    }
                }
                SessionsCommands::Purge { session_id } => {
                    purge_session(&config.daemon.data_dir, &journals, &session_id).await?;
                    println!("Session {} deleted", session_id);
                }
            }
        }
        Commands::Config(ConfigCommands::Show) => {
            print!("{}", config.redacted().to_toml()?);
        }
    }

    Ok(())
}

/// Install the tracing subscriber. The returned guard must live until exit
/// so buffered file output is written.
fn init_logging(config: &Config, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose {
        "debug".to_string()
    } else {
        config.daemon.log_level.to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));

    let (file_layer, guard) = match &config.daemon.log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let file_name = path
                .file_name()
                .with_context(|| format!("Invalid log file path: {}", path.display()))?;
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    Ok(guard)
}

/// Run the daemon until SIGTERM or SIGINT.
async fn run_daemon(config: Config) -> anyhow::Result<()> {
    // Check for existing daemon BEFORE starting
    if let Some(pid) = running_pid(&config.daemon.data_dir) {
        eprintln!("Error: Daemon already running (PID: {})", pid);
        std::process::exit(1);
    }
    let _pidfile = PidFile::acquire(&config.daemon.data_dir)?;

    tracing::info!("ShellMux daemon starting...");
    let mut orchestrator = DaemonOrchestrator::new(config)?;

    // Subscribe to orchestrator events for logging
    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                OrchestratorEvent::StateChanged(state) => {
                    tracing::info!("Orchestrator state: {:?}", state);
                }
                OrchestratorEvent::SessionsRecovered { count } => {
                    tracing::info!("Recovered {} persisted session(s)", count);
                }
                OrchestratorEvent::Listening { addr } => {
                    tracing::info!("Listening on ws://{}", addr);
                }
                OrchestratorEvent::Error { message } => {
                    tracing::error!("Orchestrator error: {}", message);
                }
            }
        }
    });

    orchestrator.start().await?;

    // Wait for shutdown signal (SIGTERM or SIGINT)
    wait_for_shutdown_signal().await?;
    tracing::info!("Received shutdown signal");

    orchestrator.stop().await?;
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")
}

/// Delete a persisted session while no daemon is using the data directory.
async fn purge_session(
    data_dir: &Path,
    journals: &JournalDir,
    raw_id: &str,
) -> anyhow::Result<()> {
    if let Some(pid) = running_pid(data_dir) {
        anyhow::bail!(
            "Daemon is running (PID: {}); close the session from a client instead",
            pid
        );
    }
    let session_id = parse_session_id(raw_id)
        .with_context(|| format!("Invalid session ID: {}", raw_id))?;

    let known = journals
        .records()
        .await?
        .iter()
        .any(|record| record.id == session_id);
    if !known {
        anyhow::bail!("No persisted session with ID {}", session_id);
    }

    journals.purge(&session_id).await?;
    Ok(())
}

/// Print sessions in a formatted ASCII table.
fn print_sessions_table(records: &[RecordInfo]) {
    if records.is_empty() {
        println!("No persisted sessions.");
        return;
    }

    let id_width = records.iter().map(|r| r.id.len()).max().unwrap_or(8).max(8);

    println!(
        "{:<id_width$}  {:>12}  {:>10}",
        "ID",
        "CREATED",
        "LOG",
        id_width = id_width
    );
    println!("{}", "-".repeat(id_width + 26));

    for record in records {
        println!(
            "{:<id_width$}  {:>12}  {:>10}",
            record.id,
            format_relative_time(record.created_at / 1000),
            format_size(record.log_bytes),
            id_width = id_width
        );
    }

    println!();
    println!("Total: {} session(s)", records.len());
}

/// Format a Unix timestamp as relative time (e.g., "5m ago").
fn format_relative_time(timestamp: u64) -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let elapsed = now.saturating_sub(timestamp);

    if elapsed < 60 {
        format!("{}s ago", elapsed)
    } else if elapsed < 3600 {
        format!("{}m ago", elapsed / 60)
    } else if elapsed < 86400 {
        format!("{}h ago", elapsed / 3600)
    } else {
        format!("{}d ago", elapsed / 86400)
    }
}

/// Format a byte count with a binary unit.
fn format_size(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * KIB;

    if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{} B", bytes)
    }
}
