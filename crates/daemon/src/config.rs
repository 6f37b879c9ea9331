//! Configuration management for the ShellMux daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/shellmux/config.toml`.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::detect_shell;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("bind_addr must be a socket address like 0.0.0.0:3000, got {0}")]
    InvalidBindAddr(String),

    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("default terminal size must be at least 1x1, got {cols}x{rows}")]
    InvalidTerminalSize { cols: u16, rows: u16 },

    #[error("outbound_queue must be between 16 and 65536, got {0}")]
    InvalidOutboundQueue(usize),

    #[error("heartbeat_timeout_secs ({timeout}) must be greater than ping_interval_secs ({ping}) and ping_interval_secs must be positive")]
    InvalidHeartbeat { ping: u64, timeout: u64 },

    #[error("flush_interval_ms must be between 10 and 60000, got {0}")]
    InvalidFlushInterval(u64),

    #[error("flush_threshold_bytes must be between 1 and 8388608, got {0}")]
    InvalidFlushThreshold(usize),

    #[error("default_shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the ShellMux daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// WebSocket listener configuration.
    pub network: NetworkConfig,

    /// Session defaults and lifecycle policies.
    pub session: SessionConfig,

    /// Output journal configuration.
    pub store: JournalConfig,

    /// Connection admission settings.
    pub security: SecurityConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for storing daemon data (journals, pidfile).
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Also write logs to this file.
    pub log_file: Option<PathBuf>,
}

/// WebSocket listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the WebSocket server listens on.
    pub bind_addr: String,

    /// Per-connection outbound queue length; overflowing it disconnects.
    pub outbound_queue: usize,

    /// Interval between server pings.
    pub ping_interval_secs: u64,

    /// Disconnect a client silent for this long.
    pub heartbeat_timeout_secs: u64,
}

/// What happens to a connection's sessions when it drops.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DisconnectPolicy {
    /// Keep the process running, unowned, for a later reattach.
    #[default]
    Detach,
    /// Kill the process and delete the session.
    Kill,
}

/// What happens to a session whose process exits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExitPolicy {
    /// Keep the log for later inspection.
    #[default]
    Retain,
    /// Delete the session right away.
    Discard,
}

/// Session defaults and lifecycle policies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Default shell to use for new sessions.
    pub default_shell: String,

    /// Arguments passed to the shell.
    pub shell_args: Vec<String>,

    /// Initial terminal columns.
    pub default_cols: u16,

    /// Initial terminal rows.
    pub default_rows: u16,

    /// Working directory for new sessions (default: home directory).
    pub cwd: Option<PathBuf>,

    /// Value of TERM for new sessions.
    pub term: String,

    /// Maximum number of concurrent live sessions.
    pub max_sessions: usize,

    pub disconnect_policy: DisconnectPolicy,

    pub on_exit: ExitPolicy,

    /// Attaching to an unknown UUID creates a session with that id.
    pub allow_client_ids: bool,
}

/// Output journal configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct JournalConfig {
    /// Persist session output under `<data_dir>/sessions`.
    pub persist: bool,

    /// Periodic flush interval in milliseconds.
    pub flush_interval_ms: u64,

    /// Buffered bytes that trigger an immediate flush.
    pub flush_threshold_bytes: usize,
}

/// Connection admission settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct SecurityConfig {
    /// Shared secret clients pass as the `token` query parameter.
    pub access_token: Option<String>,

    /// Browser origins allowed to connect. Empty means any.
    pub allowed_origins: Vec<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".to_string(),
            outbound_queue: 1024,
            ping_interval_secs: 30,
            heartbeat_timeout_secs: 90,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_shell: default_shell(),
            shell_args: Vec::new(),
            default_cols: 80,
            default_rows: 30,
            cwd: None,
            term: "xterm-color".to_string(),
            max_sessions: 64,
            disconnect_policy: DisconnectPolicy::Detach,
            on_exit: ExitPolicy::Retain,
            allow_client_ids: false,
        }
    }
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            persist: true,
            flush_interval_ms: 1000,
            flush_threshold_bytes: 64 * 1024, // 64KB
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("shellmux")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("shellmux")
}

/// Returns the default shell for the current platform.
fn default_shell() -> String {
    if cfg!(windows) {
        "powershell.exe".to_string()
    } else {
        detect_shell(None)
    }
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - SHELLMUX_BIND: Override the listen address
    /// - SHELLMUX_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - SHELLMUX_ACCESS_TOKEN: Override the shared access token
    pub fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("SHELLMUX_BIND") {
            if !addr.is_empty() {
                tracing::info!("Overriding bind_addr from environment: {}", addr);
                self.network.bind_addr = addr;
            }
        }

        if let Ok(level) = std::env::var("SHELLMUX_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }

        if let Ok(token) = std::env::var("SHELLMUX_ACCESS_TOKEN") {
            if !token.is_empty() {
                tracing::info!("Overriding access_token from environment");
                self.security.access_token = Some(token);
            }
        }
    }

    /// Parsed listen address.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.network
            .bind_addr
            .parse()
            .map_err(|_| ConfigError::InvalidBindAddr(self.network.bind_addr.clone()))
    }

    /// Working directory for new sessions.
    pub fn session_cwd(&self) -> Option<PathBuf> {
        self.session.cwd.clone().or_else(dirs::home_dir)
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bind_addr()?;

        // Validate max_sessions: 1-1000
        if self.session.max_sessions < 1 || self.session.max_sessions > 1000 {
            return Err(ConfigError::InvalidMaxSessions(self.session.max_sessions));
        }

        if self.session.default_cols == 0 || self.session.default_rows == 0 {
            return Err(ConfigError::InvalidTerminalSize {
                cols: self.session.default_cols,
                rows: self.session.default_rows,
            });
        }

        if !(16..=65536).contains(&self.network.outbound_queue) {
            return Err(ConfigError::InvalidOutboundQueue(self.network.outbound_queue));
        }

        let ping = self.network.ping_interval_secs;
        let timeout = self.network.heartbeat_timeout_secs;
        if ping == 0 || timeout <= ping {
            return Err(ConfigError::InvalidHeartbeat { ping, timeout });
        }

        if !(10..=60_000).contains(&self.store.flush_interval_ms) {
            return Err(ConfigError::InvalidFlushInterval(self.store.flush_interval_ms));
        }

        if !(1..=8 * 1024 * 1024).contains(&self.store.flush_threshold_bytes) {
            return Err(ConfigError::InvalidFlushThreshold(
                self.store.flush_threshold_bytes,
            ));
        }

        // Validate default_shell path exists
        let shell_path = Path::new(&self.session.default_shell);
        if shell_path.is_absolute() {
            if !shell_path.exists() {
                return Err(ConfigError::InvalidShellPath(
                    self.session.default_shell.clone(),
                ));
            }
        } else if which::which(&self.session.default_shell).is_err() {
            return Err(ConfigError::InvalidShellPath(
                self.session.default_shell.clone(),
            ));
        }

        // Validate log_level is a known value
        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }

    /// Copy with secrets blanked, for display.
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if config.security.access_token.is_some() {
            config.security.access_token = Some("<redacted>".to_string());
        }
        config
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.session.default_shell = "/bin/sh".to_string();
        config
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.daemon.log_level, "info");
        assert!(config.daemon.log_file.is_none());
        assert_eq!(config.network.bind_addr, "0.0.0.0:3000");
        assert_eq!(config.session.default_cols, 80);
        assert_eq!(config.session.default_rows, 30);
        assert_eq!(config.session.term, "xterm-color");
        assert_eq!(config.session.disconnect_policy, DisconnectPolicy::Detach);
        assert_eq!(config.session.on_exit, ExitPolicy::Retain);
        assert!(!config.session.allow_client_ids);
        assert!(config.store.persist);
        assert!(config.security.access_token.is_none());
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
            [network]
            bind_addr = "127.0.0.1:8022"

            [session]
            disconnect_policy = "kill"
            on_exit = "discard"
        "#;

        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.network.bind_addr, "127.0.0.1:8022");
        assert_eq!(config.network.outbound_queue, 1024);
        assert_eq!(config.session.disconnect_policy, DisconnectPolicy::Kill);
        assert_eq!(config.session.on_exit, ExitPolicy::Discard);
        assert_eq!(config.session.default_cols, 80);
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
            [daemon]
            data_dir = "/var/lib/shellmux"
            log_level = "debug"
            log_file = "/var/log/shellmux.log"

            [network]
            bind_addr = "[::1]:3000"
            outbound_queue = 64
            ping_interval_secs = 10
            heartbeat_timeout_secs = 25

            [session]
            default_shell = "/bin/bash"
            shell_args = ["-l"]
            default_cols = 120
            default_rows = 40
            cwd = "/srv"
            term = "xterm-256color"
            max_sessions = 8
            allow_client_ids = true

            [store]
            persist = false
            flush_interval_ms = 250
            flush_threshold_bytes = 4096

            [security]
            access_token = "hunter2"
            allowed_origins = ["https://term.example.com"]
        "#;

        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.daemon.data_dir, PathBuf::from("/var/lib/shellmux"));
        assert_eq!(config.daemon.log_file, Some(PathBuf::from("/var/log/shellmux.log")));
        assert_eq!(config.network.ping_interval_secs, 10);
        assert_eq!(config.session.shell_args, vec!["-l".to_string()]);
        assert_eq!(config.session.cwd, Some(PathBuf::from("/srv")));
        assert!(config.session.allow_client_ids);
        assert!(!config.store.persist);
        assert_eq!(config.store.flush_threshold_bytes, 4096);
        assert_eq!(config.security.access_token.as_deref(), Some("hunter2"));
        assert_eq!(config.security.allowed_origins.len(), 1);
        assert_eq!(config.bind_addr().unwrap().port(), 3000);
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let result = Config::from_toml("[network\nbind_addr = 1");
        assert!(result.is_err());
        let msg = format!("{:#}", result.unwrap_err());
        assert!(msg.contains("Invalid TOML configuration"));
    }

    #[test]
    fn test_from_toml_bad_policy() {
        let result = Config::from_toml("[session]\ndisconnect_policy = \"explode\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let config = Config::from_toml("[daemon]\nfavourite_colour = \"green\"").unwrap();
        assert_eq!(config.daemon.log_level, "info");
    }

    #[test]
    fn test_roundtrip_custom() {
        let mut config = valid_config();
        config.session.disconnect_policy = DisconnectPolicy::Kill;
        config.security.allowed_origins = vec!["http://localhost:3000".to_string()];

        let parsed = Config::from_toml(&config.to_toml().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(dir.path().join("missing.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_creates_directories_and_loads_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = valid_config();
        config.network.bind_addr = "127.0.0.1:4000".to_string();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.network.bind_addr, "127.0.0.1:4000");
    }

    #[test]
    fn test_load_invalid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "not = [valid").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("shellmux/config.toml"));
    }

    #[test]
    fn test_redacted_hides_token() {
        let mut config = valid_config();
        config.security.access_token = Some("hunter2".to_string());
        let shown = config.redacted().to_toml().unwrap();
        assert!(!shown.contains("hunter2"));
        assert!(shown.contains("<redacted>"));
    }

    #[test]
    fn test_session_cwd_defaults_to_home() {
        let config = valid_config();
        assert_eq!(config.session_cwd(), dirs::home_dir());

        let mut config = valid_config();
        config.session.cwd = Some(PathBuf::from("/tmp"));
        assert_eq!(config.session_cwd(), Some(PathBuf::from("/tmp")));
    }

    #[test]
    #[serial]
    fn test_env_override_bind() {
        std::env::set_var("SHELLMUX_BIND", "127.0.0.1:9999");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.network.bind_addr, "127.0.0.1:9999");

        std::env::remove_var("SHELLMUX_BIND");
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        std::env::set_var("SHELLMUX_BIND", "");
        std::env::set_var("SHELLMUX_ACCESS_TOKEN", "");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.network.bind_addr, "0.0.0.0:3000");
        assert!(config.security.access_token.is_none());

        std::env::remove_var("SHELLMUX_BIND");
        std::env::remove_var("SHELLMUX_ACCESS_TOKEN");
    }

    #[test]
    #[serial]
    fn test_env_override_log_level_and_token() {
        std::env::set_var("SHELLMUX_LOG_LEVEL", "trace");
        std::env::set_var("SHELLMUX_ACCESS_TOKEN", "from-env");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.daemon.log_level, "trace");
        assert_eq!(config.security.access_token.as_deref(), Some("from-env"));

        std::env::remove_var("SHELLMUX_LOG_LEVEL");
        std::env::remove_var("SHELLMUX_ACCESS_TOKEN");
    }

    #[test]
    #[serial]
    fn test_env_override_unset_does_not_override() {
        std::env::remove_var("SHELLMUX_BIND");
        std::env::remove_var("SHELLMUX_LOG_LEVEL");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config, Config::default());
    }

    #[test]
    #[cfg(unix)]
    fn test_validate_default_config() {
        assert_eq!(valid_config().validate(), Ok(()));
    }

    #[test]
    fn test_validate_bind_addr() {
        let mut config = valid_config();
        config.network.bind_addr = "localhost".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidBindAddr("localhost".to_string()))
        );
    }

    #[test]
    fn test_validate_max_sessions_bounds() {
        let mut config = valid_config();
        config.session.max_sessions = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxSessions(0)));

        config.session.max_sessions = 1001;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxSessions(1001)));
    }

    #[test]
    fn test_validate_terminal_size() {
        let mut config = valid_config();
        config.session.default_rows = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidTerminalSize { cols: 80, rows: 0 })
        );
    }

    #[test]
    fn test_validate_outbound_queue() {
        let mut config = valid_config();
        config.network.outbound_queue = 4;
        assert_eq!(config.validate(), Err(ConfigError::InvalidOutboundQueue(4)));
    }

    #[test]
    fn test_validate_heartbeat_must_exceed_ping() {
        let mut config = valid_config();
        config.network.ping_interval_secs = 30;
        config.network.heartbeat_timeout_secs = 30;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidHeartbeat {
                ping: 30,
                timeout: 30
            })
        );
    }

    #[test]
    fn test_validate_flush_settings() {
        let mut config = valid_config();
        config.store.flush_interval_ms = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidFlushInterval(0)));

        let mut config = valid_config();
        config.store.flush_threshold_bytes = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidFlushThreshold(0)));
    }

    #[test]
    fn test_validate_shell_path_absolute_not_exists() {
        let mut config = valid_config();
        config.session.default_shell = "/nonexistent/path/to/shell".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidShellPath(
                "/nonexistent/path/to/shell".to_string()
            ))
        );
    }

    #[test]
    fn test_validate_shell_path_not_in_path() {
        let mut config = valid_config();
        config.session.default_shell = "nonexistent_shell_xyz".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidShellPath(
                "nonexistent_shell_xyz".to_string()
            ))
        );
    }

    #[test]
    #[cfg(unix)]
    fn test_validate_log_level_case_insensitive() {
        let mut config = valid_config();
        config.daemon.log_level = "WARN".to_string();
        assert!(config.validate().is_ok());

        config.daemon.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }
}
