//! Process backend: a child process attached to a pseudo-terminal.
//!
//! The multiplexer only talks to the [`ProcessBackend`] and [`BackendHandle`]
//! traits. [`PtyBackend`] is the production implementation on top of
//! `portable-pty`; tests substitute a scripted backend.

use std::io::{ErrorKind, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Errors raised by a process backend.
#[derive(Error, Debug)]
pub enum BackendError {
    /// The OS could not create the PTY or the process.
    #[error("failed to spawn process: {0}")]
    Spawn(String),

    /// The process already exited.
    #[error("process has exited")]
    Closed,

    /// The PTY window size could not be changed.
    #[error("failed to resize PTY: {0}")]
    Resize(String),

    /// Writing to the PTY failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What to launch and how to size its terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnSpec {
    pub shell: String,
    pub args: Vec<String>,
    pub cols: u16,
    pub rows: u16,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl SpawnSpec {
    /// A spec running `shell` with no arguments.
    pub fn new(shell: impl Into<String>, cols: u16, rows: u16) -> Self {
        Self {
            shell: shell.into(),
            args: Vec::new(),
            cols,
            rows,
            cwd: None,
            env: Vec::new(),
        }
    }
}

/// How a process ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitStatus {
    /// Exit code, when the process exited on its own.
    pub code: Option<u32>,
    /// Signal name, when the process was killed by one.
    pub signal: Option<String>,
}

impl ExitStatus {
    pub fn with_code(code: u32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn with_signal(signal: impl Into<String>) -> Self {
        Self {
            code: None,
            signal: Some(signal.into()),
        }
    }
}

/// portable-pty 0.8 keeps the terminating signal private, so PTY exits only
/// ever carry a code. A process killed by a signal reports code 1.
impl From<portable_pty::ExitStatus> for ExitStatus {
    fn from(status: portable_pty::ExitStatus) -> Self {
        ExitStatus::with_code(status.exit_code())
    }
}

/// Output of a running process, in production order.
///
/// `Exit` is sent exactly once and always after the last `Data` chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    Data(Vec<u8>),
    Exit(ExitStatus),
}

/// Factory for processes.
pub trait ProcessBackend: Send + Sync + 'static {
    type Handle: BackendHandle;

    /// Spawn a process. Blocking; call from the blocking pool.
    fn spawn(
        &self,
        spec: &SpawnSpec,
    ) -> Result<(Self::Handle, mpsc::UnboundedReceiver<BackendEvent>), BackendError>;
}

/// Control surface of one spawned process.
pub trait BackendHandle: Send + Sync + 'static {
    /// Deliver input bytes in order.
    fn write(&self, data: &[u8]) -> Result<(), BackendError>;

    /// Change the terminal window size.
    fn resize(&self, cols: u16, rows: u16) -> Result<(), BackendError>;

    /// Request termination. Idempotent and non-blocking.
    fn kill(&self);

    fn pid(&self) -> Option<u32>;

    fn is_running(&self) -> bool;
}

/// Backend spawning real processes on the native PTY system.
#[derive(Debug, Clone, Copy, Default)]
pub struct PtyBackend;

impl PtyBackend {
    pub fn new() -> Self {
        Self
    }
}

/// Handle to a process spawned by [`PtyBackend`].
pub struct PtyHandle {
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    running: Arc<AtomicBool>,
    pid: Option<u32>,
}

impl ProcessBackend for PtyBackend {
    type Handle = PtyHandle;

    fn spawn(
        &self,
        spec: &SpawnSpec,
    ) -> Result<(PtyHandle, mpsc::UnboundedReceiver<BackendEvent>), BackendError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: spec.rows,
                cols: spec.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| BackendError::Spawn(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&spec.shell);
        cmd.args(&spec.args);
        if let Some(ref dir) = spec.cwd {
            cmd.cwd(dir);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| BackendError::Spawn(e.to_string()))?;
        // The reader only sees EOF once every slave descriptor is closed
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| BackendError::Spawn(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| BackendError::Spawn(e.to_string()))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let running = Arc::new(AtomicBool::new(true));

        let (status_tx, status_rx) = std::sync::mpsc::channel();
        std::thread::Builder::new()
            .name(format!("pty-wait-{}", pid.unwrap_or_default()))
            .spawn(move || {
                let status = match child.wait() {
                    Ok(status) => ExitStatus::from(status),
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to wait for child");
                        ExitStatus::default()
                    }
                };
                let _ = status_tx.send(status);
            })
            .map_err(|e| BackendError::Spawn(e.to_string()))?;

        let reader_running = Arc::clone(&running);
        std::thread::Builder::new()
            .name(format!("pty-read-{}", pid.unwrap_or_default()))
            .spawn(move || {
                read_loop(reader, &events_tx);
                let status = status_rx.recv().unwrap_or_default();
                reader_running.store(false, Ordering::SeqCst);
                tracing::debug!(pid = ?pid, status = ?status, "PTY process exited");
                let _ = events_tx.send(BackendEvent::Exit(status));
            })
            .map_err(|e| BackendError::Spawn(e.to_string()))?;

        tracing::debug!(
            pid = ?pid,
            shell = %spec.shell,
            cols = spec.cols,
            rows = spec.rows,
            "Spawned PTY process"
        );

        let handle = PtyHandle {
            master: Mutex::new(pair.master),
            writer: Mutex::new(writer),
            killer: Mutex::new(killer),
            running,
            pid,
        };

        Ok((handle, events_rx))
    }
}

/// Pump PTY output into the channel until EOF or a read error.
fn read_loop(mut reader: Box<dyn Read + Send>, events_tx: &mpsc::UnboundedSender<BackendEvent>) {
    let mut buffer = [0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                if events_tx.send(BackendEvent::Data(buffer[..n].to_vec())).is_err() {
                    tracing::trace!("Output receiver dropped");
                }
            }
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            // EIO once the slave side is gone
            Err(_) => break,
        }
    }
}

impl BackendHandle for PtyHandle {
    fn write(&self, data: &[u8]) -> Result<(), BackendError> {
        if !self.is_running() {
            return Err(BackendError::Closed);
        }

        let mut writer = self
            .writer
            .lock()
            .map_err(|_| BackendError::Closed)?;
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<(), BackendError> {
        if !self.is_running() {
            return Err(BackendError::Closed);
        }

        let master = self
            .master
            .lock()
            .map_err(|_| BackendError::Closed)?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| BackendError::Resize(e.to_string()))
    }

    fn kill(&self) {
        if !self.is_running() {
            return;
        }
        if let Ok(mut killer) = self.killer.lock() {
            if let Err(e) = killer.kill() {
                tracing::debug!(pid = ?self.pid, error = %e, "Kill request failed");
            }
        }
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for PtyHandle {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Detects the shell to use.
///
/// Returns the shell in this order of preference:
/// 1. The configured shell if Some
/// 2. The $SHELL environment variable
/// 3. bash or sh found on PATH
/// 4. /bin/sh as fallback
pub fn detect_shell(shell: Option<&str>) -> String {
    if let Some(s) = shell {
        return s.to_string();
    }

    if let Ok(s) = std::env::var("SHELL") {
        if !s.is_empty() {
            return s;
        }
    }

    ["bash", "sh"]
        .iter()
        .find_map(|name| which::which(name).ok())
        .map(|path| path.to_string_lossy().into_owned())
        .unwrap_or_else(|| "/bin/sh".to_string())
}
