//! PID file for detecting a running daemon.
//!
//! Only one daemon may use a data directory at a time, since both would
//! append to the same session journals. The PID file lives at
//! `<data_dir>/shellmux.pid` and is removed when the guard is dropped.
//! Stale files left by a crashed daemon are cleaned up automatically.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// PID file name inside the data directory.
pub const PID_FILE_NAME: &str = "shellmux.pid";

/// Errors from acquiring the PID file.
#[derive(Debug, Error)]
pub enum PidFileError {
    /// Another daemon is running against the same data directory.
    #[error("daemon already running with PID {0}")]
    AlreadyRunning(u32),

    /// The file could not be written.
    #[error("failed to write PID file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Get the path to the PID file for a data directory.
pub fn pid_file_path(data_dir: &Path) -> PathBuf {
    data_dir.join(PID_FILE_NAME)
}

/// Get the PID of the daemon running against `data_dir`, if any.
///
/// Automatically cleans up stale or unreadable PID files.
pub fn running_pid(data_dir: &Path) -> Option<u32> {
    let pid_path = pid_file_path(data_dir);

    let pid_str = fs::read_to_string(&pid_path).ok()?;

    let pid: u32 = match pid_str.trim().parse() {
        Ok(p) => p,
        Err(_) => {
            cleanup_stale_pid_file(&pid_path);
            return None;
        }
    };

    if is_process_running(pid) {
        Some(pid)
    } else {
        cleanup_stale_pid_file(&pid_path);
        None
    }
}

/// Check if a process with the given PID is running.
///
/// On Linux, this checks if `/proc/{pid}/stat` exists.
/// On other Unix systems, this sends signal 0.
fn is_process_running(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        Path::new(&format!("/proc/{}/stat", pid)).exists()
    }

    #[cfg(all(unix, not(target_os = "linux")))]
    {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        match i32::try_from(pid) {
            Ok(raw) => kill(Pid::from_raw(raw), None).is_ok(),
            Err(_) => false,
        }
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

/// Remove a stale PID file.
fn cleanup_stale_pid_file(path: &Path) {
    if fs::remove_file(path).is_ok() {
        tracing::debug!("Removed stale PID file {:?}", path);
    }
}

/// Holds the PID file for the lifetime of the daemon.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Write this process's PID, refusing if another daemon holds the file.
    pub fn acquire(data_dir: &Path) -> Result<Self, PidFileError> {
        if let Some(pid) = running_pid(data_dir) {
            if pid != std::process::id() {
                return Err(PidFileError::AlreadyRunning(pid));
            }
        }

        let path = pid_file_path(data_dir);
        let io_err = |source| PidFileError::Io {
            path: path.clone(),
            source,
        };
        fs::create_dir_all(data_dir).map_err(io_err)?;
        let mut file = fs::File::create(&path).map_err(io_err)?;
        writeln!(file, "{}", std::process::id()).map_err(io_err)?;

        tracing::debug!("Wrote PID file {:?}", path);
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
