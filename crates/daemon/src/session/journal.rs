//! Durable per-session output journal.
//!
//! Layout under `<data_dir>/sessions/`:
//! - `<uuid>.log`: the output log as a sequence of frames
//! - `<uuid>.json`: [`SessionMeta`]
//! - `retired`: ids of terminated sessions, one per line, never reissued
//!
//! Appends are buffered in memory and written as one frame per flush.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use bytes::BytesMut;
use protocol::FrameCodec;
use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::store::StoreError;
use super::SessionId;

/// Append-only list of terminated session ids.
const RETIRED_FILE: &str = "retired";

/// Largest payload written as a single frame.
const MAX_CHUNK: usize = 1024 * 1024;

/// Session metadata persisted next to the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMeta {
    pub id: SessionId,
    /// Creation time in milliseconds since the Unix epoch.
    pub created_at: u64,
    pub cols: u16,
    pub rows: u16,
    pub shell: String,
}

/// A session record read back from disk.
#[derive(Debug, Clone)]
pub struct RecoveredSession {
    pub id: SessionId,
    pub created_at: u64,
    pub log: Vec<u8>,
}

/// On-disk summary used by offline tooling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordInfo {
    pub id: SessionId,
    pub created_at: u64,
    pub log_bytes: u64,
}

/// Directory holding every session journal.
#[derive(Debug, Clone)]
pub struct JournalDir {
    root: PathBuf,
    codec: FrameCodec,
}

impl JournalDir {
    /// Journal directory inside `data_dir`.
    pub fn new(data_dir: &Path) -> Self {
        Self {
            root: data_dir.join("sessions"),
            codec: FrameCodec::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn log_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}.log"))
    }

    pub fn meta_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }

    /// Create the record for a new session and open its log for appending.
    pub async fn open(&self, meta: &SessionMeta, flush_threshold: usize) -> Result<Journal, StoreError> {
        fs::create_dir_all(&self.root).await?;

        let json = serde_json::to_vec_pretty(meta)?;
        fs::write(self.meta_path(&meta.id), json).await?;

        let path = self.log_path(&meta.id);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        tracing::debug!(session_id = %meta.id, path = %path.display(), "Opened session journal");

        Ok(Journal {
            path,
            file: Some(file),
            pending: BytesMut::new(),
            flush_threshold,
            codec: self.codec.clone(),
        })
    }

    /// Delete both files of a record. Missing files are not an error.
    pub async fn delete(&self, id: &str) -> Result<(), StoreError> {
        for path in [self.log_path(id), self.meta_path(id)] {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub fn retired_path(&self) -> PathBuf {
        self.root.join(RETIRED_FILE)
    }

    /// Record that `id` was terminated, then delete its record. The id is
    /// written first so a crash in between cannot make it reusable.
    pub async fn purge(&self, id: &str) -> Result<(), StoreError> {
        self.retire(id).await?;
        self.delete(id).await
    }

    /// Append `id` to the retired list.
    pub async fn retire(&self, id: &str) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root).await?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.retired_path())
            .await?;
        file.write_all(format!("{id}\n").as_bytes()).await?;
        file.sync_data().await?;
        Ok(())
    }

    /// Every retired id. Lines that are not session ids are skipped.
    pub async fn retired(&self) -> Result<HashSet<SessionId>, StoreError> {
        let contents = match fs::read_to_string(self.retired_path()).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashSet::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = HashSet::new();
        for line in contents.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match Uuid::parse_str(line) {
                Ok(uuid) => {
                    ids.insert(uuid.to_string());
                }
                Err(_) => {
                    tracing::warn!(line, "Ignoring invalid entry in retired session list");
                }
            }
        }
        Ok(ids)
    }

    /// Load every record whose file stem is a session identifier.
    pub async fn load_all(&self) -> Result<Vec<RecoveredSession>, StoreError> {
        let mut recovered = Vec::new();
        for id in self.record_ids().await? {
            recovered.push(self.load(&id).await?);
        }
        Ok(recovered)
    }

    /// Summaries of every record, without replaying logs.
    pub async fn records(&self) -> Result<Vec<RecordInfo>, StoreError> {
        let mut infos = Vec::new();
        for id in self.record_ids().await? {
            let log_bytes = match fs::metadata(self.log_path(&id)).await {
                Ok(meta) => meta.len(),
                Err(_) => 0,
            };
            let created_at = self.created_at(&id).await;
            infos.push(RecordInfo {
                id,
                created_at,
                log_bytes,
            });
        }
        infos.sort_by_key(|info| info.created_at);
        Ok(infos)
    }

    /// Load one record.
    pub async fn load(&self, id: &str) -> Result<RecoveredSession, StoreError> {
        let created_at = self.created_at(id).await;

        let data = match fs::read(self.log_path(id)).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let replay = self.codec.replay(&data);
        if replay.truncated {
            tracing::warn!(
                session_id = %id,
                dropped = data.len() - replay.consumed,
                "Ignoring truncated frame at end of journal"
            );
        }
        if let Some(ref e) = replay.error {
            tracing::warn!(
                session_id = %id,
                offset = replay.consumed,
                error = %e,
                "Journal is corrupt, keeping the readable prefix"
            );
        }

        Ok(RecoveredSession {
            id: id.to_string(),
            created_at,
            log: replay.into_bytes(),
        })
    }

    /// Ids of all records, skipping files that do not name a session and
    /// leftovers of retired sessions.
    async fn record_ids(&self) -> Result<Vec<SessionId>, StoreError> {
        let retired = self.retired().await?;
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let (Some(stem), Some(ext)) = (
                path.file_stem().and_then(|s| s.to_str()),
                path.extension().and_then(|s| s.to_str()),
            ) else {
                continue;
            };
            if ext != "log" && ext != "json" {
                continue;
            }
            match Uuid::parse_str(stem) {
                Ok(uuid) if uuid.to_string() == stem => {
                    if !retired.contains(stem) && !ids.iter().any(|id: &String| id == stem) {
                        ids.push(stem.to_string());
                    }
                }
                _ => {
                    tracing::warn!(path = %path.display(), "Ignoring journal file with invalid session id");
                }
            }
        }
        Ok(ids)
    }

    /// Creation time from metadata, falling back to the log's mtime.
    async fn created_at(&self, id: &str) -> u64 {
        if let Ok(bytes) = fs::read(self.meta_path(id)).await {
            match serde_json::from_slice::<SessionMeta>(&bytes) {
                Ok(meta) => return meta.created_at,
                Err(e) => {
                    tracing::warn!(session_id = %id, error = %e, "Unreadable session metadata");
                }
            }
        }

        fs::metadata(self.log_path(id))
            .await
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Open log of one session.
#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    file: Option<File>,
    pending: BytesMut,
    flush_threshold: usize,
    codec: FrameCodec,
}

impl Journal {
    /// Buffer output. Returns true once the buffer should be flushed.
    pub fn append(&mut self, data: &[u8]) -> bool {
        self.pending.extend_from_slice(data);
        self.pending.len() >= self.flush_threshold
    }

    /// Bytes buffered but not yet written.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write buffered output as frames.
    ///
    /// The buffer is dropped even when the write fails; the in-memory log
    /// still holds those bytes.
    pub async fn flush(&mut self) -> Result<(), StoreError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let pending = self.pending.split().freeze();

        let file = self.file.as_mut().ok_or(StoreError::JournalClosed)?;
        let mut out = Vec::with_capacity(pending.len() + 64);
        for chunk in pending.chunks(MAX_CHUNK) {
            out.extend(self.codec.encode(chunk)?);
        }
        file.write_all(&out).await?;
        file.flush().await?;
        Ok(())
    }

    /// Flush and close the file. Later appends are dropped.
    pub async fn close(&mut self) -> Result<(), StoreError> {
        let result = self.flush().await;
        if let Some(file) = self.file.take() {
            file.sync_all().await?;
        }
        result
    }
}
