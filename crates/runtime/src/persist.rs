// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! File-backed persistence for session metadata.
//!
//! Layout under the base directory:
//!
//! ```text
//! <base>/sessions/<id>/session.json          snapshot, atomic rename
//! <base>/sessions/<id>/activity.jsonl        append-only event log
//! <base>/sessions/<id>/extractor_state.json  extractor checkpoint
//! ```
//!
//! Snapshot writes are write-temp-fsync-rename plus an fsync of the
//! parent directory, so a crashed writer leaves either the previous or
//! the next complete document. Files are 0600, directories 0700.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::warn;

use crate::error::{Error, Result};
use crate::session::SessionSnapshot;

const SNAPSHOT_FILE: &str = "session.json";
const ACTIVITY_FILE: &str = "activity.jsonl";
const EXTRACTOR_FILE: &str = "extractor_state.json";

/// Reverse-scan chunk size for [`SessionStore::tail_activity`].
const TAIL_CHUNK: usize = 8192;

/// Durable store for session snapshots and activity streams.
#[derive(Debug, Clone)]
pub struct SessionStore {
    sessions_dir: PathBuf,
}

impl SessionStore {
    /// Open (creating if needed) a store rooted at `base`.
    pub fn new(base: impl AsRef<Path>) -> Result<Self> {
        let sessions_dir = base.as_ref().join("sessions");
        make_private_dir(&sessions_dir)?;
        Ok(Self { sessions_dir })
    }

    fn session_dir(&self, id: &str) -> PathBuf {
        self.sessions_dir.join(id)
    }

    /// Atomically replace the persisted snapshot for this session.
    pub fn save_session(&self, snapshot: &SessionSnapshot) -> Result<()> {
        let dir = self.session_dir(&snapshot.id);
        make_private_dir(&dir)?;
        let json = serde_json::to_vec_pretty(snapshot).map_err(std::io::Error::from)?;
        atomic_write(&dir.join(SNAPSHOT_FILE), &json)
    }

    pub fn load_session(&self, id: &str) -> Result<SessionSnapshot> {
        let path = self.session_dir(id).join(SNAPSHOT_FILE);
        let contents = match std::fs::read(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(id.to_owned()));
            }
            Err(e) => return Err(e.into()),
        };
        let snapshot = serde_json::from_slice(&contents).map_err(std::io::Error::from)?;
        Ok(snapshot)
    }

    /// All persisted snapshots. Unreadable entries are skipped with a
    /// warning rather than failing the whole listing.
    pub fn list_sessions(&self) -> Result<Vec<SessionSnapshot>> {
        let mut snapshots = Vec::new();
        for entry in std::fs::read_dir(&self.sessions_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().into_owned();
            match self.load_session(&id) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => warn!(session = %id, error = %e, "skipping unreadable session"),
            }
        }
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(snapshots)
    }

    /// Remove a session's directory and everything in it.
    pub fn delete_session(&self, id: &str) -> Result<()> {
        let dir = self.session_dir(id);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Append one JSON document plus newline to the session's activity
    /// log, fsyncing at the end of the batch.
    pub fn append_activity(&self, id: &str, record: &impl Serialize) -> Result<()> {
        let dir = self.session_dir(id);
        make_private_dir(&dir)?;
        let mut line = serde_json::to_vec(record).map_err(std::io::Error::from)?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o600)
            .open(dir.join(ACTIVITY_FILE))?;
        file.write_all(&line)?;
        file.sync_all()?;
        Ok(())
    }

    /// Last `n` activity lines, oldest first, read by chunked reverse
    /// scan from the end of the file.
    pub fn tail_activity(&self, id: &str, n: usize) -> Result<Vec<String>> {
        let path = self.session_dir(id).join(ACTIVITY_FILE);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if n == 0 {
            return Ok(Vec::new());
        }

        let len = file.metadata()?.len();
        let mut pos = len;
        let mut acc: Vec<u8> = Vec::new();

        while pos > 0 {
            let chunk_len = TAIL_CHUNK.min(pos as usize);
            pos -= chunk_len as u64;
            file.seek(SeekFrom::Start(pos))?;
            let mut chunk = vec![0u8; chunk_len];
            file.read_exact(&mut chunk)?;
            chunk.extend_from_slice(&acc);
            acc = chunk;

            // A trailing newline terminates the last line rather than
            // starting a new one, hence the off-by-one guard.
            let newlines = acc.iter().filter(|&&b| b == b'\n').count();
            if newlines > n {
                break;
            }
        }

        let text = String::from_utf8_lossy(&acc);
        let mut lines: Vec<String> =
            text.lines().filter(|l| !l.is_empty()).map(ToOwned::to_owned).collect();
        if lines.len() > n {
            lines.drain(..lines.len() - n);
        }
        Ok(lines)
    }

    /// Atomically checkpoint extractor state for this session.
    pub fn save_extractor_state(&self, id: &str, state: &serde_json::Value) -> Result<()> {
        let dir = self.session_dir(id);
        make_private_dir(&dir)?;
        let json = serde_json::to_vec_pretty(state).map_err(std::io::Error::from)?;
        atomic_write(&dir.join(EXTRACTOR_FILE), &json)
    }

    pub fn load_extractor_state(&self, id: &str) -> Result<Option<serde_json::Value>> {
        let path = self.session_dir(id).join(EXTRACTOR_FILE);
        let contents = match std::fs::read(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let state = serde_json::from_slice(&contents).map_err(std::io::Error::from)?;
        Ok(Some(state))
    }
}

/// Create a 0700 directory (and parents) if it doesn't exist yet.
fn make_private_dir(dir: &Path) -> Result<()> {
    match std::fs::DirBuilder::new().recursive(true).mode(0o700).create(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Write-temp-fsync-rename, then fsync the parent directory so the
/// rename itself is durable.
fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("json.tmp");
    {
        let mut tmp = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600)
            .open(&tmp_path)?;
        tmp.write_all(contents)?;
        tmp.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    if let Some(parent) = path.parent() {
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}

#[cfg(test)]
#[path = "persist_tests.rs"]
mod tests;
