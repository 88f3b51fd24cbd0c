//! Durable per-session record of what has been executed.
//!
//! The journal maps `(session, action)` to the latest [`DeploymentRecord`]. [`FileJournal`]
//! keeps one append-only JSON Lines file per session and folds it on read, so a crash can at
//! worst leave a torn final line behind. [`MemoryJournal`] backs tests and dry runs.

use std::{
    collections::HashMap,
    fs::{File, OpenOptions},
    io::{self, Read, Write},
    path::{Path, PathBuf},
};

use alloy_core::primitives::{Address, TxHash};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{
    artifact::{ActionId, SessionId},
    error::JournalError,
};

/// Name of the journal file inside a session directory.
pub const JOURNAL_FILENAME: &str = "journal.jsonl";

/// Name of the lock file inside a session directory.
pub const LOCK_FILENAME: &str = ".lock";

/// Lifecycle of an action inside a session.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RecordStatus {
    /// Submitted, confirmation not yet observed.
    Pending,
    Completed,
    Failed,
}

/// Latest known state of one action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub action: ActionId,
    pub status: RecordStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<TxHash>,
    /// Nonce the transaction was signed with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Fingerprint of the submitted payload, used to detect definition changes on resume.
    pub fingerprint: String,
    pub recorded_at: DateTime<Utc>,
}

impl DeploymentRecord {
    pub fn pending(action: ActionId, fingerprint: String, tx_hash: TxHash) -> Self {
        Self {
            action,
            status: RecordStatus::Pending,
            address: None,
            tx_hash: Some(tx_hash),
            nonce: None,
            error: None,
            fingerprint,
            recorded_at: Utc::now(),
        }
    }

    pub fn completed(
        action: ActionId,
        fingerprint: String,
        address: Option<Address>,
        tx_hash: Option<TxHash>,
    ) -> Self {
        Self {
            action,
            status: RecordStatus::Completed,
            address,
            tx_hash,
            nonce: None,
            error: None,
            fingerprint,
            recorded_at: Utc::now(),
        }
    }

    pub fn failed(
        action: ActionId,
        fingerprint: String,
        tx_hash: Option<TxHash>,
        error: impl ToString,
    ) -> Self {
        Self {
            action,
            status: RecordStatus::Failed,
            address: None,
            tx_hash,
            nonce: None,
            error: Some(error.to_string()),
            fingerprint,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_nonce(mut self, nonce: Option<u64>) -> Self {
        self.nonce = nonce;
        self
    }

    pub fn is_completed(&self) -> bool {
        self.status == RecordStatus::Completed
    }
}

/// Storage of [`DeploymentRecord`]s keyed by session and action.
///
/// A completed record is final: `put` refuses to replace it.
pub trait Journal {
    fn get(
        &self,
        session: &SessionId,
        action: &ActionId,
    ) -> Result<Option<DeploymentRecord>, JournalError>;

    fn put(&mut self, session: &SessionId, record: DeploymentRecord) -> Result<(), JournalError>;

    /// Latest record of every action of the session, in first-recorded order.
    fn list(&self, session: &SessionId) -> Result<Vec<DeploymentRecord>, JournalError>;

    fn list_completed(&self, session: &SessionId) -> Result<Vec<DeploymentRecord>, JournalError> {
        Ok(self
            .list(session)?
            .into_iter()
            .filter(DeploymentRecord::is_completed)
            .collect())
    }
}

/// Journal kept in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryJournal {
    sessions: HashMap<SessionId, IndexMap<ActionId, DeploymentRecord>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Journal for MemoryJournal {
    fn get(
        &self,
        session: &SessionId,
        action: &ActionId,
    ) -> Result<Option<DeploymentRecord>, JournalError> {
        Ok(self
            .sessions
            .get(session)
            .and_then(|records| records.get(action))
            .cloned())
    }

    fn put(&mut self, session: &SessionId, record: DeploymentRecord) -> Result<(), JournalError> {
        let records = self.sessions.entry(session.clone()).or_default();
        ensure_not_completed(session, records, &record.action)?;
        records.insert(record.action.clone(), record);
        Ok(())
    }

    fn list(&self, session: &SessionId) -> Result<Vec<DeploymentRecord>, JournalError> {
        Ok(self
            .sessions
            .get(session)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default())
    }
}

/// Journal persisted as `<root>/<session>/journal.jsonl`.
#[derive(Debug, Clone)]
pub struct FileJournal {
    root: PathBuf,
}

impl FileJournal {
    /// Journal rooted at the deployments directory. Nothing is created until the first `put`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, session: &SessionId) -> Result<PathBuf, JournalError> {
        if !session.is_path_safe() {
            return Err(JournalError::Io {
                path: self.root.join(session.as_str()),
                source: io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "session id must be a single path component",
                ),
            });
        }
        Ok(self.root.join(session.as_str()))
    }

    pub fn journal_path(&self, session: &SessionId) -> Result<PathBuf, JournalError> {
        Ok(self.session_dir(session)?.join(JOURNAL_FILENAME))
    }

    /// Ids of every session that has a journal under the root.
    pub fn sessions(&self) -> Result<Vec<SessionId>, JournalError> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(JournalError::Io {
                    path: self.root.clone(),
                    source,
                });
            }
        };

        let mut sessions = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| JournalError::Io {
                path: self.root.clone(),
                source,
            })?;
            if entry.path().join(JOURNAL_FILENAME).is_file() {
                sessions.push(SessionId::new(entry.file_name().to_string_lossy()));
            }
        }
        sessions.sort();
        Ok(sessions)
    }

    fn load(&self, session: &SessionId) -> Result<IndexMap<ActionId, DeploymentRecord>, JournalError> {
        let path = self.journal_path(session)?;
        match std::fs::read_to_string(&path) {
            Ok(content) => fold(&path, &content),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(IndexMap::new()),
            Err(source) => Err(JournalError::Io { path, source }),
        }
    }
}

impl Journal for FileJournal {
    fn get(
        &self,
        session: &SessionId,
        action: &ActionId,
    ) -> Result<Option<DeploymentRecord>, JournalError> {
        Ok(self.load(session)?.swap_remove(action))
    }

    fn put(&mut self, session: &SessionId, record: DeploymentRecord) -> Result<(), JournalError> {
        let path = self.journal_path(session)?;
        let io_err = |source| JournalError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(io_err)?;

        // Held until `file` is dropped; covers the read-check-append sequence.
        file.lock_exclusive().map_err(io_err)?;

        let mut content = String::new();
        file.read_to_string(&mut content).map_err(io_err)?;
        let records = fold(&path, &content)?;
        ensure_not_completed(session, &records, &record.action)?;

        if let Some(intact) = torn_tail(&content) {
            // Drop the torn entry; appends land at the new end of file.
            tracing::warn!(
                path = %path.display(),
                dropped_bytes = content.len() - intact,
                "Truncating torn journal entry"
            );
            file.set_len(intact as u64).map_err(io_err)?;
        }

        let mut line = serde_json::to_string(&record)
            .map_err(|err| io_err(io::Error::new(io::ErrorKind::InvalidData, err)))?;
        line.push('\n');

        file.write_all(line.as_bytes()).map_err(io_err)?;
        file.sync_data().map_err(io_err)?;

        tracing::trace!(
            session = %session,
            action = %record.action,
            status = %record.status,
            "Journal entry appended"
        );

        Ok(())
    }

    fn list(&self, session: &SessionId) -> Result<Vec<DeploymentRecord>, JournalError> {
        Ok(self.load(session)?.into_values().collect())
    }
}

/// Length of the intact prefix when the journal ends in an unterminated entry.
///
/// Every entry is written together with its newline, so only a crash mid-write leaves
/// bytes after the last `\n`.
fn torn_tail(content: &str) -> Option<usize> {
    if content.is_empty() || content.ends_with('\n') {
        return None;
    }
    Some(content.rfind('\n').map_or(0, |i| i + 1))
}

/// Replay journal lines; later entries for an action replace earlier ones.
fn fold(path: &Path, content: &str) -> Result<IndexMap<ActionId, DeploymentRecord>, JournalError> {
    let (intact, torn) = match torn_tail(content) {
        Some(end) => content.split_at(end),
        None => (content, ""),
    };
    if !torn.trim().is_empty() {
        tracing::warn!(
            path = %path.display(),
            bytes = torn.len(),
            "Ignoring torn trailing journal entry"
        );
    }

    let mut records = IndexMap::new();
    for (number, line) in intact.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: DeploymentRecord =
            serde_json::from_str(line).map_err(|source| JournalError::Corrupt {
                path: path.to_path_buf(),
                line: number + 1,
                source,
            })?;
        records.insert(record.action.clone(), record);
    }
    Ok(records)
}

fn ensure_not_completed(
    session: &SessionId,
    records: &IndexMap<ActionId, DeploymentRecord>,
    action: &ActionId,
) -> Result<(), JournalError> {
    match records.get(action) {
        Some(existing) if existing.is_completed() => Err(JournalError::AlreadyCompleted {
            session: session.clone(),
            action: action.clone(),
        }),
        _ => Ok(()),
    }
}

/// Exclusive advisory lock on a session, held for the duration of a run.
#[derive(Debug)]
pub struct SessionLock {
    file: File,
    path: PathBuf,
}

impl SessionLock {
    /// Lock `<root>/<session>/.lock`, failing immediately if another process holds it.
    pub fn acquire(journal: &FileJournal, session: &SessionId) -> Result<Self, JournalError> {
        let dir = journal.session_dir(session)?;
        let path = dir.join(LOCK_FILENAME);
        let io_err = |source| JournalError::Io {
            path: path.clone(),
            source,
        };

        std::fs::create_dir_all(&dir).map_err(io_err)?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(io_err)?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(err) if err.kind() == fs2::lock_contended_error().kind() => {
                return Err(JournalError::Locked(session.clone()));
            }
            Err(source) => return Err(io_err(source)),
        }

        tracing::debug!(session = %session, path = %path.display(), "Session lock acquired");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %err, "Failed to release session lock");
        }
    }
}
