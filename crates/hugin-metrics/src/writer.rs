//! Per-session writers for metrics and conversation records.
//!
//! Appends and whole-file rewrites take the file's [`FileLock`], so a status rewrite never drops
//! an append from another writer of the same file, whether a clone, a second writer built for
//! the same session, or another process such as `hugin sync`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::aggregate::dedupe_latest;
use crate::store::{self, FileLock, StoreError};
use crate::types::{
    ConversationPayloadRecord, ConversationStatus, DeltaInput, MetricDelta, SyncStatus,
};

/// Path of the metrics file for a session: `<dir>/<session>_metrics.jsonl`.
pub fn metrics_path(session_dir: &Path, session_id: &str) -> PathBuf {
    session_dir.join(format!("{}_metrics.jsonl", session_id))
}

/// Path of the conversation file for a session: `<dir>/<session>_conversation.jsonl`.
pub fn conversation_path(session_dir: &Path, session_id: &str) -> PathBuf {
    session_dir.join(format!("{}_conversation.jsonl", session_id))
}

/// Appends metric deltas and reconciles their sync status.
#[derive(Debug, Clone)]
pub struct DeltaWriter {
    path: PathBuf,
}

impl DeltaWriter {
    /// Create a writer for an explicit file path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Create a writer for a session's metrics file.
    pub fn for_session(session_dir: impl AsRef<Path>, session_id: &str) -> Self {
        Self::new(metrics_path(session_dir.as_ref(), session_id))
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an observation as a `pending` delta and return its record id.
    ///
    /// Appending the same record id twice is allowed; aggregation deduplicates.
    pub fn append_delta(&self, input: DeltaInput) -> Result<String, StoreError> {
        let delta = MetricDelta::pending(input);
        let _lock = FileLock::acquire(&self.path)?;
        store::append_record(&self.path, &delta)?;
        tracing::debug!(
            record_id = %delta.record_id,
            path = %self.path.display(),
            "Appended metric delta"
        );
        Ok(delta.record_id)
    }

    /// Every line of the file, duplicates included.
    pub fn read_all(&self) -> Result<Vec<MetricDelta>, StoreError> {
        // Nothing recorded yet; don't create the session directory just to read
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let _lock = FileLock::acquire(&self.path)?;
        store::read_all(&self.path)
    }

    /// Deduplicated records still in `pending`.
    pub fn pending(&self) -> Result<Vec<MetricDelta>, StoreError> {
        self.unsynced(false)
    }

    /// Deduplicated records awaiting sync.
    ///
    /// `pending` records always qualify; `failed` ones only with `include_failed`.
    pub fn unsynced(&self, include_failed: bool) -> Result<Vec<MetricDelta>, StoreError> {
        let records = dedupe_latest(self.read_all()?);
        Ok(records
            .into_iter()
            .filter(|d| match d.sync_status {
                SyncStatus::Pending => true,
                SyncStatus::Failed => include_failed,
                SyncStatus::Success => false,
            })
            .collect())
    }

    /// Mark records as accepted by the remote API after `attempts` more attempts.
    pub fn mark_synced(
        &self,
        record_ids: &HashSet<String>,
        attempts: u32,
    ) -> Result<usize, StoreError> {
        let now = Utc::now();
        self.update(record_ids, |d| {
            d.sync_status = SyncStatus::Success;
            d.sync_attempts += attempts;
            d.last_sync_error = None;
            d.synced_at = Some(now);
        })
    }

    /// Mark records as failed after `attempts` more attempts.
    pub fn mark_failed(
        &self,
        record_ids: &HashSet<String>,
        attempts: u32,
        error: &str,
    ) -> Result<usize, StoreError> {
        self.update(record_ids, |d| {
            d.sync_status = SyncStatus::Failed;
            d.sync_attempts += attempts;
            d.last_sync_error = Some(error.to_string());
        })
    }

    /// Apply `f` to every line whose record id is in `record_ids`, rewriting the file atomically.
    ///
    /// Returns the number of lines changed.
    pub fn update<F>(&self, record_ids: &HashSet<String>, mut f: F) -> Result<usize, StoreError>
    where
        F: FnMut(&mut MetricDelta),
    {
        if record_ids.is_empty() {
            return Ok(0);
        }

        let _lock = FileLock::acquire(&self.path)?;
        let mut records: Vec<MetricDelta> = store::read_all(&self.path)?;
        let mut changed = 0;
        for record in records.iter_mut() {
            if record_ids.contains(&record.record_id) {
                f(record);
                changed += 1;
            }
        }
        if changed > 0 {
            store::write_all_atomic(&self.path, &records)?;
        }
        Ok(changed)
    }
}

/// Persists conversation payload batches around their network send.
#[derive(Debug, Clone)]
pub struct ConversationWriter {
    path: PathBuf,
}

impl ConversationWriter {
    /// Create a writer for an explicit file path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Create a writer for a session's conversation file.
    pub fn for_session(session_dir: impl AsRef<Path>, session_id: &str) -> Self {
        Self::new(conversation_path(session_dir.as_ref(), session_id))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a record (normally `pending`, before the network call).
    pub fn append(&self, record: &ConversationPayloadRecord) -> Result<(), StoreError> {
        let _lock = FileLock::acquire(&self.path)?;
        store::append_record(&self.path, record)
    }

    pub fn read_all(&self) -> Result<Vec<ConversationPayloadRecord>, StoreError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let _lock = FileLock::acquire(&self.path)?;
        store::read_all(&self.path)
    }

    /// Update one record in place. Returns whether it was found.
    pub fn update<F>(&self, record_id: &str, f: F) -> Result<bool, StoreError>
    where
        F: FnOnce(&mut ConversationPayloadRecord),
    {
        let _lock = FileLock::acquire(&self.path)?;
        let mut records: Vec<ConversationPayloadRecord> = store::read_all(&self.path)?;
        let Some(record) = records.iter_mut().find(|r| r.record_id == record_id) else {
            return Ok(false);
        };
        record.updated_at = Utc::now();
        f(record);
        store::write_all_atomic(&self.path, &records)?;
        Ok(true)
    }

    /// Index after the last message successfully sent for a conversation (0 if none).
    pub fn last_synced_index(&self, conversation_id: &str) -> Result<usize, StoreError> {
        Ok(self
            .read_all()?
            .iter()
            .filter(|r| {
                r.conversation_id == conversation_id && r.status == ConversationStatus::Success
            })
            .map(|r| r.to_index)
            .max()
            .unwrap_or(0))
    }
}
