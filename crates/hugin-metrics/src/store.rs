//! JSONL record store.
//!
//! Two write paths with different guarantees:
//! - **Append**: one record per line, appended in a single write. Used for new observations.
//! - **Atomic rewrite**: whole file written to a temporary sibling, synced, then renamed over the
//!   target. Used when existing lines change (sync status reconciliation).
//!
//! A reader of the target path sees either the old or the new complete content. Writers that
//! read-modify-write hold a [`FileLock`] so appends from other writers are not lost.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Error type for record store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid record in {path} at line {line}: {source}")]
    Parse {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Append one record as a JSON line.
///
/// The serialized line and its newline go out in a single `write_all` on a file opened in
/// append mode, followed by `sync_data`. No rename is involved.
pub fn append_record<T: Serialize>(path: &Path, record: &T) -> Result<(), StoreError> {
    ensure_parent(path)?;

    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| StoreError::io(path, e))?;
    file.write_all(&line).map_err(|e| StoreError::io(path, e))?;
    file.sync_data().map_err(|e| StoreError::io(path, e))?;
    Ok(())
}

/// Replace the whole file with `records`, atomically.
///
/// Writes to a temporary sibling, forces it to stable storage and renames it over `path`.
/// On failure the temporary file is removed and the original error is returned.
pub fn write_all_atomic<T: Serialize>(path: &Path, records: &[T]) -> Result<(), StoreError> {
    ensure_parent(path)?;
    let tmp = temp_path_for(path);

    let result = write_temp(&tmp, records).and_then(|()| {
        fs::rename(&tmp, path).map_err(|e| StoreError::io(path, e))?;
        sync_parent(path);
        Ok(())
    });

    if result.is_err() {
        if let Err(e) = fs::remove_file(&tmp) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(tmp = %tmp.display(), error = %e, "Failed to remove temp file");
            }
        }
    }

    result
}

fn write_temp<T: Serialize>(tmp: &Path, records: &[T]) -> Result<(), StoreError> {
    let file = File::create(tmp).map_err(|e| StoreError::io(tmp, e))?;
    let mut writer = BufWriter::new(file);
    for record in records {
        serde_json::to_writer(&mut writer, record)?;
        writer.write_all(b"\n").map_err(|e| StoreError::io(tmp, e))?;
    }
    let file = writer
        .into_inner()
        .map_err(|e| StoreError::io(tmp, e.into_error()))?;
    file.sync_all().map_err(|e| StoreError::io(tmp, e))?;
    Ok(())
}

/// Read every record from a JSONL file.
///
/// A missing file is an empty list. Blank lines are skipped; any other line that does not
/// parse is an error.
pub fn read_all<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, StoreError> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(path, e)),
    };

    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str(line).map_err(|source| StoreError::Parse {
                path: path.to_path_buf(),
                line: idx + 1,
                source,
            })
        })
        .collect()
}

/// Temporary sibling used by [`write_all_atomic`] for `path`.
///
/// Hidden, in the same directory (so the rename stays on one filesystem), and unique per
/// process and call.
pub fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "records".to_string());
    let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
    path.with_file_name(format!(".{}.{}.{}.tmp", name, std::process::id(), nanos))
}

fn ensure_parent(path: &Path) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
    }
    Ok(())
}

/// Persist the rename itself. Best effort: not every platform lets a directory be opened.
fn sync_parent(path: &Path) {
    #[cfg(unix)]
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}

/// Lock file guarding `path`: `.{name}.lock` in the same directory.
pub fn lock_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "records".to_string());
    path.with_file_name(format!(".{}.lock", name))
}

/// Exclusive advisory lock on a record file, held until dropped.
///
/// The lock lives on a sibling lock file rather than the data file, because the atomic rewrite
/// renames a new inode over the data file. Every open handle contends, so two writers in one
/// process exclude each other as well as writers in other processes.
#[derive(Debug)]
pub struct FileLock {
    // Closing the handle releases the lock
    _file: File,
}

impl FileLock {
    /// Block until the lock for `path` is held.
    pub fn acquire(path: &Path) -> Result<Self, StoreError> {
        ensure_parent(path)?;
        let lock_path = lock_path_for(path);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| StoreError::io(&lock_path, e))?;
        file.lock_exclusive()
            .map_err(|e| StoreError::io(&lock_path, e))?;
        Ok(Self { _file: file })
    }
}
