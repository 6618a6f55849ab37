//! Session management for proxy runs.
//!
//! Each run gets a unique session id and a directory holding its log, metrics and conversation
//! files.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata file name within a session directory.
const METADATA_FILE: &str = "session.json";

/// Unique identifier for a proxy session.
///
/// Format: `YYYY-MM-DDTHH-MM-SS_XXXX` where XXXX is a short UUID suffix, so lexical order is
/// chronological.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a new session ID with current timestamp and random suffix.
    pub fn generate() -> Self {
        let now = Utc::now();
        let short_uuid = &uuid::Uuid::new_v4().simple().to_string()[..4];
        Self(format!("{}_{}", now.format("%Y-%m-%dT%H-%M-%S"), short_uuid))
    }

    /// Create a session ID from a string (for lookups of existing sessions).
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Directory holding every session.
pub fn sessions_root(hugin_dir: &Path) -> PathBuf {
    hugin_dir.join("sessions")
}

/// Get the session directory path for a given session ID.
pub fn session_dir(hugin_dir: &Path, session_id: &SessionId) -> PathBuf {
    sessions_root(hugin_dir).join(&session_id.0)
}

/// Session ids found under `hugin_dir`, oldest first.
pub fn list_sessions(hugin_dir: &Path) -> anyhow::Result<Vec<SessionId>> {
    let root = sessions_root(hugin_dir);
    if !root.exists() {
        return Ok(Vec::new());
    }

    let mut ids: Vec<String> = fs::read_dir(&root)
        .with_context(|| format!("Failed to list sessions in {}", root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect();
    ids.sort();
    Ok(ids.into_iter().map(SessionId).collect())
}

/// The most recent session, if any.
pub fn latest_session(hugin_dir: &Path) -> anyhow::Result<Option<SessionId>> {
    Ok(list_sessions(hugin_dir)?.pop())
}

/// Metadata about a proxy session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: String,

    pub started_at: DateTime<Utc>,

    /// Agent launched through the proxy, or `proxy` for standalone runs.
    pub agent_name: String,

    /// Upstream API base URL.
    pub target_url: String,

    /// Local address the proxy listened on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_addr: Option<String>,
}

impl SessionMetadata {
    pub fn new(
        session_id: &SessionId,
        agent_name: impl Into<String>,
        target_url: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            started_at: Utc::now(),
            agent_name: agent_name.into(),
            target_url: target_url.into(),
            proxy_addr: None,
        }
    }

    /// Set the proxy listen address.
    pub fn with_proxy_addr(mut self, addr: impl Into<String>) -> Self {
        self.proxy_addr = Some(addr.into());
        self
    }
}

/// Write session metadata to the session directory.
pub fn write_metadata(session_dir: &Path, metadata: &SessionMetadata) -> anyhow::Result<()> {
    let path = session_dir.join(METADATA_FILE);
    let json = serde_json::to_string_pretty(metadata)?;
    fs::write(&path, json)?;
    Ok(())
}

/// Read session metadata from a session directory.
pub fn read_metadata(session_dir: &Path) -> anyhow::Result<SessionMetadata> {
    let path = session_dir.join(METADATA_FILE);
    let json = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let metadata: SessionMetadata = serde_json::from_str(&json)?;
    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_session_id_format() {
        let id = SessionId::generate();
        let s = id.to_string();

        // Format: YYYY-MM-DDTHH-MM-SS_XXXX
        assert_eq!(s.len(), 24, "Unexpected session ID: {}", s);
        assert_eq!(&s[10..11], "T");
        assert_eq!(&s[19..20], "_");
    }

    #[test]
    fn test_session_dir_path() {
        let hugin_dir = Path::new("/tmp/.hugin");
        let session_id = SessionId::from_string("2026-01-11T17-34-52_a3f2");

        let dir = session_dir(hugin_dir, &session_id);
        assert_eq!(
            dir,
            PathBuf::from("/tmp/.hugin/sessions/2026-01-11T17-34-52_a3f2")
        );
    }

    #[test]
    fn test_list_sessions_sorted() {
        let dir = tempdir().unwrap();
        assert!(list_sessions(dir.path()).unwrap().is_empty());
        assert!(latest_session(dir.path()).unwrap().is_none());

        for id in [
            "2026-03-01T10-00-00_bbbb",
            "2026-01-01T10-00-00_aaaa",
            "2026-02-01T10-00-00_cccc",
        ] {
            fs::create_dir_all(session_dir(dir.path(), &SessionId::from_string(id))).unwrap();
        }
        // Stray files are not sessions
        fs::write(sessions_root(dir.path()).join("notes.txt"), "x").unwrap();

        let ids: Vec<String> = list_sessions(dir.path())
            .unwrap()
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            ids,
            vec![
                "2026-01-01T10-00-00_aaaa",
                "2026-02-01T10-00-00_cccc",
                "2026-03-01T10-00-00_bbbb",
            ]
        );
        assert_eq!(
            latest_session(dir.path()).unwrap().unwrap().as_str(),
            "2026-03-01T10-00-00_bbbb"
        );
    }

    #[test]
    fn test_metadata_roundtrip() {
        let dir = tempdir().unwrap();
        let session_id = SessionId::generate();
        let metadata = SessionMetadata::new(&session_id, "claude", "https://api.anthropic.com")
            .with_proxy_addr("127.0.0.1:4100");

        write_metadata(dir.path(), &metadata).unwrap();
        let loaded = read_metadata(dir.path()).unwrap();

        assert_eq!(loaded.session_id, metadata.session_id);
        assert_eq!(loaded.agent_name, "claude");
        assert_eq!(loaded.proxy_addr.as_deref(), Some("127.0.0.1:4100"));
    }
}
