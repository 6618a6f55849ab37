//! Record types persisted as JSON lines.
//!
//! Field names are camelCase on disk so the files can be shipped to the sync API unchanged.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Sync state of a persisted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Not yet accepted by the remote API.
    #[default]
    Pending,
    /// Accepted by the remote API.
    Success,
    /// Gave up: non-retryable response or attempt cap reached.
    Failed,
}

/// Token counts for one observed response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    #[serde(default)]
    pub input: u64,
    #[serde(default)]
    pub output: u64,
    #[serde(default)]
    pub cache_creation: u64,
    #[serde(default)]
    pub cache_read: u64,
}

impl TokenUsage {
    /// Usage with only input/output counts.
    pub fn new(input: u64, output: u64) -> Self {
        Self {
            input,
            output,
            ..Default::default()
        }
    }

    /// Set cache counters.
    pub fn with_cache(mut self, creation: u64, read: u64) -> Self {
        self.cache_creation = creation;
        self.cache_read = read;
        self
    }

    /// Add another usage into this one.
    pub fn add(&mut self, other: &TokenUsage) {
        self.input += other.input;
        self.output += other.output;
        self.cache_creation += other.cache_creation;
        self.cache_read += other.cache_read;
    }

    /// Sum of all counters.
    pub fn total(&self) -> u64 {
        self.input + self.output + self.cache_creation + self.cache_read
    }
}

/// Derive a stable record id from the originating message id.
///
/// The same `(session_id, message_id)` always maps to the same id, which is what makes
/// re-appending an observation idempotent after aggregation.
pub fn record_id_for(session_id: &str, message_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(session_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(message_id.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().take(16).map(|b| format!("{:02x}", b)).collect();
    format!("md_{}", hex)
}

/// An observation before the writer assigns sync fields.
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaInput {
    pub record_id: String,
    pub session_id: String,
    pub agent_name: String,
    pub timestamp: DateTime<Utc>,
    pub model: Option<String>,
    pub request_path: Option<String>,
    pub status_code: Option<u16>,
    pub duration_ms: Option<u64>,
    pub tokens: TokenUsage,
    pub tools: BTreeMap<String, u64>,
}

impl DeltaInput {
    /// Create an observation for a message, deriving the record id from it.
    pub fn new(
        session_id: impl Into<String>,
        agent_name: impl Into<String>,
        message_id: &str,
    ) -> Self {
        let session_id = session_id.into();
        Self {
            record_id: record_id_for(&session_id, message_id),
            session_id,
            agent_name: agent_name.into(),
            timestamp: Utc::now(),
            model: None,
            request_path: None,
            status_code: None,
            duration_ms: None,
            tokens: TokenUsage::default(),
            tools: BTreeMap::new(),
        }
    }

    /// Set the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set token usage.
    pub fn with_tokens(mut self, tokens: TokenUsage) -> Self {
        self.tokens = tokens;
        self
    }

    /// Record one call of a tool.
    pub fn with_tool_call(mut self, tool: impl Into<String>) -> Self {
        *self.tools.entry(tool.into()).or_insert(0) += 1;
        self
    }

    /// Set request path, response status and duration.
    pub fn with_response(mut self, path: impl Into<String>, status: u16, duration_ms: u64) -> Self {
        self.request_path = Some(path.into());
        self.status_code = Some(status);
        self.duration_ms = Some(duration_ms);
        self
    }
}

/// One line of `<session>_metrics.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricDelta {
    pub record_id: String,
    pub session_id: String,
    pub agent_name: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub tokens: TokenUsage,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tools: BTreeMap<String, u64>,
    pub sync_status: SyncStatus,
    #[serde(default)]
    pub sync_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<DateTime<Utc>>,
}

impl MetricDelta {
    /// A freshly observed delta: `pending`, zero attempts.
    pub fn pending(input: DeltaInput) -> Self {
        Self {
            record_id: input.record_id,
            session_id: input.session_id,
            agent_name: input.agent_name,
            timestamp: input.timestamp,
            model: input.model,
            request_path: input.request_path,
            status_code: input.status_code,
            duration_ms: input.duration_ms,
            tokens: input.tokens,
            tools: input.tools,
            sync_status: SyncStatus::Pending,
            sync_attempts: 0,
            last_sync_error: None,
            synced_at: None,
        }
    }

    /// Total tool calls in this delta.
    pub fn tool_calls(&self) -> u64 {
        self.tools.values().sum()
    }
}

/// Outcome of a conversation payload send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    #[default]
    Pending,
    Success,
    Failed,
}

/// One line of `<session>_conversation.jsonl`.
///
/// Written with `pending` before the network call, rewritten with the outcome after.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationPayloadRecord {
    pub record_id: String,
    pub conversation_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// First message index included in the payload (inclusive).
    pub from_index: usize,
    /// Last message index included in the payload (exclusive).
    pub to_index: usize,
    /// Exact body sent to the conversation API.
    pub payload: serde_json::Value,
    pub status: ConversationStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<serde_json::Value>,
}

impl ConversationPayloadRecord {
    /// A new pending record for the given message range.
    pub fn pending(
        conversation_id: impl Into<String>,
        from_index: usize,
        to_index: usize,
        payload: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            record_id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            created_at: now,
            updated_at: now,
            from_index,
            to_index,
            payload,
            status: ConversationStatus::Pending,
            attempts: 0,
            error: None,
            response: None,
        }
    }
}
