//! Remote sync of metric deltas and conversation payloads.
//!
//! Records are pushed in batches. Each batch is retried on transient failures (network errors,
//! timeouts, unexpected statuses) with increasing delays, up to an attempt cap. Statuses in the
//! non-retryable set end the batch on the first response. Either way the outcome is written back
//! to the session file through the writer's atomic rewrite path.

use std::collections::HashSet;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Value, json};

use crate::store::StoreError;
use crate::types::{ConversationPayloadRecord, ConversationStatus};
use crate::writer::{ConversationWriter, DeltaWriter};

/// Statuses that end a batch without retrying.
pub const DEFAULT_NON_RETRYABLE: [u16; 3] = [400, 401, 403];

/// Sync client configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Base URL of the sync API.
    pub base_url: String,
    /// Path for metric batches.
    pub metrics_path: String,
    /// Path for conversation payloads.
    pub conversations_path: String,
    /// Bearer token sent with every request.
    pub token: Option<String>,
    /// Records per metrics batch.
    pub batch_size: usize,
    /// Attempts per batch, first one included.
    pub max_attempts: u32,
    /// Delay before each retry; the last entry repeats.
    pub retry_delays: Vec<Duration>,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Statuses treated as terminal.
    pub non_retryable: Vec<u16>,
    /// Also pick up records previously marked `failed`.
    pub retry_failed: bool,
}

impl SyncConfig {
    /// Configuration with defaults for the given base URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            metrics_path: "/v1/metrics".to_string(),
            conversations_path: "/v1/conversations".to_string(),
            token: None,
            batch_size: 50,
            max_attempts: 3,
            retry_delays: vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(5),
            ],
            timeout: Duration::from_secs(30),
            non_retryable: DEFAULT_NON_RETRYABLE.to_vec(),
            retry_failed: false,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_retry_delays(mut self, delays: Vec<Duration>) -> Self {
        self.retry_delays = delays;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_non_retryable(mut self, statuses: Vec<u16>) -> Self {
        self.non_retryable = statuses;
        self
    }

    pub fn with_retry_failed(mut self, retry_failed: bool) -> Self {
        self.retry_failed = retry_failed;
        self
    }

    /// Delay before retry number `retry` (0-based).
    pub fn delay_for(&self, retry: usize) -> Duration {
        self.retry_delays
            .get(retry)
            .or_else(|| self.retry_delays.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

/// Error from one sync request.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SyncError {
    #[error("Sync API rejected request with status {status}: {body}")]
    Terminal { status: u16, body: String },

    #[error("Sync API returned status {status}: {body}")]
    Retryable { status: u16, body: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Sync request timed out")]
    Timeout,

    #[error("Invalid sync configuration: {0}")]
    Config(String),
}

impl SyncError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Retryable { .. } | SyncError::Network(_) | SyncError::Timeout
        )
    }

    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            SyncError::Timeout
        } else {
            SyncError::Network(e.to_string())
        }
    }
}

/// A batch that ended in `failed`.
#[derive(Debug, Clone)]
pub struct SyncFailure {
    pub record_ids: Vec<String>,
    pub attempts: u32,
    pub error: SyncError,
}

/// Outcome of a `sync_pending` run.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub batches: usize,
    pub synced: usize,
    pub failed: usize,
    pub failures: Vec<SyncFailure>,
}

impl SyncReport {
    /// True when nothing failed.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// A range of conversation messages to send.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationBatch {
    pub conversation_id: String,
    pub session_id: String,
    pub agent_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub from_index: usize,
    pub to_index: usize,
    pub messages: Vec<Value>,
}

/// HTTP client for the sync API.
#[derive(Debug, Clone)]
pub struct SyncClient {
    client: reqwest::Client,
    config: SyncConfig,
}

impl SyncClient {
    /// Build a client; the configured timeout applies to each request.
    pub fn new(config: SyncConfig) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| SyncError::Config(e.to_string()))?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Push every unsynced delta of a session file and record the outcome per batch.
    ///
    /// Remote failures are reported in the returned [`SyncReport`]; only persistence errors
    /// are returned as `Err`.
    pub async fn sync_pending(&self, writer: &DeltaWriter) -> Result<SyncReport, StoreError> {
        let records = writer.unsynced(self.config.retry_failed)?;
        let mut report = SyncReport::default();
        if records.is_empty() {
            return Ok(report);
        }

        let url = self.config.url(&self.config.metrics_path);
        for batch in records.chunks(self.config.batch_size.max(1)) {
            report.batches += 1;
            let ids: HashSet<String> = batch.iter().map(|d| d.record_id.clone()).collect();
            let body = json!({
                "session_id": batch[0].session_id,
                "agent_name": batch[0].agent_name,
                "records": batch,
            });

            let (outcome, attempts) = self.send_with_retry(&url, &body).await;
            match outcome {
                Ok(_) => {
                    writer.mark_synced(&ids, attempts)?;
                    report.synced += ids.len();
                    tracing::debug!(record_count = ids.len(), attempts, "Metrics batch synced");
                }
                Err(error) => {
                    writer.mark_failed(&ids, attempts, &error.to_string())?;
                    report.failed += ids.len();
                    tracing::warn!(
                        record_count = ids.len(),
                        attempts,
                        error = %error,
                        "Metrics batch failed"
                    );
                    report.failures.push(SyncFailure {
                        record_ids: batch.iter().map(|d| d.record_id.clone()).collect(),
                        attempts,
                        error,
                    });
                }
            }
        }

        Ok(report)
    }

    /// Send a conversation batch, persisting it as `pending` first and updating it afterwards.
    ///
    /// Returns the record as last written.
    pub async fn send_conversation(
        &self,
        writer: &ConversationWriter,
        batch: ConversationBatch,
    ) -> Result<ConversationPayloadRecord, StoreError> {
        let payload = serde_json::to_value(&batch)?;
        let record = ConversationPayloadRecord::pending(
            batch.conversation_id.clone(),
            batch.from_index,
            batch.to_index,
            payload,
        );
        writer.append(&record)?;

        let url = self.config.url(&self.config.conversations_path);
        let (outcome, attempts) = self.send_with_retry(&url, &record.payload).await;

        if let Err(e) = &outcome {
            tracing::warn!(
                conversation_id = %batch.conversation_id,
                attempts,
                error = %e,
                "Conversation sync failed"
            );
        }

        let mut updated = None;
        writer.update(&record.record_id, |r| {
            r.attempts = attempts;
            match outcome {
                Ok(response) => {
                    r.status = ConversationStatus::Success;
                    r.response = Some(response);
                    r.error = None;
                }
                Err(e) => {
                    r.status = ConversationStatus::Failed;
                    r.error = Some(e.to_string());
                }
            }
            updated = Some(r.clone());
        })?;

        Ok(updated.unwrap_or(record))
    }

    /// POST with the retry policy. Returns the final outcome and the number of attempts made.
    async fn send_with_retry(&self, url: &str, body: &Value) -> (Result<Value, SyncError>, u32) {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.post_json(url, body).await {
                Ok(value) => return (Ok(value), attempt),
                Err(e) if !e.is_retryable() || attempt >= max_attempts => return (Err(e), attempt),
                Err(e) => {
                    let delay = self.config.delay_for(attempt as usize - 1);
                    tracing::warn!(
                        url,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Sync request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn post_json(&self, url: &str, body: &Value) -> Result<Value, SyncError> {
        let mut request = self.client.post(url).json(body);
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(SyncError::from_reqwest)?;
        let status = response.status();
        let text = response.text().await.map_err(SyncError::from_reqwest)?;

        if status.is_success() {
            if text.trim().is_empty() {
                return Ok(Value::Null);
            }
            return Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)));
        }

        let code = status.as_u16();
        if self.config.non_retryable.contains(&code) {
            Err(SyncError::Terminal {
                status: code,
                body: text,
            })
        } else {
            Err(SyncError::Retryable {
                status: code,
                body: text,
            })
        }
    }
}
