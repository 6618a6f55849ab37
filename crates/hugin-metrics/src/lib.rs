//! Append-only metrics and conversation records for proxied agent sessions.
//!
//! This crate provides the persistence and reconciliation side of hugin:
//!
//! - **Store**: JSONL append, atomic whole-file rewrite and cross-process file locks
//! - **Types**: `MetricDelta` and `ConversationPayloadRecord` line formats
//! - **Writer**: per-session delta and conversation writers, locked per file
//! - **Aggregate**: folds deltas into session totals, deduplicating by record id
//! - **Sync**: pushes pending records to a remote API with bounded retries
//!
//! # Usage
//!
//! ```rust,no_run
//! use hugin_metrics::{DeltaInput, DeltaWriter, SyncClient, SyncConfig, TokenUsage, aggregate};
//!
//! #[tokio::main]
//! async fn main() {
//!     let writer = DeltaWriter::for_session("/tmp/.hugin/sessions/s1", "s1");
//!
//!     let input = DeltaInput::new("s1", "claude", "msg_01")
//!         .with_model("claude-sonnet-4")
//!         .with_tokens(TokenUsage::new(1200, 340));
//!     writer.append_delta(input).unwrap();
//!
//!     let totals = aggregate(&writer.read_all().unwrap());
//!     println!("{} input tokens", totals.tokens.input);
//!
//!     let client = SyncClient::new(SyncConfig::new("https://metrics.example.com")).unwrap();
//!     let report = client.sync_pending(&writer).await.unwrap();
//!     println!("synced {} records", report.synced);
//! }
//! ```

pub mod aggregate;
pub mod store;
pub mod sync;
pub mod types;
pub mod writer;

pub use aggregate::{ModelTotals, SessionTotals, aggregate, dedupe_latest};
pub use store::{
    FileLock, StoreError, append_record, lock_path_for, read_all, temp_path_for, write_all_atomic,
};
pub use sync::{
    ConversationBatch, DEFAULT_NON_RETRYABLE, SyncClient, SyncConfig, SyncError, SyncFailure,
    SyncReport,
};
pub use types::{
    ConversationPayloadRecord, ConversationStatus, DeltaInput, MetricDelta, SyncStatus,
    TokenUsage, record_id_for,
};
pub use writer::{ConversationWriter, DeltaWriter, conversation_path, metrics_path};
