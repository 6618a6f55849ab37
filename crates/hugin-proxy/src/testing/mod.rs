//! Testing utilities for hugin-proxy.
//!
//! - [`fixtures`]: Anthropic-shaped request bodies, JSON responses and SSE streams
//! - [`mock_upstream`]: an upstream API that records requests and replays canned replies
//! - [`mock_sync`]: a metrics sync endpoint that records posted batches

pub mod fixtures;
pub mod mock_sync;
pub mod mock_upstream;

pub use mock_sync::MockSyncServer;
pub use mock_upstream::{CapturedRequest, MockReply, MockUpstream};
