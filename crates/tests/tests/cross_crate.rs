//! Cross-crate integration and E2E tests
//!
//! These tests run a served proxy with the built-in plugins between a reqwest client, a mock
//! upstream API and a mock sync API, then check what lands on disk and on the sync side.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use hugin_metrics::{
    ConversationStatus, ConversationWriter, DeltaWriter, SyncConfig, SyncStatus, aggregate,
};
use hugin_proxy::testing::{MockReply, MockSyncServer, MockUpstream, fixtures};
use hugin_proxy::{HEALTH_PATH, ProxyConfig, ProxyServer, builtin_registry};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const SESSION: &str = "2026-10-16T09-00-00_e2e0";

struct RunningProxy {
    addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<std::io::Result<()>>,
}

impl RunningProxy {
    async fn start(config: ProxyConfig, disabled: &[String]) -> Self {
        let server = ProxyServer::new(config, &builtin_registry(disabled)).unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(server.serve(listener, async move {
            shutdown_rx.await.ok();
        }));
        Self {
            addr,
            shutdown_tx,
            handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        self.handle.await.unwrap().unwrap();
    }
}

fn session_config(upstream: &MockUpstream, sync: &MockSyncServer, dir: &Path) -> ProxyConfig {
    ProxyConfig::new(upstream.url(), SESSION)
        .with_agent_name("claude")
        .with_api_key("sk-test")
        .with_metrics_dir(dir)
        .with_sync(
            SyncConfig::new(sync.url())
                .with_token("sync-token")
                .with_retry_delays(vec![Duration::from_millis(10)]),
        )
        // Only the stop flush should sync
        .with_sync_interval(Duration::from_secs(3600))
}

fn concat(chunks: &[Bytes]) -> Vec<u8> {
    chunks.iter().flat_map(|c| c.iter().copied()).collect()
}

/// E2E Test: a streamed Messages call is forwarded, observed, recorded and synced on stop.
#[tokio::test]
async fn test_e2e_streaming_session() {
    let upstream = MockUpstream::start().await;
    let sync = MockSyncServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    let events = fixtures::sse_events("msg_e2e", "claude-sonnet", 100, 20, &["Read"]);
    upstream.set_reply(MockReply::sse(events.clone()));

    let proxy = RunningProxy::start(session_config(&upstream, &sync, dir.path()), &[]).await;

    let response = reqwest::Client::new()
        .post(proxy.url("/v1/messages?beta=true"))
        .header("x-api-key", "client-key")
        .json(&fixtures::messages_request("claude-sonnet", &["hello"], true))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body = response.bytes().await.unwrap();
    assert_eq!(body.as_ref(), concat(&events).as_slice());

    // Upstream saw the injected credential and session headers
    let captured = upstream.captured_requests();
    assert_eq!(captured.len(), 1);
    assert_eq!(captured[0].path, "/v1/messages?beta=true");
    assert_eq!(captured[0].header("authorization"), Some("Bearer sk-test"));
    assert_eq!(captured[0].header("x-api-key"), None);
    assert_eq!(captured[0].header("x-hugin-session-id"), Some(SESSION));
    assert_eq!(captured[0].header("x-hugin-agent"), Some("claude"));

    // Completion hooks finish before the client body ends
    let deltas = DeltaWriter::for_session(dir.path(), SESSION);
    let recorded = deltas.read_all().unwrap();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].model.as_deref(), Some("claude-sonnet"));
    assert_eq!(recorded[0].sync_status, SyncStatus::Pending);

    proxy.stop().await;

    // Stop flushed metrics once and shipped the conversation
    let metric_bodies = sync.bodies("metrics");
    assert_eq!(metric_bodies.len(), 1);
    assert_eq!(metric_bodies[0]["records"].as_array().unwrap().len(), 1);
    assert_eq!(sync.last_authorization().as_deref(), Some("Bearer sync-token"));

    let totals = aggregate(&deltas.read_all().unwrap());
    assert_eq!(totals.requests, 1);
    assert_eq!(totals.tokens.input, 100);
    assert_eq!(totals.tokens.output, 20);
    assert_eq!(totals.tool_calls.get("Read"), Some(&1));
    assert_eq!(totals.synced, 1);
    assert_eq!(totals.pending, 0);

    let conversations = sync.bodies("conversations");
    assert_eq!(conversations.len(), 1);
    assert_eq!(conversations[0]["from_index"], 0);
    assert_eq!(conversations[0]["to_index"], 1);
    let records = ConversationWriter::for_session(dir.path(), SESSION)
        .read_all()
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, ConversationStatus::Success);

    upstream.shutdown().await;
    sync.shutdown().await;
}

/// E2E Test: blocked telemetry never reaches upstream and records nothing.
#[tokio::test]
async fn test_e2e_blocked_path() {
    let upstream = MockUpstream::start().await;
    let sync = MockSyncServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    let proxy = RunningProxy::start(session_config(&upstream, &sync, dir.path()), &[]).await;

    let response = reqwest::Client::new()
        .post(proxy.url("/api/event_logging/batch"))
        .json(&serde_json::json!({"events": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(response.bytes().await.unwrap().is_empty());
    assert_eq!(upstream.request_count(), 0);

    proxy.stop().await;

    assert!(
        DeltaWriter::for_session(dir.path(), SESSION)
            .read_all()
            .unwrap()
            .is_empty()
    );
    assert!(sync.bodies("metrics").is_empty());

    upstream.shutdown().await;
    sync.shutdown().await;
}

/// E2E Test: non-streaming turns ship only the new conversation tail.
#[tokio::test]
async fn test_e2e_json_conversation_tail() {
    let upstream = MockUpstream::start().await;
    let sync = MockSyncServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    upstream.set_reply(MockReply::json(
        200,
        fixtures::json_response("msg_a", "claude-sonnet", 10, 5, &[]),
    ));
    let proxy = RunningProxy::start(session_config(&upstream, &sync, dir.path()), &[]).await;
    let client = reqwest::Client::new();

    for turns in [&["one"][..], &["one", "two", "three"][..]] {
        let response = client
            .post(proxy.url("/v1/messages"))
            .json(&fixtures::messages_request("claude-sonnet", turns, false))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let json: serde_json::Value = response.json().await.unwrap();
        assert_eq!(json["id"], "msg_a");

        // Let the shipped batch settle before the next turn
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while sync.bodies("conversations").len() < turns.len().div_ceil(2)
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    proxy.stop().await;

    let conversations = sync.bodies("conversations");
    assert_eq!(conversations.len(), 2);
    assert_eq!(conversations[1]["from_index"], 1);
    assert_eq!(conversations[1]["to_index"], 3);

    // Same message id twice folds into a single request
    let totals = aggregate(
        &DeltaWriter::for_session(dir.path(), SESSION)
            .read_all()
            .unwrap(),
    );
    assert_eq!(totals.requests, 1);

    upstream.shutdown().await;
    sync.shutdown().await;
}

/// E2E Test: with sync plugins disabled, records stay pending on disk.
#[tokio::test]
async fn test_e2e_disabled_sync_plugins() {
    let upstream = MockUpstream::start().await;
    let sync = MockSyncServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    upstream.set_reply(MockReply::json(
        200,
        fixtures::json_response("msg_b", "claude-haiku", 3, 4, &["Bash"]),
    ));
    let disabled = vec!["metrics-sync".to_string(), "conversation-sync".to_string()];
    let proxy = RunningProxy::start(session_config(&upstream, &sync, dir.path()), &disabled).await;

    let health: serde_json::Value = reqwest::get(proxy.url(HEALTH_PATH))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["session_id"], SESSION);

    reqwest::Client::new()
        .post(proxy.url("/v1/messages"))
        .json(&fixtures::messages_request("claude-haiku", &["hi"], false))
        .send()
        .await
        .unwrap();

    proxy.stop().await;

    assert_eq!(sync.request_count(), 0);
    let deltas = DeltaWriter::for_session(dir.path(), SESSION)
        .read_all()
        .unwrap();
    assert_eq!(deltas.len(), 1);
    assert_eq!(deltas[0].sync_status, SyncStatus::Pending);
    assert_eq!(deltas[0].tools.get("Bash"), Some(&1));

    upstream.shutdown().await;
    sync.shutdown().await;
}
