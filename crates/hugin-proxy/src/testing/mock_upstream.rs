//! Mock upstream API server.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// What the mock answers with.
#[derive(Debug, Clone)]
pub enum MockReply {
    Json { status: u16, body: Value },
    Chunks {
        content_type: String,
        chunks: Vec<Bytes>,
        /// Pause before each chunk.
        interval: Duration,
    },
}

impl MockReply {
    pub fn json(status: u16, body: Value) -> Self {
        MockReply::Json { status, body }
    }

    pub fn chunks(content_type: &str, chunks: Vec<Bytes>) -> Self {
        MockReply::Chunks {
            content_type: content_type.to_string(),
            chunks,
            interval: Duration::from_millis(5),
        }
    }

    pub fn sse(chunks: Vec<Bytes>) -> Self {
        Self::chunks("text/event-stream", chunks)
    }

    /// Set the pause before each chunk of a chunked reply.
    pub fn with_interval(mut self, pause: Duration) -> Self {
        if let MockReply::Chunks { interval, .. } = &mut self {
            *interval = pause;
        }
        self
    }
}

impl Default for MockReply {
    fn default() -> Self {
        MockReply::json(200, serde_json::json!({"ok": true}))
    }
}

/// A request as the upstream saw it.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub method: String,
    /// Path and query.
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl CapturedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn json(&self) -> Option<Value> {
        serde_json::from_slice(&self.body).ok()
    }
}

#[derive(Default)]
struct MockState {
    reply: Mutex<MockReply>,
    delay: Mutex<Duration>,
    captured: Mutex<Vec<CapturedRequest>>,
}

/// An HTTP server standing in for the upstream API.
///
/// Accepts any method and path, records the request and answers with the current
/// [`MockReply`].
pub struct MockUpstream {
    addr: SocketAddr,
    state: Arc<MockState>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl MockUpstream {
    /// Start on a random available port.
    pub async fn start() -> Self {
        let state = Arc::new(MockState::default());
        let app = Router::new()
            .fallback(handle_any)
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock upstream");
        let addr = listener.local_addr().expect("Failed to get local address");

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .ok();
        });

        Self {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Answer every following request with `reply`.
    pub fn set_reply(&self, reply: MockReply) {
        *self.state.reply.lock().unwrap() = reply;
    }

    /// Wait this long before sending response headers.
    pub fn set_delay(&self, delay: Duration) {
        *self.state.delay.lock().unwrap() = delay;
    }

    pub fn captured_requests(&self) -> Vec<CapturedRequest> {
        self.state.captured.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.state.captured.lock().unwrap().len()
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

async fn handle_any(State(state): State<Arc<MockState>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, usize::MAX)
        .await
        .unwrap_or_default();
    state.captured.lock().unwrap().push(CapturedRequest {
        method: parts.method.to_string(),
        path: parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_default(),
        headers: parts.headers,
        body,
    });

    let delay = *state.delay.lock().unwrap();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let reply = state.reply.lock().unwrap().clone();
    match reply {
        MockReply::Json { status, body } => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, axum::Json(body)).into_response()
        }
        MockReply::Chunks {
            content_type,
            chunks,
            interval,
        } => {
            let stream = futures::stream::iter(chunks).then(move |chunk| async move {
                tokio::time::sleep(interval).await;
                Ok::<_, Infallible>(chunk)
            });
            ([(header::CONTENT_TYPE, content_type)], Body::from_stream(stream)).into_response()
        }
    }
}
