//! Mock metrics sync API.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

#[derive(Default)]
struct SyncState {
    status: AtomicU16,
    /// `(endpoint, authorization, body)` per request.
    posts: Mutex<Vec<(String, Option<String>, Value)>>,
}

/// Accepts `POST /v1/{endpoint}` and answers with a configurable status.
pub struct MockSyncServer {
    addr: SocketAddr,
    state: Arc<SyncState>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl MockSyncServer {
    pub async fn start() -> Self {
        let state = Arc::new(SyncState::default());
        state.status.store(200, Ordering::SeqCst);

        let app = Router::new()
            .route("/v1/{endpoint}", post(handle_post))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock sync server");
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

    pub fn set_status(&self, status: u16) {
        self.state.status.store(status, Ordering::SeqCst);
    }

    /// Bodies posted to one endpoint, e.g. `"metrics"`.
    pub fn bodies(&self, endpoint: &str) -> Vec<Value> {
        self.state
            .posts
            .lock()
            .unwrap()
            .iter()
            .filter(|(e, _, _)| e == endpoint)
            .map(|(_, _, body)| body.clone())
            .collect()
    }

    /// Authorization header of the most recent request.
    pub fn last_authorization(&self) -> Option<String> {
        self.state
            .posts
            .lock()
            .unwrap()
            .last()
            .and_then(|(_, auth, _)| auth.clone())
    }

    pub fn request_count(&self) -> usize {
        self.state.posts.lock().unwrap().len()
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

async fn handle_post(
    State(state): State<Arc<SyncState>>,
    Path(endpoint): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    state.posts.lock().unwrap().push((endpoint, auth, body));

    let status = StatusCode::from_u16(state.status.load(Ordering::SeqCst))
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(serde_json::json!({"accepted": true})))
}
