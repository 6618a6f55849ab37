//! The proxy server: accepts agent requests and drives them through the interceptor chain.

use std::future::Future;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use bytes::Bytes;
use futures::StreamExt;
use hugin_metrics::{ConversationWriter, DeltaWriter, SyncClient};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;

use crate::chain::InterceptorChain;
use crate::config::ProxyConfig;
use crate::context::{ProxyContext, RequestPhase, ResponseHead, ResponseSummary};
use crate::error::{ProxyError, Result};
use crate::plugin::PluginContext;
use crate::registry::PluginRegistry;
use crate::upstream::{Upstream, response_headers};

/// Reserved local health endpoint, never forwarded.
pub const HEALTH_PATH: &str = "/_hugin/health";

/// Largest inbound request body accepted.
const MAX_REQUEST_BODY: usize = 32 * 1024 * 1024;

/// Response chunks buffered between the upstream reader and the client.
const CHANNEL_CAPACITY: usize = 16;

struct ProxyState {
    config: Arc<ProxyConfig>,
    chain: Arc<InterceptorChain>,
    upstream: Upstream,
}

/// The hugin proxy server.
pub struct ProxyServer {
    state: Arc<ProxyState>,
}

impl ProxyServer {
    /// Build a server, instantiating the registry's plugins against `config`.
    pub fn new(config: ProxyConfig, registry: &PluginRegistry) -> Result<Self> {
        let config = Arc::new(config);
        let ctx = Self::plugin_context(&config);
        Self::with_context(config, registry, ctx)
    }

    /// Build a server with an explicit plugin context.
    pub fn with_context(
        config: Arc<ProxyConfig>,
        registry: &PluginRegistry,
        ctx: PluginContext,
    ) -> Result<Self> {
        let chain = registry
            .instantiate(&ctx, config.hook_timeout)?
            .with_stop_timeout(config.stop_timeout);
        let upstream = Upstream::new(config.request_timeout)?;
        Ok(Self {
            state: Arc::new(ProxyState {
                config,
                chain: Arc::new(chain),
                upstream,
            }),
        })
    }

    /// Plugin context for a config: session writers when metrics are on, a sync client when
    /// sync is configured.
    pub fn plugin_context(config: &Arc<ProxyConfig>) -> PluginContext {
        let mut ctx = PluginContext::new(config.clone());
        if let Some(dir) = &config.metrics_dir {
            ctx = ctx
                .with_deltas(DeltaWriter::for_session(dir, &config.session_id))
                .with_conversations(ConversationWriter::for_session(dir, &config.session_id));
        }
        if let Some(sync) = &config.sync {
            match SyncClient::new(sync.clone()) {
                Ok(client) => ctx = ctx.with_sync(client),
                Err(e) => tracing::warn!(error = %e, "Sync disabled: failed to build client"),
            }
        }
        ctx
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.state.config
    }

    pub fn chain(&self) -> &InterceptorChain {
        &self.state.chain
    }

    /// Build the axum router for the proxy.
    pub fn router(&self) -> Router {
        let mut router = Router::new()
            .route(HEALTH_PATH, get(handle_health))
            .fallback(handle_proxy)
            .with_state(self.state.clone());

        if self.state.config.enable_tracing {
            router = router.layer(TraceLayer::new_for_http());
        }

        router
    }

    /// Run the proxy server until the process ends.
    pub async fn run(self) -> std::io::Result<()> {
        self.run_with_shutdown(std::future::pending()).await
    }

    /// Run the proxy server with graceful shutdown.
    pub async fn run_with_shutdown(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.state.config.bind_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener.
    ///
    /// `on_proxy_start` runs before the first connection is accepted and `on_proxy_stop` after
    /// graceful shutdown completes.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> std::io::Result<()> {
        self.state.chain.start().await;

        tracing::info!(
            addr = %listener.local_addr()?,
            target = %self.state.config.target_url,
            session_id = %self.state.config.session_id,
            plugins = ?self.state.chain.plugin_ids(),
            "Starting hugin proxy"
        );

        let result = axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await;

        self.state.chain.stop().await;
        tracing::info!(session_id = %self.state.config.session_id, "Proxy stopped");
        result
    }
}

/// Handle GET /_hugin/health
async fn handle_health(State(state): State<Arc<ProxyState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "session_id": state.config.session_id,
        "plugins": state.chain.plugin_ids(),
    }))
}

/// Handle every other method and path.
async fn handle_proxy(State(state): State<Arc<ProxyState>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let body = match axum::body::to_bytes(body, MAX_REQUEST_BODY).await {
        Ok(b) => b,
        Err(e) => {
            return ProxyError::InvalidRequest(format!("failed to read request body: {}", e))
                .into_response();
        }
    };
    let body = (!body.is_empty()).then_some(body);

    let ctx = ProxyContext::new(&state.config, parts.method, path, parts.headers, body);
    match proxy(state, ctx).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn proxy(state: Arc<ProxyState>, mut ctx: ProxyContext) -> Result<Response> {
    ctx.transition(RequestPhase::RequestReceived)?;
    state.chain.run_request(&mut ctx).await;
    ctx.transition(RequestPhase::RequestIntercepted)?;

    if ctx.is_blocked() {
        ctx.transition(RequestPhase::Completed)?;
        tracing::debug!(
            request_id = %ctx.request_id,
            path = %ctx.path,
            "Blocked request answered locally"
        );
        return Ok(StatusCode::OK.into_response());
    }

    ctx.transition(RequestPhase::Forwarding)?;
    let url = state.config.upstream_url(&ctx.path);
    let upstream = match state.upstream.send(&url, &ctx).await {
        Ok(response) => response,
        Err(e) => return Err(fail(&state.chain, &mut ctx, e).await),
    };

    ctx.transition(RequestPhase::ResponseHeadersReceived)?;
    let mut head = ResponseHead {
        status: upstream.status(),
        headers: response_headers(upstream.headers()),
    };
    state.chain.run_response_headers(&mut ctx, &mut head).await;

    ctx.transition(RequestPhase::Streaming)?;
    let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(CHANNEL_CAPACITY);
    tokio::spawn(pump(state.chain.clone(), ctx, head.status, upstream, tx));

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });
    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = head.status;
    *response.headers_mut() = head.headers;
    Ok(response)
}

/// Read the upstream body, run each chunk through the chain and hand it to the client.
///
/// The bounded channel applies backpressure: upstream is read only as fast as the client
/// drains. When the client goes away the upstream response is dropped and no further chunks
/// are dispatched.
async fn pump(
    chain: Arc<InterceptorChain>,
    mut ctx: ProxyContext,
    status: StatusCode,
    upstream: reqwest::Response,
    tx: mpsc::Sender<std::io::Result<Bytes>>,
) {
    let mut stream = upstream.bytes_stream();
    let mut total_bytes = 0u64;
    let mut chunks_delivered = 0u64;

    loop {
        let next = tokio::select! {
            item = stream.next() => item,
            _ = tx.closed() => {
                fail(&chain, &mut ctx, ProxyError::ClientDisconnected).await;
                return;
            }
        };

        match next {
            Some(Ok(chunk)) => {
                total_bytes += chunk.len() as u64;
                let Some(out) = chain.run_chunk(&mut ctx, chunk).await else {
                    continue;
                };
                if out.is_empty() {
                    continue;
                }
                if tx.send(Ok(out)).await.is_err() {
                    fail(&chain, &mut ctx, ProxyError::ClientDisconnected).await;
                    return;
                }
                chunks_delivered += 1;
            }
            Some(Err(e)) => {
                let error = ProxyError::Upstream(format!("response body: {}", e));
                let _ = tx.send(Err(std::io::Error::other(error.to_string()))).await;
                fail(&chain, &mut ctx, error).await;
                return;
            }
            None => break,
        }
    }

    if let Err(e) = ctx.transition(RequestPhase::Completed) {
        tracing::warn!(request_id = %ctx.request_id, error = %e, "Unexpected phase");
    }
    let summary = ResponseSummary {
        status,
        total_bytes,
        chunks_delivered,
        duration_ms: ctx.elapsed_ms(),
    };
    // The client body stays open until completion hooks ran
    chain.run_complete(&mut ctx, &summary).await;
    drop(tx);
}

/// Move to `Errored`, notify every interceptor and hand the error back.
async fn fail(chain: &InterceptorChain, ctx: &mut ProxyContext, error: ProxyError) -> ProxyError {
    if let Err(e) = ctx.transition(RequestPhase::Errored) {
        tracing::warn!(request_id = %ctx.request_id, error = %e, "Unexpected phase");
    }
    tracing::warn!(
        request_id = %ctx.request_id,
        path = %ctx.path,
        error = %error,
        "Request failed"
    );
    chain.run_error(ctx, &error).await;
    error
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptor::Interceptor;
    use crate::plugin::Plugin;
    use crate::plugins::{BlockerPlugin, builtin_registry};
    use crate::testing::{MockReply, MockUpstream};
    use async_trait::async_trait;
    use axum::http::Method;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tower::ServiceExt;

    fn config(upstream: &MockUpstream) -> ProxyConfig {
        ProxyConfig::new(upstream.url(), "s1").with_tracing(false)
    }

    fn request(method: Method, path: &str, body: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method(method)
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    /// Records the phases and errors each hook observed.
    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Interceptor for Recorder {
        async fn on_request(&self, ctx: &mut ProxyContext) -> Result<()> {
            self.events.lock().unwrap().push(format!("request:{:?}", ctx.phase()));
            Ok(())
        }

        async fn on_response_headers(
            &self,
            _ctx: &mut ProxyContext,
            head: &mut ResponseHead,
        ) -> Result<()> {
            self.events
                .lock()
                .unwrap()
                .push(format!("headers:{}", head.status.as_u16()));
            Ok(())
        }

        async fn on_response_complete(
            &self,
            ctx: &mut ProxyContext,
            summary: &ResponseSummary,
        ) -> Result<()> {
            self.events.lock().unwrap().push(format!(
                "complete:{:?}:{}",
                ctx.phase(),
                summary.total_bytes
            ));
            Ok(())
        }

        async fn on_error(&self, ctx: &mut ProxyContext, error: &ProxyError) -> Result<()> {
            self.events
                .lock()
                .unwrap()
                .push(format!("error:{:?}:{}", ctx.phase(), error.status_and_type().1));
            Ok(())
        }
    }

    struct InstancePlugin {
        id: &'static str,
        priority: i32,
        interceptor: Arc<dyn Interceptor>,
    }

    impl Plugin for InstancePlugin {
        fn id(&self) -> &str {
            self.id
        }
        fn name(&self) -> &str {
            self.id
        }
        fn version(&self) -> &str {
            "0.1.0"
        }
        fn priority(&self) -> i32 {
            self.priority
        }
        fn create_interceptor(&self, _ctx: &PluginContext) -> Result<Arc<dyn Interceptor>> {
            Ok(self.interceptor.clone())
        }
    }

    /// Drops every third chunk of a response.
    #[derive(Default)]
    struct DropEveryThird {
        seen: AtomicUsize,
    }

    #[async_trait]
    impl Interceptor for DropEveryThird {
        async fn on_response_chunk(
            &self,
            _ctx: &mut ProxyContext,
            chunk: Bytes,
        ) -> Result<Option<Bytes>> {
            let n = self.seen.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(if n % 3 == 0 { None } else { Some(chunk) })
        }
    }

    struct Tag;

    #[async_trait]
    impl Interceptor for Tag {
        async fn on_response_chunk(
            &self,
            _ctx: &mut ProxyContext,
            chunk: Bytes,
        ) -> Result<Option<Bytes>> {
            let mut tagged = b"[".to_vec();
            tagged.extend_from_slice(&chunk);
            tagged.push(b']');
            Ok(Some(Bytes::from(tagged)))
        }
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let upstream = MockUpstream::start().await;
        let server = ProxyServer::new(config(&upstream), &builtin_registry(&[])).unwrap();

        let response = server
            .router()
            .oneshot(request(Method::GET, HEALTH_PATH, ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(json["session_id"], "s1");
        assert_eq!(upstream.request_count(), 0);
        upstream.shutdown().await;
    }

    #[tokio::test]
    async fn test_blocked_path_never_reaches_upstream() {
        let upstream = MockUpstream::start().await;
        let mut registry = PluginRegistry::new();
        registry.register(BlockerPlugin);
        let server = ProxyServer::new(config(&upstream), &registry).unwrap();

        for path in [
            "/api/event_logging/batch",
            "/API/Event_Logging/Batch",
            "/api/event_logging/batch?attempt=2",
        ] {
            let response = server
                .router()
                .oneshot(request(Method::POST, path, r#"{"events":[]}"#))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(body_string(response).await.is_empty());
        }

        assert_eq!(upstream.request_count(), 0);
        upstream.shutdown().await;
    }

    #[tokio::test]
    async fn test_non_exact_path_is_forwarded() {
        let upstream = MockUpstream::start().await;
        let mut registry = PluginRegistry::new();
        registry.register(BlockerPlugin);
        let server = ProxyServer::new(config(&upstream), &registry).unwrap();

        let response = server
            .router()
            .oneshot(request(Method::POST, "/api/event_logging/batch/extra", "{}"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let captured = upstream.captured_requests();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].path, "/api/event_logging/batch/extra");
        upstream.shutdown().await;
    }

    #[tokio::test]
    async fn test_request_forwarded_with_body_and_query() {
        let upstream = MockUpstream::start().await;
        upstream.set_reply(MockReply::json(200, serde_json::json!({"id": "msg_1"})));
        let server = ProxyServer::new(config(&upstream), &PluginRegistry::new()).unwrap();

        let response = server
            .router()
            .oneshot(request(Method::POST, "/v1/messages?beta=true", r#"{"model":"m"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("content-length").is_none());
        assert!(body_string(response).await.contains("msg_1"));

        let captured = upstream.captured_requests();
        assert_eq!(captured[0].method, "POST");
        assert_eq!(captured[0].path, "/v1/messages?beta=true");
        assert_eq!(&captured[0].body[..], br#"{"model":"m"}"#);
        upstream.shutdown().await;
    }

    #[tokio::test]
    async fn test_streamed_chunks_through_two_interceptors() {
        let upstream = MockUpstream::start().await;
        let chunks: Vec<Bytes> = (0..10).map(|i| Bytes::from(format!("c{}", i))).collect();
        upstream.set_reply(MockReply::chunks("text/event-stream", chunks));

        let mut registry = PluginRegistry::new();
        registry.register(InstancePlugin {
            id: "tag",
            priority: 1,
            interceptor: Arc::new(Tag),
        });
        registry.register(InstancePlugin {
            id: "drop",
            priority: 2,
            interceptor: Arc::new(DropEveryThird::default()),
        });
        let server = ProxyServer::new(config(&upstream), &registry).unwrap();

        let response = server
            .router()
            .oneshot(request(Method::POST, "/v1/messages", "{}"))
            .await
            .unwrap();
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/event-stream"
        );

        // Each upstream chunk is tagged individually, so framing survives concatenation
        let body = body_string(response).await;
        assert_eq!(body, "[c0][c1][c3][c4][c6][c7][c9]");
        upstream.shutdown().await;
    }

    #[tokio::test]
    async fn test_lifecycle_hooks_observe_phases() {
        let upstream = MockUpstream::start().await;
        upstream.set_reply(MockReply::json(529, serde_json::json!({"error": "overloaded"})));

        let recorder = Arc::new(Recorder::default());
        let mut registry = PluginRegistry::new();
        registry.register(InstancePlugin {
            id: "recorder",
            priority: 0,
            interceptor: recorder.clone(),
        });
        let server = ProxyServer::new(config(&upstream), &registry).unwrap();

        let response = server
            .router()
            .oneshot(request(Method::POST, "/v1/messages", "{}"))
            .await
            .unwrap();
        // Non-2xx upstream responses pass through untouched
        assert_eq!(response.status().as_u16(), 529);
        let body = body_string(response).await;
        assert!(body.contains("overloaded"));

        let events = recorder.events.lock().unwrap().clone();
        assert_eq!(events[0], "request:RequestReceived");
        assert_eq!(events[1], "headers:529");
        assert_eq!(events[2], format!("complete:Completed:{}", body.len()));
        upstream.shutdown().await;
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_bad_gateway() {
        // Bind and drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let recorder = Arc::new(Recorder::default());
        let mut registry = PluginRegistry::new();
        registry.register(InstancePlugin {
            id: "recorder",
            priority: 0,
            interceptor: recorder.clone(),
        });
        let config = ProxyConfig::new(format!("http://{}", addr), "s1").with_tracing(false);
        let server = ProxyServer::new(config, &registry).unwrap();

        let response = server
            .router()
            .oneshot(request(Method::POST, "/v1/messages", "{}"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(json["error"]["type"], "upstream_error");

        let events = recorder.events.lock().unwrap().clone();
        assert_eq!(events.last().unwrap(), "error:Errored:upstream_error");
    }

    #[tokio::test]
    async fn test_slow_upstream_times_out() {
        let upstream = MockUpstream::start().await;
        upstream.set_delay(Duration::from_millis(500));
        let config = config(&upstream).with_request_timeout(Duration::from_millis(50));
        let server = ProxyServer::new(config, &PluginRegistry::new()).unwrap();

        let response = server
            .router()
            .oneshot(request(Method::GET, "/v1/models", ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        upstream.shutdown().await;
    }

    #[tokio::test]
    async fn test_run_with_shutdown_starts_and_stops_plugins() {
        #[derive(Default)]
        struct Lifecycle {
            started: AtomicUsize,
            stopped: AtomicUsize,
        }

        #[async_trait]
        impl Interceptor for Lifecycle {
            async fn on_proxy_start(&self) -> Result<()> {
                self.started.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            async fn on_proxy_stop(&self) -> Result<()> {
                self.stopped.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let upstream = MockUpstream::start().await;
        let lifecycle = Arc::new(Lifecycle::default());
        let mut registry = PluginRegistry::new();
        registry.register(InstancePlugin {
            id: "lifecycle",
            priority: 0,
            interceptor: lifecycle.clone(),
        });
        let server = ProxyServer::new(config(&upstream), &registry).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(server.serve(listener, async {
            rx.await.ok();
        }));

        let response = reqwest::get(format!("http://{}{}", addr, HEALTH_PATH))
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(lifecycle.started.load(Ordering::SeqCst), 1);

        tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
        assert_eq!(lifecycle.stopped.load(Ordering::SeqCst), 1);
        upstream.shutdown().await;
    }

    /// Counts chunks, completions and client disconnects.
    #[derive(Default)]
    struct Counting {
        chunks: AtomicUsize,
        completes: AtomicUsize,
        disconnects: AtomicUsize,
    }

    #[async_trait]
    impl Interceptor for Counting {
        async fn on_response_chunk(
            &self,
            _ctx: &mut ProxyContext,
            chunk: Bytes,
        ) -> Result<Option<Bytes>> {
            self.chunks.fetch_add(1, Ordering::SeqCst);
            Ok(Some(chunk))
        }

        async fn on_response_complete(
            &self,
            _ctx: &mut ProxyContext,
            _summary: &ResponseSummary,
        ) -> Result<()> {
            self.completes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_error(&self, _ctx: &mut ProxyContext, error: &ProxyError) -> Result<()> {
            if matches!(error, ProxyError::ClientDisconnected) {
                self.disconnects.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_client_disconnect_stops_streaming() {
        let upstream = MockUpstream::start().await;
        let chunks: Vec<Bytes> = (0..20).map(|i| Bytes::from(format!("c{}", i))).collect();
        upstream.set_reply(
            MockReply::chunks("text/event-stream", chunks).with_interval(Duration::from_millis(50)),
        );

        let counting = Arc::new(Counting::default());
        let mut registry = PluginRegistry::new();
        registry.register(InstancePlugin {
            id: "counting",
            priority: 0,
            interceptor: counting.clone(),
        });
        let server = ProxyServer::new(config(&upstream), &registry).unwrap();

        let response = server
            .router()
            .oneshot(request(Method::POST, "/v1/messages", "{}"))
            .await
            .unwrap();
        let mut body = response.into_body().into_data_stream();
        let first = body.next().await.unwrap().unwrap();
        assert_eq!(&first[..], b"c0");
        drop(body);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while counting.disconnects.load(Ordering::SeqCst) == 0
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let seen = counting.chunks.load(Ordering::SeqCst);

        // No further chunks are dispatched once the client is gone
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(counting.chunks.load(Ordering::SeqCst), seen);
        assert!(seen < 20);
        assert_eq!(counting.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(counting.completes.load(Ordering::SeqCst), 0);
        upstream.shutdown().await;
    }

    /// Fails its response headers hook.
    #[derive(Default)]
    struct FailingHeaders {
        errors: AtomicUsize,
        completes: AtomicUsize,
    }

    #[async_trait]
    impl Interceptor for FailingHeaders {
        async fn on_response_headers(
            &self,
            _ctx: &mut ProxyContext,
            _head: &mut ResponseHead,
        ) -> Result<()> {
            Err(ProxyError::Internal("bad headers".into()))
        }

        async fn on_response_complete(
            &self,
            _ctx: &mut ProxyContext,
            _summary: &ResponseSummary,
        ) -> Result<()> {
            self.completes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_error(&self, _ctx: &mut ProxyContext, error: &ProxyError) -> Result<()> {
            assert!(matches!(error, ProxyError::Interceptor { plugin, .. } if plugin == "failing"));
            self.errors.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failing_headers_hook_is_isolated() {
        let upstream = MockUpstream::start().await;
        let chunks: Vec<Bytes> = (0..5).map(|i| Bytes::from(format!("c{}", i))).collect();
        upstream.set_reply(MockReply::chunks("text/event-stream", chunks));

        let failing = Arc::new(FailingHeaders::default());
        let counting = Arc::new(Counting::default());
        let mut registry = PluginRegistry::new();
        registry.register(InstancePlugin {
            id: "failing",
            priority: 0,
            interceptor: failing.clone(),
        });
        registry.register(InstancePlugin {
            id: "counting",
            priority: 1,
            interceptor: counting.clone(),
        });
        let server = ProxyServer::new(config(&upstream), &registry).unwrap();

        let response = server
            .router()
            .oneshot(request(Method::POST, "/v1/messages", "{}"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "c0c1c2c3c4");

        assert_eq!(failing.errors.load(Ordering::SeqCst), 1);
        assert_eq!(failing.completes.load(Ordering::SeqCst), 1);
        assert_eq!(counting.completes.load(Ordering::SeqCst), 1);
        assert_eq!(counting.disconnects.load(Ordering::SeqCst), 0);
        upstream.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_hooks_get_stop_timeout() {
        struct SlowFlush {
            flushed: AtomicUsize,
        }

        #[async_trait]
        impl Interceptor for SlowFlush {
            async fn on_proxy_stop(&self) -> Result<()> {
                tokio::time::sleep(Duration::from_millis(200)).await;
                self.flushed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let upstream = MockUpstream::start().await;
        let flush = Arc::new(SlowFlush {
            flushed: AtomicUsize::new(0),
        });
        let mut registry = PluginRegistry::new();
        registry.register(InstancePlugin {
            id: "flush",
            priority: 0,
            interceptor: flush.clone(),
        });
        let config = config(&upstream)
            .with_hook_timeout(Duration::from_millis(50))
            .with_stop_timeout(Duration::from_secs(5));
        let server = ProxyServer::new(config, &registry).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        server.serve(listener, std::future::ready(())).await.unwrap();
        assert_eq!(flush.flushed.load(Ordering::SeqCst), 1);
        upstream.shutdown().await;
    }
}
