//! Ordered interceptor chain with per-hook timeouts and failure isolation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::context::{ProxyContext, ResponseHead, ResponseSummary};
use crate::error::{ProxyError, Result};
use crate::interceptor::Interceptor;

/// One active interceptor and the plugin that produced it.
#[derive(Clone)]
pub struct ChainEntry {
    pub plugin_id: String,
    pub interceptor: Arc<dyn Interceptor>,
}

/// Interceptors in resolved plugin order.
///
/// A failing or timed-out hook on `on_request`, `on_response_headers`, `on_response_chunk` or
/// `on_response_complete` is reported to that interceptor's `on_error` and the chain carries on.
///
/// `on_proxy_stop` is bounded by a separate stop timeout.
#[derive(Clone)]
pub struct InterceptorChain {
    entries: Vec<ChainEntry>,
    hook_timeout: Duration,
    stop_timeout: Duration,
}

impl InterceptorChain {
    pub fn new(hook_timeout: Duration) -> Self {
        Self {
            entries: Vec::new(),
            hook_timeout,
            stop_timeout: hook_timeout,
        }
    }

    /// Bound `on_proxy_stop` calls by `timeout` instead of the hook timeout.
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn push(&mut self, plugin_id: impl Into<String>, interceptor: Arc<dyn Interceptor>) {
        self.entries.push(ChainEntry {
            plugin_id: plugin_id.into(),
            interceptor,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn plugin_ids(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.plugin_id.as_str()).collect()
    }

    pub async fn start(&self) {
        for entry in &self.entries {
            let result = self
                .bounded(entry, "on_proxy_start", entry.interceptor.on_proxy_start())
                .await;
            if let Err(e) = result {
                tracing::warn!(plugin = %entry.plugin_id, error = %e, "on_proxy_start failed");
            }
        }
    }

    pub async fn stop(&self) {
        for entry in &self.entries {
            let result = self
                .bounded_for(
                    entry,
                    "on_proxy_stop",
                    self.stop_timeout,
                    entry.interceptor.on_proxy_stop(),
                )
                .await;
            if let Err(e) = result {
                tracing::warn!(plugin = %entry.plugin_id, error = %e, "on_proxy_stop failed");
            }
        }
    }

    pub async fn run_request(&self, ctx: &mut ProxyContext) {
        for entry in &self.entries {
            let result = self
                .bounded(entry, "on_request", entry.interceptor.on_request(ctx))
                .await;
            if let Err(e) = result {
                self.isolate(entry, ctx, e).await;
            }
        }
    }

    pub async fn run_response_headers(&self, ctx: &mut ProxyContext, head: &mut ResponseHead) {
        for entry in &self.entries {
            let result = self
                .bounded(
                    entry,
                    "on_response_headers",
                    entry.interceptor.on_response_headers(ctx, head),
                )
                .await;
            if let Err(e) = result {
                self.isolate(entry, ctx, e).await;
            }
        }
    }

    /// Thread a chunk through every interceptor. `None` means it was dropped.
    ///
    /// A failing interceptor passes its input on unchanged.
    pub async fn run_chunk(&self, ctx: &mut ProxyContext, chunk: Bytes) -> Option<Bytes> {
        let mut current = chunk;
        for entry in &self.entries {
            let result = self
                .bounded(
                    entry,
                    "on_response_chunk",
                    entry.interceptor.on_response_chunk(ctx, current.clone()),
                )
                .await;
            match result {
                Ok(Some(next)) => current = next,
                Ok(None) => return None,
                Err(e) => self.isolate(entry, ctx, e).await,
            }
        }
        Some(current)
    }

    pub async fn run_complete(&self, ctx: &mut ProxyContext, summary: &ResponseSummary) {
        for entry in &self.entries {
            let result = self
                .bounded(
                    entry,
                    "on_response_complete",
                    entry.interceptor.on_response_complete(ctx, summary),
                )
                .await;
            if let Err(e) = result {
                self.isolate(entry, ctx, e).await;
            }
        }
    }

    /// Notify every interceptor of a request failure. Failures here are only logged.
    pub async fn run_error(&self, ctx: &mut ProxyContext, error: &ProxyError) {
        for entry in &self.entries {
            let result = self
                .bounded(entry, "on_error", entry.interceptor.on_error(ctx, error))
                .await;
            if let Err(e) = result {
                tracing::warn!(
                    plugin = %entry.plugin_id,
                    request_id = %ctx.request_id,
                    error = %e,
                    "on_error failed"
                );
            }
        }
    }

    async fn bounded<T>(
        &self,
        entry: &ChainEntry,
        hook: &'static str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        self.bounded_for(entry, hook, self.hook_timeout, fut).await
    }

    async fn bounded_for<T>(
        &self,
        entry: &ChainEntry,
        hook: &'static str,
        limit: Duration,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(limit, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e @ ProxyError::Interceptor { .. })) => Err(e),
            Ok(Err(e)) => Err(ProxyError::Interceptor {
                plugin: entry.plugin_id.clone(),
                message: e.to_string(),
            }),
            Err(_) => Err(ProxyError::HookTimeout {
                plugin: entry.plugin_id.clone(),
                hook,
            }),
        }
    }

    /// Report a hook failure to the interceptor that caused it.
    async fn isolate(&self, entry: &ChainEntry, ctx: &mut ProxyContext, error: ProxyError) {
        tracing::warn!(
            plugin = %entry.plugin_id,
            request_id = %ctx.request_id,
            error = %error,
            "Interceptor hook failed"
        );
        let result = self
            .bounded(entry, "on_error", entry.interceptor.on_error(ctx, &error))
            .await;
        if let Err(e) = result {
            tracing::warn!(plugin = %entry.plugin_id, error = %e, "on_error failed");
        }
    }
}

impl std::fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("plugins", &self.plugin_ids())
            .field("hook_timeout", &self.hook_timeout)
            .field("stop_timeout", &self.stop_timeout)
            .finish()
    }
}
