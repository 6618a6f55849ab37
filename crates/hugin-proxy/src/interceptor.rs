//! The interceptor contract.
//!
//! An interceptor observes and rewrites one proxy's traffic through lifecycle hooks. Every hook
//! has a no-op default, so implementations override only what they need. Hooks for a single
//! request are called sequentially in chain order; different requests may run concurrently, so
//! per-request state belongs in [`ProxyContext::extensions`], not in the interceptor.

use async_trait::async_trait;
use bytes::Bytes;

use crate::context::{ProxyContext, ResponseHead, ResponseSummary};
use crate::error::{ProxyError, Result};

#[async_trait]
pub trait Interceptor: Send + Sync {
    /// Called once before the listener accepts connections.
    async fn on_proxy_start(&self) -> Result<()> {
        Ok(())
    }

    /// Called once after graceful shutdown.
    async fn on_proxy_stop(&self) -> Result<()> {
        Ok(())
    }

    /// Inspect or rewrite the inbound request. Call [`ProxyContext::block`] to skip forwarding.
    async fn on_request(&self, _ctx: &mut ProxyContext) -> Result<()> {
        Ok(())
    }

    /// Inspect or rewrite the upstream response status and headers.
    async fn on_response_headers(
        &self,
        _ctx: &mut ProxyContext,
        _head: &mut ResponseHead,
    ) -> Result<()> {
        Ok(())
    }

    /// Transform one body chunk. `None` drops it for every later interceptor and the client.
    async fn on_response_chunk(
        &self,
        _ctx: &mut ProxyContext,
        chunk: Bytes,
    ) -> Result<Option<Bytes>> {
        Ok(Some(chunk))
    }

    /// Called after the upstream body ended.
    async fn on_response_complete(
        &self,
        _ctx: &mut ProxyContext,
        _summary: &ResponseSummary,
    ) -> Result<()> {
        Ok(())
    }

    /// Called when the request failed, or when this interceptor's own hook failed.
    async fn on_error(&self, _ctx: &mut ProxyContext, _error: &ProxyError) -> Result<()> {
        Ok(())
    }
}
