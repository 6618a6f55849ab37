//! Debug logging of proxied traffic.

use std::sync::Arc;

use async_trait::async_trait;

use crate::context::{ProxyContext, ResponseHead, ResponseSummary};
use crate::error::{ProxyError, Result};
use crate::interceptor::Interceptor;
use crate::plugin::{Plugin, PluginContext};

pub(crate) const ID: &str = "request-logger";

pub struct RequestLoggerPlugin;

impl Plugin for RequestLoggerPlugin {
    fn id(&self) -> &str {
        ID
    }

    fn name(&self) -> &str {
        "Request logger"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn priority(&self) -> i32 {
        50
    }

    fn create_interceptor(&self, ctx: &PluginContext) -> Result<Arc<dyn Interceptor>> {
        Ok(Arc::new(RequestLogger {
            span: ctx.span().clone(),
        }))
    }
}

struct RequestLogger {
    span: tracing::Span,
}

#[async_trait]
impl Interceptor for RequestLogger {
    async fn on_request(&self, ctx: &mut ProxyContext) -> Result<()> {
        let _enter = self.span.enter();
        tracing::debug!(
            request_id = %ctx.request_id,
            method = %ctx.method,
            path = %ctx.path,
            body_bytes = ctx.body.as_ref().map_or(0, |b| b.len()),
            "Request"
        );
        Ok(())
    }

    async fn on_response_headers(
        &self,
        ctx: &mut ProxyContext,
        head: &mut ResponseHead,
    ) -> Result<()> {
        let _enter = self.span.enter();
        tracing::debug!(
            request_id = %ctx.request_id,
            status = head.status.as_u16(),
            streaming = head.is_event_stream(),
            "Response headers"
        );
        Ok(())
    }

    async fn on_response_complete(
        &self,
        ctx: &mut ProxyContext,
        summary: &ResponseSummary,
    ) -> Result<()> {
        let _enter = self.span.enter();
        tracing::debug!(
            request_id = %ctx.request_id,
            status = summary.status.as_u16(),
            total_bytes = summary.total_bytes,
            chunks = summary.chunks_delivered,
            duration_ms = summary.duration_ms,
            "Response complete"
        );
        Ok(())
    }

    async fn on_error(&self, ctx: &mut ProxyContext, error: &ProxyError) -> Result<()> {
        let _enter = self.span.enter();
        tracing::debug!(request_id = %ctx.request_id, error = %error, "Request error");
        Ok(())
    }
}
