//! Observes response bodies for token usage and tool calls and records one delta per response.
//!
//! Streaming responses are parsed incrementally from their `data:` lines, so chunk boundaries
//! may fall anywhere. Non-streaming JSON bodies are buffered and parsed on completion.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use hugin_metrics::{DeltaInput, DeltaWriter, TokenUsage};
use serde_json::Value;

use crate::context::{ProxyContext, ResponseHead, ResponseSummary};
use crate::error::{ProxyError, Result};
use crate::interceptor::Interceptor;
use crate::plugin::{Plugin, PluginContext};

pub(crate) const ID: &str = "metrics";

/// Largest body (or unterminated SSE line) kept for parsing.
const MAX_OBSERVED_BYTES: usize = 8 * 1024 * 1024;

/// Usage observed on one response, left in [`ProxyContext::extensions`] after completion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageObservation {
    pub message_id: Option<String>,
    pub model: Option<String>,
    pub tokens: TokenUsage,
    /// Tool names in call order.
    pub tools: Vec<String>,
    /// Whether any usage block was seen.
    pub has_usage: bool,
}

impl UsageObservation {
    fn apply_usage(&mut self, usage: &Value) {
        let Some(usage) = usage.as_object() else {
            return;
        };
        let field = |names: &[&str]| names.iter().find_map(|n| usage.get(*n)?.as_u64());

        if let Some(n) = field(&["input_tokens", "prompt_tokens"]) {
            self.tokens.input = n;
        }
        if let Some(n) = field(&["output_tokens", "completion_tokens"]) {
            self.tokens.output = n;
        }
        if let Some(n) = field(&["cache_creation_input_tokens"]) {
            self.tokens.cache_creation = n;
        }
        if let Some(n) = field(&["cache_read_input_tokens"]) {
            self.tokens.cache_read = n;
        }
        self.has_usage = true;
    }

    /// Apply one streamed event.
    fn apply_event(&mut self, event: &Value) {
        match event.get("type").and_then(Value::as_str) {
            Some("message_start") => {
                if let Some(message) = event.get("message") {
                    self.apply_message_fields(message);
                }
            }
            Some("content_block_start") => {
                if let Some(block) = event.get("content_block") {
                    self.apply_tool_block(block);
                }
            }
            Some("message_delta") => {
                if let Some(usage) = event.get("usage") {
                    self.apply_usage(usage);
                }
            }
            // Chat-completions style streams carry usage on the final chunk
            _ => {
                if let Some(usage) = event.get("usage").filter(|u| !u.is_null()) {
                    self.apply_message_fields(event);
                    self.apply_usage(usage);
                }
            }
        }
    }

    /// Apply a complete (non-streamed) response body.
    fn apply_body(&mut self, body: &Value) {
        self.apply_message_fields(body);
        if let Some(content) = body.get("content").and_then(Value::as_array) {
            for block in content {
                self.apply_tool_block(block);
            }
        }
        if let Some(choices) = body.get("choices").and_then(Value::as_array) {
            let calls = choices
                .iter()
                .filter_map(|c| c.pointer("/message/tool_calls")?.as_array())
                .flatten();
            for call in calls {
                if let Some(name) = call.pointer("/function/name").and_then(Value::as_str) {
                    self.tools.push(name.to_string());
                }
            }
        }
    }

    fn apply_message_fields(&mut self, message: &Value) {
        if let Some(id) = message.get("id").and_then(Value::as_str) {
            self.message_id.get_or_insert_with(|| id.to_string());
        }
        if let Some(model) = message.get("model").and_then(Value::as_str) {
            self.model.get_or_insert_with(|| model.to_string());
        }
        if let Some(usage) = message.get("usage") {
            self.apply_usage(usage);
        }
    }

    fn apply_tool_block(&mut self, block: &Value) {
        if block.get("type").and_then(Value::as_str) == Some("tool_use") {
            if let Some(name) = block.get("name").and_then(Value::as_str) {
                self.tools.push(name.to_string());
            }
        }
    }
}

/// Per-request parse state.
#[derive(Debug, Clone, Default)]
struct BodyObserver {
    streaming: bool,
    buffer: Vec<u8>,
    overflowed: bool,
    usage: UsageObservation,
}

impl BodyObserver {
    fn feed(&mut self, chunk: &[u8]) {
        if self.overflowed {
            return;
        }
        self.buffer.extend_from_slice(chunk);

        if self.streaming {
            while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.buffer.drain(..=pos).collect();
                self.parse_line(&line);
            }
        }

        if self.buffer.len() > MAX_OBSERVED_BYTES {
            tracing::debug!(bytes = self.buffer.len(), "Response too large to observe");
            self.buffer = Vec::new();
            self.overflowed = true;
        }
    }

    fn parse_line(&mut self, line: &[u8]) {
        let Ok(line) = std::str::from_utf8(line) else {
            return;
        };
        let Some(data) = line.trim_end().strip_prefix("data:") else {
            return;
        };
        let data = data.trim_start();
        if data.is_empty() || data == "[DONE]" {
            return;
        }
        if let Ok(event) = serde_json::from_str::<Value>(data) {
            self.usage.apply_event(&event);
        }
    }

    fn finish(mut self) -> UsageObservation {
        if self.overflowed {
            return self.usage;
        }
        if self.streaming {
            // A final line without a trailing newline
            let rest = std::mem::take(&mut self.buffer);
            self.parse_line(&rest);
        } else if let Ok(body) = serde_json::from_slice::<Value>(&self.buffer) {
            self.usage.apply_body(&body);
        }
        self.usage
    }
}

pub struct MetricsPlugin;

impl Plugin for MetricsPlugin {
    fn id(&self) -> &str {
        ID
    }

    fn name(&self) -> &str {
        "Usage metrics"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn priority(&self) -> i32 {
        100
    }

    fn create_interceptor(&self, ctx: &PluginContext) -> Result<Arc<dyn Interceptor>> {
        let writer = ctx
            .deltas
            .clone()
            .ok_or_else(|| ProxyError::Configuration("metrics directory not configured".into()))?;
        Ok(Arc::new(MetricsInterceptor { writer }))
    }
}

struct MetricsInterceptor {
    writer: DeltaWriter,
}

#[async_trait]
impl Interceptor for MetricsInterceptor {
    async fn on_response_headers(
        &self,
        ctx: &mut ProxyContext,
        head: &mut ResponseHead,
    ) -> Result<()> {
        ctx.extensions.insert(BodyObserver {
            streaming: head.is_event_stream(),
            ..Default::default()
        });
        Ok(())
    }

    async fn on_response_chunk(
        &self,
        ctx: &mut ProxyContext,
        chunk: Bytes,
    ) -> Result<Option<Bytes>> {
        if let Some(observer) = ctx.extensions.get_mut::<BodyObserver>() {
            observer.feed(&chunk);
        }
        Ok(Some(chunk))
    }

    async fn on_response_complete(
        &self,
        ctx: &mut ProxyContext,
        summary: &ResponseSummary,
    ) -> Result<()> {
        let Some(observer) = ctx.extensions.remove::<BodyObserver>() else {
            return Ok(());
        };
        let mut usage = observer.finish();
        if usage.model.is_none() {
            usage.model = ctx
                .body_json()
                .and_then(|b| b.get("model")?.as_str().map(String::from));
        }
        ctx.extensions.insert(usage.clone());

        if !usage.has_usage {
            return Ok(());
        }

        let message_id = usage.message_id.as_deref().unwrap_or(&ctx.request_id);
        let mut input = DeltaInput::new(&ctx.session_id, &ctx.agent_name, message_id)
            .with_tokens(usage.tokens)
            .with_response(ctx.path_only(), summary.status.as_u16(), summary.duration_ms);
        if let Some(model) = &usage.model {
            input = input.with_model(model);
        }
        for tool in &usage.tools {
            input = input.with_tool_call(tool);
        }

        let record_id = self.writer.append_delta(input)?;
        tracing::debug!(
            request_id = %ctx.request_id,
            record_id = %record_id,
            input_tokens = usage.tokens.input,
            output_tokens = usage.tokens.output,
            tool_calls = usage.tools.len(),
            "Recorded usage"
        );
        Ok(())
    }
}
