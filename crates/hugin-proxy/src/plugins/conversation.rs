//! Ships conversation messages to the sync API as they grow.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::http::Method;
use hugin_metrics::{ConversationBatch, ConversationStatus, ConversationWriter, SyncClient};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::context::{ProxyContext, ResponseSummary};
use crate::error::{ProxyError, Result};
use crate::interceptor::Interceptor;
use crate::plugin::{Plugin, PluginContext};

pub(crate) const ID: &str = "conversation-sync";

/// Request messages stashed until the response completes.
#[derive(Debug, Clone)]
struct OutboundMessages {
    model: Option<String>,
    messages: Vec<Value>,
}

pub struct ConversationSyncPlugin;

impl Plugin for ConversationSyncPlugin {
    fn id(&self) -> &str {
        ID
    }

    fn name(&self) -> &str {
        "Conversation sync"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn priority(&self) -> i32 {
        110
    }

    fn dependencies(&self) -> Vec<String> {
        vec![super::metrics::ID.to_string()]
    }

    fn create_interceptor(&self, ctx: &PluginContext) -> Result<Arc<dyn Interceptor>> {
        let client = ctx
            .sync
            .clone()
            .ok_or_else(|| ProxyError::Configuration("sync not configured".into()))?;
        let writer = ctx
            .conversations
            .clone()
            .ok_or_else(|| ProxyError::Configuration("metrics directory not configured".into()))?;
        Ok(Arc::new(ConversationSync {
            shared: Arc::new(Shared {
                client,
                writer,
                session_id: ctx.config.session_id.clone(),
                agent_name: ctx.config.agent_name.clone(),
                send_lock: tokio::sync::Mutex::new(()),
            }),
            tasks: Mutex::new(Vec::new()),
            span: ctx.span().clone(),
        }))
    }
}

struct Shared {
    client: SyncClient,
    writer: ConversationWriter,
    session_id: String,
    agent_name: String,
    /// One send at a time, so index ranges never overlap.
    send_lock: tokio::sync::Mutex<()>,
}

impl Shared {
    async fn send_new(&self, outbound: OutboundMessages) {
        let _guard = self.send_lock.lock().await;

        let conversation_id = self.session_id.clone();
        let from = match self.writer.last_synced_index(&conversation_id) {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read conversation file");
                return;
            }
        };
        let to = outbound.messages.len();
        if to <= from {
            return;
        }

        let batch = ConversationBatch {
            conversation_id,
            session_id: self.session_id.clone(),
            agent_name: self.agent_name.clone(),
            model: outbound.model,
            from_index: from,
            to_index: to,
            messages: outbound.messages[from..].to_vec(),
        };
        match self.client.send_conversation(&self.writer, batch).await {
            Ok(record) if record.status == ConversationStatus::Success => {
                tracing::debug!(from_index = from, to_index = to, "Conversation synced");
            }
            Ok(record) => {
                tracing::warn!(
                    from_index = from,
                    to_index = to,
                    error = record.error.as_deref().unwrap_or(""),
                    "Conversation sync failed"
                );
            }
            Err(e) => tracing::warn!(error = %e, "Failed to persist conversation record"),
        }
    }
}

struct ConversationSync {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    span: tracing::Span,
}

fn is_messages_call(ctx: &ProxyContext) -> bool {
    ctx.method == Method::POST && ctx.path_only().ends_with("/messages")
}

#[async_trait]
impl Interceptor for ConversationSync {
    async fn on_request(&self, ctx: &mut ProxyContext) -> Result<()> {
        if !is_messages_call(ctx) {
            return Ok(());
        }
        let Some(body) = ctx.body_json() else {
            return Ok(());
        };
        let Some(messages) = body.get("messages").and_then(Value::as_array) else {
            return Ok(());
        };
        ctx.extensions.insert(OutboundMessages {
            model: body.get("model").and_then(Value::as_str).map(String::from),
            messages: messages.clone(),
        });
        Ok(())
    }

    async fn on_response_complete(
        &self,
        ctx: &mut ProxyContext,
        summary: &ResponseSummary,
    ) -> Result<()> {
        if !summary.status.is_success() {
            return Ok(());
        }
        let Some(outbound) = ctx.extensions.remove::<OutboundMessages>() else {
            return Ok(());
        };

        let shared = self.shared.clone();
        let handle = tokio::spawn(
            async move { shared.send_new(outbound).await }.instrument(self.span.clone()),
        );

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
        Ok(())
    }

    async fn on_proxy_stop(&self) -> Result<()> {
        let pending: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        for handle in pending {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Conversation sync task failed");
            }
        }
        Ok(())
    }
}
