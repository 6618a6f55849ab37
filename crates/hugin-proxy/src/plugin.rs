//! Plugins: identity, ordering and an interceptor factory.

use std::sync::Arc;

use hugin_metrics::{ConversationWriter, DeltaWriter, SyncClient};

use crate::config::{Credentials, ProxyConfig};
use crate::error::Result;
use crate::interceptor::Interceptor;

/// A proxy plugin.
///
/// `priority` orders plugins ascending (ties by registration order); `dependencies` names
/// plugin ids that must run earlier. `create_interceptor` returning an error disables the plugin
/// for the lifetime of the proxy.
pub trait Plugin: Send + Sync {
    fn id(&self) -> &str;

    fn name(&self) -> &str;

    /// Semantic version of the plugin.
    fn version(&self) -> &str;

    fn priority(&self) -> i32;

    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    fn create_interceptor(&self, ctx: &PluginContext) -> Result<Arc<dyn Interceptor>>;
}

/// Everything a plugin factory may need.
#[derive(Clone)]
pub struct PluginContext {
    pub config: Arc<ProxyConfig>,
    /// Session metrics writer, when metrics are enabled.
    pub deltas: Option<DeltaWriter>,
    /// Session conversation writer, when metrics are enabled.
    pub conversations: Option<ConversationWriter>,
    /// Sync API client, when sync is configured.
    pub sync: Option<SyncClient>,
    span: tracing::Span,
}

impl PluginContext {
    pub fn new(config: Arc<ProxyConfig>) -> Self {
        Self {
            config,
            deltas: None,
            conversations: None,
            sync: None,
            span: tracing::Span::none(),
        }
    }

    pub fn with_deltas(mut self, writer: DeltaWriter) -> Self {
        self.deltas = Some(writer);
        self
    }

    pub fn with_conversations(mut self, writer: ConversationWriter) -> Self {
        self.conversations = Some(writer);
        self
    }

    pub fn with_sync(mut self, client: SyncClient) -> Self {
        self.sync = Some(client);
        self
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.config.credentials.as_ref()
    }

    /// The plugin's logger. Enter it or pass it to `Instrument` for plugin-scoped events.
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    /// Copy of this context with a span scoped to one plugin.
    pub fn for_plugin(&self, plugin_id: &str) -> Self {
        let mut ctx = self.clone();
        ctx.span = tracing::info_span!(
            "plugin",
            plugin = %plugin_id,
            session_id = %self.config.session_id
        );
        ctx
    }
}

impl std::fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContext")
            .field("session_id", &self.config.session_id)
            .field("deltas", &self.deltas.as_ref().map(|w| w.path().to_path_buf()))
            .field("sync", &self.sync.is_some())
            .finish()
    }
}
