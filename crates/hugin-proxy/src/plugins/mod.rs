//! Built-in plugins.

mod auth;
mod blocker;
mod conversation;
mod logger;
mod metrics;
mod session_headers;
mod sync;

pub use auth::AuthPlugin;
pub use blocker::{BlockerPlugin, PathMatcher};
pub use conversation::ConversationSyncPlugin;
pub use logger::RequestLoggerPlugin;
pub use metrics::{MetricsPlugin, UsageObservation};
pub use session_headers::{
    AGENT_HEADER, REQUEST_ID_HEADER, SESSION_ID_HEADER, SessionHeadersPlugin,
};
pub use sync::MetricsSyncPlugin;

use std::sync::Arc;

use crate::plugin::Plugin;
use crate::registry::PluginRegistry;

/// Ids of every built-in plugin, in priority order.
pub const BUILTIN_PLUGIN_IDS: &[&str] = &[
    blocker::ID,
    auth::ID,
    session_headers::ID,
    logger::ID,
    metrics::ID,
    conversation::ID,
    sync::ID,
];

/// A registry holding every built-in plugin except those listed in `disabled`.
///
/// Plugins whose requirements are not configured (credentials, metrics directory, sync) disable
/// themselves when the chain is instantiated.
pub fn builtin_registry(disabled: &[String]) -> PluginRegistry {
    let all: Vec<Arc<dyn Plugin>> = vec![
        Arc::new(BlockerPlugin),
        Arc::new(AuthPlugin),
        Arc::new(SessionHeadersPlugin),
        Arc::new(RequestLoggerPlugin),
        Arc::new(MetricsPlugin),
        Arc::new(ConversationSyncPlugin),
        Arc::new(MetricsSyncPlugin),
    ];

    let mut registry = PluginRegistry::new();
    for plugin in all {
        if disabled.iter().any(|d| d == plugin.id()) {
            tracing::debug!(plugin = %plugin.id(), "Plugin disabled by config");
            continue;
        }
        registry.register_arc(plugin);
    }
    registry
}
