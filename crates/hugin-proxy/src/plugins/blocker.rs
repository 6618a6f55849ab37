//! Answers telemetry-style endpoints locally instead of forwarding them.

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;

use crate::context::ProxyContext;
use crate::error::{ProxyError, Result};
use crate::interceptor::Interceptor;
use crate::plugin::{Plugin, PluginContext};

pub(crate) const ID: &str = "endpoint-blocker";

/// Matches request paths against configured patterns.
///
/// Matching is exact and case-insensitive on the path without its query string. A `*` segment
/// matches any single path segment.
#[derive(Debug, Clone)]
pub struct PathMatcher {
    patterns: Vec<Regex>,
}

impl PathMatcher {
    pub fn new(paths: &[String]) -> Result<Self> {
        let patterns = paths
            .iter()
            .map(|path| {
                let body = path
                    .split('/')
                    .map(|segment| {
                        if segment == "*" {
                            "[^/]+".to_string()
                        } else {
                            regex::escape(segment)
                        }
                    })
                    .collect::<Vec<_>>()
                    .join("/");
                Regex::new(&format!("(?i)^{}$", body)).map_err(|e| {
                    ProxyError::Configuration(format!("invalid blocked path {:?}: {}", path, e))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Whether `path` (query string ignored) is blocked.
    pub fn matches(&self, path: &str) -> bool {
        let path = path.split('?').next().unwrap_or(path);
        self.patterns.iter().any(|re| re.is_match(path))
    }
}

pub struct BlockerPlugin;

impl Plugin for BlockerPlugin {
    fn id(&self) -> &str {
        ID
    }

    fn name(&self) -> &str {
        "Endpoint blocker"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn priority(&self) -> i32 {
        0
    }

    fn create_interceptor(&self, ctx: &PluginContext) -> Result<Arc<dyn Interceptor>> {
        let matcher = PathMatcher::new(&ctx.config.blocked_paths)?;
        if matcher.is_empty() {
            return Err(ProxyError::Configuration("no blocked paths configured".into()));
        }
        Ok(Arc::new(BlockerInterceptor { matcher }))
    }
}

struct BlockerInterceptor {
    matcher: PathMatcher,
}

#[async_trait]
impl Interceptor for BlockerInterceptor {
    async fn on_request(&self, ctx: &mut ProxyContext) -> Result<()> {
        if self.matcher.matches(ctx.path_only()) {
            tracing::debug!(request_id = %ctx.request_id, path = %ctx.path, "Blocking request");
            ctx.block();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;
    use axum::http::{HeaderMap, Method};

    fn matcher(paths: &[&str]) -> PathMatcher {
        PathMatcher::new(&paths.iter().map(|p| p.to_string()).collect::<Vec<_>>()).unwrap()
    }

    #[test]
    fn test_exact_case_insensitive_match() {
        let m = matcher(&["/api/event_logging/batch"]);
        assert!(m.matches("/api/event_logging/batch"));
        assert!(m.matches("/API/EVENT_LOGGING/BATCH"));
        assert!(m.matches("/api/event_logging/batch?x=1"));
        assert!(!m.matches("/api/event_logging/batch/extra"));
        assert!(!m.matches("/v1/api/event_logging/batch"));
        assert!(!m.matches("/api/event_logging"));
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        let m = matcher(&["/v1/a.b"]);
        assert!(m.matches("/v1/a.b"));
        assert!(!m.matches("/v1/aXb"));
    }

    #[test]
    fn test_wildcard_segment() {
        let m = matcher(&["/v1/*/telemetry"]);
        assert!(m.matches("/v1/agents/telemetry"));
        assert!(!m.matches("/v1/a/b/telemetry"));
        assert!(!m.matches("/v1//telemetry"));
    }

    #[tokio::test]
    async fn test_interceptor_sets_blocked() {
        let config = Arc::new(ProxyConfig::default());
        let interceptor = BlockerPlugin
            .create_interceptor(&PluginContext::new(config.clone()))
            .unwrap();

        let mut blocked = ProxyContext::new(
            &config,
            Method::POST,
            "/api/event_logging/batch",
            HeaderMap::new(),
            None,
        );
        interceptor.on_request(&mut blocked).await.unwrap();
        assert!(blocked.is_blocked());

        let mut passed =
            ProxyContext::new(&config, Method::POST, "/v1/messages", HeaderMap::new(), None);
        interceptor.on_request(&mut passed).await.unwrap();
        assert!(!passed.is_blocked());
    }

    #[test]
    fn test_no_paths_disables_plugin() {
        let config = Arc::new(ProxyConfig::default().with_blocked_paths(Vec::new()));
        assert!(
            BlockerPlugin
                .create_interceptor(&PluginContext::new(config))
                .is_err()
        );
    }
}
