//! Tags upstream requests with session and request identifiers.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{HeaderName, HeaderValue};

use crate::context::ProxyContext;
use crate::error::{ProxyError, Result};
use crate::interceptor::Interceptor;
use crate::plugin::{Plugin, PluginContext};

pub(crate) const ID: &str = "session-headers";

pub const SESSION_ID_HEADER: &str = "x-hugin-session-id";
pub const AGENT_HEADER: &str = "x-hugin-agent";
pub const REQUEST_ID_HEADER: &str = "x-hugin-request-id";

pub struct SessionHeadersPlugin;

impl Plugin for SessionHeadersPlugin {
    fn id(&self) -> &str {
        ID
    }

    fn name(&self) -> &str {
        "Session headers"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn priority(&self) -> i32 {
        20
    }

    fn create_interceptor(&self, ctx: &PluginContext) -> Result<Arc<dyn Interceptor>> {
        Ok(Arc::new(SessionHeaders {
            session_id: value(&ctx.config.session_id)?,
            agent: value(&ctx.config.agent_name)?,
        }))
    }
}

fn value(s: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(s)
        .map_err(|e| ProxyError::Configuration(format!("invalid header value {:?}: {}", s, e)))
}

struct SessionHeaders {
    session_id: HeaderValue,
    agent: HeaderValue,
}

#[async_trait]
impl Interceptor for SessionHeaders {
    async fn on_request(&self, ctx: &mut ProxyContext) -> Result<()> {
        let request_id = value(&ctx.request_id)?;
        ctx.headers
            .insert(HeaderName::from_static(SESSION_ID_HEADER), self.session_id.clone());
        ctx.headers
            .insert(HeaderName::from_static(AGENT_HEADER), self.agent.clone());
        ctx.headers
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), request_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;
    use axum::http::{HeaderMap, Method};

    #[tokio::test]
    async fn test_headers_added() {
        let config = Arc::new(ProxyConfig::new("http://upstream", "2026-01-01T00-00-00_ab12"));
        let interceptor = SessionHeadersPlugin
            .create_interceptor(&PluginContext::new(config.clone()))
            .unwrap();

        let mut ctx = ProxyContext::new(&config, Method::GET, "/v1/models", HeaderMap::new(), None);
        interceptor.on_request(&mut ctx).await.unwrap();

        assert_eq!(
            ctx.headers.get(SESSION_ID_HEADER).unwrap(),
            "2026-01-01T00-00-00_ab12"
        );
        assert_eq!(ctx.headers.get(AGENT_HEADER).unwrap(), "claude");
        assert_eq!(
            ctx.headers.get(REQUEST_ID_HEADER).unwrap().to_str().unwrap(),
            ctx.request_id
        );
    }
}
