//! Injects static credentials into upstream requests.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::header::{AUTHORIZATION, COOKIE};
use axum::http::{HeaderName, HeaderValue};

use crate::config::Credentials;
use crate::context::ProxyContext;
use crate::error::{ProxyError, Result};
use crate::interceptor::Interceptor;
use crate::plugin::{Plugin, PluginContext};

pub(crate) const ID: &str = "auth";

/// Inbound headers replaced when an API key is injected.
const API_KEY_HEADERS: &[&str] = &["authorization", "x-api-key"];

pub struct AuthPlugin;

impl Plugin for AuthPlugin {
    fn id(&self) -> &str {
        ID
    }

    fn name(&self) -> &str {
        "Credential injection"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn priority(&self) -> i32 {
        10
    }

    fn create_interceptor(&self, ctx: &PluginContext) -> Result<Arc<dyn Interceptor>> {
        let credentials = ctx
            .credentials()
            .ok_or_else(|| ProxyError::Configuration("no credentials configured".into()))?;

        let (name, value, replaces) = match credentials {
            Credentials::ApiKey(key) => match &ctx.config.custom_header {
                Some(custom) => {
                    let name = header_name(&custom.name)?;
                    let mut replaces = vec![name.clone()];
                    replaces.extend(API_KEY_HEADERS.iter().map(|h| HeaderName::from_static(*h)));
                    (name, custom.render(key), replaces)
                }
                None => (
                    AUTHORIZATION,
                    format!("Bearer {}", key),
                    API_KEY_HEADERS
                        .iter()
                        .map(|h| HeaderName::from_static(*h))
                        .collect(),
                ),
            },
            Credentials::SsoCookies(cookies) => {
                if cookies.is_empty() {
                    return Err(ProxyError::Configuration("empty SSO cookie set".into()));
                }
                let value = cookies
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect::<Vec<_>>()
                    .join("; ");
                (COOKIE, value, vec![COOKIE])
            }
        };

        let mut value = HeaderValue::from_str(&value)
            .map_err(|e| ProxyError::Configuration(format!("invalid credential value: {}", e)))?;
        value.set_sensitive(true);

        Ok(Arc::new(AuthInterceptor {
            name,
            value,
            replaces,
        }))
    }
}

fn header_name(name: &str) -> Result<HeaderName> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| ProxyError::Configuration(format!("invalid header name {:?}: {}", name, e)))
}

struct AuthInterceptor {
    name: HeaderName,
    value: HeaderValue,
    replaces: Vec<HeaderName>,
}

#[async_trait]
impl Interceptor for AuthInterceptor {
    async fn on_request(&self, ctx: &mut ProxyContext) -> Result<()> {
        for name in &self.replaces {
            ctx.headers.remove(name);
        }
        ctx.headers.insert(self.name.clone(), self.value.clone());
        Ok(())
    }
}
