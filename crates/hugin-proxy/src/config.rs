//! Per-session proxy configuration.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use hugin_metrics::SyncConfig;

/// Default upstream for Anthropic-compatible agents.
pub const ANTHROPIC_API_URL: &str = "https://api.anthropic.com";

/// Paths blocked unless configured otherwise.
pub const DEFAULT_BLOCKED_PATHS: &[&str] = &["/api/event_logging/batch"];

/// Placeholder replaced by the credential in [`CustomHeader::value_format`].
pub const TOKEN_PLACEHOLDER: &str = "{token}";

/// Static credentials injected into upstream requests.
///
/// An API key and SSO cookies are mutually exclusive.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// API key, sent via the custom header or `Authorization: Bearer`.
    ApiKey(String),
    /// Cookie name to value, sent as a `Cookie` header.
    SsoCookies(BTreeMap<String, String>),
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::ApiKey(_) => f.write_str("ApiKey(<redacted>)"),
            Credentials::SsoCookies(cookies) => f
                .debug_tuple("SsoCookies")
                .field(&cookies.keys().collect::<Vec<_>>())
                .finish(),
        }
    }
}

/// Custom auth header: name plus a value template containing `{token}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomHeader {
    pub name: String,
    pub value_format: String,
}

impl CustomHeader {
    pub fn new(name: impl Into<String>, value_format: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value_format: value_format.into(),
        }
    }

    /// Header value for a token.
    pub fn render(&self, token: &str) -> String {
        self.value_format.replace(TOKEN_PLACEHOLDER, token)
    }
}

/// Configuration for one proxy instance. Immutable once the server is built.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address to bind the listener to.
    pub bind_addr: SocketAddr,
    /// Upstream API base URL.
    pub target_url: String,
    pub session_id: String,
    pub agent_name: String,
    pub credentials: Option<Credentials>,
    pub custom_header: Option<CustomHeader>,
    /// Bound on the wait for upstream response headers.
    pub request_timeout: Duration,
    /// Bound on every interceptor hook call except `on_proxy_stop`.
    pub hook_timeout: Duration,
    /// Bound on each `on_proxy_stop` call, which includes the final sync flush.
    pub stop_timeout: Duration,
    /// Paths answered locally with an empty 200.
    pub blocked_paths: Vec<String>,
    /// Session directory for metrics and conversation files. Metrics are off when unset.
    pub metrics_dir: Option<PathBuf>,
    /// Remote sync settings. Sync is off when unset.
    pub sync: Option<SyncConfig>,
    /// Period of the background metrics sync.
    pub sync_interval: Duration,
    /// Whether to add the HTTP trace layer.
    pub enable_tracing: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            target_url: ANTHROPIC_API_URL.to_string(),
            session_id: "default".to_string(),
            agent_name: "claude".to_string(),
            credentials: None,
            custom_header: None,
            request_timeout: Duration::from_secs(300),
            hook_timeout: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(120),
            blocked_paths: DEFAULT_BLOCKED_PATHS.iter().map(|p| p.to_string()).collect(),
            metrics_dir: None,
            sync: None,
            sync_interval: Duration::from_secs(120),
            enable_tracing: true,
        }
    }
}

impl ProxyConfig {
    /// Create a config for a session forwarding to `target_url`.
    pub fn new(target_url: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            target_url: target_url.into(),
            session_id: session_id.into(),
            ..Default::default()
        }
    }

    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn with_agent_name(mut self, name: impl Into<String>) -> Self {
        self.agent_name = name.into();
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.credentials = Some(Credentials::ApiKey(key.into()));
        self
    }

    pub fn with_sso_cookies(mut self, cookies: BTreeMap<String, String>) -> Self {
        self.credentials = Some(Credentials::SsoCookies(cookies));
        self
    }

    pub fn with_custom_header(mut self, header: CustomHeader) -> Self {
        self.custom_header = Some(header);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_hook_timeout(mut self, timeout: Duration) -> Self {
        self.hook_timeout = timeout;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn with_blocked_paths(mut self, paths: Vec<String>) -> Self {
        self.blocked_paths = paths;
        self
    }

    /// Enable metrics, writing session files under `dir`.
    pub fn with_metrics_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.metrics_dir = Some(dir.into());
        self
    }

    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = Some(sync);
        self
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    pub fn with_tracing(mut self, enable: bool) -> Self {
        self.enable_tracing = enable;
        self
    }

    /// Upstream URL for a request path (including any query string).
    pub fn upstream_url(&self, path_and_query: &str) -> String {
        format!("{}{}", self.target_url.trim_end_matches('/'), path_and_query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProxyConfig::default();
        assert_eq!(config.target_url, ANTHROPIC_API_URL);
        assert_eq!(config.bind_addr.port(), 0);
        assert_eq!(config.blocked_paths, vec!["/api/event_logging/batch"]);
        assert!(config.metrics_dir.is_none());
        assert!(config.sync.is_none());
    }

    #[test]
    fn test_credentials_are_exclusive() {
        let mut cookies = BTreeMap::new();
        cookies.insert("session".to_string(), "abc".to_string());

        let config = ProxyConfig::default()
            .with_api_key("sk-test")
            .with_sso_cookies(cookies);
        assert!(matches!(config.credentials, Some(Credentials::SsoCookies(_))));
    }

    #[test]
    fn test_credentials_debug_is_redacted() {
        let debug = format!("{:?}", Credentials::ApiKey("sk-secret".into()));
        assert!(!debug.contains("sk-secret"));
    }

    #[test]
    fn test_custom_header_render() {
        let header = CustomHeader::new("x-api-key", "{token}");
        assert_eq!(header.render("sk-1"), "sk-1");

        let header = CustomHeader::new("Authorization", "Token {token}");
        assert_eq!(header.render("abc"), "Token abc");
    }

    #[test]
    fn test_upstream_url() {
        let config = ProxyConfig::new("http://localhost:9000/", "s1");
        assert_eq!(
            config.upstream_url("/v1/messages?beta=true"),
            "http://localhost:9000/v1/messages?beta=true"
        );
    }
}
