//! Configuration file support for hugin.
//!
//! All hugin data lives in a `.hugin/` directory:
//! - `.hugin/config.toml` - configuration file
//! - `.hugin/sessions/<id>/` - per-session log, metrics and conversation files
//!
//! Discovery searches for `.hugin/config.toml` starting from the current directory and walking
//! up to parent directories.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use hugin_metrics::SyncConfig;
use hugin_proxy::{ANTHROPIC_API_URL, BUILTIN_PLUGIN_IDS, Credentials, CustomHeader, ProxyConfig};
use serde::{Deserialize, Serialize};

/// The hugin data directory name.
pub const HUGIN_DIR: &str = ".hugin";
/// The config file name within the hugin directory.
pub const CONFIG_FILE: &str = "config.toml";

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub proxy: ProxySection,
    pub auth: AuthConfig,
    pub metrics: MetricsConfig,
    pub sync: SyncSection,
    pub plugins: PluginsConfig,
}

/// `[proxy]` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxySection {
    /// Upstream base URL. Defaults per agent when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_url: Option<String>,
    pub host: String,
    /// 0 picks a free port.
    pub port: u16,
    pub request_timeout_secs: u64,
    pub hook_timeout_secs: u64,
    /// Bound on plugin stop hooks, including the final sync flush.
    pub stop_timeout_secs: u64,
    pub blocked_paths: Vec<String>,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            target_url: None,
            host: "127.0.0.1".to_string(),
            port: 0,
            request_timeout_secs: 300,
            hook_timeout_secs: 10,
            stop_timeout_secs: 120,
            blocked_paths: hugin_proxy::DEFAULT_BLOCKED_PATHS
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }
}

/// `[auth]` section. `api_key` and `sso_cookies` are mutually exclusive.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sso_cookies: Option<BTreeMap<String, String>>,
    /// Custom header carrying the API key instead of `Authorization: Bearer`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header_name: Option<String>,
    /// Value template for `header_name`, containing `{token}`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_format: Option<String>,
}

/// `[metrics]` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// `[sync]` section. Sync is disabled without a `base_url`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SyncSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub retry_delays_ms: Vec<u64>,
    pub interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            base_url: None,
            token: None,
            batch_size: 50,
            max_attempts: 3,
            retry_delays_ms: vec![1000, 2000, 5000],
            interval_secs: 120,
            timeout_secs: 30,
        }
    }
}

/// `[plugins]` section.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PluginsConfig {
    /// Built-in plugin ids to leave out.
    pub disabled: Vec<String>,
}

/// Configuration validation error.
#[derive(Debug, Clone)]
pub struct ConfigValidationError {
    pub field: String,
    pub message: String,
}

impl ConfigValidationError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ConfigValidationError {}

impl Config {
    /// Load configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Find and load configuration from the current or a parent directory.
    ///
    /// Returns the config and its `.hugin` directory.
    pub fn find_and_load() -> Result<Option<(Self, PathBuf)>> {
        let current = std::env::current_dir()?;
        Self::find_and_load_from(&current)
    }

    /// Find and load configuration starting from a specific directory.
    pub fn find_and_load_from(start: &Path) -> Result<Option<(Self, PathBuf)>> {
        let mut dir = start.to_path_buf();

        loop {
            let hugin_dir = dir.join(HUGIN_DIR);
            let config_path = hugin_dir.join(CONFIG_FILE);
            if config_path.exists() {
                let config = Self::from_file(&config_path)?;
                return Ok(Some((config, hugin_dir)));
            }

            if !dir.pop() {
                break;
            }
        }

        Ok(None)
    }

    /// Get the config file path for a given .hugin directory.
    pub fn config_path(hugin_dir: &Path) -> PathBuf {
        hugin_dir.join(CONFIG_FILE)
    }

    /// Validate the configuration.
    ///
    /// Returns a list of validation errors if any are found.
    pub fn validate(&self) -> Vec<ConfigValidationError> {
        let mut errors = Vec::new();

        if let Some(url) = &self.proxy.target_url {
            if url.trim().is_empty() {
                errors.push(ConfigValidationError::new(
                    "proxy.target_url",
                    "Target URL cannot be empty.",
                ));
            } else if !url.starts_with("http://") && !url.starts_with("https://") {
                errors.push(ConfigValidationError::new(
                    "proxy.target_url",
                    format!("Target URL '{}' must start with http:// or https://.", url),
                ));
            }
        }

        if self.auth.api_key.is_some() && self.auth.sso_cookies.is_some() {
            errors.push(ConfigValidationError::new(
                "auth",
                "Set either api_key or sso_cookies, not both.",
            ));
        }

        if let Some(format) = &self.auth.value_format {
            if !format.contains(hugin_proxy::TOKEN_PLACEHOLDER) {
                errors.push(ConfigValidationError::new(
                    "auth.value_format",
                    format!("Value format must contain {}.", hugin_proxy::TOKEN_PLACEHOLDER),
                ));
            }
        }

        if self.sync.batch_size == 0 {
            errors.push(ConfigValidationError::new(
                "sync.batch_size",
                "Batch size must be at least 1.",
            ));
        }

        if self.sync.max_attempts == 0 {
            errors.push(ConfigValidationError::new(
                "sync.max_attempts",
                "Max attempts must be at least 1.",
            ));
        }

        for id in &self.plugins.disabled {
            if !BUILTIN_PLUGIN_IDS.contains(&id.as_str()) {
                errors.push(ConfigValidationError::new(
                    "plugins.disabled",
                    format!(
                        "Unknown plugin '{}'. Expected one of: {}.",
                        id,
                        BUILTIN_PLUGIN_IDS.join(", ")
                    ),
                ));
            }
        }

        errors
    }

    /// Credentials to inject. SSO cookies win over an API key; `env_api_key` fills in when the
    /// file has no key.
    pub fn credentials(&self, env_api_key: Option<String>) -> Option<Credentials> {
        if let Some(cookies) = self.auth.sso_cookies.as_ref().filter(|c| !c.is_empty()) {
            return Some(Credentials::SsoCookies(cookies.clone()));
        }
        self.auth
            .api_key
            .clone()
            .or(env_api_key)
            .filter(|k| !k.is_empty())
            .map(Credentials::ApiKey)
    }

    /// Sync client settings, when a base URL is configured.
    pub fn sync_config(&self, retry_failed: bool) -> Option<SyncConfig> {
        let base_url = self.sync.base_url.as_ref()?;
        let mut sync = SyncConfig::new(base_url.clone())
            .with_batch_size(self.sync.batch_size)
            .with_max_attempts(self.sync.max_attempts)
            .with_retry_delays(
                self.sync
                    .retry_delays_ms
                    .iter()
                    .map(|ms| Duration::from_millis(*ms))
                    .collect(),
            )
            .with_timeout(Duration::from_secs(self.sync.timeout_secs))
            .with_retry_failed(retry_failed);
        if let Some(token) = &self.sync.token {
            sync = sync.with_token(token.clone());
        }
        Some(sync)
    }

    /// Build the proxy configuration for one session.
    pub fn proxy_config(
        &self,
        target_url: &str,
        session_id: &str,
        agent_name: &str,
        bind_addr: SocketAddr,
        session_dir: &Path,
        env_api_key: Option<String>,
    ) -> ProxyConfig {
        let mut config = ProxyConfig::new(target_url, session_id)
            .with_bind_addr(bind_addr)
            .with_agent_name(agent_name)
            .with_request_timeout(Duration::from_secs(self.proxy.request_timeout_secs))
            .with_hook_timeout(Duration::from_secs(self.proxy.hook_timeout_secs))
            .with_stop_timeout(Duration::from_secs(self.proxy.stop_timeout_secs))
            .with_blocked_paths(self.proxy.blocked_paths.clone())
            .with_sync_interval(Duration::from_secs(self.sync.interval_secs));

        match self.credentials(env_api_key) {
            Some(Credentials::ApiKey(key)) => config = config.with_api_key(key),
            Some(Credentials::SsoCookies(cookies)) => config = config.with_sso_cookies(cookies),
            None => {}
        }
        if let Some(name) = &self.auth.header_name {
            let format = self
                .auth
                .value_format
                .clone()
                .unwrap_or_else(|| hugin_proxy::TOKEN_PLACEHOLDER.to_string());
            config = config.with_custom_header(CustomHeader::new(name.clone(), format));
        }
        if self.metrics.enabled {
            config = config.with_metrics_dir(session_dir);
        }
        if let Some(sync) = self.sync_config(false) {
            config = config.with_sync(sync);
        }
        config
    }

    /// Upstream URL for an agent: the configured one, else the agent's usual API.
    pub fn target_url_for(&self, agent: &str) -> String {
        if let Some(url) = &self.proxy.target_url {
            return url.clone();
        }
        match agent {
            "codex" => "https://api.openai.com".to_string(),
            "gemini" => "https://generativelanguage.googleapis.com".to_string(),
            _ => ANTHROPIC_API_URL.to_string(),
        }
    }
}
