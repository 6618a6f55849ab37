//! hugin-proxy: local reverse proxy with a prioritized plugin pipeline
//!
//! This crate sits between an agent CLI and its upstream API:
//! - Transparent forwarding with streamed response bodies and backpressure
//! - Plugins ordered by priority, registration order and declared dependencies
//! - Interceptor hooks over the request lifecycle, each bounded by a timeout
//! - Failure isolation: a failing interceptor never breaks the request
//! - Built-in plugins for endpoint blocking, credentials, usage metrics and sync

pub mod chain;
pub mod config;
pub mod context;
pub mod error;
pub mod interceptor;
pub mod plugin;
pub mod plugins;
pub mod registry;
pub mod server;
pub mod upstream;

// Testing utilities - available in test builds and behind the `testing` feature
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use chain::{ChainEntry, InterceptorChain};
pub use config::{
    ANTHROPIC_API_URL, Credentials, CustomHeader, DEFAULT_BLOCKED_PATHS, ProxyConfig,
    TOKEN_PLACEHOLDER,
};
pub use context::{BLOCKED_KEY, ProxyContext, RequestPhase, ResponseHead, ResponseSummary};
pub use error::{ProxyError, Result};
pub use interceptor::Interceptor;
pub use plugin::{Plugin, PluginContext};
pub use plugins::{BUILTIN_PLUGIN_IDS, UsageObservation, builtin_registry};
pub use registry::PluginRegistry;
pub use server::{HEALTH_PATH, ProxyServer};
pub use upstream::Upstream;
