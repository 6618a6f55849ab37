//! Forwarding to the upstream API.

use std::time::Duration;

use axum::http::HeaderMap;
use axum::http::header;
use reqwest::Client;

use crate::context::ProxyContext;
use crate::error::{ProxyError, Result};

/// Connection-scoped headers never forwarded in either direction.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// HTTP client for the upstream API.
#[derive(Debug, Clone)]
pub struct Upstream {
    client: Client,
    timeout: Duration,
}

impl Upstream {
    /// Create a client. `timeout` bounds the wait for response headers, not the body.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ProxyError::Configuration(format!("upstream client: {}", e)))?;
        Ok(Self { client, timeout })
    }

    /// Send the (possibly rewritten) request in `ctx` to `url`.
    pub async fn send(&self, url: &str, ctx: &ProxyContext) -> Result<reqwest::Response> {
        let mut request = self
            .client
            .request(ctx.method.clone(), url)
            .headers(request_headers(&ctx.headers));
        if let Some(body) = &ctx.body {
            request = request.body(body.clone());
        }

        tracing::debug!(
            request_id = %ctx.request_id,
            method = %ctx.method,
            url = %url,
            "Forwarding request"
        );

        match tokio::time::timeout(self.timeout, request.send()).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) if e.is_timeout() => Err(ProxyError::UpstreamTimeout(self.timeout)),
            Ok(Err(e)) => Err(ProxyError::Upstream(e.to_string())),
            Err(_) => Err(ProxyError::UpstreamTimeout(self.timeout)),
        }
    }
}

/// Headers to send upstream.
///
/// Drops hop-by-hop headers, `host` and `content-length` (both recomputed by the client), and
/// `accept-encoding` so response bodies reach the interceptors uncompressed.
pub fn request_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = strip_hop_by_hop(headers);
    out.remove(header::HOST);
    out.remove(header::CONTENT_LENGTH);
    out.remove(header::ACCEPT_ENCODING);
    out
}

/// Headers to send back to the client.
///
/// `content-length` is dropped because chunk interceptors may change the body length.
pub fn response_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = strip_hop_by_hop(headers);
    out.remove(header::CONTENT_LENGTH);
    out
}

fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    // Headers named by the Connection header are hop-by-hop too
    let named: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    let mut out = headers.clone();
    for name in HOP_BY_HOP {
        out.remove(*name);
    }
    for name in named {
        out.remove(name.as_str());
    }
    out
}
