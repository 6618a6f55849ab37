//! Per-request proxy state.

use std::time::Instant;

use axum::http::{Extensions, HeaderMap, Method, StatusCode};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};

/// Metadata key that short-circuits forwarding when set to `true`.
pub const BLOCKED_KEY: &str = "blocked";

/// Lifecycle phase of a proxied request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    Idle,
    RequestReceived,
    RequestIntercepted,
    Forwarding,
    ResponseHeadersReceived,
    Streaming,
    Completed,
    Errored,
}

impl RequestPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestPhase::Completed | RequestPhase::Errored)
    }

    /// Whether `self -> next` is a legal transition.
    ///
    /// `RequestIntercepted -> Completed` is the blocked short-circuit. `Errored` is reachable
    /// from any non-terminal phase.
    pub fn can_transition_to(self, next: RequestPhase) -> bool {
        use RequestPhase::*;
        match (self, next) {
            (Idle, RequestReceived)
            | (RequestReceived, RequestIntercepted)
            | (RequestIntercepted, Forwarding)
            | (RequestIntercepted, Completed)
            | (Forwarding, ResponseHeadersReceived)
            | (ResponseHeadersReceived, Streaming)
            | (Streaming, Completed) => true,
            (from, Errored) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Mutable state for one in-flight request, passed to every hook.
#[derive(Debug)]
pub struct ProxyContext {
    pub request_id: String,
    pub session_id: String,
    pub agent_name: String,
    pub method: Method,
    /// Path including the query string.
    pub path: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub started_at: Instant,
    pub started_at_utc: DateTime<Utc>,
    /// Open map for decisions shared between plugins.
    pub metadata: serde_json::Map<String, Value>,
    /// Typed per-request plugin state.
    pub extensions: Extensions,
    phase: RequestPhase,
}

impl ProxyContext {
    pub fn new(
        config: &ProxyConfig,
        method: Method,
        path: impl Into<String>,
        headers: HeaderMap,
        body: Option<Bytes>,
    ) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            session_id: config.session_id.clone(),
            agent_name: config.agent_name.clone(),
            method,
            path: path.into(),
            headers,
            body,
            started_at: Instant::now(),
            started_at_utc: Utc::now(),
            metadata: serde_json::Map::new(),
            extensions: Extensions::new(),
            phase: RequestPhase::Idle,
        }
    }

    pub fn phase(&self) -> RequestPhase {
        self.phase
    }

    /// Move to the next phase, rejecting illegal transitions.
    pub fn transition(&mut self, next: RequestPhase) -> Result<()> {
        if !self.phase.can_transition_to(next) {
            return Err(ProxyError::Internal(format!(
                "illegal phase transition {:?} -> {:?}",
                self.phase, next
            )));
        }
        tracing::trace!(request_id = %self.request_id, from = ?self.phase, to = ?next, "Phase");
        self.phase = next;
        Ok(())
    }

    /// Path without the query string.
    pub fn path_only(&self) -> &str {
        self.path.split('?').next().unwrap_or(&self.path)
    }

    /// Request the forwarding step be skipped.
    pub fn block(&mut self) {
        self.metadata.insert(BLOCKED_KEY.to_string(), Value::Bool(true));
    }

    pub fn is_blocked(&self) -> bool {
        self.metadata.get(BLOCKED_KEY).and_then(Value::as_bool) == Some(true)
    }

    /// Request body parsed as JSON, if it is JSON.
    pub fn body_json(&self) -> Option<Value> {
        self.body
            .as_ref()
            .and_then(|b| serde_json::from_slice(b).ok())
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }
}

/// Upstream response status and headers, as seen by `on_response_headers`.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl ResponseHead {
    /// Whether the body is a server-sent event stream.
    pub fn is_event_stream(&self) -> bool {
        self.headers
            .get(axum::http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"))
    }
}

/// Final metadata passed to `on_response_complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseSummary {
    pub status: StatusCode,
    /// Bytes received from upstream.
    pub total_bytes: u64,
    /// Chunks delivered to the client after the chunk pipeline.
    pub chunks_delivered: u64,
    pub duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(path: &str) -> ProxyContext {
        ProxyContext::new(
            &ProxyConfig::new("http://upstream", "s1"),
            Method::POST,
            path,
            HeaderMap::new(),
            None,
        )
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut c = ctx("/v1/messages");
        assert_eq!(c.phase(), RequestPhase::Idle);
        for next in [
            RequestPhase::RequestReceived,
            RequestPhase::RequestIntercepted,
            RequestPhase::Forwarding,
            RequestPhase::ResponseHeadersReceived,
            RequestPhase::Streaming,
            RequestPhase::Completed,
        ] {
            c.transition(next).unwrap();
        }
        assert!(c.phase().is_terminal());
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let mut c = ctx("/");
        assert!(c.transition(RequestPhase::Streaming).is_err());

        c.transition(RequestPhase::RequestReceived).unwrap();
        c.transition(RequestPhase::Errored).unwrap();
        assert!(c.transition(RequestPhase::Errored).is_err());
        assert!(c.transition(RequestPhase::Completed).is_err());
    }

    #[test]
    fn test_blocked_short_circuit_is_legal() {
        assert!(RequestPhase::RequestIntercepted.can_transition_to(RequestPhase::Completed));
        assert!(!RequestPhase::Forwarding.can_transition_to(RequestPhase::Completed));
    }

    #[test]
    fn test_block_flag() {
        let mut c = ctx("/api/event_logging/batch?x=1");
        assert!(!c.is_blocked());
        c.block();
        assert!(c.is_blocked());
        assert_eq!(c.path_only(), "/api/event_logging/batch");
    }

    #[test]
    fn test_body_json() {
        let mut c = ctx("/v1/messages");
        assert!(c.body_json().is_none());
        c.body = Some(Bytes::from_static(br#"{"model":"m"}"#));
        assert_eq!(c.body_json().unwrap()["model"], "m");
    }
}
