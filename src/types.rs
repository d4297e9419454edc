use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing_error::SpanTrace;

use crate::constants::{DONE_SENTINEL, PASSTHROUGH_STATUS_CODES};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SessionId(pub String);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RequestId(pub String);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct LatencyMs(pub u128);

impl fmt::Display for LatencyMs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl SessionId {
    pub fn short(&self) -> &str {
        crate::str_utils::prefix_chars(&self.0, 6)
    }
}

impl RequestId {
    pub fn short(&self) -> &str {
        crate::str_utils::prefix_chars(&self.0, 8)
    }
}

#[derive(Error, Debug)]
pub enum BanterError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid ingress payload: {0}")]
    InvalidIngress(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Upstream error (status {0}): {1}")]
    Upstream(axum::http::StatusCode, String),

    #[error("Internal error: {0}")]
    Internal(String, SpanTrace),
}

/// Clamp an upstream status to what the edge contract allows through:
/// 401/403/404/429 pass untouched, everything else becomes 503.
pub fn normalize_upstream_status(status: axum::http::StatusCode) -> axum::http::StatusCode {
    if PASSTHROUGH_STATUS_CODES.contains(&status.as_u16()) {
        status
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    }
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: BanterError,
    pub span_trace: SpanTrace,
}

impl fmt::Display for ObservedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\n\nSpan Trace:\n{}", self.inner, self.span_trace)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<BanterError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

impl axum::response::IntoResponse for ObservedError {
    fn into_response(self) -> axum::response::Response {
        let (status, msg, code) = match &self.inner {
            BanterError::Upstream(s, m) => (*s, m.clone(), "UPSTREAM_ERROR"),
            BanterError::InvalidIngress(m) => (
                axum::http::StatusCode::BAD_REQUEST,
                m.clone(),
                "INVALID_INGRESS",
            ),
            BanterError::NotFound(m) => (axum::http::StatusCode::NOT_FOUND, m.clone(), "NOT_FOUND"),
            BanterError::Network(e) => (
                axum::http::StatusCode::SERVICE_UNAVAILABLE,
                e.to_string(),
                "NETWORK_ERROR",
            ),
            BanterError::Database(e) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
                "DATABASE_ERROR",
            ),
            BanterError::Serialization(e) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
                "SERIALIZATION_ERROR",
            ),
            BanterError::Io(e) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
                "IO_ERROR",
            ),
            BanterError::Internal(m, _) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                m.clone(),
                "INTERNAL_ERROR",
            ),
        };
        (
            status,
            axum::Json(serde_json::json!({
                "error": msg,
                "code": code,
            })),
        )
            .into_response()
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;

/// --- SESSION & MESSAGE MODEL ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    pub id: String,
    pub name: Option<String>,
    /// Epoch millis of the newest accepted write; None until first touched.
    pub last_updated: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_summary: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Absent until the row is persisted; absence signals "not yet saved".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub content: String,
    pub is_user: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// --- EDGE CONTRACT ---

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub chat_id: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
}

impl ChatRequest {
    pub fn validate(&self) -> Result<()> {
        if self.chat_id.trim().is_empty() {
            return Err(BanterError::InvalidIngress("chatId is required".into()).into());
        }
        if self.messages.is_empty() {
            return Err(BanterError::InvalidIngress(
                "Request must contain at least one message".into(),
            )
            .into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
    /// Set when the upstream stream died mid-response and only a prefix of
    /// the assistant turn was recovered.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
}

/// --- STREAM WIRE TYPES ---

/// One decoded SSE frame. Order is preserved exactly as received; this layer
/// never reorders or deduplicates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StreamEvent {
    Token { delta: String },
    Image { url: String },
    Done,
    Unknown { raw: serde_json::Value },
}

/// Classify one `data:` payload into a StreamEvent.
///
/// Malformed JSON is swallowed (returns None, never an error) so a noisy
/// channel cannot fail the stream. Recognized but unclassifiable payloads
/// come back as Unknown so they stay visible in logs.
pub fn classify_stream_payload(payload: &str) -> Option<StreamEvent> {
    let trimmed = payload.trim();
    if trimmed == DONE_SENTINEL {
        return Some(StreamEvent::Done);
    }

    let value: serde_json::Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(
                "[STREAM] Swallowed malformed payload ({}): {}",
                e,
                crate::str_utils::prefix_chars(trimmed, 120)
            );
            return None;
        }
    };

    if value.get("type").and_then(|t| t.as_str()) == Some("image") {
        if let Some(url) = value.get("url").and_then(|u| u.as_str()) {
            return Some(StreamEvent::Image {
                url: url.to_string(),
            });
        }
    }

    // Direct `delta` key first, then the nested chat-completions path some
    // providers use.
    let delta = value
        .get("delta")
        .and_then(|d| d.as_str())
        .or_else(|| {
            value
                .get("choices")
                .and_then(|c| c.get(0))
                .and_then(|c| c.get("delta"))
                .and_then(|d| d.get("content"))
                .and_then(|d| d.as_str())
        })
        .map(|d| d.to_string());

    match delta {
        Some(d) if !d.is_empty() => Some(StreamEvent::Token { delta: d }),
        _ => Some(StreamEvent::Unknown { raw: value }),
    }
}
