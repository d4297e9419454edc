use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

use crate::accumulator::{AccumulationResult, StreamAccumulator};
use crate::types::{normalize_upstream_status, BanterError, ChatMessage, Result};

/// One turn in the provider's input shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderMessage {
    pub role: String,
    pub content: String,
}

impl From<&ChatMessage> for ProviderMessage {
    fn from(msg: &ChatMessage) -> Self {
        Self {
            role: if msg.is_user { "user" } else { "assistant" }.to_string(),
            content: msg.content.clone(),
        }
    }
}

#[derive(Serialize)]
struct CreateResponseBody<'a> {
    model: &'a str,
    input: &'a [ProviderMessage],
    store: bool,
}

#[derive(Deserialize)]
struct CreateResponseReply {
    id: String,
}

/// Thin client for the upstream LLM API: create a stored response, then open
/// its SSE event stream. Non-2xx statuses are normalized here, at the
/// boundary, so every caller sees the edge contract's status set.
#[derive(Clone)]
pub struct ProviderClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl ProviderClient {
    pub fn new(client: reqwest::Client, api_key: String, base_url: String, model: String) -> Self {
        Self {
            client,
            api_key,
            base_url,
            model,
        }
    }

    pub async fn create_response(&self, input: &[ProviderMessage]) -> Result<String> {
        let response = self
            .client
            .post(format!("{}/responses", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&CreateResponseBody {
                model: &self.model,
                input,
                store: true,
            })
            .send()
            .await
            .map_err(BanterError::Network)?;

        let status = response.status();
        if !status.is_success() {
            let body = match response.text().await {
                Ok(t) => t,
                Err(_) => "Unknown upstream error (body unreadable)".to_string(),
            };
            tracing::error!("[☁️  -> ⚙️ ] Create response failed ({}): {}", status, body);
            return Err(BanterError::Upstream(normalize_upstream_status(status), body).into());
        }

        let reply: CreateResponseReply = response.json().await.map_err(BanterError::Network)?;
        Ok(reply.id)
    }

    pub async fn open_stream(&self, response_id: &str) -> Result<reqwest::Response> {
        let response = self
            .client
            .get(format!("{}/responses/{}/events", self.base_url, response_id))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(BanterError::Network)?;

        let status = response.status();
        if !status.is_success() {
            let body = match response.text().await {
                Ok(t) => t,
                Err(_) => "Unknown upstream error (body unreadable)".to_string(),
            };
            tracing::error!("[☁️  -> ⚙️ ] Open stream failed ({}): {}", status, body);
            return Err(BanterError::Upstream(normalize_upstream_status(status), body).into());
        }

        Ok(response)
    }

    /// Create + open in one call.
    pub async fn stream_for(&self, input: &[ProviderMessage]) -> Result<reqwest::Response> {
        let response_id = self.create_response(input).await?;
        tracing::debug!(
            "[⚙️  -> ☁️ ] Opening event stream for response [{}...]",
            crate::str_utils::prefix_chars(&response_id, 8)
        );
        self.open_stream(&response_id).await
    }

    /// Non-streaming mode: open the stream anyway and drain it fully
    /// server-side through the accumulator.
    pub async fn complete(&self, input: &[ProviderMessage]) -> Result<AccumulationResult> {
        let response = self.stream_for(input).await?;
        let bytes_stream = response
            .bytes_stream()
            .map(|r| r.map_err(std::io::Error::other));
        Ok(StreamAccumulator::new().accumulate_bytes(bytes_stream).await)
    }
}
