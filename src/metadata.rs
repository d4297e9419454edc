use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;

use crate::constants::{METADATA_RETRY_ATTEMPTS, METADATA_RETRY_BASE_DELAY_MS};
use crate::hardening::RetryPolicy;
use crate::main_helper::now_millis;
use crate::provider::ProviderMessage;
use crate::reconcile::{PatchTimestamp, SessionPatch};
use crate::sessions::{list_messages, reconcile_and_store};
use crate::types::{BanterError, ChatSession, Result};
use crate::AppState;

const METADATA_INSTRUCTION: &str = "Summarize this conversation. Reply with a JSON object \
    {\"name\": \"<title, at most six words>\", \"summary\": \"<one-sentence summary>\"} \
    and nothing else.";

/// How many recent turns to show the model; titles don't need full history.
const METADATA_CONTEXT_TURNS: usize = 12;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct GeneratedMetadata {
    pub name: Option<String>,
    pub session_summary: Option<String>,
}

impl GeneratedMetadata {
    fn is_empty(&self) -> bool {
        self.name.is_none() && self.session_summary.is_none()
    }
}

/// Pull {name, summary} out of the model's reply. Models wrap JSON in prose
/// often enough that we scan for the outermost braces; with no JSON at all,
/// the first line serves as a title.
pub fn parse_metadata_reply(text: &str) -> GeneratedMetadata {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return GeneratedMetadata::default();
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(&trimmed[start..=end]) {
                let name = value
                    .get("name")
                    .or_else(|| value.get("title"))
                    .and_then(|v| v.as_str())
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty());
                let summary = value
                    .get("summary")
                    .or_else(|| value.get("session_summary"))
                    .and_then(|v| v.as_str())
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty());
                if name.is_some() || summary.is_some() {
                    return GeneratedMetadata {
                        name,
                        session_summary: summary,
                    };
                }
            }
        }
    }

    let first_line = match trimmed.lines().next() {
        Some(l) => l.trim(),
        None => return GeneratedMetadata::default(),
    };
    if first_line.is_empty() {
        return GeneratedMetadata::default();
    }
    GeneratedMetadata {
        name: Some(crate::str_utils::prefix_chars(first_line, 80).to_string()),
        session_summary: None,
    }
}

fn build_prompt(history: &[crate::types::ChatMessage]) -> Vec<ProviderMessage> {
    let recent = if history.len() > METADATA_CONTEXT_TURNS {
        &history[history.len() - METADATA_CONTEXT_TURNS..]
    } else {
        history
    };
    let mut input: Vec<ProviderMessage> = recent.iter().map(ProviderMessage::from).collect();
    input.push(ProviderMessage {
        role: "user".to_string(),
        content: METADATA_INSTRUCTION.to_string(),
    });
    input
}

/// Run one metadata round trip and apply its result through the reconciler.
///
/// The patch is stamped with the time the round trip STARTED: any update
/// that lands while the model is thinking carries a later timestamp and wins
/// reconciliation, so a slow reply can never clobber newer state.
pub async fn generate_session_metadata(
    state: &AppState,
    session_id: &str,
) -> Result<ChatSession> {
    let requested_at = now_millis();

    let history = list_messages(&state.db, session_id).await?;
    if history.is_empty() {
        return Err(BanterError::InvalidIngress(format!(
            "Session {} has no messages to summarize",
            session_id
        ))
        .into());
    }

    let input = build_prompt(&history);
    let retry = RetryPolicy::new(METADATA_RETRY_ATTEMPTS, METADATA_RETRY_BASE_DELAY_MS);
    let result = retry
        .execute_with_retry(|| {
            let provider = state.provider.clone();
            let input = input.clone();
            async move { provider.complete(&input).await }
        })
        .await?;

    if !result.completed {
        tracing::warn!(
            "[☁️  -> ⚙️ ] Metadata reply for [{}...] was truncated; parsing what arrived",
            crate::str_utils::prefix_chars(session_id, 6)
        );
    }

    let generated = parse_metadata_reply(&result.text);
    if generated.is_empty() {
        tracing::warn!(
            "[⚙️ ] Metadata generation produced nothing usable for [{}...]",
            crate::str_utils::prefix_chars(session_id, 6)
        );
        return match crate::sessions::fetch_session(&state.db, session_id).await? {
            Some(s) => Ok(s),
            None => {
                Err(BanterError::NotFound(format!("Session {} not found", session_id)).into())
            }
        };
    }

    let patch = SessionPatch {
        name: generated.name,
        session_summary: generated.session_summary,
        last_updated: Some(PatchTimestamp::EpochMillis(requested_at)),
    };
    reconcile_and_store(state, session_id, &patch).await
}

/// Fire-and-forget variant used after an assistant turn persists. Failures
/// are logged, never surfaced: titles are garnish, not the meal.
pub async fn maybe_generate_metadata(state: Arc<AppState>, session_id: String) {
    let assistant_turns = match crate::sessions::count_assistant_turns(&state.db, &session_id).await
    {
        Ok(n) => n,
        Err(e) => {
            tracing::warn!("Failed to count assistant turns: {}", e);
            return;
        }
    };

    if !state.metadata_should_fire(&session_id, assistant_turns).await {
        return;
    }

    tracing::info!(
        "[⚙️  -> ☁️ ] Generating metadata for session [{}...] at turn {}",
        crate::str_utils::prefix_chars(&session_id, 6),
        assistant_turns
    );

    if let Err(e) = generate_session_metadata(&state, &session_id).await {
        tracing::warn!("Metadata generation failed: {}", e);
    }
}

pub async fn metadata_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ChatSession>> {
    let session = generate_session_metadata(&state, &id).await?;
    Ok(Json(session))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_clean_json_reply() {
        let parsed = parse_metadata_reply(r#"{"name":"Rust Questions","summary":"Borrow checker help."}"#);
        assert_eq!(parsed.name.as_deref(), Some("Rust Questions"));
        assert_eq!(parsed.session_summary.as_deref(), Some("Borrow checker help."));
    }

    #[test]
    fn test_parse_json_wrapped_in_prose() {
        let reply = "Sure! Here you go:\n{\"name\": \"Trip Planning\", \"summary\": \"Flights to Lisbon.\"}\nHope that helps.";
        let parsed = parse_metadata_reply(reply);
        assert_eq!(parsed.name.as_deref(), Some("Trip Planning"));
    }

    #[test]
    fn test_parse_falls_back_to_first_line() {
        let parsed = parse_metadata_reply("A chat about sourdough\nwith extra detail");
        assert_eq!(parsed.name.as_deref(), Some("A chat about sourdough"));
        assert_eq!(parsed.session_summary, None);
    }

    #[test]
    fn test_parse_empty_reply() {
        assert!(parse_metadata_reply("   \n  ").is_empty());
    }

    #[test]
    fn test_prompt_keeps_recent_turns_and_instruction() {
        let history: Vec<crate::types::ChatMessage> = (0..20)
            .map(|i| crate::types::ChatMessage {
                id: Some(format!("m{}", i)),
                content: format!("turn {}", i),
                is_user: i % 2 == 0,
                timestamp: None,
                image_url: None,
            })
            .collect();
        let prompt = build_prompt(&history);
        assert_eq!(prompt.len(), METADATA_CONTEXT_TURNS + 1);
        assert_eq!(prompt[0].content, "turn 8");
        assert_eq!(prompt[prompt.len() - 1].content, METADATA_INSTRUCTION);
    }
}
