use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use crate::types::ChatSession;
use crate::AppState;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RealtimeEventType {
    #[serde(rename = "INSERT")]
    Insert,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
}

/// A change notification for the sessions table, in the shape realtime
/// subscribers consume: `{eventType, new?, old?}`. UPDATE payloads double as
/// reconciler patches on the receiving side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeEvent {
    #[serde(rename = "eventType")]
    pub event_type: RealtimeEventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new: Option<ChatSession>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old: Option<ChatSession>,
}

impl RealtimeEvent {
    pub fn insert(row: ChatSession) -> Self {
        Self {
            event_type: RealtimeEventType::Insert,
            new: Some(row),
            old: None,
        }
    }

    pub fn update(old: ChatSession, new: ChatSession) -> Self {
        Self {
            event_type: RealtimeEventType::Update,
            new: Some(new),
            old: Some(old),
        }
    }

    pub fn delete(row: ChatSession) -> Self {
        Self {
            event_type: RealtimeEventType::Delete,
            new: None,
            old: Some(row),
        }
    }
}

pub type RealtimeHub = broadcast::Sender<RealtimeEvent>;

/// Fan a change out to every subscriber. No receivers is not an error.
pub fn publish(hub: &RealtimeHub, event: RealtimeEvent) {
    let _ = hub.send(event);
}

/// Long-lived SSE subscription over the broadcast hub. Slow subscribers that
/// lag the ring buffer lose the missed events and keep going; the reconciler
/// on the client side absorbs the gap.
pub async fn realtime_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let rx = state.tx_realtime.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|result| async move {
        match result {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => Some(Ok(Event::default().data(json))),
                Err(e) => {
                    tracing::warn!("Failed to serialize realtime event: {}", e);
                    None
                }
            },
            Err(BroadcastStreamRecvError::Lagged(missed)) => {
                tracing::warn!(
                    "[⚙️  -> 🖱️ ] Realtime subscriber lagged; dropped {} events",
                    missed
                );
                None
            }
        }
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text(": keepalive"),
    )
}
