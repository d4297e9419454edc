use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::codec::FramedRead;
use tracing::Instrument;

use crate::accumulator::{AccumulationResult, StreamAccumulator};
use crate::constants::{DONE_SENTINEL, MAX_STREAM_FRAMES};
use crate::logging::StreamMetric;
use crate::main_helper::now_millis;
use crate::provider::ProviderMessage;
use crate::realtime::{publish, RealtimeEvent};
use crate::reconcile::SessionPatch;
use crate::sessions;
use crate::types::{BanterError, ChatRequest, ChatResponse, ChatSession, Result, StreamEvent};
use crate::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamOutcome {
    Clean,
    Truncated,
}

pub struct RelayHandler;

impl RelayHandler {
    /// Relay one upstream SSE body: forward each data payload to the client
    /// channel and fold the decoded events into an accumulator, in a single
    /// pass over the bytes. Forwarding happens before folding so the relay
    /// path never waits on persistence bookkeeping.
    pub async fn handle_stream<R>(
        byte_source: R,
        state: Arc<AppState>,
        session_id: String,
        request_id: String,
        tx: mpsc::Sender<std::result::Result<Event, BanterError>>,
    ) where
        R: Stream<Item = std::result::Result<Bytes, std::io::Error>> + Unpin + Send,
    {
        let mut frames = FramedRead::new(
            tokio_util::io::StreamReader::new(byte_source),
            crate::sse::SseFrameCodec,
        );
        let mut accumulator = StreamAccumulator::new();
        let mut metrics = StreamMetric::new();
        let mut outcome = StreamOutcome::Clean;
        let mut frame_count = 0usize;

        while let Some(frame_result) = frames.next().await {
            frame_count += 1;
            if frame_count > MAX_STREAM_FRAMES {
                tracing::error!(
                    "[☁️  -> ⚙️ ] Stream exceeded max frame limit ({})",
                    MAX_STREAM_FRAMES
                );
                let _ = tx
                    .send(Err(BanterError::Internal(
                        "Stream exceeded max frame limit".to_string(),
                        tracing_error::SpanTrace::capture(),
                    )))
                    .await;
                outcome = StreamOutcome::Truncated;
                break;
            }

            match frame_result {
                Ok(frame) => {
                    metrics.record_frame();
                    let payload = match crate::sse::frame_payload(&frame) {
                        Some(p) => p.to_string(),
                        None => continue,
                    };
                    let event = crate::types::classify_stream_payload(&payload);

                    if matches!(event, Some(StreamEvent::Done)) {
                        tracing::debug!("[☁️  -> ⚙️ ] Stream end marker [DONE] received");
                        accumulator.push(&StreamEvent::Done);
                        break;
                    }

                    if tx.send(Ok(Event::default().data(payload))).await.is_err() {
                        tracing::trace!("Client disconnected, stopping relay");
                        outcome = StreamOutcome::Truncated;
                        break;
                    }

                    if let Some(event) = event {
                        metrics.record_event(&event);
                        if let StreamEvent::Unknown { raw } = &event {
                            tracing::debug!(
                                "[☁️  -> ⚙️ ] Unknown frame passed through: {}",
                                crate::str_utils::prefix_chars(&raw.to_string(), 120)
                            );
                        }
                        accumulator.push(&event);
                    }
                }
                Err(e) => {
                    tracing::error!("[☁️  -> ⚙️ ] Stream read error: {}", e);
                    let _ = tx.send(Err(BanterError::Io(e))).await;
                    outcome = StreamOutcome::Truncated;
                    break;
                }
            }
        }

        let result = match outcome {
            StreamOutcome::Clean => accumulator.finalize(),
            StreamOutcome::Truncated => accumulator.finalize_truncated(),
        };
        Self::finish_stream(state, session_id, request_id, result, &metrics, &tx).await;
    }

    async fn finish_stream(
        state: Arc<AppState>,
        session_id: String,
        request_id: String,
        result: AccumulationResult,
        metrics: &StreamMetric,
        tx: &mpsc::Sender<std::result::Result<Event, BanterError>>,
    ) {
        metrics.log_summary(result.first_chunk_latency);

        let persisted = Self::persist_turn_outcome(&state, &session_id, &result).await;

        // Release before the trigger check so the finished stream no longer
        // counts as in-flight.
        state.release_inflight(&session_id, &request_id).await;
        if persisted {
            tokio::spawn(crate::metadata::maybe_generate_metadata(
                state.clone(),
                session_id.clone(),
            ));
        }

        if tx
            .send(Ok(Event::default().data(DONE_SENTINEL)))
            .await
            .is_err()
        {
            tracing::trace!("Client disconnected, stopping stream");
        }
    }

    async fn persist_turn_outcome(
        state: &AppState,
        session_id: &str,
        result: &AccumulationResult,
    ) -> bool {
        if result.text.is_empty() && result.image_urls.is_empty() {
            tracing::warn!(
                "[⚙️ ] Upstream produced an empty stream for session [{}...]",
                crate::str_utils::prefix_chars(session_id, 6)
            );
            return false;
        }
        match Self::persist_assistant_turn(state, session_id, result).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("[⚙️ ] Failed to persist assistant turn: {}", e);
                false
            }
        }
    }

    /// Store the finalized assistant message and bump the session's
    /// last-updated through the reconciler, same as every other writer. A
    /// truncated result is stored too — partial progress is never dropped —
    /// with the truncation recorded on the row.
    async fn persist_assistant_turn(
        state: &AppState,
        session_id: &str,
        result: &AccumulationResult,
    ) -> Result<()> {
        let first_image = result.image_urls.first().map(|s| s.as_str());
        sessions::insert_message(
            &state.db,
            session_id,
            &result.text,
            false,
            first_image,
            !result.completed,
        )
        .await?;
        for extra in result.image_urls.iter().skip(1) {
            sessions::insert_message(&state.db, session_id, "", false, Some(extra), false).await?;
        }

        let patch = SessionPatch::touch(now_millis());
        sessions::reconcile_and_store(state, session_id, &patch).await?;
        Ok(())
    }
}

async fn ensure_session(state: &AppState, session_id: &str) -> Result<()> {
    if sessions::fetch_session(&state.db, session_id).await?.is_some() {
        return Ok(());
    }
    let session = ChatSession {
        id: session_id.to_string(),
        name: None,
        last_updated: Some(now_millis()),
        session_summary: None,
    };
    sessions::insert_session(&state.db, &session).await?;
    publish(&state.tx_realtime, RealtimeEvent::insert(session));
    Ok(())
}

/// Rows the client has not saved yet arrive without an id; store them before
/// the turn starts so a failed send cannot lose the user's words.
async fn persist_pending_user_messages(
    state: &AppState,
    session_id: &str,
    request: &ChatRequest,
) -> Result<()> {
    for msg in request.messages.iter().filter(|m| m.is_user && m.id.is_none()) {
        sessions::insert_message(
            &state.db,
            session_id,
            &msg.content,
            true,
            msg.image_url.as_deref(),
            false,
        )
        .await?;
    }
    Ok(())
}

pub async fn chat_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ChatRequest>,
) -> Response {
    if let Err(e) = payload.validate() {
        tracing::error!("[🖱️  -> ⚙️ ] Validation Failed: {}", e);
        return e.into_response();
    }

    crate::logging::log_request_summary(&payload);

    let session_id = payload.chat_id.clone();
    let request_id = uuid::Uuid::new_v4().to_string();

    tracing::info!(
        "[🖱️  -> ⚙️ ] Received Turn [Session: [{}...] | History: {} | RID: [{}...]]",
        crate::str_utils::prefix_chars(&session_id, 6),
        payload.messages.len(),
        crate::str_utils::prefix_chars(&request_id, 8)
    );

    // A new send supersedes any stream still running for this chat; the old
    // task dies before it can apply anything late.
    state.cancel_inflight(&session_id).await;

    if let Err(e) = ensure_session(&state, &session_id).await {
        return e.into_response();
    }
    if let Err(e) = persist_pending_user_messages(&state, &session_id, &payload).await {
        return e.into_response();
    }

    let input: Vec<ProviderMessage> = payload.messages.iter().map(ProviderMessage::from).collect();

    let upstream = match state.provider.stream_for(&input).await {
        Ok(r) => r,
        Err(e) => {
            tracing::error!("[☁️  -> ⚙️ ] Request Error: {}", e);
            return e.into_response();
        }
    };
    let bytes_stream = upstream
        .bytes_stream()
        .map(|r| r.map_err(std::io::Error::other));

    if !payload.stream {
        let result = StreamAccumulator::new().accumulate_bytes(bytes_stream).await;
        let persisted = RelayHandler::persist_turn_outcome(&state, &session_id, &result).await;
        if persisted {
            tokio::spawn(crate::metadata::maybe_generate_metadata(
                state.clone(),
                session_id.clone(),
            ));
        }
        return Json(ChatResponse {
            content: result.text,
            truncated: !result.completed,
        })
        .into_response();
    }

    let (tx, rx) = mpsc::channel(100);
    let relay_state = state.clone();
    let sid = session_id.clone();
    let rid = request_id.clone();

    let task = tokio::spawn(async move {
        let stream_span = tracing::info_span!(
            "stream",
            sid = %crate::str_utils::prefix_chars(&sid, 6),
            rid = %crate::str_utils::prefix_chars(&rid, 8)
        );
        RelayHandler::handle_stream(bytes_stream, relay_state, sid, rid, tx)
            .instrument(stream_span)
            .await;
    });
    state
        .register_inflight(&session_id, &request_id, task.abort_handle())
        .await;

    Sse::new(ReceiverStream::new(rx))
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(15))
                .text(": keepalive"),
        )
        .into_response()
}
