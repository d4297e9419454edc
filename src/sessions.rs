use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::db::DbPool;
use crate::main_helper::now_millis;
use crate::realtime::{publish, RealtimeEvent};
use crate::reconcile::{apply_patch, PatchOutcome, SessionPatch};
use crate::types::{BanterError, ChatMessage, ChatSession, Profile, Result};
use crate::AppState;

/// --- STORE ---

fn session_from_row(row: &SqliteRow) -> ChatSession {
    ChatSession {
        id: row.get("id"),
        name: row.get("name"),
        last_updated: row.get("last_updated"),
        session_summary: row.get("session_summary"),
    }
}

fn message_from_row(row: &SqliteRow) -> ChatMessage {
    ChatMessage {
        id: Some(row.get("id")),
        content: row.get("content"),
        is_user: row.get::<i64, _>("is_user") != 0,
        timestamp: Some(row.get("created_at")),
        image_url: row.get("image_url"),
    }
}

pub async fn fetch_session(pool: &DbPool, id: &str) -> Result<Option<ChatSession>> {
    let row = sqlx::query(
        "SELECT id, name, session_summary, last_updated FROM chat_sessions WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(session_from_row))
}

pub async fn list_session_rows(pool: &DbPool) -> Result<Vec<ChatSession>> {
    let rows = sqlx::query(
        "SELECT id, name, session_summary, last_updated FROM chat_sessions \
         ORDER BY last_updated DESC",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(session_from_row).collect())
}

pub async fn insert_session(pool: &DbPool, session: &ChatSession) -> Result<()> {
    sqlx::query(
        "INSERT INTO chat_sessions (id, name, session_summary, last_updated) VALUES (?, ?, ?, ?)",
    )
    .bind(&session.id)
    .bind(&session.name)
    .bind(&session.session_summary)
    .bind(session.last_updated)
    .execute(pool)
    .await?;
    Ok(())
}

/// Persist an already-reconciled session. The WHERE clause repeats the
/// reconciler's rule so a concurrent writer in another process cannot
/// regress the row between our read and this write. Returns false when the
/// row lost that race (or vanished); the caller treats it as a discard.
pub async fn persist_reconciled(pool: &DbPool, session: &ChatSession) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE chat_sessions SET name = ?, session_summary = ?, last_updated = ? \
         WHERE id = ? AND (last_updated IS NULL OR last_updated <= ?)",
    )
    .bind(&session.name)
    .bind(&session.session_summary)
    .bind(session.last_updated)
    .bind(&session.id)
    .bind(session.last_updated.unwrap_or(0))
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn delete_session_row(pool: &DbPool, id: &str) -> Result<Option<ChatSession>> {
    let existing = fetch_session(pool, id).await?;
    if existing.is_none() {
        return Ok(None);
    }
    sqlx::query("DELETE FROM chat_messages WHERE session_id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    sqlx::query("DELETE FROM chat_sessions WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(existing)
}

pub async fn insert_message(
    pool: &DbPool,
    session_id: &str,
    content: &str,
    is_user: bool,
    image_url: Option<&str>,
    truncated: bool,
) -> Result<ChatMessage> {
    let id = uuid::Uuid::new_v4().to_string();
    let created_at = now_millis();
    sqlx::query(
        "INSERT INTO chat_messages (id, session_id, content, is_user, image_url, truncated, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(session_id)
    .bind(content)
    .bind(is_user)
    .bind(image_url)
    .bind(truncated)
    .bind(created_at)
    .execute(pool)
    .await?;

    Ok(ChatMessage {
        id: Some(id),
        content: content.to_string(),
        is_user,
        timestamp: Some(created_at),
        image_url: image_url.map(|u| u.to_string()),
    })
}

pub async fn list_messages(pool: &DbPool, session_id: &str) -> Result<Vec<ChatMessage>> {
    let rows = sqlx::query(
        "SELECT id, content, is_user, image_url, created_at FROM chat_messages \
         WHERE session_id = ? ORDER BY created_at ASC, id ASC",
    )
    .bind(session_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(message_from_row).collect())
}

pub async fn count_assistant_turns(pool: &DbPool, session_id: &str) -> Result<u32> {
    let row = sqlx::query(
        "SELECT COUNT(*) AS n FROM chat_messages WHERE session_id = ? AND is_user = 0",
    )
    .bind(session_id)
    .fetch_one(pool)
    .await?;
    let count: i64 = row.get("n");
    Ok(count.max(0) as u32)
}

pub async fn fetch_profile(pool: &DbPool, id: &str) -> Result<Option<Profile>> {
    let row = sqlx::query("SELECT id, display_name, avatar_url FROM profiles WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| Profile {
        id: r.get("id"),
        display_name: r.get("display_name"),
        avatar_url: r.get("avatar_url"),
    }))
}

pub async fn upsert_profile(pool: &DbPool, profile: &Profile) -> Result<()> {
    sqlx::query(
        "INSERT INTO profiles (id, display_name, avatar_url) VALUES (?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET display_name = excluded.display_name, \
         avatar_url = excluded.avatar_url",
    )
    .bind(&profile.id)
    .bind(&profile.display_name)
    .bind(&profile.avatar_url)
    .execute(pool)
    .await?;
    Ok(())
}

/// Reconcile a patch against the stored row and, when it wins, persist and
/// broadcast it. Both the realtime path and RPC replies land here, so
/// arrival order cannot regress a session. Returns the row as it stands
/// after the decision.
pub async fn reconcile_and_store(
    state: &AppState,
    session_id: &str,
    patch: &SessionPatch,
) -> Result<ChatSession> {
    let mut session = match fetch_session(&state.db, session_id).await? {
        Some(s) => s,
        None => {
            return Err(BanterError::NotFound(format!("Session {} not found", session_id)).into())
        }
    };
    let old = session.clone();

    match apply_patch(&mut session, patch) {
        PatchOutcome::Applied => {
            if persist_reconciled(&state.db, &session).await? {
                publish(&state.tx_realtime, RealtimeEvent::update(old, session.clone()));
            } else {
                // Lost a cross-process race after the in-memory pass; the
                // stored row is newer, keep it.
                tracing::debug!(
                    "[⚙️ ] Patch for session [{}...] superseded at the store",
                    crate::str_utils::prefix_chars(session_id, 6)
                );
                if let Some(current) = fetch_session(&state.db, session_id).await? {
                    session = current;
                }
            }
        }
        PatchOutcome::Discarded => {
            tracing::debug!(
                "[⚙️ ] Stale patch for session [{}...] discarded",
                crate::str_utils::prefix_chars(session_id, 6)
            );
            session = old;
        }
    }

    Ok(session)
}

/// --- HANDLERS ---

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

pub async fn list_sessions_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ChatSession>>> {
    Ok(Json(list_session_rows(&state.db).await?))
}

pub async fn create_session_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse> {
    let session = ChatSession {
        id: match payload.id {
            Some(id) if !id.trim().is_empty() => id,
            _ => uuid::Uuid::new_v4().to_string(),
        },
        name: payload.name,
        last_updated: Some(now_millis()),
        session_summary: None,
    };
    insert_session(&state.db, &session).await?;
    publish(&state.tx_realtime, RealtimeEvent::insert(session.clone()));
    Ok((StatusCode::CREATED, Json(session)))
}

pub async fn update_session_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(patch): Json<SessionPatch>,
) -> Result<Json<ChatSession>> {
    let session = reconcile_and_store(&state, &id, &patch).await?;
    Ok(Json(session))
}

pub async fn delete_session_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let deleted = match delete_session_row(&state.db, &id).await? {
        Some(s) => s,
        None => return Err(BanterError::NotFound(format!("Session {} not found", id)).into()),
    };
    state.forget_session(&id).await;
    publish(&state.tx_realtime, RealtimeEvent::delete(deleted));
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_messages_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<ChatMessage>>> {
    if fetch_session(&state.db, &id).await?.is_none() {
        return Err(BanterError::NotFound(format!("Session {} not found", id)).into());
    }
    Ok(Json(list_messages(&state.db, &id).await?))
}

pub async fn get_profile_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Profile>> {
    match fetch_profile(&state.db, &id).await? {
        Some(p) => Ok(Json(p)),
        None => Err(BanterError::NotFound(format!("Profile {} not found", id)).into()),
    }
}

pub async fn put_profile_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(mut profile): Json<Profile>,
) -> Result<Json<Profile>> {
    profile.id = id;
    upsert_profile(&state.db, &profile).await?;
    Ok(Json(profile))
}
