use sqlx::sqlite::SqlitePool;
use std::path::Path;

use crate::constants::DB_PRAGMAS;
use crate::types::{BanterError, Result};

pub type DbPool = SqlitePool;

pub async fn init_db<P: AsRef<Path>>(path: P) -> Result<DbPool> {
    let path_str = match path.as_ref().to_str() {
        Some(s) => s,
        None => {
            return Err(BanterError::Internal(
                "Invalid database path: Path contains non-UTF8 characters".to_string(),
                tracing_error::SpanTrace::capture(),
            )
            .into())
        }
    };
    let url = format!("sqlite:{}?mode=rwc", path_str);

    let pool = match SqlitePool::connect(&url).await {
        Ok(p) => p,
        Err(e) => return Err(BanterError::Database(e).into()),
    };

    configure_db(&pool).await?;

    if let Err(e) = sqlx::migrate!("./migrations").run(&pool).await {
        return Err(BanterError::Internal(
            format!("Migration failed: {}", e),
            tracing_error::SpanTrace::capture(),
        )
        .into());
    }

    verify_schema_version(&pool).await;

    if let Err(e) = cleanup_orphaned_messages(&pool).await {
        tracing::warn!("Database cleanup failed: {}", e);
    }

    Ok(pool)
}

async fn configure_db(pool: &DbPool) -> Result<()> {
    for pragma in DB_PRAGMAS {
        if let Err(e) = sqlx::query(pragma).execute(pool).await {
            return Err(BanterError::Database(e).into());
        }
    }
    Ok(())
}

async fn verify_schema_version(pool: &DbPool) {
    let version_row: std::result::Result<(String,), sqlx::Error> =
        sqlx::query_as("SELECT value FROM schema_metadata WHERE key = 'schema_version'")
            .fetch_one(pool)
            .await;

    match version_row {
        Ok((version,)) => {
            tracing::info!("Database initialized. Schema version: {}", version);
        }
        Err(e) => {
            tracing::warn!("Could not verify schema version: {}", e);
        }
    }
}

/// Messages whose session was deleted while the process was down have no
/// owner left; sweep them at startup.
pub async fn cleanup_orphaned_messages(pool: &DbPool) -> std::result::Result<u64, sqlx::Error> {
    let deleted = sqlx::query(
        "DELETE FROM chat_messages WHERE session_id NOT IN (SELECT id FROM chat_sessions)",
    )
    .execute(pool)
    .await?;

    if deleted.rows_affected() > 0 {
        tracing::info!(
            "Cleanup complete: removed {} orphaned messages.",
            deleted.rows_affected()
        );
    }

    Ok(deleted.rows_affected())
}
