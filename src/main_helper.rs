use std::collections::HashMap;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;

use crate::constants::{DEFAULT_MODEL, DEFAULT_PROVIDER_BASE_URL};
use crate::db::DbPool;
use crate::provider::ProviderClient;
use crate::realtime::RealtimeHub;
use crate::reconcile::MetadataTrigger;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(long, default_value_t = 8787)]
    pub port: u16,
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, default_value = "banter.db")]
    pub database: String,
    #[arg(long, default_value = DEFAULT_PROVIDER_BASE_URL)]
    pub provider_base_url: String,
    #[arg(long, default_value = DEFAULT_MODEL)]
    pub model: String,
    #[arg(long, default_value_t = 120)]
    pub request_timeout_secs: u64,
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,
    #[arg(long, default_value_t = 2 * 1024 * 1024)]
    pub max_body_size: usize,
}

struct InflightStream {
    request_id: String,
    abort: AbortHandle,
}

pub struct AppState {
    pub provider: ProviderClient,
    pub db: DbPool,
    pub tx_realtime: RealtimeHub,
    pub args: Arc<Args>,
    inflight: Mutex<HashMap<String, InflightStream>>,
    triggers: Mutex<HashMap<String, MetadataTrigger>>,
}

impl AppState {
    pub fn new(provider: ProviderClient, db: DbPool, tx_realtime: RealtimeHub, args: Arc<Args>) -> Self {
        Self {
            provider,
            db,
            tx_realtime,
            args,
            inflight: Mutex::new(HashMap::new()),
            triggers: Mutex::new(HashMap::new()),
        }
    }

    /// Abort the previous stream for this session, if any. One live stream
    /// per active chat: a superseded task dies before it can persist or
    /// forward anything late.
    pub async fn cancel_inflight(&self, session_id: &str) {
        let mut inflight = self.inflight.lock().await;
        if let Some(prev) = inflight.remove(session_id) {
            tracing::debug!(
                "[⚙️ ] Superseding in-flight stream [{}...] for session [{}...]",
                crate::str_utils::prefix_chars(&prev.request_id, 8),
                crate::str_utils::prefix_chars(session_id, 6)
            );
            prev.abort.abort();
        }
    }

    pub async fn register_inflight(&self, session_id: &str, request_id: &str, abort: AbortHandle) {
        let mut inflight = self.inflight.lock().await;
        if let Some(prev) = inflight.insert(
            session_id.to_string(),
            InflightStream {
                request_id: request_id.to_string(),
                abort,
            },
        ) {
            prev.abort.abort();
        }
    }

    /// Remove the bookkeeping entry once a stream finishes, unless a newer
    /// stream already replaced it.
    pub async fn release_inflight(&self, session_id: &str, request_id: &str) {
        let mut inflight = self.inflight.lock().await;
        let current = inflight
            .get(session_id)
            .map(|s| s.request_id == request_id)
            .unwrap_or(false);
        if current {
            inflight.remove(session_id);
        }
    }

    pub async fn has_inflight(&self, session_id: &str) -> bool {
        self.inflight.lock().await.contains_key(session_id)
    }

    /// Trigger check for one session; the per-session entry is what makes
    /// the last-fired counter reset across sessions.
    pub async fn metadata_should_fire(&self, session_id: &str, assistant_turns: u32) -> bool {
        let in_flight = self.has_inflight(session_id).await;
        let mut triggers = self.triggers.lock().await;
        triggers
            .entry(session_id.to_string())
            .or_insert_with(MetadataTrigger::new)
            .should_fire(assistant_turns, in_flight)
    }

    pub async fn forget_session(&self, session_id: &str) {
        self.triggers.lock().await.remove(session_id);
        self.cancel_inflight(session_id).await;
    }
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
