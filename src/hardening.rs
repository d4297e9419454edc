use std::future::Future;
use std::time::Duration;

use crate::types::{BanterError, Result};

/// Jittered exponential backoff for background work. Interactive sends are
/// never routed through this: a failed send surfaces to the caller exactly
/// once.
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
        }
    }

    pub async fn execute_with_retry<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match operation().await {
                Ok(val) => return Ok(val),
                Err(e) if attempts < self.max_attempts && self.is_retryable(&e) => {
                    let base_delay = self.base_delay_ms * 2u64.pow(attempts - 1);
                    // Jitter: ±25% of the base delay
                    let jitter_range = base_delay / 4;
                    let jitter = if jitter_range > 0 {
                        fastrand::i64(-(jitter_range as i64)..jitter_range as i64)
                    } else {
                        0
                    };
                    let final_delay_ms = (base_delay as i64 + jitter).max(1) as u64;
                    let delay = Duration::from_millis(final_delay_ms);

                    tracing::warn!(
                        "Background request failed (attempt {}): {}. Retrying in {:?} (jittered)...",
                        attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn is_retryable(&self, err: &crate::types::ObservedError) -> bool {
        match &err.inner {
            BanterError::Network(_) | BanterError::Io(_) | BanterError::Internal(_, _) => true,
            BanterError::Upstream(status, _) => {
                status.is_server_error() || *status == axum::http::StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }
}
