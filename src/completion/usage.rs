use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinSet;
use tracing::warn;

use super::Usage;
use crate::db::Database;

#[derive(Debug, Clone)]
pub struct UsageEvent {
    pub provider: String,
    pub model: String,
    pub purpose: String,
    pub usage: Usage,
    pub success: bool,
}

/// Writes completion token/cost accounting without the caller waiting on it.
/// Pending writes are tracked so `flush` can wait for them before exit.
#[derive(Clone)]
pub struct UsageLogger {
    db: Database,
    pending: Arc<Mutex<JoinSet<()>>>,
}

impl UsageLogger {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            pending: Arc::new(Mutex::new(JoinSet::new())),
        }
    }

    /// Background write; a failure is logged here and goes no further.
    pub fn record(&self, event: UsageEvent) {
        let db = self.db.clone();
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(provider = %event.provider, "No runtime for usage logging, event dropped");
            return;
        };
        let task = async move {
            let provider = event.provider.clone();
            let result = db
                .call(move |conn| {
                    conn.execute(
                        "INSERT INTO completion_usage (provider, model, purpose, input_tokens, output_tokens, duration_ms, success) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        rusqlite::params![
                            event.provider,
                            event.model,
                            event.purpose,
                            event.usage.input_tokens as i64,
                            event.usage.output_tokens as i64,
                            event.usage.duration_ms as i64,
                            event.success,
                        ],
                    )?;
                    Ok(())
                })
                .await;
            if let Err(e) = result {
                warn!(provider = %provider, error = %e, "Failed to record completion usage");
            }
        };
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        while pending.try_join_next().is_some() {}
        pending.spawn_on(task, &handle);
    }

    /// Wait for every write recorded so far.
    pub async fn flush(&self) {
        let mut tasks = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *pending)
        };
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Usage write task failed");
            }
        }
    }
}
