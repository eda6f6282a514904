use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info};

use super::format::FileFormat;
use super::Pipeline;
use crate::error::{Result, SpendsortError};
use crate::models::{ImportType, ItemStatus};

/// Payload handed to the worker for one batch item.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemJob {
    pub batch_id: String,
    pub item_id: String,
    pub owner_id: String,
    pub import_type: ImportType,
    pub file_name: String,
    pub file_url: String,
    /// Guess from the file name; confirmed from magic bytes after download.
    pub format_hint: Option<FileFormat>,
    pub attempt: i64,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: ItemJob) -> Result<()>;
}

/// In-process queue over an unbounded tokio channel. The worker stops once
/// every sender is gone and the channel is drained.
#[derive(Clone)]
pub struct ChannelQueue {
    tx: mpsc::UnboundedSender<ItemJob>,
}

impl ChannelQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ItemJob>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl JobQueue for ChannelQueue {
    async fn enqueue(&self, job: ItemJob) -> Result<()> {
        self.tx
            .send(job)
            .map_err(|e| SpendsortError::Enqueue(format!("worker is not accepting jobs (item {})", e.0.item_id)))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub completed: usize,
    pub failed: usize,
    pub duplicate: usize,
}

/// Process jobs until the channel closes, at most `concurrency` at a time.
pub async fn run_worker(
    pipeline: Arc<Pipeline>,
    mut rx: mpsc::UnboundedReceiver<ItemJob>,
    concurrency: usize,
) -> Result<WorkerStats> {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks = JoinSet::new();
    let mut stats = WorkerStats::default();

    while let Some(job) = rx.recv().await {
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| SpendsortError::Other(format!("worker semaphore closed: {e}")))?;
        let pipeline = Arc::clone(&pipeline);
        tasks.spawn(async move {
            let _permit = permit;
            pipeline.process_item(job).await
        });
        while let Some(done) = tasks.try_join_next() {
            tally(&mut stats, done);
        }
    }
    while let Some(done) = tasks.join_next().await {
        tally(&mut stats, done);
    }
    info!(
        completed = stats.completed,
        failed = stats.failed,
        duplicate = stats.duplicate,
        "Worker drained"
    );
    Ok(stats)
}

fn tally(stats: &mut WorkerStats, done: std::result::Result<Result<ItemStatus>, tokio::task::JoinError>) {
    match done {
        Ok(Ok(ItemStatus::Completed | ItemStatus::Skipped)) => stats.completed += 1,
        Ok(Ok(ItemStatus::Duplicate)) => stats.duplicate += 1,
        Ok(Ok(_)) => stats.failed += 1,
        Ok(Err(e)) => {
            error!(error = %e, "Item could not be processed");
            stats.failed += 1;
        }
        Err(e) => {
            error!(error = %e, "Item task panicked");
            stats.failed += 1;
        }
    }
}
