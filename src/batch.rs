//! Import batch lifecycle: creation, per-item state machine, retry and
//! progress accounting.
//!
//! Batch counters are never incremented in place. Every item change
//! re-derives them from the item rows inside the same database call, so
//! concurrent workers cannot lose updates.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use tracing::{info, warn};

use crate::db::Database;
use crate::error::{Result, SpendsortError};
use crate::models::{
    BatchStatus, DuplicateMatchType, ImportBatch, ImportBatchItem, ImportType, ItemStatus,
    NewBatchFile,
};
use crate::pipeline::format::FileFormat;
use crate::pipeline::queue::{ItemJob, JobQueue};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchProgress {
    pub batch_id: String,
    pub status: BatchStatus,
    pub percentage: f64,
    pub total_files: i64,
    pub processed_files: i64,
    pub successful_files: i64,
    pub failed_files: i64,
    pub duplicate_files: i64,
    pub remaining_files: i64,
    pub is_complete: bool,
    pub estimated_completion: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryAllOutcome {
    pub success: bool,
    pub retried_count: usize,
    pub errors: Vec<String>,
}

/// A status change reported by the pipeline.
#[derive(Debug, Clone)]
pub struct ItemUpdate {
    pub status: ItemStatus,
    pub error: Option<(String, String)>,
    pub duplicate_of: Option<String>,
    pub duplicate_match_type: Option<DuplicateMatchType>,
    pub document_id: Option<String>,
}

impl ItemUpdate {
    pub fn completed(document_id: impl Into<String>) -> Self {
        Self {
            status: ItemStatus::Completed,
            error: None,
            duplicate_of: None,
            duplicate_match_type: None,
            document_id: Some(document_id.into()),
        }
    }

    pub fn failed(err: &SpendsortError) -> Self {
        Self {
            status: ItemStatus::Failed,
            error: Some((err.error_code().to_string(), err.to_string())),
            duplicate_of: None,
            duplicate_match_type: None,
            document_id: None,
        }
    }

    pub fn duplicate(document_id: impl Into<String>, match_type: DuplicateMatchType, message: String) -> Self {
        Self {
            status: ItemStatus::Duplicate,
            error: Some(("DUPLICATE_FILE".to_string(), message)),
            duplicate_of: Some(document_id.into()),
            duplicate_match_type: Some(match_type),
            document_id: None,
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            status: ItemStatus::Skipped,
            error: Some(("SKIPPED".to_string(), reason.into())),
            duplicate_of: None,
            duplicate_match_type: None,
            document_id: None,
        }
    }
}

const BATCH_COLUMNS: &str = "id, owner_id, import_type, total_files, processed_files, successful_files, \
     failed_files, duplicate_files, status, started_at, completed_at, estimated_completion, errors, created_at";

const ITEM_COLUMNS: &str = "i.id, i.batch_id, i.file_name, i.file_url, i.file_size, i.processing_order, \
     i.status, i.retry_count, i.error_code, i.error_message, i.duplicate_of, i.duplicate_match_type, i.document_id";

fn batch_from_row(row: &Row) -> rusqlite::Result<ImportBatch> {
    let raw_errors: String = row.get(12)?;
    let errors: Vec<String> = serde_json::from_str(&raw_errors).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(12, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(ImportBatch {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        import_type: row.get(2)?,
        total_files: row.get(3)?,
        processed_files: row.get(4)?,
        successful_files: row.get(5)?,
        failed_files: row.get(6)?,
        duplicate_files: row.get(7)?,
        status: row.get(8)?,
        started_at: row.get(9)?,
        completed_at: row.get(10)?,
        estimated_completion: row.get(11)?,
        errors,
        created_at: row.get(13)?,
    })
}

fn item_from_row(row: &Row) -> rusqlite::Result<ImportBatchItem> {
    Ok(ImportBatchItem {
        id: row.get(0)?,
        batch_id: row.get(1)?,
        file_name: row.get(2)?,
        file_url: row.get(3)?,
        file_size: row.get(4)?,
        processing_order: row.get(5)?,
        status: row.get(6)?,
        retry_count: row.get(7)?,
        error_code: row.get(8)?,
        error_message: row.get(9)?,
        duplicate_of: row.get(10)?,
        duplicate_match_type: row.get(11)?,
        document_id: row.get(12)?,
    })
}

fn require_owner(owner_id: &str) -> Result<()> {
    if owner_id.trim().is_empty() {
        return Err(SpendsortError::Unauthorized("missing owner".into()));
    }
    Ok(())
}

/// Load a batch and check it belongs to `owner_id`.
fn load_batch(conn: &Connection, owner_id: &str, batch_id: &str) -> Result<ImportBatch> {
    require_owner(owner_id)?;
    let batch = conn
        .query_row(
            &format!("SELECT {BATCH_COLUMNS} FROM import_batches WHERE id = ?1"),
            [batch_id],
            batch_from_row,
        )
        .optional()?
        .ok_or_else(|| SpendsortError::NotFound(format!("batch {batch_id}")))?;
    if batch.owner_id != owner_id {
        return Err(SpendsortError::Unauthorized(format!("batch {batch_id}")));
    }
    Ok(batch)
}

/// Load an item with its batch, checking ownership through the batch.
fn load_item(conn: &Connection, owner_id: &str, item_id: &str) -> Result<(ImportBatch, ImportBatchItem)> {
    require_owner(owner_id)?;
    let item = conn
        .query_row(
            &format!("SELECT {ITEM_COLUMNS} FROM import_batch_items i WHERE i.id = ?1"),
            [item_id],
            item_from_row,
        )
        .optional()?
        .ok_or_else(|| SpendsortError::NotFound(format!("item {item_id}")))?;
    let batch = load_batch(conn, owner_id, &item.batch_id)?;
    Ok((batch, item))
}

fn list_items_sync(conn: &Connection, batch_id: &str) -> Result<Vec<ImportBatchItem>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ITEM_COLUMNS} FROM import_batch_items i WHERE i.batch_id = ?1 ORDER BY i.processing_order"
    ))?;
    let items = stmt
        .query_map([batch_id], item_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(items)
}

pub fn percentage(processed: i64, total: i64) -> f64 {
    if total <= 0 {
        return 100.0;
    }
    processed as f64 / total as f64 * 100.0
}

/// `now + remaining / rate`, where rate is files processed per elapsed time.
pub fn estimate_completion(
    now: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    processed: i64,
    total: i64,
) -> Option<DateTime<Utc>> {
    let started = started_at?;
    if processed <= 0 {
        return None;
    }
    let elapsed_ms = (now - started).num_milliseconds().max(0);
    let remaining = (total - processed).max(0);
    let eta_ms = elapsed_ms.saturating_mul(remaining) / processed;
    Some(now + Duration::milliseconds(eta_ms))
}

/// Recompute counters and derived status from the item rows.
pub(crate) fn refresh_batch(conn: &Connection, batch_id: &str) -> Result<ImportBatch> {
    let (processing, completed, failed, duplicate, skipped): (i64, i64, i64, i64, i64) = conn.query_row(
        "SELECT \
            COALESCE(SUM(status = 'processing'), 0), \
            COALESCE(SUM(status = 'completed'), 0), \
            COALESCE(SUM(status = 'failed'), 0), \
            COALESCE(SUM(status = 'duplicate'), 0), \
            COALESCE(SUM(status = 'skipped'), 0) \
         FROM import_batch_items WHERE batch_id = ?1",
        [batch_id],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
    )?;
    let batch = conn.query_row(
        &format!("SELECT {BATCH_COLUMNS} FROM import_batches WHERE id = ?1"),
        [batch_id],
        batch_from_row,
    )?;

    let successful = completed + skipped;
    let processed = successful + failed + duplicate;
    let now = Utc::now();

    let (status, completed_at, estimated) = match batch.status {
        BatchStatus::Cancelled | BatchStatus::Failed => (batch.status, batch.completed_at, None),
        _ if processed >= batch.total_files => {
            (BatchStatus::Completed, batch.completed_at.or(Some(now)), None)
        }
        _ if processing > 0 || processed > 0 || batch.started_at.is_some() => (
            BatchStatus::Processing,
            None,
            estimate_completion(now, batch.started_at, processed, batch.total_files),
        ),
        _ => (BatchStatus::Pending, None, None),
    };

    conn.execute(
        "UPDATE import_batches SET processed_files = ?1, successful_files = ?2, failed_files = ?3, \
         duplicate_files = ?4, status = ?5, completed_at = ?6, estimated_completion = ?7, updated_at = ?8 \
         WHERE id = ?9",
        params![processed, successful, failed, duplicate, status, completed_at, estimated, now, batch_id],
    )?;
    if status == BatchStatus::Completed && batch.status != BatchStatus::Completed {
        info!(
            batch_id,
            successful, failed, duplicate, "Batch completed"
        );
    }
    Ok(ImportBatch {
        processed_files: processed,
        successful_files: successful,
        failed_files: failed,
        duplicate_files: duplicate,
        status,
        completed_at,
        estimated_completion: estimated,
        ..batch
    })
}

fn append_error(conn: &Connection, batch_id: &str, message: &str) -> Result<()> {
    let raw: String = conn.query_row(
        "SELECT errors FROM import_batches WHERE id = ?1",
        [batch_id],
        |row| row.get(0),
    )?;
    let mut errors: Vec<String> = serde_json::from_str(&raw)?;
    errors.push(message.to_string());
    conn.execute(
        "UPDATE import_batches SET errors = ?1, updated_at = ?2 WHERE id = ?3",
        params![serde_json::to_string(&errors)?, Utc::now(), batch_id],
    )?;
    Ok(())
}

/// Mark an item failed without going through the state machine. Used when
/// a job could not be handed to the queue, so the item is never left
/// looking pending.
fn revert_to_failed(conn: &Connection, item_id: &str, code: &str, message: &str) -> Result<()> {
    conn.execute(
        "UPDATE import_batch_items SET status = 'failed', error_code = ?1, error_message = ?2, updated_at = ?3 \
         WHERE id = ?4",
        params![code, message, Utc::now(), item_id],
    )?;
    Ok(())
}

/// Queue payload for one item. Batch creation and both retry paths go
/// through here.
pub fn build_job(batch: &ImportBatch, item: &ImportBatchItem) -> Result<ItemJob> {
    let file_url = item
        .file_url
        .clone()
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| {
            SpendsortError::Validation(format!("item {} has no source file to process", item.id))
        })?;
    Ok(ItemJob {
        batch_id: batch.id.clone(),
        item_id: item.id.clone(),
        owner_id: batch.owner_id.clone(),
        import_type: batch.import_type,
        file_name: item.file_name.clone(),
        file_url,
        format_hint: FileFormat::from_file_name(&item.file_name),
        attempt: item.retry_count,
    })
}

#[derive(Clone)]
pub struct BatchCoordinator {
    db: Database,
    queue: Option<Arc<dyn JobQueue>>,
}

impl BatchCoordinator {
    /// A coordinator without a queue can track items but not (re)submit them.
    pub fn new(db: Database) -> Self {
        Self { db, queue: None }
    }

    pub fn with_queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    fn queue(&self) -> Result<&Arc<dyn JobQueue>> {
        self.queue
            .as_ref()
            .ok_or_else(|| SpendsortError::Enqueue("no job queue is configured".into()))
    }

    pub async fn create_batch(
        &self,
        owner_id: &str,
        import_type: ImportType,
        files: Vec<NewBatchFile>,
    ) -> Result<ImportBatch> {
        require_owner(owner_id)?;
        if files.is_empty() {
            return Err(SpendsortError::Validation("a batch needs at least one file".into()));
        }
        if let Some(bad) = files.iter().find(|f| f.file_name.trim().is_empty()) {
            return Err(SpendsortError::Validation(format!(
                "file name missing for {}",
                bad.file_url.as_deref().unwrap_or("unnamed file")
            )));
        }
        let owner = owner_id.to_string();
        let batch = self
            .db
            .call(move |conn| {
                let tx = conn.unchecked_transaction()?;
                let batch_id = uuid::Uuid::new_v4().to_string();
                let now = Utc::now();
                tx.execute(
                    "INSERT INTO import_batches (id, owner_id, import_type, total_files, status, errors, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, 'pending', '[]', ?5, ?5)",
                    params![batch_id, owner, import_type, files.len() as i64, now],
                )?;
                for (order, file) in files.iter().enumerate() {
                    tx.execute(
                        "INSERT INTO import_batch_items (id, batch_id, file_name, file_url, file_size, processing_order, status, created_at, updated_at) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?7)",
                        params![
                            uuid::Uuid::new_v4().to_string(),
                            batch_id,
                            file.file_name.trim(),
                            file.file_url,
                            file.file_size,
                            order as i64,
                            now,
                        ],
                    )?;
                }
                let batch = load_batch(&tx, &owner, &batch_id)?;
                tx.commit()?;
                Ok(batch)
            })
            .await?;
        info!(batch_id = %batch.id, files = batch.total_files, import_type = %import_type, "Batch created");
        Ok(batch)
    }

    /// Queue every pending item of a new batch. Items that cannot be queued
    /// are failed in place; a batch with nothing queued fails as a whole.
    pub async fn submit_batch(&self, owner_id: &str, batch_id: &str) -> Result<usize> {
        let queue = Arc::clone(self.queue()?);
        let owner = owner_id.to_string();
        let id = batch_id.to_string();
        let (batch, items) = self
            .db
            .call(move |conn| {
                let batch = load_batch(conn, &owner, &id)?;
                let items = list_items_sync(conn, &id)?;
                Ok((batch, items))
            })
            .await?;
        if batch.status.is_terminal() {
            return Err(SpendsortError::Validation(format!(
                "batch {batch_id} is already {}",
                batch.status
            )));
        }

        let mut queued = 0usize;
        let mut pending = 0usize;
        for item in items.iter().filter(|i| i.status == ItemStatus::Pending) {
            pending += 1;
            let outcome = match build_job(&batch, item) {
                Ok(job) => queue.enqueue(job).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => queued += 1,
                Err(e) => {
                    warn!(batch_id, item_id = %item.id, error = %e, "Could not queue item");
                    let item_id = item.id.clone();
                    let code = e.error_code();
                    let reason = e.to_string();
                    let message = format!("{}: {e}", item.file_name);
                    let batch_id = batch.id.clone();
                    self.db
                        .call(move |conn| {
                            revert_to_failed(conn, &item_id, code, &reason)?;
                            append_error(conn, &batch_id, &message)?;
                            refresh_batch(conn, &batch_id)?;
                            Ok(())
                        })
                        .await?;
                }
            }
        }
        if pending > 0 && queued == 0 {
            self.fail_batch(owner_id, batch_id, "no item of the batch could be queued")
                .await?;
        }
        Ok(queued)
    }

    pub async fn get_batch(&self, owner_id: &str, batch_id: &str) -> Result<ImportBatch> {
        let owner = owner_id.to_string();
        let id = batch_id.to_string();
        self.db.call(move |conn| load_batch(conn, &owner, &id)).await
    }

    pub async fn get_item(&self, owner_id: &str, item_id: &str) -> Result<ImportBatchItem> {
        let owner = owner_id.to_string();
        let id = item_id.to_string();
        self.db
            .call(move |conn| load_item(conn, &owner, &id).map(|(_, item)| item))
            .await
    }

    pub async fn list_items(&self, owner_id: &str, batch_id: &str) -> Result<Vec<ImportBatchItem>> {
        let owner = owner_id.to_string();
        let id = batch_id.to_string();
        self.db
            .call(move |conn| {
                load_batch(conn, &owner, &id)?;
                list_items_sync(conn, &id)
            })
            .await
    }

    pub async fn list_batches(&self, owner_id: &str) -> Result<Vec<ImportBatch>> {
        require_owner(owner_id)?;
        let owner = owner_id.to_string();
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {BATCH_COLUMNS} FROM import_batches WHERE owner_id = ?1 ORDER BY created_at DESC"
                ))?;
                let batches = stmt
                    .query_map([owner], batch_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(batches)
            })
            .await
    }

    /// `pending -> processing`; stamps the batch start on the first item.
    pub async fn start_item(&self, owner_id: &str, item_id: &str) -> Result<ImportBatchItem> {
        let owner = owner_id.to_string();
        let id = item_id.to_string();
        self.db
            .call(move |conn| {
                let (batch, item) = load_item(conn, &owner, &id)?;
                if batch.status == BatchStatus::Cancelled {
                    return Err(SpendsortError::Validation(format!(
                        "batch {} was cancelled",
                        batch.id
                    )));
                }
                if !item.status.can_transition_to(ItemStatus::Processing) {
                    return Err(SpendsortError::Validation(format!(
                        "item {id} cannot start from {}",
                        item.status
                    )));
                }
                let now = Utc::now();
                conn.execute(
                    "UPDATE import_batch_items SET status = 'processing', updated_at = ?1 WHERE id = ?2",
                    params![now, id],
                )?;
                conn.execute(
                    "UPDATE import_batches SET started_at = COALESCE(started_at, ?1), updated_at = ?1 WHERE id = ?2",
                    params![now, batch.id],
                )?;
                refresh_batch(conn, &batch.id)?;
                Ok(ImportBatchItem {
                    status: ItemStatus::Processing,
                    ..item
                })
            })
            .await
    }

    pub async fn update_item_status(
        &self,
        owner_id: &str,
        item_id: &str,
        update: ItemUpdate,
    ) -> Result<ImportBatchItem> {
        if update.status == ItemStatus::Duplicate && update.duplicate_of.is_none() {
            return Err(SpendsortError::Validation(
                "a duplicate item must reference the document it duplicates".into(),
            ));
        }
        let owner = owner_id.to_string();
        let id = item_id.to_string();
        self.db
            .call(move |conn| {
                let (batch, item) = load_item(conn, &owner, &id)?;
                if !item.status.can_transition_to(update.status) {
                    return Err(SpendsortError::Validation(format!(
                        "item {id} cannot move from {} to {}",
                        item.status, update.status
                    )));
                }
                let (error_code, error_message) = update.error.clone().unzip();
                conn.execute(
                    "UPDATE import_batch_items SET status = ?1, error_code = ?2, error_message = ?3, \
                     duplicate_of = ?4, duplicate_match_type = ?5, document_id = COALESCE(?6, document_id), updated_at = ?7 \
                     WHERE id = ?8",
                    params![
                        update.status,
                        error_code,
                        error_message,
                        update.duplicate_of,
                        update.duplicate_match_type,
                        update.document_id,
                        Utc::now(),
                        id,
                    ],
                )?;
                refresh_batch(conn, &batch.id)?;
                let (_, item) = load_item(conn, &owner, &id)?;
                Ok(item)
            })
            .await
    }

    /// `failed -> pending` and back onto the queue. Rejected when the item
    /// has no source file left; reverted to `failed` when queueing fails.
    pub async fn retry_item(&self, owner_id: &str, item_id: &str) -> Result<ImportBatchItem> {
        let queue = Arc::clone(self.queue()?);
        let owner = owner_id.to_string();
        let id = item_id.to_string();
        let (job, item, reopened_failed) = self
            .db
            .call(move |conn| {
                let (batch, item) = load_item(conn, &owner, &id)?;
                if batch.status == BatchStatus::Cancelled {
                    return Err(SpendsortError::Validation(format!(
                        "batch {} was cancelled",
                        batch.id
                    )));
                }
                if !item.status.can_transition_to(ItemStatus::Pending) {
                    return Err(SpendsortError::Validation(format!(
                        "only failed items can be retried (item {id} is {})",
                        item.status
                    )));
                }
                let job = build_job(&batch, &item)?;
                conn.execute(
                    "UPDATE import_batch_items SET status = 'pending', retry_count = retry_count + 1, \
                     error_code = NULL, error_message = NULL, duplicate_of = NULL, duplicate_match_type = NULL, \
                     document_id = NULL, updated_at = ?1 WHERE id = ?2",
                    params![Utc::now(), id],
                )?;
                // A failed batch is reopened like a completed one; the
                // prior state is kept in case the job cannot be queued.
                let reopened_failed =
                    (batch.status == BatchStatus::Failed).then_some(batch.completed_at);
                if reopened_failed.is_some() {
                    conn.execute(
                        "UPDATE import_batches SET status = 'processing', completed_at = NULL WHERE id = ?1",
                        [&batch.id],
                    )?;
                }
                refresh_batch(conn, &batch.id)?;
                let (_, item) = load_item(conn, &owner, &id)?;
                Ok((job, item, reopened_failed))
            })
            .await?;

        if let Err(e) = queue.enqueue(job).await {
            warn!(item_id, error = %e, "Retry could not be queued, reverting item");
            let err = match e {
                SpendsortError::Enqueue(_) => e,
                other => SpendsortError::Enqueue(other.to_string()),
            };
            let id = item_id.to_string();
            let batch_id = item.batch_id.clone();
            let (code, message) = (err.error_code(), err.to_string());
            self.db
                .call(move |conn| {
                    revert_to_failed(conn, &id, code, &message)?;
                    // No attempt was made.
                    conn.execute(
                        "UPDATE import_batch_items SET retry_count = MAX(retry_count - 1, 0) WHERE id = ?1",
                        [&id],
                    )?;
                    if let Some(completed_at) = reopened_failed {
                        conn.execute(
                            "UPDATE import_batches SET status = 'failed', completed_at = ?1 WHERE id = ?2",
                            params![completed_at, batch_id],
                        )?;
                    }
                    refresh_batch(conn, &batch_id)?;
                    Ok(())
                })
                .await?;
            return Err(err);
        }
        info!(item_id, retry_count = item.retry_count, "Item re-queued");
        Ok(item)
    }

    /// Retry every failed item, continuing past individual failures.
    pub async fn retry_all_failed(&self, owner_id: &str, batch_id: &str) -> Result<RetryAllOutcome> {
        let items = self.list_items(owner_id, batch_id).await?;
        let failed: Vec<ImportBatchItem> = items
            .into_iter()
            .filter(|i| i.status == ItemStatus::Failed)
            .collect();
        if failed.is_empty() {
            return Ok(RetryAllOutcome {
                success: true,
                retried_count: 0,
                errors: Vec::new(),
            });
        }
        let mut retried_count = 0usize;
        let mut errors = Vec::new();
        for item in &failed {
            match self.retry_item(owner_id, &item.id).await {
                Ok(_) => retried_count += 1,
                Err(e) => errors.push(format!("{}: {e}", item.file_name)),
            }
        }
        info!(batch_id, retried_count, failures = errors.len(), "Bulk retry finished");
        Ok(RetryAllOutcome {
            success: retried_count > 0,
            retried_count,
            errors,
        })
    }

    pub async fn get_progress(&self, owner_id: &str, batch_id: &str) -> Result<BatchProgress> {
        let batch = self.get_batch(owner_id, batch_id).await?;
        Ok(progress_of(&batch, Utc::now()))
    }

    pub async fn cancel_batch(&self, owner_id: &str, batch_id: &str) -> Result<ImportBatch> {
        let owner = owner_id.to_string();
        let id = batch_id.to_string();
        self.db
            .call(move |conn| {
                let batch = load_batch(conn, &owner, &id)?;
                match batch.status {
                    BatchStatus::Cancelled => return Ok(batch),
                    BatchStatus::Completed | BatchStatus::Failed => {
                        return Err(SpendsortError::Validation(format!(
                            "batch {id} is already {}",
                            batch.status
                        )))
                    }
                    BatchStatus::Pending | BatchStatus::Processing => {}
                }
                let now = Utc::now();
                conn.execute(
                    "UPDATE import_batches SET status = 'cancelled', completed_at = ?1, \
                     estimated_completion = NULL, updated_at = ?1 WHERE id = ?2",
                    params![now, id],
                )?;
                info!(batch_id = %id, "Batch cancelled");
                load_batch(conn, &owner, &id)
            })
            .await
    }

    /// Batch-level failure: terminal, with the reason kept in the error list.
    pub async fn fail_batch(&self, owner_id: &str, batch_id: &str, reason: &str) -> Result<ImportBatch> {
        let owner = owner_id.to_string();
        let id = batch_id.to_string();
        let reason = reason.to_string();
        self.db
            .call(move |conn| {
                let batch = load_batch(conn, &owner, &id)?;
                if batch.status.is_terminal() && batch.status != BatchStatus::Completed {
                    return Ok(batch);
                }
                append_error(conn, &id, &reason)?;
                let now = Utc::now();
                conn.execute(
                    "UPDATE import_batches SET status = 'failed', completed_at = ?1, \
                     estimated_completion = NULL, updated_at = ?1 WHERE id = ?2",
                    params![now, id],
                )?;
                warn!(batch_id = %id, reason = %reason, "Batch failed");
                load_batch(conn, &owner, &id)
            })
            .await
    }

    pub async fn add_batch_error(&self, owner_id: &str, batch_id: &str, message: &str) -> Result<()> {
        let owner = owner_id.to_string();
        let id = batch_id.to_string();
        let message = message.to_string();
        self.db
            .call(move |conn| {
                load_batch(conn, &owner, &id)?;
                append_error(conn, &id, &message)
            })
            .await
    }
}

pub fn progress_of(batch: &ImportBatch, now: DateTime<Utc>) -> BatchProgress {
    let is_complete =
        batch.status == BatchStatus::Completed || batch.processed_files >= batch.total_files;
    let estimated_completion = if is_complete || batch.status.is_terminal() {
        None
    } else {
        estimate_completion(now, batch.started_at, batch.processed_files, batch.total_files)
    };
    BatchProgress {
        batch_id: batch.id.clone(),
        status: batch.status,
        percentage: percentage(batch.processed_files, batch.total_files),
        total_files: batch.total_files,
        processed_files: batch.processed_files,
        successful_files: batch.successful_files,
        failed_files: batch.failed_files,
        duplicate_files: batch.duplicate_files,
        remaining_files: (batch.total_files - batch.processed_files).max(0),
        is_complete,
        estimated_completion,
    }
}
