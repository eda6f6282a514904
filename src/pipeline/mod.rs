//! Per-item import pipeline run by the worker.

pub mod format;
pub mod queue;

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::batch::{BatchCoordinator, ItemUpdate};
use crate::categorize::{CategorizationContext, CategorizationInput, CategoryManager};
use crate::completion::CompletionChain;
use crate::db::Database;
use crate::documents::{self, NewDocument};
use crate::duplicate::{DuplicateDetector, FileFingerprint, ReceiptKey};
use crate::error::{Result, SpendsortError};
use crate::fetch::FileFetcher;
use crate::models::{
    CategorizationResult, DocumentKind, DuplicateMatch, ImportType, ItemStatus, NormalizedTransaction,
    StatementKind,
};
use crate::normalizer::StatementNormalizer;
use crate::receipt::{ExtractedReceipt, ReceiptExtractor};
use crate::settings::Settings;

use self::format::FileFormat;
use self::queue::ItemJob;

/// How a downloaded file is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Receipt,
    Statement(StatementKind),
}

fn route_for(import_type: ImportType, format: FileFormat) -> Result<Route> {
    match (import_type, format) {
        (ImportType::Receipts, f) if f.is_image() || f == FileFormat::Pdf => Ok(Route::Receipt),
        (ImportType::Receipts, f) => Err(SpendsortError::Validation(format!(
            "receipts must be images or PDFs, got {}",
            f.media_type()
        ))),
        (ImportType::Auto, f) if f.is_image() => Ok(Route::Receipt),
        (_, f) if f.is_image() => Err(SpendsortError::Validation(
            "statements must be spreadsheets or PDFs".into(),
        )),
        (t, _) => Ok(Route::Statement(t.statement_kind())),
    }
}

fn fingerprint(bytes: &[u8]) -> FileFingerprint {
    FileFingerprint {
        content_hash: hex::encode(Sha256::digest(bytes)),
        file_size: bytes.len() as i64,
    }
}

enum Extracted {
    Receipt(ExtractedReceipt),
    Statement(Vec<NormalizedTransaction>),
}

/// Why an item stopped short of `completed`.
enum Halt {
    Duplicate(ItemUpdate),
    Failed(SpendsortError),
}

impl From<SpendsortError> for Halt {
    fn from(err: SpendsortError) -> Self {
        Halt::Failed(err)
    }
}

pub struct Pipeline {
    db: Database,
    coordinator: BatchCoordinator,
    fetcher: Arc<dyn FileFetcher>,
    normalizer: StatementNormalizer,
    receipts: ReceiptExtractor,
    detector: DuplicateDetector,
    categorizer: Arc<CategoryManager>,
    categorize_concurrency: usize,
    scanned_fallback: bool,
}

impl Pipeline {
    pub fn new(
        db: Database,
        chain: CompletionChain,
        fetcher: Arc<dyn FileFetcher>,
        settings: &Settings,
        ai_enabled: bool,
    ) -> Self {
        let categorizer = CategoryManager::standard(
            db.clone(),
            chain.clone(),
            &settings.categorization,
            ai_enabled && settings.categorization.ai_fallback,
        );
        Self {
            coordinator: BatchCoordinator::new(db.clone()),
            fetcher,
            normalizer: StatementNormalizer::new(
                db.clone(),
                chain.clone(),
                settings.import.clone(),
                settings.sign_policy,
            ),
            receipts: ReceiptExtractor::new(chain),
            detector: DuplicateDetector::new(db.clone()),
            categorizer: Arc::new(categorizer),
            categorize_concurrency: settings.categorization.concurrency,
            scanned_fallback: false,
            db,
        }
    }

    /// Route PDFs without a text layer to vision extraction instead of
    /// failing them.
    pub fn with_scanned_fallback(mut self, enabled: bool) -> Self {
        self.scanned_fallback = enabled;
        self
    }

    /// Run one item to a final status. Item-level failures are recorded on
    /// the item and returned as `Ok(ItemStatus::Failed)`; an `Err` means the
    /// status itself could not be recorded.
    pub async fn process_item(&self, job: ItemJob) -> Result<ItemStatus> {
        self.coordinator.start_item(&job.owner_id, &job.item_id).await?;
        debug!(item_id = %job.item_id, attempt = job.attempt, "Processing item");

        let mut created_document = None;
        let outcome = self.run(&job, &mut created_document).await;

        let update = match outcome {
            Ok(document_id) => {
                info!(item_id = %job.item_id, file = %job.file_name, "Item completed");
                ItemUpdate::completed(document_id)
            }
            Err(halt) => {
                if let Some(doc_id) = created_document.take() {
                    if let Err(e) = documents::delete_document(&self.db, &doc_id).await {
                        warn!(document_id = %doc_id, error = %e, "Could not remove partial document");
                    }
                }
                match halt {
                    Halt::Duplicate(update) => {
                        info!(item_id = %job.item_id, file = %job.file_name, "Item is a duplicate");
                        update
                    }
                    Halt::Failed(err) => {
                        warn!(
                            item_id = %job.item_id,
                            file = %job.file_name,
                            code = err.error_code(),
                            error = %err,
                            "Item failed"
                        );
                        let message = format!("{}: {err}", job.file_name);
                        if let Err(e) = self
                            .coordinator
                            .add_batch_error(&job.owner_id, &job.batch_id, &message)
                            .await
                        {
                            warn!(batch_id = %job.batch_id, error = %e, "Could not record batch error");
                        }
                        ItemUpdate::failed(&err)
                    }
                }
            }
        };
        let status = update.status;
        self.coordinator
            .update_item_status(&job.owner_id, &job.item_id, update)
            .await?;
        Ok(status)
    }

    async fn run(
        &self,
        job: &ItemJob,
        created_document: &mut Option<String>,
    ) -> std::result::Result<String, Halt> {
        let bytes = self.fetcher.fetch(&job.file_url).await?;
        if bytes.is_empty() {
            return Err(SpendsortError::Extraction(format!("{} is empty", job.file_name)).into());
        }
        let fp = fingerprint(&bytes);

        if let Some(found) = self.detector.check_file(&job.owner_id, &fp, None).await? {
            return Err(self.duplicate_halt(found).await);
        }

        let format = FileFormat::detect(&job.file_name, &bytes)
            .or(job.format_hint)
            .ok_or_else(|| {
                SpendsortError::Validation(format!("unsupported file type: {}", job.file_name))
            })?;
        let route = route_for(job.import_type, format)?;

        let document_id = documents::create_document(
            &self.db,
            NewDocument {
                owner_id: job.owner_id.clone(),
                kind: match route {
                    Route::Receipt => DocumentKind::Receipt,
                    Route::Statement(_) => DocumentKind::Statement,
                },
                file_name: job.file_name.clone(),
                file_url: Some(job.file_url.clone()),
                file_size: fp.file_size,
                content_hash: fp.content_hash.clone(),
            },
        )
        .await?;
        *created_document = Some(document_id.clone());

        // A copy stored by a concurrent item after our first check.
        if let Some(found) = self
            .detector
            .detect(&job.owner_id, &fp, None, Some(&document_id))
            .await?
        {
            return Err(self.duplicate_halt(found).await);
        }

        let extracted = match route {
            Route::Receipt => Extracted::Receipt(self.receipts.extract(bytes, format.media_type()).await?),
            Route::Statement(kind) => Extracted::Statement(
                self.extract_statement(&job.owner_id, bytes, format, kind).await?,
            ),
        };

        if let Extracted::Receipt(receipt) = &extracted {
            let key = ReceiptKey {
                merchant_name: receipt.merchant_name.clone(),
                date: receipt.transaction_date,
                amount: receipt.total_amount,
            };
            if let Some(found) = self
                .detector
                .check_receipt(&job.owner_id, &key, fp.file_size, Some(&document_id))
                .await?
            {
                return Err(self.duplicate_halt(found).await);
            }
        }

        let (receipt, transactions) = match extracted {
            Extracted::Receipt(receipt) => {
                let transactions = vec![receipt.to_transaction()];
                (Some(receipt), transactions)
            }
            Extracted::Statement(transactions) => (None, transactions),
        };
        let ctx = CategorizationContext::load(&self.db, &job.owner_id).await?;
        let inputs: Vec<CategorizationInput> = transactions.iter().map(CategorizationInput::from).collect();
        let results = self
            .categorizer
            .categorize_many(&inputs, &ctx, self.categorize_concurrency)
            .await?;

        match receipt {
            Some(receipt) => {
                let result = results.into_iter().next().unwrap_or_else(CategorizationResult::none);
                documents::set_receipt_fields(
                    &self.db,
                    &document_id,
                    &receipt.merchant_name,
                    receipt.transaction_date,
                    receipt.total_amount,
                    &result,
                )
                .await?;
            }
            None => {
                let count = documents::insert_transactions(
                    &self.db,
                    &job.owner_id,
                    &document_id,
                    transactions.into_iter().zip(results).collect(),
                )
                .await?;
                debug!(document_id = %document_id, count, "Stored statement transactions");
            }
        }
        Ok(document_id)
    }

    async fn duplicate_halt(&self, found: DuplicateMatch) -> Halt {
        match self.detector.duplicate_error(&found).await {
            Ok(err) => Halt::Duplicate(ItemUpdate::duplicate(
                found.document_id,
                found.match_type,
                err.to_string(),
            )),
            Err(e) => Halt::Failed(e),
        }
    }

    async fn extract_statement(
        &self,
        owner_id: &str,
        bytes: Vec<u8>,
        format: FileFormat,
        kind: StatementKind,
    ) -> Result<Vec<NormalizedTransaction>> {
        let statement = match format.tabular() {
            Some(tabular) => {
                self.normalizer
                    .normalize_tabular(owner_id, &bytes, tabular, kind)
                    .await?
            }
            None if self.scanned_fallback => self.normalizer.normalize_pdf_or_scanned(bytes, kind).await?,
            None => self.normalizer.normalize_pdf(bytes, kind).await?,
        };
        Ok(statement.transactions)
    }
}
