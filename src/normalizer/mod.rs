//! Statement normalization: spreadsheets and PDFs into canonical transactions.

pub mod convert;
pub mod mapping;
pub mod pdf;
pub mod tabular;

use tracing::info;

use crate::completion::CompletionChain;
use crate::db::Database;
use crate::error::{Result, SpendsortError};
use crate::models::{NormalizedTransaction, StatementKind};
use crate::settings::{ImportSettings, SignPolicy};

pub use tabular::TabularFormat;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingSource {
    /// Reused a mapping learned from an earlier upload with the same header.
    Stored,
    Inferred,
    /// PDF statements are extracted whole; no column mapping exists.
    Document,
}

#[derive(Debug, Clone)]
pub struct NormalizedStatement {
    pub transactions: Vec<NormalizedTransaction>,
    pub currency: Option<String>,
    pub confidence: f64,
    /// Kind the statement was normalized as, after `Unknown` resolution.
    pub statement_kind: StatementKind,
    pub mapping_source: MappingSource,
}

#[derive(Clone)]
pub struct StatementNormalizer {
    db: Database,
    chain: CompletionChain,
    settings: ImportSettings,
    sign_policy: SignPolicy,
}

impl StatementNormalizer {
    pub fn new(
        db: Database,
        chain: CompletionChain,
        settings: ImportSettings,
        sign_policy: SignPolicy,
    ) -> Self {
        Self {
            db,
            chain,
            settings,
            sign_policy,
        }
    }

    pub async fn normalize_tabular(
        &self,
        owner_id: &str,
        bytes: &[u8],
        format: TabularFormat,
        kind: StatementKind,
    ) -> Result<NormalizedStatement> {
        let rows = tabular::read_rows(bytes, format)?;
        let stats = mapping::amount_sign_stats(&rows, &self.settings);

        let (column_mapping, source) =
            match mapping::find_known_mapping(&self.db, owner_id, &rows).await? {
                Some(known) => (known, MappingSource::Stored),
                None => {
                    let inferred =
                        mapping::infer_mapping(&self.chain, &rows, &stats, &self.settings).await?;
                    mapping::save_mapping(&self.db, owner_id, &rows, &inferred).await?;
                    (inferred, MappingSource::Inferred)
                }
            };

        // The caller's declared kind wins; the mapping only fills in `Unknown`.
        let kind = match kind {
            StatementKind::Unknown => column_mapping.statement_kind.unwrap_or(StatementKind::Unknown),
            declared => declared,
        };

        let transactions =
            tabular::normalize_rows(&rows, &column_mapping, kind, &stats, self.sign_policy);
        if transactions.is_empty() {
            return Err(SpendsortError::Extraction(
                "no transactions found in statement".into(),
            ));
        }
        info!(
            owner_id,
            rows = rows.len(),
            transactions = transactions.len(),
            kind = %kind,
            source = ?source,
            "Normalized tabular statement"
        );
        Ok(NormalizedStatement {
            transactions,
            currency: column_mapping.currency.clone(),
            confidence: column_mapping.confidence,
            statement_kind: kind,
            mapping_source: source,
        })
    }

    pub async fn normalize_pdf(&self, bytes: Vec<u8>, kind: StatementKind) -> Result<NormalizedStatement> {
        let (transactions, currency, confidence) =
            pdf::extract_statement_pdf(&self.chain, bytes, kind, &self.settings).await?;
        Ok(NormalizedStatement {
            transactions,
            currency,
            confidence,
            statement_kind: kind,
            mapping_source: MappingSource::Document,
        })
    }

    /// Text-layer extraction, switching to vision extraction when the PDF
    /// has too little text. Pages are read once.
    pub async fn normalize_pdf_or_scanned(
        &self,
        bytes: Vec<u8>,
        kind: StatementKind,
    ) -> Result<NormalizedStatement> {
        let text = pdf::extract_pages(bytes.clone()).await?;
        self.normalize_extracted_pdf(&text, bytes, kind).await
    }

    async fn normalize_extracted_pdf(
        &self,
        text: &pdf::PdfText,
        bytes: Vec<u8>,
        kind: StatementKind,
    ) -> Result<NormalizedStatement> {
        if pdf::ensure_text_layer(text, self.settings.low_text_chars_per_page).is_err() {
            info!(pages = text.pages.len(), "No usable text layer, reading statement as scanned");
            return self.normalize_scanned_pdf(bytes, kind).await;
        }
        let (transactions, currency, confidence) =
            pdf::extract_statement_text(&self.chain, text, kind, &self.settings).await?;
        Ok(NormalizedStatement {
            transactions,
            currency,
            confidence,
            statement_kind: kind,
            mapping_source: MappingSource::Document,
        })
    }

    /// Vision extraction for statements without a text layer.
    pub async fn normalize_scanned_pdf(
        &self,
        bytes: Vec<u8>,
        kind: StatementKind,
    ) -> Result<NormalizedStatement> {
        let (transactions, currency, confidence) =
            pdf::extract_scanned_pdf(&self.chain, bytes, kind, &self.settings).await?;
        Ok(NormalizedStatement {
            transactions,
            currency,
            confidence,
            statement_kind: kind,
            mapping_source: MappingSource::Document,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use std::sync::Arc;

    use rust_decimal::Decimal;
    use serde_json::json;

    use super::*;
    use crate::completion::testing::{chain_of, FakeProvider};
    use crate::db::test_db;

    const CARD_CSV: &str = "Posted Date,Payee,Amount\n\
        01/03/2025,NETFLIX.COM,15.49\n\
        01/04/2025,SHELL OIL 5723,48.20\n\
        01/05/2025,WHOLE FOODS,102.33\n\
        01/06/2025,UBER TRIP,23.10\n\
        01/07/2025,SPOTIFY,9.99\n\
        01/08/2025,TARGET,61.75\n\
        01/09/2025,ONLINE PAYMENT THANK YOU,-260.00\n";

    fn mapping_response() -> serde_json::Value {
        json!({
            "headerRow": 0,
            "columns": {"transactionDate": 0, "description": 1, "amount": 2},
            "conversions": [{"field": "transactionDate", "dateFormat": "MM/DD/YYYY"}],
            "currency": "USD",
            "confidence": 0.93,
            "statementKind": "credit_card"
        })
    }

    #[tokio::test]
    async fn test_auto_kind_resolved_from_mapping_and_reused() {
        let (_dir, db) = test_db();
        let provider = Arc::new(FakeProvider::new("fake", vec![Ok(mapping_response())]));
        let normalizer = StatementNormalizer::new(
            db,
            chain_of(vec![provider.clone()]),
            ImportSettings::default(),
            SignPolicy::default(),
        );

        let first = normalizer
            .normalize_tabular("owner-1", CARD_CSV.as_bytes(), TabularFormat::Csv, StatementKind::Unknown)
            .await
            .unwrap();
        assert_eq!(first.statement_kind, StatementKind::CreditCard);
        assert_eq!(first.mapping_source, MappingSource::Inferred);
        assert_eq!(first.transactions.len(), 7);
        assert_eq!(first.transactions[0].amount, Decimal::from_str("-15.49").unwrap());
        assert_eq!(first.transactions[6].amount, Decimal::from_str("-260.00").unwrap());
        assert_eq!(first.currency.as_deref(), Some("USD"));

        let second = normalizer
            .normalize_tabular("owner-1", CARD_CSV.as_bytes(), TabularFormat::Csv, StatementKind::Unknown)
            .await
            .unwrap();
        assert_eq!(second.mapping_source, MappingSource::Stored);
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn test_declared_kind_beats_mapping() {
        let (_dir, db) = test_db();
        let provider = Arc::new(FakeProvider::new("fake", vec![Ok(mapping_response())]));
        let normalizer = StatementNormalizer::new(
            db,
            chain_of(vec![provider]),
            ImportSettings::default(),
            SignPolicy::default(),
        );
        let got = normalizer
            .normalize_tabular("owner-1", CARD_CSV.as_bytes(), TabularFormat::Csv, StatementKind::BankAccount)
            .await
            .unwrap();
        assert_eq!(got.statement_kind, StatementKind::BankAccount);
        assert_eq!(got.transactions[0].amount, Decimal::from_str("15.49").unwrap());
    }

    #[tokio::test]
    async fn test_mapping_failure_surfaces_as_extraction() {
        let (_dir, db) = test_db();
        let provider = Arc::new(FakeProvider::new(
            "fake",
            vec![Ok(json!({"headerRow": 0, "columns": {}, "confidence": 0.1}))],
        ));
        let normalizer = StatementNormalizer::new(
            db,
            chain_of(vec![provider]),
            ImportSettings::default(),
            SignPolicy::default(),
        );
        let err = normalizer
            .normalize_tabular("owner-1", CARD_CSV.as_bytes(), TabularFormat::Csv, StatementKind::Unknown)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "EXTRACTION_FAILED");
    }

    fn statement_response() -> serde_json::Value {
        json!({
            "transactions": [
                {"date": "2025-02-03", "description": "ACH PAYROLL", "amount": 1800.0},
                {"date": "2025-02-04", "description": "CITY WATER", "amount": -42.1}
            ],
            "currency": "USD",
            "confidence": 0.9
        })
    }

    #[tokio::test]
    async fn test_extracted_pdf_routes_by_text_layer() {
        let (_dir, db) = test_db();
        let provider = Arc::new(FakeProvider::new(
            "fake",
            vec![Ok(statement_response()), Ok(statement_response())],
        ));
        let normalizer = StatementNormalizer::new(
            db,
            chain_of(vec![provider.clone()]),
            ImportSettings::default(),
            SignPolicy::default(),
        );

        let scanned = pdf::PdfText {
            pages: vec![" ".into(), "1".into()],
        };
        let got = normalizer
            .normalize_extracted_pdf(&scanned, b"%PDF-1.4".to_vec(), StatementKind::BankAccount)
            .await
            .unwrap();
        assert_eq!(got.transactions.len(), 2);
        assert_eq!(got.mapping_source, MappingSource::Document);

        let text = pdf::PdfText {
            pages: vec!["02/03 ACH PAYROLL 1,800.00 ".repeat(10)],
        };
        normalizer
            .normalize_extracted_pdf(&text, b"%PDF-1.4".to_vec(), StatementKind::BankAccount)
            .await
            .unwrap();

        let prompts = provider.prompts.lock().unwrap().clone();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[0].contains("scanned statement"));
        assert!(prompts[1].starts_with("Statement text:"));
        assert!(prompts[1].contains("ACH PAYROLL"));
    }
}
