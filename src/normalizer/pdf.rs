//! Text-layer and vision extraction of PDF statements.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use super::convert::{derive_merchant, DateConfig, DateConverter};
use crate::completion::{Attachment, CompletionChain, CompletionRequest};
use crate::error::{Result, SpendsortError};
use crate::models::{NormalizedTransaction, StatementKind};
use crate::settings::ImportSettings;

/// Page texts of a PDF with a usable text layer.
#[derive(Debug, Clone)]
pub struct PdfText {
    pub pages: Vec<String>,
}

impl PdfText {
    pub fn avg_chars_per_page(&self) -> f64 {
        if self.pages.is_empty() {
            return 0.0;
        }
        let chars: usize = self
            .pages
            .iter()
            .map(|p| p.chars().filter(|c| !c.is_whitespace()).count())
            .sum();
        chars as f64 / self.pages.len() as f64
    }

    pub fn joined(&self) -> String {
        self.pages.join("\n\n")
    }
}

/// Extract page text off the async workers.
pub async fn extract_pages(bytes: Vec<u8>) -> Result<PdfText> {
    tokio::task::spawn_blocking(move || {
        pdf_extract::extract_text_from_mem_by_pages(&bytes)
            .map(|pages| PdfText { pages })
            .map_err(|e| SpendsortError::Extraction(format!("Failed to read PDF text: {e}")))
    })
    .await
    .map_err(|e| SpendsortError::Other(format!("PDF extraction task panicked: {e}")))?
}

/// Scanned statements carry little or no text layer and must go through
/// the explicit vision path instead.
pub fn ensure_text_layer(text: &PdfText, min_chars_per_page: usize) -> Result<()> {
    let avg = text.avg_chars_per_page();
    if avg < min_chars_per_page as f64 {
        return Err(SpendsortError::Extraction(format!(
            "PDF looks scanned ({avg:.0} characters per page); use scanned-statement extraction"
        )));
    }
    Ok(())
}

pub fn truncate_chars(text: &str, budget: usize) -> &str {
    match text.char_indices().nth(budget) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedRow {
    pub date: String,
    #[serde(default)]
    pub post_date: Option<String>,
    pub description: String,
    #[serde(default)]
    pub merchant: Option<String>,
    pub amount: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedStatement {
    pub transactions: Vec<ExtractedRow>,
    #[serde(default)]
    pub currency: Option<String>,
    pub confidence: f64,
}

fn statement_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "required": ["transactions", "confidence"],
        "properties": {
            "transactions": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["date", "description", "amount"],
                    "properties": {
                        "date": {"type": "string"},
                        "postDate": {"type": ["string", "null"]},
                        "description": {"type": "string"},
                        "merchant": {"type": ["string", "null"]},
                        "amount": {"type": "number"}
                    }
                }
            },
            "currency": {"type": ["string", "null"]},
            "confidence": {"type": "number", "minimum": 0, "maximum": 1}
        }
    })
}

fn system_prompt(kind: StatementKind) -> String {
    let kind_hint = match kind {
        StatementKind::BankAccount => "This is a bank account statement.",
        StatementKind::CreditCard => {
            "This is a credit card statement: purchases and payments to the card are expenses, refunds are income."
        }
        StatementKind::Unknown => "The statement type is not known.",
    };
    format!(
        "You extract every transaction from financial statements. {kind_hint} \
         Report dates as YYYY-MM-DD. Report amounts signed from the account holder's view: \
         money out is negative, money in is positive. Skip opening and closing balance lines."
    )
}

fn into_transactions(rows: Vec<ExtractedRow>) -> Vec<NormalizedTransaction> {
    let iso = DateConfig {
        format: Some("YYYY-MM-DD".into()),
        excel_serial: false,
    };
    rows.into_iter()
        .filter_map(|row| {
            let Some(transaction_date) = DateConverter::convert(&row.date, &iso) else {
                warn!(date = %row.date, "Dropping extracted row with unparseable date");
                return None;
            };
            let amount = Decimal::from_f64_retain(row.amount)?.round_dp(2);
            let posted_date: Option<NaiveDate> = row
                .post_date
                .as_deref()
                .and_then(|d| DateConverter::convert(d, &iso));
            let description = row.description.trim().to_string();
            let merchant_name = row
                .merchant
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| derive_merchant(&description));
            let mut raw_fields = BTreeMap::new();
            raw_fields.insert("date".to_string(), row.date);
            raw_fields.insert("amount".to_string(), row.amount.to_string());
            Some(NormalizedTransaction {
                transaction_date,
                posted_date,
                description,
                merchant_name,
                amount,
                debit: None,
                credit: None,
                balance: None,
                raw_fields,
            })
        })
        .collect()
}

async fn run_extraction(
    chain: &CompletionChain,
    request: CompletionRequest,
) -> Result<(Vec<NormalizedTransaction>, Option<String>, f64)> {
    let completion = chain.complete::<ExtractedStatement>(&request).await?;
    let statement = completion.data;
    let extracted = statement.transactions.len();
    let transactions = into_transactions(statement.transactions);
    if transactions.is_empty() {
        return Err(SpendsortError::Extraction(
            "no transactions found in statement".into(),
        ));
    }
    info!(
        provider = %completion.provider,
        extracted,
        kept = transactions.len(),
        "Extracted statement transactions"
    );
    Ok((transactions, statement.currency, statement.confidence))
}

/// Text-layer path. Fails fast on scanned documents.
pub async fn extract_statement_pdf(
    chain: &CompletionChain,
    bytes: Vec<u8>,
    kind: StatementKind,
    settings: &ImportSettings,
) -> Result<(Vec<NormalizedTransaction>, Option<String>, f64)> {
    let text = extract_pages(bytes).await?;
    extract_statement_text(chain, &text, kind, settings).await
}

/// Text-layer path over pages that were already extracted.
pub async fn extract_statement_text(
    chain: &CompletionChain,
    text: &PdfText,
    kind: StatementKind,
    settings: &ImportSettings,
) -> Result<(Vec<NormalizedTransaction>, Option<String>, f64)> {
    ensure_text_layer(text, settings.low_text_chars_per_page)?;
    let joined = text.joined();
    let body = truncate_chars(&joined, settings.pdf_char_budget);
    if body.len() < joined.len() {
        warn!(budget = settings.pdf_char_budget, "Statement text truncated");
    }
    let request = CompletionRequest {
        purpose: "statement_text",
        system: system_prompt(kind),
        prompt: format!("Statement text:\n\n{body}\n\nReturn all transactions as JSON."),
        schema: statement_schema(),
        attachment: None,
        max_output_tokens: settings.statement_max_output_tokens,
    };
    run_extraction(chain, request).await
}

/// Vision path for scanned statements.
pub async fn extract_scanned_pdf(
    chain: &CompletionChain,
    bytes: Vec<u8>,
    kind: StatementKind,
    settings: &ImportSettings,
) -> Result<(Vec<NormalizedTransaction>, Option<String>, f64)> {
    let request = CompletionRequest {
        purpose: "statement_vision",
        system: system_prompt(kind),
        prompt: "Read the attached scanned statement and return all transactions as JSON.".into(),
        schema: statement_schema(),
        attachment: Some(Attachment {
            media_type: "application/pdf".into(),
            data: bytes,
        }),
        max_output_tokens: settings.statement_max_output_tokens,
    };
    run_extraction(chain, request).await
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use std::sync::Arc;

    use super::*;
    use crate::completion::testing::{chain_of, FakeProvider};

    #[test]
    fn test_scanned_detection() {
        let scanned = PdfText {
            pages: vec!["  \n ".into(), "Page 2".into()],
        };
        assert!(ensure_text_layer(&scanned, 100).is_err());
        let text = PdfText {
            pages: vec!["x".repeat(150), "y".repeat(90)],
        };
        assert!(ensure_text_layer(&text, 100).is_ok());
        assert!(ensure_text_layer(&PdfText { pages: vec![] }, 100).is_err());
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }

    #[test]
    fn test_into_transactions_drops_bad_dates() {
        let rows = vec![
            ExtractedRow {
                date: "2025-03-04".into(),
                post_date: Some("2025-03-05".into()),
                description: "SQ *BLUE BOTTLE".into(),
                merchant: None,
                amount: -6.5,
            },
            ExtractedRow {
                date: "sometime".into(),
                post_date: None,
                description: "??".into(),
                merchant: None,
                amount: 1.0,
            },
        ];
        let txns = into_transactions(rows);
        assert_eq!(txns.len(), 1);
        assert_eq!(txns[0].amount, Decimal::from_str("-6.50").unwrap());
        assert_eq!(txns[0].merchant_name, "BLUE BOTTLE");
        assert_eq!(
            txns[0].posted_date,
            NaiveDate::from_ymd_opt(2025, 3, 5)
        );
    }

    #[tokio::test]
    async fn test_scanned_path_sends_pdf_attachment() {
        let provider = Arc::new(FakeProvider::new(
            "vision",
            vec![Ok(json!({
                "transactions": [
                    {"date": "2025-01-02", "description": "RENT", "merchant": "Landlord", "amount": -1200.0}
                ],
                "confidence": 0.8
            }))],
        ));
        let chain = chain_of(vec![provider.clone()]);
        let (txns, currency, confidence) = extract_scanned_pdf(
            &chain,
            b"%PDF-1.4".to_vec(),
            StatementKind::BankAccount,
            &ImportSettings::default(),
        )
        .await
        .unwrap();
        assert_eq!(txns.len(), 1);
        assert_eq!(txns[0].merchant_name, "Landlord");
        assert_eq!(currency, None);
        assert!((confidence - 0.8).abs() < f64::EPSILON);
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn test_empty_extraction_is_failure() {
        let provider = Arc::new(FakeProvider::new(
            "vision",
            vec![Ok(json!({"transactions": [], "confidence": 0.2}))],
        ));
        let chain = chain_of(vec![provider]);
        let err = extract_scanned_pdf(
            &chain,
            b"%PDF-1.4".to_vec(),
            StatementKind::Unknown,
            &ImportSettings::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SpendsortError::Extraction(_)));
    }
}
