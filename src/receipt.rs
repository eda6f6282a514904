use std::collections::BTreeMap;

use chrono::NaiveDate;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::completion::{Attachment, CompletionChain, CompletionRequest};
use crate::error::{Result, SpendsortError};
use crate::models::NormalizedTransaction;
use crate::normalizer::convert::{DateConfig, DateConverter};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceiptFields {
    merchant_name: Option<String>,
    transaction_date: Option<String>,
    total_amount: Option<f64>,
    currency: Option<String>,
    tax_amount: Option<f64>,
    confidence: f64,
}

/// Fields read off a receipt image or PDF. Amounts follow the canonical
/// polarity, so a purchase total is negative.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedReceipt {
    pub merchant_name: String,
    pub transaction_date: NaiveDate,
    pub total_amount: Decimal,
    pub currency: Option<String>,
    pub tax_amount: Option<Decimal>,
    pub confidence: f64,
}

impl ExtractedReceipt {
    pub fn to_transaction(&self) -> NormalizedTransaction {
        let mut raw_fields = BTreeMap::new();
        if let Some(currency) = &self.currency {
            raw_fields.insert("currency".to_string(), currency.clone());
        }
        if let Some(tax) = self.tax_amount {
            raw_fields.insert("taxAmount".to_string(), tax.to_string());
        }
        NormalizedTransaction {
            transaction_date: self.transaction_date,
            posted_date: None,
            description: self.merchant_name.clone(),
            merchant_name: self.merchant_name.clone(),
            amount: self.total_amount,
            debit: Some(self.total_amount.abs()),
            credit: None,
            balance: None,
            raw_fields,
        }
    }
}

fn receipt_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "required": ["merchantName", "transactionDate", "totalAmount", "confidence"],
        "properties": {
            "merchantName": {"type": ["string", "null"]},
            "transactionDate": {"type": ["string", "null"]},
            "totalAmount": {"type": ["number", "null"]},
            "currency": {"type": ["string", "null"]},
            "taxAmount": {"type": ["number", "null"]},
            "confidence": {"type": "number", "minimum": 0, "maximum": 1}
        }
    })
}

const SYSTEM_PROMPT: &str = "You read purchase receipts. Return the merchant name as printed, \
the purchase date as YYYY-MM-DD, the grand total including tax as a positive number, \
the ISO currency code and the tax amount if shown. Use null for anything you cannot read.";

#[derive(Clone)]
pub struct ReceiptExtractor {
    chain: CompletionChain,
}

impl ReceiptExtractor {
    pub fn new(chain: CompletionChain) -> Self {
        Self { chain }
    }

    pub async fn extract(&self, bytes: Vec<u8>, media_type: &str) -> Result<ExtractedReceipt> {
        let request = CompletionRequest {
            purpose: "receipt",
            system: SYSTEM_PROMPT.to_string(),
            prompt: "Extract the receipt fields from the attachment as JSON.".to_string(),
            schema: receipt_schema(),
            attachment: Some(Attachment {
                media_type: media_type.to_string(),
                data: bytes,
            }),
            max_output_tokens: 1_000,
        };
        let completion = self.chain.complete::<ReceiptFields>(&request).await?;
        let receipt = into_receipt(completion.data)?;
        info!(
            provider = %completion.provider,
            merchant = %receipt.merchant_name,
            date = %receipt.transaction_date,
            "Extracted receipt"
        );
        Ok(receipt)
    }
}

fn into_receipt(fields: ReceiptFields) -> Result<ExtractedReceipt> {
    let merchant_name = fields
        .merchant_name
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty())
        .ok_or_else(|| SpendsortError::Extraction("receipt has no readable merchant".into()))?;
    let transaction_date = fields
        .transaction_date
        .as_deref()
        .and_then(|d| DateConverter::convert(d, &DateConfig::default()))
        .ok_or_else(|| SpendsortError::Extraction("receipt has no readable date".into()))?;
    let total = fields
        .total_amount
        .and_then(Decimal::from_f64)
        .ok_or_else(|| SpendsortError::Extraction("receipt has no readable total".into()))?;
    Ok(ExtractedReceipt {
        merchant_name,
        transaction_date,
        total_amount: -total.abs().round_dp(2),
        currency: fields.currency.filter(|c| !c.trim().is_empty()),
        tax_amount: fields.tax_amount.and_then(Decimal::from_f64).map(|t| t.abs().round_dp(2)),
        confidence: fields.confidence,
    })
}
