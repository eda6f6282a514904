//! Column mappings for tabular statements: inference through the completion
//! service and reuse of mappings learned earlier for the same header row.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::convert::{looks_numeric, AmountConfig, AmountConverter, DateConfig, DescriptionConfig};
use crate::completion::{CompletionChain, CompletionRequest};
use crate::db::Database;
use crate::error::{Result, SpendsortError};
use crate::models::StatementKind;
use crate::settings::ImportSettings;
use crate::sign::AmountSignStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LogicalField {
    TransactionDate,
    PostedDate,
    Description,
    Amount,
    Debit,
    Credit,
    Balance,
    Category,
    Merchant,
    Reference,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ColumnMappings {
    pub transaction_date: Option<usize>,
    pub posted_date: Option<usize>,
    pub description: Option<usize>,
    pub amount: Option<usize>,
    pub debit: Option<usize>,
    pub credit: Option<usize>,
    pub balance: Option<usize>,
    pub category: Option<usize>,
    pub merchant: Option<usize>,
    pub reference: Option<usize>,
}

impl ColumnMappings {
    pub fn get(&self, field: LogicalField) -> Option<usize> {
        match field {
            LogicalField::TransactionDate => self.transaction_date,
            LogicalField::PostedDate => self.posted_date,
            LogicalField::Description => self.description,
            LogicalField::Amount => self.amount,
            LogicalField::Debit => self.debit,
            LogicalField::Credit => self.credit,
            LogicalField::Balance => self.balance,
            LogicalField::Category => self.category,
            LogicalField::Merchant => self.merchant,
            LogicalField::Reference => self.reference,
        }
    }

    fn slots_mut(&mut self) -> [&mut Option<usize>; 10] {
        [
            &mut self.transaction_date,
            &mut self.posted_date,
            &mut self.description,
            &mut self.amount,
            &mut self.debit,
            &mut self.credit,
            &mut self.balance,
            &mut self.category,
            &mut self.merchant,
            &mut self.reference,
        ]
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

fn yes() -> bool {
    true
}

/// Per-field conversion instructions reported with a mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldConversion {
    pub field: LogicalField,
    #[serde(default)]
    pub date_format: Option<String>,
    #[serde(default)]
    pub excel_serial: bool,
    #[serde(default)]
    pub reverse_sign: bool,
    #[serde(default = "yes")]
    pub remove_symbols: bool,
    #[serde(default = "yes")]
    pub parentheses_negative: bool,
    #[serde(default = "yes")]
    pub trim: bool,
    #[serde(default)]
    pub strip_codes: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnMapping {
    pub header_row: usize,
    #[serde(default)]
    pub columns: ColumnMappings,
    #[serde(default)]
    pub conversions: Vec<FieldConversion>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub statement_kind: Option<StatementKind>,
}

impl ColumnMapping {
    pub fn conversion(&self, field: LogicalField) -> Option<&FieldConversion> {
        self.conversions.iter().find(|c| c.field == field)
    }

    pub fn date_config(&self, field: LogicalField) -> DateConfig {
        self.conversion(field)
            .map(|c| DateConfig {
                format: c.date_format.clone(),
                excel_serial: c.excel_serial,
            })
            .unwrap_or_default()
    }

    /// Amount parsing config with sign reversal left to the sign resolver.
    pub fn amount_config(&self, field: LogicalField) -> AmountConfig {
        self.conversion(field)
            .map(|c| AmountConfig {
                remove_symbols: c.remove_symbols,
                handle_parentheses: c.parentheses_negative,
                reverse_sign: false,
            })
            .unwrap_or_default()
    }

    pub fn description_config(&self, field: LogicalField) -> DescriptionConfig {
        self.conversion(field)
            .map(|c| DescriptionConfig {
                trim: c.trim,
                strip_codes: c.strip_codes,
            })
            .unwrap_or_default()
    }

    pub fn declared_reversal(&self) -> Option<bool> {
        self.conversion(LogicalField::Amount).map(|c| c.reverse_sign)
    }

    /// Drop column indices that fall outside the sheet.
    fn clamp_to_width(&mut self, width: usize) {
        for slot in self.columns.slots_mut() {
            if slot.map_or(false, |idx| idx >= width) {
                *slot = None;
            }
        }
    }
}

/// Columns that are numeric in more than `min_hits` of the first
/// `probe_rows` rows.
pub fn numeric_columns(rows: &[Vec<String>], probe_rows: usize, min_hits: usize) -> Vec<usize> {
    let width = rows.iter().map(Vec::len).max().unwrap_or(0);
    (0..width)
        .filter(|&col| {
            rows.iter()
                .take(probe_rows)
                .filter(|row| row.get(col).map_or(false, |c| looks_numeric(c)))
                .count()
                > min_hits
        })
        .collect()
}

/// Dataset-wide sign profile over the numeric columns.
pub fn amount_sign_stats(rows: &[Vec<String>], settings: &ImportSettings) -> AmountSignStats {
    let columns = numeric_columns(rows, settings.numeric_probe_rows, settings.numeric_min_hits);
    let config = AmountConfig::default();
    let mut stats = AmountSignStats::default();
    for row in rows.iter().take(settings.stats_sample_rows) {
        for &col in &columns {
            let Some(cell) = row.get(col).filter(|c| looks_numeric(c)) else {
                continue;
            };
            match AmountConverter::convert(cell, &config) {
                Some(v) if v.is_sign_positive() && !v.is_zero() => stats.positive_count += 1,
                Some(v) if v.is_sign_negative() && !v.is_zero() => stats.negative_count += 1,
                _ => {}
            }
        }
    }
    stats
}

pub fn header_signature(header: &[String]) -> String {
    let normalized: Vec<String> = header.iter().map(|c| c.trim().to_lowercase()).collect();
    let mut hasher = Sha256::new();
    hasher.update(normalized.join("\u{1f}").as_bytes());
    hex::encode(hasher.finalize())
}

/// A mapping this owner already confirmed for a statement with the same header row.
pub async fn find_known_mapping(
    db: &Database,
    owner_id: &str,
    rows: &[Vec<String>],
) -> Result<Option<ColumnMapping>> {
    let owner = owner_id.to_string();
    let stored: Vec<(String, String)> = db
        .call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT header_signature, mapping FROM statement_mappings WHERE owner_id = ?1 ORDER BY created_at DESC",
            )?;
            let rows = stmt
                .query_map([owner], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await?;

    for (signature, raw) in stored {
        let Ok(mapping) = serde_json::from_str::<ColumnMapping>(&raw) else {
            continue;
        };
        let Some(header) = rows.get(mapping.header_row) else {
            continue;
        };
        if header_signature(header) == signature {
            debug!(owner_id, "Reusing stored column mapping");
            return Ok(Some(mapping));
        }
    }
    Ok(None)
}

pub async fn save_mapping(
    db: &Database,
    owner_id: &str,
    rows: &[Vec<String>],
    mapping: &ColumnMapping,
) -> Result<()> {
    let Some(header) = rows.get(mapping.header_row) else {
        return Ok(());
    };
    let signature = header_signature(header);
    let raw = serde_json::to_string(mapping)?;
    let owner = owner_id.to_string();
    db.call(move |conn| {
        conn.execute(
            "INSERT INTO statement_mappings (id, owner_id, header_signature, mapping, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(owner_id, header_signature) DO UPDATE SET mapping = excluded.mapping, created_at = excluded.created_at",
            rusqlite::params![uuid::Uuid::new_v4().to_string(), owner, signature, raw, Utc::now()],
        )?;
        Ok(())
    })
    .await
}

const MAPPING_SYSTEM_PROMPT: &str = "You analyse spreadsheet exports of bank and credit card statements. \
Identify the header row and which zero-based column holds each field. Use null for fields that are absent. \
Report per-field conversion instructions: date formats using YYYY/MM/DD tokens or excelSerial for numeric dates, \
reverseSign when purchases appear as positive numbers, parenthesesNegative when negatives are wrapped in parentheses, \
stripCodes when descriptions carry reference codes.";

fn mapping_schema() -> serde_json::Value {
    let column = json!({"type": ["integer", "null"], "minimum": 0});
    json!({
        "type": "object",
        "required": ["headerRow", "columns", "confidence"],
        "properties": {
            "headerRow": {"type": "integer", "minimum": 0},
            "columns": {
                "type": "object",
                "properties": {
                    "transactionDate": column, "postedDate": column, "description": column,
                    "amount": column, "debit": column, "credit": column, "balance": column,
                    "category": column, "merchant": column, "reference": column
                }
            },
            "conversions": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["field"],
                    "properties": {
                        "field": {"type": "string", "enum": [
                            "transactionDate", "postedDate", "description", "amount", "debit",
                            "credit", "balance", "category", "merchant", "reference"
                        ]},
                        "dateFormat": {"type": ["string", "null"]},
                        "excelSerial": {"type": "boolean"},
                        "reverseSign": {"type": "boolean"},
                        "removeSymbols": {"type": "boolean"},
                        "parenthesesNegative": {"type": "boolean"},
                        "trim": {"type": "boolean"},
                        "stripCodes": {"type": "boolean"}
                    }
                }
            },
            "currency": {"type": ["string", "null"]},
            "confidence": {"type": "number", "minimum": 0, "maximum": 1},
            "statementKind": {"type": ["string", "null"], "enum": ["bank_account", "credit_card", "unknown", null]}
        }
    })
}

pub fn mapping_prompt(rows: &[Vec<String>], stats: &AmountSignStats, preview_rows: usize) -> String {
    let mut prompt = String::from("First rows of the sheet:\n");
    for (i, row) in rows.iter().take(preview_rows).enumerate() {
        prompt.push_str(&format!("Row {i}: {}\n", row.join(" | ")));
    }
    prompt.push_str(&format!(
        "\nAmount sign statistics across the sheet: {} positive values ({:.1}%), {} negative values ({:.1}%).\n",
        stats.positive_count,
        stats.positive_pct(),
        stats.negative_count,
        stats.negative_pct(),
    ));
    prompt.push_str("Return the column mapping as JSON.");
    prompt
}

pub async fn infer_mapping(
    chain: &CompletionChain,
    rows: &[Vec<String>],
    stats: &AmountSignStats,
    settings: &ImportSettings,
) -> Result<ColumnMapping> {
    let request = CompletionRequest {
        purpose: "column_mapping",
        system: MAPPING_SYSTEM_PROMPT.to_string(),
        prompt: mapping_prompt(rows, stats, settings.preview_rows),
        schema: mapping_schema(),
        attachment: None,
        max_output_tokens: 2_000,
    };
    let completion = chain.complete::<ColumnMapping>(&request).await?;
    let mut mapping = completion.data;
    validate_mapping(&mut mapping, rows)?;
    info!(
        provider = %completion.provider,
        confidence = mapping.confidence,
        header_row = mapping.header_row,
        "Inferred column mapping"
    );
    Ok(mapping)
}

pub fn validate_mapping(mapping: &mut ColumnMapping, rows: &[Vec<String>]) -> Result<()> {
    if mapping.header_row >= rows.len() {
        return Err(SpendsortError::Extraction(format!(
            "header row {} is outside the sheet",
            mapping.header_row
        )));
    }
    let width = rows.iter().map(Vec::len).max().unwrap_or(0);
    mapping.clamp_to_width(width);
    if mapping.columns.is_empty() {
        return Err(SpendsortError::Extraction(
            "could not map any statement columns".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::completion::testing::{chain_of, FakeProvider};
    use crate::db::test_db;

    fn sheet(rows: &[&[&str]]) -> Vec<Vec<String>> {
        rows.iter()
            .map(|r| r.iter().map(|c| c.to_string()).collect())
            .collect()
    }

    fn sample_rows() -> Vec<Vec<String>> {
        let mut rows = sheet(&[
            &["Account: 1234", "", ""],
            &["Date", "Description", "Amount"],
        ]);
        for i in 0..10 {
            rows.push(vec![
                format!("01/{:02}/2025", i + 1),
                format!("SHOP {i}"),
                if i < 8 { format!("{}.00", i + 1) } else { format!("-{}.00", i + 1) },
            ]);
        }
        rows
    }

    #[test]
    fn test_numeric_columns_skip_dates_and_text() {
        let rows = sample_rows();
        assert_eq!(numeric_columns(&rows, 50, 5), vec![2]);
        assert!(numeric_columns(&rows[..5], 50, 5).is_empty());
    }

    #[test]
    fn test_amount_sign_stats() {
        let stats = amount_sign_stats(&sample_rows(), &ImportSettings::default());
        assert_eq!(stats.positive_count, 8);
        assert_eq!(stats.negative_count, 2);
    }

    #[test]
    fn test_empty_mapping_rejected() {
        let rows = sample_rows();
        let mut mapping = ColumnMapping {
            header_row: 1,
            columns: ColumnMappings::default(),
            conversions: vec![],
            currency: None,
            confidence: 0.9,
            statement_kind: None,
        };
        let err = validate_mapping(&mut mapping, &rows).unwrap_err();
        assert!(matches!(err, SpendsortError::Extraction(_)));
    }

    #[test]
    fn test_out_of_range_columns_dropped() {
        let rows = sample_rows();
        let mut mapping = ColumnMapping {
            header_row: 1,
            columns: ColumnMappings {
                transaction_date: Some(0),
                amount: Some(2),
                balance: Some(9),
                ..Default::default()
            },
            conversions: vec![],
            currency: None,
            confidence: 0.9,
            statement_kind: None,
        };
        validate_mapping(&mut mapping, &rows).unwrap();
        assert_eq!(mapping.columns.balance, None);
        assert_eq!(mapping.columns.amount, Some(2));
    }

    #[test]
    fn test_mapping_deserializes_camel_case() {
        let raw = json!({
            "headerRow": 1,
            "columns": {"transactionDate": 0, "description": 1, "amount": 2, "debit": null},
            "conversions": [{"field": "amount", "reverseSign": true}],
            "currency": "USD",
            "confidence": 0.92,
            "statementKind": "credit_card"
        });
        let mapping: ColumnMapping = serde_json::from_value(raw).unwrap();
        assert_eq!(mapping.columns.amount, Some(2));
        assert_eq!(mapping.declared_reversal(), Some(true));
        assert!(mapping.amount_config(LogicalField::Amount).remove_symbols);
        assert!(!mapping.amount_config(LogicalField::Amount).reverse_sign);
        assert_eq!(mapping.statement_kind, Some(StatementKind::CreditCard));
    }

    #[test]
    fn test_prompt_carries_preview_and_stats() {
        let rows = sample_rows();
        let stats = AmountSignStats {
            positive_count: 8,
            negative_count: 2,
        };
        let prompt = mapping_prompt(&rows, &stats, 3);
        assert!(prompt.contains("Row 1: Date | Description | Amount"));
        assert!(!prompt.contains("Row 3:"));
        assert!(prompt.contains("80.0%"));
    }

    #[tokio::test]
    async fn test_infer_mapping_via_completion() {
        let provider = Arc::new(FakeProvider::new(
            "fake",
            vec![Ok(json!({
                "headerRow": 1,
                "columns": {"transactionDate": 0, "description": 1, "amount": 2},
                "confidence": 0.9
            }))],
        ));
        let chain = chain_of(vec![provider.clone()]);
        let rows = sample_rows();
        let stats = amount_sign_stats(&rows, &ImportSettings::default());
        let mapping = infer_mapping(&chain, &rows, &stats, &ImportSettings::default())
            .await
            .unwrap();
        assert_eq!(mapping.columns.description, Some(1));
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn test_saved_mapping_found_by_header() {
        let (_dir, db) = test_db();
        let rows = sample_rows();
        let mapping = ColumnMapping {
            header_row: 1,
            columns: ColumnMappings {
                transaction_date: Some(0),
                description: Some(1),
                amount: Some(2),
                ..Default::default()
            },
            conversions: vec![],
            currency: Some("USD".into()),
            confidence: 0.9,
            statement_kind: None,
        };
        save_mapping(&db, "owner-1", &rows, &mapping).await.unwrap();
        let found = find_known_mapping(&db, "owner-1", &rows).await.unwrap();
        assert_eq!(found, Some(mapping));
        assert_eq!(find_known_mapping(&db, "owner-2", &rows).await.unwrap(), None);

        let mut other = rows.clone();
        other[1] = vec!["Posted".into(), "Payee".into(), "Value".into()];
        assert_eq!(find_known_mapping(&db, "owner-1", &other).await.unwrap(), None);
    }
}
