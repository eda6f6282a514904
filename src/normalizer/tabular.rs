use std::collections::BTreeMap;

use tracing::debug;

use super::convert::{derive_merchant, AmountConverter, DateConverter, DescriptionConverter};
use super::mapping::{ColumnMapping, LogicalField};
use crate::error::{Result, SpendsortError};
use crate::models::{NormalizedTransaction, StatementKind};
use crate::settings::SignPolicy;
use crate::sign::{resolve_amount, AmountSignStats, RawAmounts, SignContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabularFormat {
    Csv,
    Xlsx,
}

const BALANCE_MARKERS: &[&str] = &[
    "beginning balance",
    "ending balance",
    "opening balance",
    "closing balance",
    "previous balance",
    "new balance",
];

/// Read every row of the first sheet as strings.
pub fn read_rows(bytes: &[u8], format: TabularFormat) -> Result<Vec<Vec<String>>> {
    let rows = match format {
        TabularFormat::Csv => read_csv(bytes)?,
        TabularFormat::Xlsx => read_xlsx(bytes)?,
    };
    let rows: Vec<Vec<String>> = rows
        .into_iter()
        .filter(|row| row.iter().any(|c| !c.trim().is_empty()))
        .collect();
    if rows.is_empty() {
        return Err(SpendsortError::Extraction("statement has no rows".into()));
    }
    Ok(rows)
}

fn read_csv(bytes: &[u8]) -> Result<Vec<Vec<String>>> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes);
    let mut rows = Vec::new();
    for result in rdr.records() {
        let record = result?;
        rows.push(record.iter().map(|c| c.trim().to_string()).collect());
    }
    Ok(rows)
}

#[cfg(feature = "xlsx")]
fn read_xlsx(bytes: &[u8]) -> Result<Vec<Vec<String>>> {
    use calamine::{Data, Reader};

    use super::convert::excel_serial_to_date;

    let mut workbook = calamine::open_workbook_auto_from_rs(std::io::Cursor::new(bytes.to_vec()))
        .map_err(|e| SpendsortError::Extraction(format!("Failed to open spreadsheet: {e}")))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| SpendsortError::Extraction("spreadsheet has no sheets".into()))?
        .map_err(|e| SpendsortError::Extraction(format!("Failed to read sheet: {e}")))?;

    let rows = range
        .rows()
        .map(|row| {
            row.iter()
                .map(|cell| match cell {
                    Data::String(s) => s.trim().to_string(),
                    Data::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", *f as i64),
                    Data::Float(f) => f.to_string(),
                    Data::Int(i) => i.to_string(),
                    Data::Bool(b) => b.to_string(),
                    Data::DateTime(dt) => excel_serial_to_date(dt.as_f64())
                        .map(|d| d.to_string())
                        .unwrap_or_default(),
                    Data::DateTimeIso(s) | Data::DurationIso(s) => s.clone(),
                    Data::Error(_) | Data::Empty => String::new(),
                })
                .collect()
        })
        .collect();
    Ok(rows)
}

#[cfg(not(feature = "xlsx"))]
fn read_xlsx(_bytes: &[u8]) -> Result<Vec<Vec<String>>> {
    Err(SpendsortError::Validation(
        "spreadsheet support is not compiled in (enable the xlsx feature)".into(),
    ))
}

fn is_balance_row(description: &str) -> bool {
    let lower = description.to_lowercase();
    BALANCE_MARKERS.iter().any(|m| lower.contains(m))
}

fn cell<'a>(row: &'a [String], mapping: &ColumnMapping, field: LogicalField) -> Option<&'a str> {
    mapping
        .columns
        .get(field)
        .and_then(|idx| row.get(idx))
        .map(String::as_str)
        .filter(|s| !s.trim().is_empty())
}

/// Convert the data rows below the header into canonical transactions.
/// Rows without a parseable date or any amount are dropped.
pub fn normalize_rows(
    rows: &[Vec<String>],
    mapping: &ColumnMapping,
    kind: StatementKind,
    stats: &AmountSignStats,
    policy: SignPolicy,
) -> Vec<NormalizedTransaction> {
    let header = rows.get(mapping.header_row).cloned().unwrap_or_default();
    let ctx = SignContext {
        kind,
        declared_reversal: mapping.declared_reversal(),
        stats: Some(stats),
        policy,
    };
    let date_cfg = mapping.date_config(LogicalField::TransactionDate);
    let posted_cfg = mapping.date_config(LogicalField::PostedDate);
    let desc_cfg = mapping.description_config(LogicalField::Description);

    let mut out = Vec::new();
    let mut skipped = 0usize;
    for row in rows.iter().skip(mapping.header_row + 1) {
        let description = cell(row, mapping, LogicalField::Description)
            .map(|raw| DescriptionConverter::convert(raw, &desc_cfg))
            .unwrap_or_default();
        if is_balance_row(&description) {
            skipped += 1;
            continue;
        }
        let Some(transaction_date) = cell(row, mapping, LogicalField::TransactionDate)
            .and_then(|raw| DateConverter::convert(raw, &date_cfg))
        else {
            skipped += 1;
            continue;
        };

        let parse = |field| {
            cell(row, mapping, field)
                .and_then(|raw| AmountConverter::convert(raw, &mapping.amount_config(field)))
        };
        let raw = RawAmounts {
            amount: parse(LogicalField::Amount),
            debit: parse(LogicalField::Debit).filter(|d| !d.is_zero()),
            credit: parse(LogicalField::Credit).filter(|c| !c.is_zero()),
        };
        let Some(amount) = resolve_amount(&raw, &description, &ctx) else {
            skipped += 1;
            continue;
        };

        let merchant_name = cell(row, mapping, LogicalField::Merchant)
            .map(|m| m.trim().to_string())
            .unwrap_or_else(|| derive_merchant(&description));

        let raw_fields: BTreeMap<String, String> = row
            .iter()
            .enumerate()
            .map(|(i, value)| {
                let name = header
                    .get(i)
                    .filter(|h| !h.trim().is_empty())
                    .cloned()
                    .unwrap_or_else(|| format!("column_{i}"));
                (name, value.clone())
            })
            .collect();

        out.push(NormalizedTransaction {
            transaction_date,
            posted_date: cell(row, mapping, LogicalField::PostedDate)
                .and_then(|raw| DateConverter::convert(raw, &posted_cfg)),
            description,
            merchant_name,
            amount,
            debit: raw.debit.map(|d| d.abs()),
            credit: raw.credit.map(|c| c.abs()),
            balance: parse(LogicalField::Balance),
            raw_fields,
        });
    }
    debug!(kept = out.len(), skipped, "Normalized statement rows");
    out
}
