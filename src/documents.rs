//! Stored documents and the transactions extracted from them.

use chrono::{NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;

use crate::db::{decimal_from_sql, decimal_to_sql, Database};
use crate::error::Result;
use crate::models::{CategorizationResult, Document, DocumentKind, NormalizedTransaction};

#[derive(Debug, Clone)]
pub struct NewDocument {
    pub owner_id: String,
    pub kind: DocumentKind,
    pub file_name: String,
    pub file_url: Option<String>,
    pub file_size: i64,
    pub content_hash: String,
}

const DOCUMENT_COLUMNS: &str = "id, owner_id, kind, file_name, file_url, file_size, content_hash, \
                                merchant_name, document_date, total_amount, created_at";

pub(crate) fn document_from_row(row: &Row) -> rusqlite::Result<Document> {
    Ok(Document {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        kind: row.get(2)?,
        file_name: row.get(3)?,
        file_url: row.get(4)?,
        file_size: row.get(5)?,
        content_hash: row.get(6)?,
        merchant_name: row.get(7)?,
        document_date: row.get(8)?,
        total_amount: decimal_from_sql(row.get(9)?)?,
        created_at: row.get(10)?,
    })
}

pub fn get_document_sync(conn: &Connection, document_id: &str) -> Result<Option<Document>> {
    let doc = conn
        .query_row(
            &format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ?1"),
            [document_id],
            document_from_row,
        )
        .optional()?;
    Ok(doc)
}

pub async fn get_document(db: &Database, document_id: &str) -> Result<Option<Document>> {
    let id = document_id.to_string();
    db.call(move |conn| get_document_sync(conn, &id)).await
}

pub async fn create_document(db: &Database, doc: NewDocument) -> Result<String> {
    let id = uuid::Uuid::new_v4().to_string();
    let doc_id = id.clone();
    db.call(move |conn| {
        conn.execute(
            "INSERT INTO documents (id, owner_id, kind, file_name, file_url, file_size, content_hash, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                doc_id,
                doc.owner_id,
                doc.kind,
                doc.file_name,
                doc.file_url,
                doc.file_size,
                doc.content_hash,
                Utc::now(),
            ],
        )?;
        Ok(())
    })
    .await?;
    Ok(id)
}

/// Removes the document and, through the cascade, its transactions.
pub async fn delete_document(db: &Database, document_id: &str) -> Result<()> {
    let id = document_id.to_string();
    db.call(move |conn| {
        conn.execute("DELETE FROM documents WHERE id = ?1", [id])?;
        Ok(())
    })
    .await
}

pub async fn set_receipt_fields(
    db: &Database,
    document_id: &str,
    merchant_name: &str,
    date: NaiveDate,
    total: Decimal,
    categorization: &CategorizationResult,
) -> Result<()> {
    let id = document_id.to_string();
    let merchant = merchant_name.to_string();
    let total = decimal_to_sql(Some(total));
    let category_id = categorization.category_id.clone();
    let business_id = categorization.business_id.clone();
    db.call(move |conn| {
        conn.execute(
            "UPDATE documents SET merchant_name = ?1, document_date = ?2, total_amount = ?3, \
             category_id = ?4, business_id = ?5 WHERE id = ?6",
            params![merchant, date, total, category_id, business_id, id],
        )?;
        Ok(())
    })
    .await
}

/// Insert all transactions of one document in a single SQLite transaction.
pub async fn insert_transactions(
    db: &Database,
    owner_id: &str,
    document_id: &str,
    rows: Vec<(NormalizedTransaction, CategorizationResult)>,
) -> Result<usize> {
    let owner = owner_id.to_string();
    let doc_id = document_id.to_string();
    db.call(move |conn| {
        let tx = conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO statement_transactions \
                 (id, owner_id, document_id, transaction_date, posted_date, description, merchant_name, \
                  amount, debit, credit, balance, category_id, business_id, categorization_method, \
                  confidence, suggested_category, raw_fields, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            )?;
            let now = Utc::now();
            for (txn, result) in &rows {
                let raw = serde_json::to_string(&txn.raw_fields)?;
                stmt.execute(params![
                    uuid::Uuid::new_v4().to_string(),
                    owner,
                    doc_id,
                    txn.transaction_date,
                    txn.posted_date,
                    txn.description,
                    txn.merchant_name,
                    decimal_to_sql(Some(txn.amount)),
                    decimal_to_sql(txn.debit),
                    decimal_to_sql(txn.credit),
                    decimal_to_sql(txn.balance),
                    result.category_id,
                    result.business_id,
                    result.method,
                    result.confidence,
                    result.suggested_category,
                    raw,
                    now,
                ])?;
            }
        }
        tx.commit()?;
        Ok(rows.len())
    })
    .await
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::str::FromStr;

    use super::*;
    use crate::db::test_db;
    use crate::models::CategorizationMethod;

    fn new_doc(hash: &str) -> NewDocument {
        NewDocument {
            owner_id: "owner-1".into(),
            kind: DocumentKind::Statement,
            file_name: "jan.csv".into(),
            file_url: None,
            file_size: 120,
            content_hash: hash.into(),
        }
    }

    #[tokio::test]
    async fn test_delete_cascades_to_transactions() {
        let (_dir, db) = test_db();
        let doc_id = create_document(&db, new_doc("abc")).await.unwrap();
        let txn = NormalizedTransaction {
            transaction_date: NaiveDate::from_ymd_opt(2025, 1, 2).unwrap(),
            posted_date: None,
            description: "COFFEE".into(),
            merchant_name: "COFFEE".into(),
            amount: Decimal::from_str("-3.50").unwrap(),
            debit: None,
            credit: None,
            balance: None,
            raw_fields: BTreeMap::new(),
        };
        let result = CategorizationResult {
            method: CategorizationMethod::Rule,
            confidence: 1.0,
            ..CategorizationResult::none()
        };
        let inserted = insert_transactions(&db, "owner-1", &doc_id, vec![(txn, result)])
            .await
            .unwrap();
        assert_eq!(inserted, 1);

        delete_document(&db, &doc_id).await.unwrap();
        assert!(get_document(&db, &doc_id).await.unwrap().is_none());
        let remaining: i64 = db
            .call(|conn| {
                Ok(conn.query_row("SELECT count(*) FROM statement_transactions", [], |r| r.get(0))?)
            })
            .await
            .unwrap();
        assert_eq!(remaining, 0);
    }

    #[tokio::test]
    async fn test_receipt_fields_roundtrip() {
        let (_dir, db) = test_db();
        let doc_id = create_document(&db, new_doc("def")).await.unwrap();
        let date = NaiveDate::from_ymd_opt(2025, 2, 14).unwrap();
        set_receipt_fields(
            &db,
            &doc_id,
            "Blue Bottle",
            date,
            Decimal::from_str("-12.75").unwrap(),
            &CategorizationResult::none(),
        )
        .await
        .unwrap();
        let doc = get_document(&db, &doc_id).await.unwrap().unwrap();
        assert_eq!(doc.merchant_name.as_deref(), Some("Blue Bottle"));
        assert_eq!(doc.document_date, Some(date));
        assert_eq!(doc.total_amount, Some(Decimal::from_str("-12.75").unwrap()));
    }
}
