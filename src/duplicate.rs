//! Duplicate document detection.
//!
//! Strategies run in decreasing order of certainty. Given the document being
//! checked, every query looks only at documents stored before it, so of two
//! copies imported concurrently the earlier one stands and the later one is
//! the duplicate:
//! 1. identical content fingerprint for the same owner (`exact_image`, high)
//! 2. a single other document with the same byte size (`exact_image`, medium)
//! 3. a receipt with the same merchant, amount and day (`merchant_date_amount`),
//!    promoted to high when it also matches on size.

use chrono::{Duration, NaiveDate};
use rusqlite::{params, OptionalExtension};
use rust_decimal::Decimal;
use tracing::debug;

use crate::db::{decimal_from_sql, Database};
use crate::documents::get_document;
use crate::error::{Result, SpendsortError};
use crate::models::{DocumentKind, DuplicateMatch, DuplicateMatchType, MatchConfidence};

/// Receipt dates are compared by calendar day, allowing one day either way
/// for timestamps that straddle midnight between time zones.
const DATE_TOLERANCE_DAYS: i64 = 1;

#[derive(Debug, Clone)]
pub struct FileFingerprint {
    pub content_hash: String,
    pub file_size: i64,
}

#[derive(Debug, Clone)]
pub struct ReceiptKey {
    pub merchant_name: String,
    pub date: NaiveDate,
    pub amount: Decimal,
}

#[derive(Clone)]
pub struct DuplicateDetector {
    db: Database,
}

impl DuplicateDetector {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// All three strategies in order; the receipt strategy only runs when
    /// receipt fields are known.
    pub async fn detect(
        &self,
        owner_id: &str,
        fingerprint: &FileFingerprint,
        receipt: Option<&ReceiptKey>,
        exclude_document_id: Option<&str>,
    ) -> Result<Option<DuplicateMatch>> {
        if let Some(found) = self
            .check_file(owner_id, fingerprint, exclude_document_id)
            .await?
        {
            return Ok(Some(found));
        }
        match receipt {
            Some(key) => {
                self.check_receipt(owner_id, key, fingerprint.file_size, exclude_document_id)
                    .await
            }
            None => Ok(None),
        }
    }

    /// Strategies 1 and 2: content fingerprint, then unique size match.
    pub async fn check_file(
        &self,
        owner_id: &str,
        fingerprint: &FileFingerprint,
        exclude_document_id: Option<&str>,
    ) -> Result<Option<DuplicateMatch>> {
        let owner = owner_id.to_string();
        let hash = fingerprint.content_hash.clone();
        let size = fingerprint.file_size;
        let exclude = exclude_document_id.unwrap_or("").to_string();
        self.db
            .call(move |conn| {
                let exact: Option<String> = conn
                    .query_row(
                        "SELECT id FROM documents WHERE owner_id = ?1 AND content_hash = ?2 \
                           AND id != ?3 AND rowid < COALESCE((SELECT rowid FROM documents WHERE id = ?3), ?4) \
                         ORDER BY rowid LIMIT 1",
                        params![owner, hash, exclude, i64::MAX],
                        |row| row.get(0),
                    )
                    .optional()?;
                if let Some(document_id) = exact {
                    debug!(document_id = %document_id, "Fingerprint duplicate");
                    return Ok(Some(DuplicateMatch {
                        document_id,
                        match_type: DuplicateMatchType::ExactImage,
                        confidence: MatchConfidence::High,
                    }));
                }

                let mut stmt = conn.prepare(
                    "SELECT id FROM documents WHERE owner_id = ?1 AND file_size = ?2 \
                       AND id != ?3 AND rowid < COALESCE((SELECT rowid FROM documents WHERE id = ?3), ?4) \
                     LIMIT 2",
                )?;
                let same_size = stmt
                    .query_map(params![owner, size, exclude, i64::MAX], |row| row.get::<_, String>(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                // Several documents of this size prove nothing.
                match same_size.as_slice() {
                    [only] => Ok(Some(DuplicateMatch {
                        document_id: only.clone(),
                        match_type: DuplicateMatchType::ExactImage,
                        confidence: MatchConfidence::Medium,
                    })),
                    _ => Ok(None),
                }
            })
            .await
    }

    /// Strategy 3: same merchant (case-insensitive), amount and day among
    /// the owner's receipts.
    pub async fn check_receipt(
        &self,
        owner_id: &str,
        key: &ReceiptKey,
        file_size: i64,
        exclude_document_id: Option<&str>,
    ) -> Result<Option<DuplicateMatch>> {
        let owner = owner_id.to_string();
        let merchant = key.merchant_name.trim().to_lowercase();
        let from = key.date - Duration::days(DATE_TOLERANCE_DAYS);
        let to = key.date + Duration::days(DATE_TOLERANCE_DAYS);
        let amount = key.amount;
        let exclude = exclude_document_id.unwrap_or("").to_string();
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, file_size, total_amount FROM documents \
                     WHERE owner_id = ?1 AND kind = ?2 AND lower(trim(merchant_name)) = ?3 \
                       AND document_date BETWEEN ?4 AND ?5 \
                       AND id != ?6 AND rowid < COALESCE((SELECT rowid FROM documents WHERE id = ?6), ?7) \
                     ORDER BY rowid",
                )?;
                let candidates = stmt
                    .query_map(
                        params![owner, DocumentKind::Receipt, merchant, from, to, exclude, i64::MAX],
                        |row| {
                            Ok((
                                row.get::<_, String>(0)?,
                                row.get::<_, i64>(1)?,
                                decimal_from_sql(row.get(2)?)?,
                            ))
                        },
                    )?
                    .collect::<std::result::Result<Vec<_>, _>>()?;

                let matching: Vec<(String, i64)> = candidates
                    .into_iter()
                    .filter(|(_, _, total)| *total == Some(amount))
                    .map(|(id, size, _)| (id, size))
                    .collect();
                let promoted = matching.iter().find(|(_, size)| *size == file_size);
                let found = match (promoted, matching.first()) {
                    (Some((id, _)), _) => Some((id.clone(), MatchConfidence::High)),
                    (None, Some((id, _))) => Some((id.clone(), MatchConfidence::Medium)),
                    (None, None) => None,
                };
                Ok(found.map(|(document_id, confidence)| DuplicateMatch {
                    document_id,
                    match_type: DuplicateMatchType::MerchantDateAmount,
                    confidence,
                }))
            })
            .await
    }

    /// The user-facing error for a duplicate, naming the earlier upload.
    pub async fn duplicate_error(&self, found: &DuplicateMatch) -> Result<SpendsortError> {
        let message = match get_document(&self.db, &found.document_id).await? {
            Some(prior) => format!(
                "This file appears to duplicate \"{}\", uploaded on {}",
                prior.file_name,
                prior.created_at.format("%Y-%m-%d")
            ),
            None => "This file appears to duplicate an earlier upload".to_string(),
        };
        Ok(SpendsortError::DuplicateFile {
            message,
            existing_document_id: found.document_id.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;
    use crate::db::test_db;
    use crate::documents::{create_document, set_receipt_fields, NewDocument};
    use crate::models::CategorizationResult;

    fn doc(owner: &str, hash: &str, size: i64, kind: DocumentKind) -> NewDocument {
        NewDocument {
            owner_id: owner.into(),
            kind,
            file_name: format!("{hash}.jpg"),
            file_url: None,
            file_size: size,
            content_hash: hash.into(),
        }
    }

    fn fp(hash: &str, size: i64) -> FileFingerprint {
        FileFingerprint {
            content_hash: hash.into(),
            file_size: size,
        }
    }

    async fn receipt(db: &Database, hash: &str, size: i64, merchant: &str, date: NaiveDate, total: &str) -> String {
        let id = create_document(db, doc("owner-1", hash, size, DocumentKind::Receipt))
            .await
            .unwrap();
        set_receipt_fields(
            db,
            &id,
            merchant,
            date,
            Decimal::from_str(total).unwrap(),
            &CategorizationResult::none(),
        )
        .await
        .unwrap();
        id
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, d).unwrap()
    }

    #[tokio::test]
    async fn test_exact_fingerprint_is_high() {
        let (_dir, db) = test_db();
        let existing = create_document(&db, doc("owner-1", "h1", 100, DocumentKind::Receipt))
            .await
            .unwrap();
        let detector = DuplicateDetector::new(db);
        let found = detector.check_file("owner-1", &fp("h1", 999), None).await.unwrap().unwrap();
        assert_eq!(found.document_id, existing);
        assert_eq!(found.match_type, DuplicateMatchType::ExactImage);
        assert_eq!(found.confidence, MatchConfidence::High);
    }

    #[tokio::test]
    async fn test_other_owner_and_self_excluded() {
        let (_dir, db) = test_db();
        let own = create_document(&db, doc("owner-1", "h1", 100, DocumentKind::Receipt))
            .await
            .unwrap();
        let detector = DuplicateDetector::new(db);
        assert!(detector.check_file("owner-2", &fp("h1", 100), None).await.unwrap().is_none());
        assert!(detector
            .check_file("owner-1", &fp("h1", 100), Some(&own))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_later_copy_is_the_duplicate() {
        let (_dir, db) = test_db();
        let first = create_document(&db, doc("owner-1", "h1", 100, DocumentKind::Statement))
            .await
            .unwrap();
        let second = create_document(&db, doc("owner-1", "h1", 100, DocumentKind::Statement))
            .await
            .unwrap();
        let detector = DuplicateDetector::new(db);
        assert!(detector
            .check_file("owner-1", &fp("h1", 100), Some(&first))
            .await
            .unwrap()
            .is_none());
        let found = detector
            .check_file("owner-1", &fp("h1", 100), Some(&second))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.document_id, first);
        assert_eq!(found.confidence, MatchConfidence::High);
    }

    #[tokio::test]
    async fn test_later_receipt_does_not_shadow_earlier() {
        let (_dir, db) = test_db();
        let first = receipt(&db, "r1", 500, "Target", day(10), "-40.00").await;
        let second = receipt(&db, "r2", 600, "Target", day(10), "-40.00").await;
        let detector = DuplicateDetector::new(db);
        let key = ReceiptKey {
            merchant_name: "Target".into(),
            date: day(10),
            amount: Decimal::from_str("-40").unwrap(),
        };
        assert!(detector
            .check_receipt("owner-1", &key, 500, Some(&first))
            .await
            .unwrap()
            .is_none());
        let found = detector
            .check_receipt("owner-1", &key, 600, Some(&second))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.document_id, first);
        assert_eq!(found.confidence, MatchConfidence::Medium);
    }

    #[tokio::test]
    async fn test_size_match_unique_vs_ambiguous() {
        let (_dir, db) = test_db();
        let first = create_document(&db, doc("owner-1", "a", 2048, DocumentKind::Receipt))
            .await
            .unwrap();
        let detector = DuplicateDetector::new(db.clone());
        let found = detector.check_file("owner-1", &fp("z", 2048), None).await.unwrap().unwrap();
        assert_eq!(found.document_id, first);
        assert_eq!(found.confidence, MatchConfidence::Medium);

        create_document(&db, doc("owner-1", "b", 2048, DocumentKind::Receipt))
            .await
            .unwrap();
        assert!(detector.check_file("owner-1", &fp("z", 2048), None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_receipt_match_by_day_and_amount() {
        let (_dir, db) = test_db();
        let existing = receipt(&db, "r1", 500, "Blue Bottle", day(4), "-12.75").await;
        let detector = DuplicateDetector::new(db);
        let key = ReceiptKey {
            merchant_name: "BLUE BOTTLE".into(),
            date: day(5),
            amount: Decimal::from_str("-12.750").unwrap(),
        };
        let found = detector.check_receipt("owner-1", &key, 777, None).await.unwrap().unwrap();
        assert_eq!(found.document_id, existing);
        assert_eq!(found.match_type, DuplicateMatchType::MerchantDateAmount);
        assert_eq!(found.confidence, MatchConfidence::Medium);

        let far = ReceiptKey { date: day(8), ..key.clone() };
        assert!(detector.check_receipt("owner-1", &far, 777, None).await.unwrap().is_none());
        let other_amount = ReceiptKey {
            amount: Decimal::from_str("-12.70").unwrap(),
            ..key
        };
        assert!(detector
            .check_receipt("owner-1", &other_amount, 777, None)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_receipt_match_promoted_by_size() {
        let (_dir, db) = test_db();
        let existing = receipt(&db, "r1", 500, "Target", day(10), "-40.00").await;
        let detector = DuplicateDetector::new(db);
        let key = ReceiptKey {
            merchant_name: "target".into(),
            date: day(10),
            amount: Decimal::from_str("-40").unwrap(),
        };
        let found = detector.check_receipt("owner-1", &key, 500, None).await.unwrap().unwrap();
        assert_eq!(found.document_id, existing);
        assert_eq!(found.confidence, MatchConfidence::High);
    }

    #[tokio::test]
    async fn test_detect_short_circuits_on_fingerprint() {
        let (_dir, db) = test_db();
        let existing = receipt(&db, "same", 500, "Target", day(10), "-40.00").await;
        let detector = DuplicateDetector::new(db);
        let key = ReceiptKey {
            merchant_name: "Other".into(),
            date: day(1),
            amount: Decimal::ONE,
        };
        let found = detector
            .detect("owner-1", &fp("same", 1), Some(&key), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.document_id, existing);
        assert_eq!(found.match_type, DuplicateMatchType::ExactImage);
    }

    #[tokio::test]
    async fn test_duplicate_error_names_prior_file() {
        let (_dir, db) = test_db();
        let existing = create_document(&db, doc("owner-1", "h1", 100, DocumentKind::Receipt))
            .await
            .unwrap();
        let detector = DuplicateDetector::new(db);
        let err = detector
            .duplicate_error(&DuplicateMatch {
                document_id: existing.clone(),
                match_type: DuplicateMatchType::ExactImage,
                confidence: MatchConfidence::High,
            })
            .await
            .unwrap();
        assert!(err.to_string().contains("h1.jpg"));
        assert_eq!(err.error_code(), "DUPLICATE_FILE");
    }
}
