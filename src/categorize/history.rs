use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};

use super::{CategorizationContext, CategorizationInput, CategorizationStrategy};
use crate::db::Database;
use crate::error::Result;
use crate::models::{CategorizationMethod, CategorizationResult};

/// Reuses the category of the owner's most recent categorized transaction
/// (statement line or receipt) from the same merchant.
pub struct HistoryStrategy {
    db: Database,
    confidence: f64,
}

impl HistoryStrategy {
    pub fn new(db: Database, confidence: f64) -> Self {
        Self { db, confidence }
    }
}

#[async_trait]
impl CategorizationStrategy for HistoryStrategy {
    fn name(&self) -> &'static str {
        "history"
    }

    fn priority(&self) -> u32 {
        2
    }

    async fn categorize(
        &self,
        input: &CategorizationInput,
        ctx: &CategorizationContext,
    ) -> Result<CategorizationResult> {
        let merchant = input.merchant_name.trim().to_lowercase();
        if merchant.is_empty() {
            return Ok(CategorizationResult::none());
        }
        let owner = ctx.owner_id.clone();
        let found: Option<(String, Option<String>, String)> = self
            .db
            .call(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT h.category_id, h.business_id, c.name FROM ( \
                             SELECT category_id, business_id, created_at FROM statement_transactions \
                             WHERE owner_id = ?1 AND lower(trim(merchant_name)) = ?2 AND category_id IS NOT NULL \
                             UNION ALL \
                             SELECT category_id, business_id, created_at FROM documents \
                             WHERE owner_id = ?1 AND kind = 'receipt' AND lower(trim(merchant_name)) = ?2 \
                               AND category_id IS NOT NULL \
                         ) h \
                         JOIN categories c ON c.id = h.category_id AND c.deleted_at IS NULL \
                         ORDER BY h.created_at DESC LIMIT 1",
                        params![owner, merchant],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                    )
                    .optional()?;
                Ok(row)
            })
            .await?;

        Ok(match found {
            Some((category_id, business_id, name)) => CategorizationResult {
                category_id: Some(category_id),
                category_name: Some(name),
                business_id,
                confidence: self.confidence,
                method: CategorizationMethod::History,
                matched_rule_id: None,
                suggested_category: None,
            },
            None => CategorizationResult::none(),
        })
    }
}
