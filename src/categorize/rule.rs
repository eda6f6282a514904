use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use regex::{Regex, RegexBuilder};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{CategorizationContext, CategorizationInput, CategorizationStrategy};
use crate::db::Database;
use crate::error::{Result, SpendsortError};
use crate::models::{CategorizationMethod, CategorizationResult, CategoryRule, MatchField, MatchType};

fn compile(pattern: &str) -> Option<Regex> {
    RegexBuilder::new(pattern).case_insensitive(true).build().ok()
}

pub fn matches(value: &str, pattern: &str, match_type: MatchType) -> bool {
    match match_type {
        MatchType::Exact => value.trim().to_lowercase() == pattern.trim().to_lowercase(),
        MatchType::Contains => value.to_lowercase().contains(&pattern.to_lowercase()),
        MatchType::Regex => compile(pattern).is_some_and(|re| re.is_match(value)),
    }
}

/// Owner-authored rules; the first enabled rule that matches wins.
pub struct RuleStrategy {
    db: Database,
    /// Compiled regex per pattern, `None` where the pattern does not compile.
    regexes: Mutex<HashMap<String, Option<Regex>>>,
}

impl RuleStrategy {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            regexes: Mutex::new(HashMap::new()),
        }
    }

    fn rule_matches(&self, value: &str, rule: &CategoryRule) -> bool {
        if rule.match_type != MatchType::Regex {
            return matches(value, &rule.pattern, rule.match_type);
        }
        let mut regexes = self.regexes.lock().unwrap_or_else(PoisonError::into_inner);
        regexes
            .entry(rule.pattern.clone())
            .or_insert_with(|| compile(&rule.pattern))
            .as_ref()
            .is_some_and(|re| re.is_match(value))
    }
}

#[async_trait]
impl CategorizationStrategy for RuleStrategy {
    fn name(&self) -> &'static str {
        "rule"
    }

    fn priority(&self) -> u32 {
        1
    }

    async fn categorize(
        &self,
        input: &CategorizationInput,
        ctx: &CategorizationContext,
    ) -> Result<CategorizationResult> {
        let owner = ctx.owner_id.clone();
        let rules = self
            .db
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {RULE_COLUMNS}, c.name FROM category_rules r \
                     JOIN categories c ON c.id = r.category_id \
                     WHERE r.owner_id = ?1 AND r.enabled = 1 AND c.deleted_at IS NULL \
                     ORDER BY r.created_at, r.rowid"
                ))?;
                let rows = stmt
                    .query_map([owner], |row| Ok((rule_from_row(row)?, row.get::<_, String>(8)?)))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        for (rule, category_name) in rules {
            let value = match rule.match_field {
                MatchField::MerchantName => &input.merchant_name,
                MatchField::Description => &input.description,
            };
            if self.rule_matches(value, &rule) {
                return Ok(CategorizationResult {
                    category_id: Some(rule.category_id),
                    category_name: Some(category_name),
                    business_id: rule.business_id,
                    confidence: 1.0,
                    method: CategorizationMethod::Rule,
                    matched_rule_id: Some(rule.id),
                    suggested_category: None,
                });
            }
        }
        Ok(CategorizationResult::none())
    }
}

const RULE_COLUMNS: &str =
    "r.id, r.owner_id, r.match_field, r.match_type, r.pattern, r.category_id, r.business_id, r.enabled";

fn rule_from_row(row: &Row) -> rusqlite::Result<CategoryRule> {
    Ok(CategoryRule {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        match_field: row.get(2)?,
        match_type: row.get(3)?,
        pattern: row.get(4)?,
        category_id: row.get(5)?,
        business_id: row.get(6)?,
        enabled: row.get(7)?,
    })
}

#[derive(Debug, Clone)]
pub struct RuleDraft {
    pub match_field: MatchField,
    pub match_type: MatchType,
    pub pattern: String,
    pub category_id: String,
    pub business_id: Option<String>,
}

/// Changes to apply to an existing rule; `None` leaves a field alone.
#[derive(Debug, Clone, Default)]
pub struct RuleUpdate {
    pub match_field: Option<MatchField>,
    pub match_type: Option<MatchType>,
    pub pattern: Option<String>,
    pub category_id: Option<String>,
    pub business_id: Option<Option<String>>,
}

fn validate_pattern(pattern: &str, match_type: MatchType) -> Result<()> {
    if pattern.trim().is_empty() {
        return Err(SpendsortError::Validation("rule pattern must not be empty".into()));
    }
    if match_type == MatchType::Regex {
        RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| SpendsortError::Validation(format!("invalid regex pattern: {e}")))?;
    }
    Ok(())
}

fn ensure_category_usable(conn: &Connection, owner_id: &str, category_id: &str) -> Result<()> {
    let usable: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM categories WHERE id = ?1 AND deleted_at IS NULL \
         AND (owner_id IS NULL OR owner_id = ?2))",
        params![category_id, owner_id],
        |row| row.get(0),
    )?;
    if !usable {
        return Err(SpendsortError::Validation(format!("unknown category: {category_id}")));
    }
    Ok(())
}

fn ensure_business_owned(conn: &Connection, owner_id: &str, business_id: &str) -> Result<()> {
    let owned: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM businesses WHERE id = ?1 AND owner_id = ?2)",
        params![business_id, owner_id],
        |row| row.get(0),
    )?;
    if !owned {
        return Err(SpendsortError::Validation(format!("unknown business: {business_id}")));
    }
    Ok(())
}

fn get_rule_sync(conn: &Connection, owner_id: &str, rule_id: &str) -> Result<CategoryRule> {
    conn.query_row(
        &format!("SELECT {RULE_COLUMNS} FROM category_rules r WHERE r.id = ?1 AND r.owner_id = ?2"),
        params![rule_id, owner_id],
        rule_from_row,
    )
    .optional()?
    .ok_or_else(|| SpendsortError::NotFound(format!("rule {rule_id}")))
}

pub async fn list_rules(db: &Database, owner_id: &str) -> Result<Vec<CategoryRule>> {
    let owner = owner_id.to_string();
    db.call(move |conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT {RULE_COLUMNS} FROM category_rules r WHERE r.owner_id = ?1 ORDER BY r.created_at, r.rowid"
        ))?;
        let rules = stmt
            .query_map([owner], rule_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rules)
    })
    .await
}

pub async fn create_rule(db: &Database, owner_id: &str, draft: RuleDraft) -> Result<CategoryRule> {
    validate_pattern(&draft.pattern, draft.match_type)?;
    let owner = owner_id.to_string();
    db.call(move |conn| {
        ensure_category_usable(conn, &owner, &draft.category_id)?;
        if let Some(business_id) = &draft.business_id {
            ensure_business_owned(conn, &owner, business_id)?;
        }
        let id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO category_rules (id, owner_id, match_field, match_type, pattern, category_id, business_id, enabled, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8)",
            params![
                id,
                owner,
                draft.match_field,
                draft.match_type,
                draft.pattern.trim(),
                draft.category_id,
                draft.business_id,
                Utc::now(),
            ],
        )?;
        get_rule_sync(conn, &owner, &id)
    })
    .await
}

pub async fn update_rule(
    db: &Database,
    owner_id: &str,
    rule_id: &str,
    update: RuleUpdate,
) -> Result<CategoryRule> {
    let owner = owner_id.to_string();
    let id = rule_id.to_string();
    db.call(move |conn| {
        let mut rule = get_rule_sync(conn, &owner, &id)?;
        if let Some(field) = update.match_field {
            rule.match_field = field;
        }
        if let Some(match_type) = update.match_type {
            rule.match_type = match_type;
        }
        if let Some(pattern) = update.pattern {
            rule.pattern = pattern.trim().to_string();
        }
        if let Some(category_id) = update.category_id {
            ensure_category_usable(conn, &owner, &category_id)?;
            rule.category_id = category_id;
        }
        if let Some(business_id) = update.business_id {
            if let Some(b) = &business_id {
                ensure_business_owned(conn, &owner, b)?;
            }
            rule.business_id = business_id;
        }
        validate_pattern(&rule.pattern, rule.match_type)?;
        conn.execute(
            "UPDATE category_rules SET match_field = ?1, match_type = ?2, pattern = ?3, category_id = ?4, business_id = ?5 \
             WHERE id = ?6 AND owner_id = ?7",
            params![
                rule.match_field,
                rule.match_type,
                rule.pattern,
                rule.category_id,
                rule.business_id,
                id,
                owner,
            ],
        )?;
        Ok(rule)
    })
    .await
}

pub async fn delete_rule(db: &Database, owner_id: &str, rule_id: &str) -> Result<()> {
    let owner = owner_id.to_string();
    let id = rule_id.to_string();
    db.call(move |conn| {
        let deleted = conn.execute(
            "DELETE FROM category_rules WHERE id = ?1 AND owner_id = ?2",
            params![id, owner],
        )?;
        if deleted == 0 {
            return Err(SpendsortError::NotFound(format!("rule {id}")));
        }
        Ok(())
    })
    .await
}

/// Flip the enabled flag and return the new state.
pub async fn toggle_rule(db: &Database, owner_id: &str, rule_id: &str) -> Result<bool> {
    let owner = owner_id.to_string();
    let id = rule_id.to_string();
    db.call(move |conn| {
        let rule = get_rule_sync(conn, &owner, &id)?;
        let enabled = !rule.enabled;
        conn.execute(
            "UPDATE category_rules SET enabled = ?1 WHERE id = ?2 AND owner_id = ?3",
            params![enabled, id, owner],
        )?;
        Ok(enabled)
    })
    .await
}
