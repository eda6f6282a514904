use std::collections::HashMap;

use comfy_table::{Cell, Table};

use crate::categorize::categories::{available_categories, get_profile};
use crate::categorize::rule::{self, RuleDraft, RuleUpdate};
use crate::db::Database;
use crate::error::{Result, SpendsortError};
use crate::models::{MatchField, MatchType};

use super::App;

async fn category_id_by_name(db: &Database, owner_id: &str, name: &str) -> Result<String> {
    available_categories(db, owner_id, None)
        .await?
        .into_iter()
        .find(|c| c.name.eq_ignore_ascii_case(name.trim()))
        .map(|c| c.id)
        .ok_or_else(|| SpendsortError::NotFound(format!("category '{name}'")))
}

async fn business_id_by_name(db: &Database, owner_id: &str, name: &str) -> Result<String> {
    get_profile(db, owner_id)
        .await?
        .businesses
        .into_iter()
        .find(|b| b.name.eq_ignore_ascii_case(name.trim()))
        .map(|b| b.id)
        .ok_or_else(|| SpendsortError::NotFound(format!("business '{name}'")))
}

pub async fn add(
    app: &App,
    pattern: &str,
    category: &str,
    match_field: MatchField,
    match_type: MatchType,
    business: Option<&str>,
) -> Result<()> {
    let category_id = category_id_by_name(&app.db, &app.owner, category).await?;
    let business_id = match business {
        Some(name) => Some(business_id_by_name(&app.db, &app.owner, name).await?),
        None => None,
    };
    let rule = rule::create_rule(
        &app.db,
        &app.owner,
        RuleDraft {
            match_field,
            match_type,
            pattern: pattern.to_string(),
            category_id,
            business_id,
        },
    )
    .await?;
    println!("Added rule {}: {} {} '{}' \u{2192} {category}", rule.id, rule.match_field, rule.match_type, rule.pattern);
    Ok(())
}

pub async fn list(app: &App) -> Result<()> {
    let rules = rule::list_rules(&app.db, &app.owner).await?;
    if rules.is_empty() {
        println!("No rules yet. Add one with `spendsort rules add`.");
        return Ok(());
    }
    let names: HashMap<String, String> = available_categories(&app.db, &app.owner, None)
        .await?
        .into_iter()
        .map(|c| (c.id, c.name))
        .collect();

    let mut table = Table::new();
    table.set_header(vec!["#", "ID", "Field", "Type", "Pattern", "Category", "Enabled"]);
    for (i, r) in rules.into_iter().enumerate() {
        let category = names.get(&r.category_id).cloned().unwrap_or(r.category_id);
        table.add_row(vec![
            Cell::new(i + 1),
            Cell::new(r.id),
            Cell::new(r.match_field),
            Cell::new(r.match_type),
            Cell::new(r.pattern),
            Cell::new(category),
            Cell::new(if r.enabled { "yes" } else { "no" }),
        ]);
    }
    println!("Rules (first match wins)\n{table}");
    Ok(())
}

pub async fn update(
    app: &App,
    id: &str,
    pattern: Option<String>,
    category: Option<&str>,
    match_field: Option<MatchField>,
    match_type: Option<MatchType>,
) -> Result<()> {
    let category_id = match category {
        Some(name) => Some(category_id_by_name(&app.db, &app.owner, name).await?),
        None => None,
    };
    let rule = rule::update_rule(
        &app.db,
        &app.owner,
        id,
        RuleUpdate {
            match_field,
            match_type,
            pattern,
            category_id,
            business_id: None,
        },
    )
    .await?;
    println!("Updated rule {}: {} {} '{}'", rule.id, rule.match_field, rule.match_type, rule.pattern);
    Ok(())
}

pub async fn delete(app: &App, id: &str) -> Result<()> {
    rule::delete_rule(&app.db, &app.owner, id).await?;
    println!("Deleted rule {id}");
    Ok(())
}

pub async fn toggle(app: &App, id: &str) -> Result<()> {
    let enabled = rule::toggle_rule(&app.db, &app.owner, id).await?;
    println!("Rule {id} is now {}", if enabled { "enabled" } else { "disabled" });
    Ok(())
}
