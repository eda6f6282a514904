use std::str::FromStr;

use rust_decimal::Decimal;

use crate::categorize::{CategorizationContext, CategorizationInput, CategoryManager};
use crate::error::{Result, SpendsortError};
use crate::fmt::money;

use super::App;

pub async fn run(
    app: &App,
    merchant: &str,
    description: Option<&str>,
    amount: &str,
    no_ai: bool,
) -> Result<()> {
    let amount = Decimal::from_str(amount.trim())
        .map_err(|e| SpendsortError::Validation(format!("amount '{amount}': {e}")))?;
    let chain = app.chain();
    let mut manager = CategoryManager::standard(
        app.db.clone(),
        chain.clone(),
        &app.settings.categorization,
        app.settings.categorization.ai_fallback,
    );
    if no_ai {
        manager.remove_strategy("ai");
    }
    let ctx = CategorizationContext::load(&app.db, &app.owner).await?;
    let input = CategorizationInput {
        merchant_name: merchant.to_string(),
        description: description.unwrap_or(merchant).to_string(),
        amount,
        date: None,
    };
    let result = manager.categorize(&input, &ctx).await;
    chain.flush_usage().await;
    let result = result?;

    println!("Transaction: {merchant} {}", money(amount));
    println!("Strategies:  {}", manager.strategy_names().join(" \u{2192} "));
    match &result.category_name {
        Some(name) => println!(
            "Category:    {name} (via {}, confidence {:.2})",
            result.method, result.confidence
        ),
        None => println!("Category:    (uncategorized)"),
    }
    if let Some(rule_id) = &result.matched_rule_id {
        println!("Rule:        {rule_id}");
    }
    if let Some(suggested) = &result.suggested_category {
        println!("Suggested:   {suggested} (not an existing category)");
    }
    Ok(())
}
