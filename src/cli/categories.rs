use comfy_table::{Cell, Table};

use crate::categorize::categories::{available_categories, create_category, delete_category};
use crate::error::Result;
use crate::models::{CategoryScope, TransactionType};

use super::App;

pub async fn list(app: &App, type_filter: Option<TransactionType>) -> Result<()> {
    let categories = available_categories(&app.db, &app.owner, type_filter).await?;
    let mut table = Table::new();
    table.set_header(vec!["ID", "Name", "Type", "Scope", "Source"]);
    for cat in categories {
        table.add_row(vec![
            Cell::new(cat.id),
            Cell::new(cat.name),
            Cell::new(cat.category_type),
            Cell::new(cat.scope),
            Cell::new(if cat.owner_id.is_some() { "custom" } else { "system" }),
        ]);
    }
    println!("{table}");
    Ok(())
}

pub async fn add(
    app: &App,
    name: &str,
    category_type: TransactionType,
    scope: CategoryScope,
) -> Result<()> {
    let category = create_category(&app.db, &app.owner, name, scope, category_type).await?;
    println!("Added category {} ({})", category.name, category.id);
    Ok(())
}

pub async fn delete(app: &App, id: &str) -> Result<()> {
    delete_category(&app.db, &app.owner, id).await?;
    println!("Deleted category {id}");
    Ok(())
}
