use crate::categorize::categories::{add_business, get_profile, set_profile};
use crate::error::Result;
use crate::models::CategoryScope;

use super::App;

pub async fn run(
    app: &App,
    country: Option<String>,
    usage: Option<CategoryScope>,
    business: Option<String>,
) -> Result<()> {
    if country.is_some() || usage.is_some() {
        let current = get_profile(&app.db, &app.owner).await?;
        set_profile(
            &app.db,
            &app.owner,
            country.or(current.country),
            usage.or(current.usage_type),
        )
        .await?;
    }
    if let Some(name) = business {
        let added = add_business(&app.db, &app.owner, &name).await?;
        println!("Added business {} ({})", added.name, added.id);
    }

    let profile = get_profile(&app.db, &app.owner).await?;
    println!("Owner:      {}", app.owner);
    println!("Country:    {}", profile.country.as_deref().unwrap_or("(not set)"));
    println!(
        "Usage:      {}",
        profile.usage_type.map(|u| u.to_string()).unwrap_or_else(|| "(not set)".into())
    );
    if profile.businesses.is_empty() {
        println!("Businesses: none");
    } else {
        let names: Vec<&str> = profile.businesses.iter().map(|b| b.name.as_str()).collect();
        println!("Businesses: {}", names.join(", "));
    }
    Ok(())
}
