use crate::db::Database;
use crate::error::Result;
use crate::settings::{database_path, load_settings, save_settings};

use super::data_dir;

pub fn run(data_dir_flag: Option<String>, owner: Option<String>) -> Result<()> {
    let mut settings = load_settings();
    if let Some(dir) = data_dir_flag {
        settings.data_dir = dir;
    }
    if let Some(owner) = owner.filter(|o| !o.trim().is_empty()) {
        settings.default_owner = Some(owner.trim().to_string());
    }
    std::fs::create_dir_all(data_dir(&settings))?;
    save_settings(&settings)?;

    let db_path = database_path(&settings);
    Database::open(&db_path)?;

    println!("Data directory: {}", settings.data_dir);
    println!("Database:       {}", db_path.display());
    match &settings.default_owner {
        Some(owner) => println!("Default owner:  {owner}"),
        None => println!("Default owner:  (not set; pass --owner or set SPENDSORT_OWNER)"),
    }
    let configured = settings
        .providers
        .iter()
        .filter(|p| p.resolve_api_key().is_some())
        .count();
    println!(
        "Completion providers: {configured} of {} have an API key",
        settings.providers.len()
    );
    Ok(())
}
