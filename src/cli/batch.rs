use colored::{ColoredString, Colorize};
use comfy_table::{Cell, Table};

use crate::batch::BatchCoordinator;
use crate::error::Result;
use crate::fmt::{clip, percent};
use crate::models::{BatchStatus, ItemStatus};

use super::import::{drain, queued_coordinator};
use super::App;

fn item_status(status: ItemStatus) -> ColoredString {
    match status {
        ItemStatus::Completed | ItemStatus::Skipped => status.as_str().green(),
        ItemStatus::Failed => status.as_str().red(),
        ItemStatus::Duplicate => status.as_str().yellow(),
        ItemStatus::Pending | ItemStatus::Processing => status.as_str().normal(),
    }
}

fn batch_status(status: BatchStatus) -> ColoredString {
    match status {
        BatchStatus::Completed => status.as_str().green().bold(),
        BatchStatus::Failed | BatchStatus::Cancelled => status.as_str().red().bold(),
        BatchStatus::Pending | BatchStatus::Processing => status.as_str().bold(),
    }
}

pub async fn list(app: &App) -> Result<()> {
    let coordinator = BatchCoordinator::new(app.db.clone());
    let batches = coordinator.list_batches(&app.owner).await?;
    if batches.is_empty() {
        println!("No batches yet.");
        return Ok(());
    }
    let mut table = Table::new();
    table.set_header(vec!["ID", "Type", "Status", "Files", "Done", "Failed", "Dupes", "Created"]);
    for b in batches {
        table.add_row(vec![
            Cell::new(b.id),
            Cell::new(b.import_type),
            Cell::new(batch_status(b.status)),
            Cell::new(b.total_files),
            Cell::new(b.successful_files),
            Cell::new(b.failed_files),
            Cell::new(b.duplicate_files),
            Cell::new(b.created_at.format("%Y-%m-%d %H:%M")),
        ]);
    }
    println!("{table}");
    Ok(())
}

/// Progress line, batch errors and the item table.
pub async fn print_batch(app: &App, batch_id: &str) -> Result<()> {
    let coordinator = BatchCoordinator::new(app.db.clone());
    let progress = coordinator.get_progress(&app.owner, batch_id).await?;
    let batch = coordinator.get_batch(&app.owner, batch_id).await?;
    let items = coordinator.list_items(&app.owner, batch_id).await?;

    println!(
        "Batch {} [{}]: {} processed of {} ({}), {} ok, {} failed, {} duplicate",
        progress.batch_id,
        batch_status(progress.status),
        progress.processed_files,
        progress.total_files,
        percent(progress.percentage),
        progress.successful_files,
        progress.failed_files,
        progress.duplicate_files,
    );
    if let Some(eta) = progress.estimated_completion {
        println!("Estimated completion: {}", eta.format("%H:%M:%S UTC"));
    }
    for error in &batch.errors {
        println!("  ! {error}");
    }

    let mut table = Table::new();
    table.set_header(vec!["Item", "File", "Status", "Retries", "Detail"]);
    for item in items {
        let detail = match (&item.duplicate_of, &item.error_message) {
            (Some(doc), _) => format!("duplicate of {doc}"),
            (None, Some(message)) => format!(
                "{}: {}",
                item.error_code.as_deref().unwrap_or("ERROR"),
                clip(message, 60)
            ),
            (None, None) => item.document_id.clone().unwrap_or_default(),
        };
        table.add_row(vec![
            Cell::new(item.id),
            Cell::new(clip(&item.file_name, 40)),
            Cell::new(item_status(item.status)),
            Cell::new(item.retry_count),
            Cell::new(detail),
        ]);
    }
    println!("{table}");
    Ok(())
}

pub async fn item(app: &App, item_id: &str) -> Result<()> {
    let coordinator = BatchCoordinator::new(app.db.clone());
    let item = coordinator.get_item(&app.owner, item_id).await?;
    println!("Item:      {}", item.id);
    println!("Batch:     {}", item.batch_id);
    println!("File:      {}", item.file_name);
    println!("Source:    {}", item.file_url.as_deref().unwrap_or("(none)"));
    println!("Status:    {}", item.status);
    println!("Retries:   {}", item.retry_count);
    if let Some(doc) = &item.document_id {
        println!("Document:  {doc}");
    }
    if let Some(doc) = &item.duplicate_of {
        let match_type = item
            .duplicate_match_type
            .map(|m| m.to_string())
            .unwrap_or_default();
        println!("Duplicate: {doc} ({match_type})");
    }
    if let Some(message) = &item.error_message {
        println!(
            "Error:     {} {message}",
            item.error_code.as_deref().unwrap_or("ERROR")
        );
    }
    Ok(())
}

pub async fn retry(app: &App, item_id: &str, scanned: bool) -> Result<()> {
    let (coordinator, rx) = queued_coordinator(app);
    let item = coordinator.retry_item(&app.owner, item_id).await?;
    drop(coordinator);
    println!("Retrying {} (attempt {})", item.file_name, item.retry_count + 1);
    drain(app, rx, scanned, false).await?;
    print_batch(app, &item.batch_id).await
}

pub async fn retry_all(app: &App, batch_id: &str, scanned: bool) -> Result<()> {
    let (coordinator, rx) = queued_coordinator(app);
    let outcome = coordinator.retry_all_failed(&app.owner, batch_id).await?;
    drop(coordinator);
    println!("{} item(s) re-queued", outcome.retried_count);
    for error in &outcome.errors {
        println!("  ! {error}");
    }
    if outcome.retried_count > 0 {
        drain(app, rx, scanned, false).await?;
    }
    print_batch(app, batch_id).await
}

pub async fn cancel(app: &App, batch_id: &str) -> Result<()> {
    let coordinator = BatchCoordinator::new(app.db.clone());
    let batch = coordinator.cancel_batch(&app.owner, batch_id).await?;
    println!("Batch {} is {}", batch.id, batch.status);
    Ok(())
}
