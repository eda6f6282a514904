use std::sync::Arc;

use tokio::sync::mpsc;

use crate::batch::BatchCoordinator;
use crate::error::{Result, SpendsortError};
use crate::fetch::{is_remote, local_path, AnyFetcher};
use crate::models::{ImportType, NewBatchFile};
use crate::pipeline::queue::{run_worker, ChannelQueue, ItemJob, WorkerStats};
use crate::pipeline::Pipeline;

use super::batch::print_batch;
use super::App;

/// Turn a command-line argument into a batch file descriptor. Local files
/// must exist; remote URLs are checked when the worker downloads them.
pub(crate) fn describe_file(arg: &str) -> Result<NewBatchFile> {
    if is_remote(arg) {
        let without_query = arg.split(['?', '#']).next().unwrap_or(arg);
        let file_name = without_query
            .rsplit('/')
            .find(|s| !s.is_empty())
            .unwrap_or(without_query)
            .to_string();
        return Ok(NewBatchFile {
            file_name,
            file_url: Some(arg.to_string()),
            file_size: None,
        });
    }
    let path = local_path(arg);
    let meta = std::fs::metadata(&path)
        .map_err(|e| SpendsortError::Validation(format!("{}: {e}", path.display())))?;
    if !meta.is_file() {
        return Err(SpendsortError::Validation(format!("{} is not a file", path.display())));
    }
    let absolute = path.canonicalize()?;
    let file_name = absolute
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| arg.to_string());
    Ok(NewBatchFile {
        file_name,
        file_url: Some(absolute.to_string_lossy().to_string()),
        file_size: Some(meta.len() as i64),
    })
}

/// Coordinator wired to a fresh in-process queue. Drop it before draining.
pub(crate) fn queued_coordinator(app: &App) -> (BatchCoordinator, mpsc::UnboundedReceiver<ItemJob>) {
    let (queue, rx) = ChannelQueue::new();
    (BatchCoordinator::new(app.db.clone()).with_queue(Arc::new(queue)), rx)
}

/// Process everything queued so far.
pub(crate) async fn drain(
    app: &App,
    rx: mpsc::UnboundedReceiver<ItemJob>,
    scanned: bool,
    no_ai: bool,
) -> Result<WorkerStats> {
    let chain = app.chain();
    if chain.is_empty() {
        println!("No completion provider has an API key; receipts, PDFs and new statement layouts will fail.");
    }
    let pipeline = Pipeline::new(
        app.db.clone(),
        chain.clone(),
        Arc::new(AnyFetcher::new(app.client())),
        &app.settings,
        !no_ai,
    )
    .with_scanned_fallback(scanned);
    let stats = run_worker(Arc::new(pipeline), rx, app.settings.import.worker_concurrency).await;
    chain.flush_usage().await;
    stats
}

pub async fn run(
    app: &App,
    import_type: ImportType,
    files: &[String],
    scanned: bool,
    no_ai: bool,
) -> Result<()> {
    let descriptors = files
        .iter()
        .map(|f| describe_file(f))
        .collect::<Result<Vec<_>>>()?;

    let (coordinator, rx) = queued_coordinator(app);
    let batch = coordinator
        .create_batch(&app.owner, import_type, descriptors)
        .await?;
    let queued = coordinator.submit_batch(&app.owner, &batch.id).await?;
    drop(coordinator);
    println!("Batch {} created with {} file(s), {queued} queued", batch.id, batch.total_files);

    let stats = drain(app, rx, scanned, no_ai).await?;
    println!(
        "{} completed, {} duplicate, {} failed",
        stats.completed, stats.duplicate, stats.failed
    );
    print_batch(app, &batch.id).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_remote_file() {
        let file = describe_file("https://cdn.example.com/up/jan%20stmt.pdf?sig=abc").unwrap();
        assert_eq!(file.file_name, "jan%20stmt.pdf");
        assert_eq!(file.file_size, None);
        assert!(file.file_url.unwrap().ends_with("sig=abc"));
    }

    #[test]
    fn test_describe_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("receipt.png");
        std::fs::write(&path, b"12345").unwrap();
        let file = describe_file(path.to_str().unwrap()).unwrap();
        assert_eq!(file.file_name, "receipt.png");
        assert_eq!(file.file_size, Some(5));

        let err = describe_file(dir.path().join("nope.png").to_str().unwrap()).unwrap_err();
        assert!(matches!(err, SpendsortError::Validation(_)));
    }
}
