mod batch;
mod categorize;
mod cli;
mod completion;
mod db;
mod documents;
mod duplicate;
mod error;
mod fetch;
mod fmt;
mod models;
mod normalizer;
mod pipeline;
mod receipt;
mod settings;
mod sign;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{App, BatchCommands, CategoriesCommands, Cli, Commands, RulesCommands};

async fn dispatch(cli: Cli) -> error::Result<()> {
    let owner = cli.owner;
    match cli.command {
        Commands::Init { data_dir } => cli::init::run(data_dir, owner),
        Commands::Import {
            import_type,
            scanned,
            no_ai,
            files,
        } => {
            let app = App::open(owner)?;
            cli::import::run(&app, import_type.into(), &files, scanned, no_ai).await
        }
        Commands::Batch { command } => {
            let app = App::open(owner)?;
            match command {
                BatchCommands::List => cli::batch::list(&app).await,
                BatchCommands::Status { batch_id } => cli::batch::print_batch(&app, &batch_id).await,
                BatchCommands::Item { item_id } => cli::batch::item(&app, &item_id).await,
                BatchCommands::Retry { item_id, scanned } => {
                    cli::batch::retry(&app, &item_id, scanned).await
                }
                BatchCommands::RetryAll { batch_id, scanned } => {
                    cli::batch::retry_all(&app, &batch_id, scanned).await
                }
                BatchCommands::Cancel { batch_id } => cli::batch::cancel(&app, &batch_id).await,
            }
        }
        Commands::Rules { command } => {
            let app = App::open(owner)?;
            match command {
                RulesCommands::Add {
                    pattern,
                    category,
                    match_field,
                    match_type,
                    business,
                } => {
                    cli::rules::add(
                        &app,
                        &pattern,
                        &category,
                        match_field.into(),
                        match_type.into(),
                        business.as_deref(),
                    )
                    .await
                }
                RulesCommands::List => cli::rules::list(&app).await,
                RulesCommands::Update {
                    id,
                    pattern,
                    category,
                    match_field,
                    match_type,
                } => {
                    cli::rules::update(
                        &app,
                        &id,
                        pattern,
                        category.as_deref(),
                        match_field.map(Into::into),
                        match_type.map(Into::into),
                    )
                    .await
                }
                RulesCommands::Delete { id } => cli::rules::delete(&app, &id).await,
                RulesCommands::Toggle { id } => cli::rules::toggle(&app, &id).await,
            }
        }
        Commands::Categories {
            category_type,
            command,
        } => {
            let app = App::open(owner)?;
            match command {
                None => cli::categories::list(&app, category_type.map(Into::into)).await,
                Some(CategoriesCommands::Add {
                    name,
                    category_type,
                    scope,
                }) => cli::categories::add(&app, &name, category_type.into(), scope.into()).await,
                Some(CategoriesCommands::Delete { id }) => cli::categories::delete(&app, &id).await,
            }
        }
        Commands::Profile {
            country,
            usage,
            add_business,
        } => {
            let app = App::open(owner)?;
            cli::profile::run(&app, country, usage.map(Into::into), add_business).await
        }
        Commands::Categorize {
            merchant,
            description,
            amount,
            no_ai,
        } => {
            let app = App::open(owner)?;
            cli::categorize::run(&app, &merchant, description.as_deref(), &amount, no_ai).await
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = dispatch(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
