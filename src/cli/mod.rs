pub mod batch;
pub mod categories;
pub mod categorize;
pub mod import;
pub mod init;
pub mod profile;
pub mod rules;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};

use crate::completion::{CompletionChain, UsageLogger};
use crate::db::Database;
use crate::error::{Result, SpendsortError};
use crate::models::{CategoryScope, ImportType, MatchField, MatchType, TransactionType};
use crate::settings::{database_path, load_settings, Settings};

#[derive(Parser)]
#[command(
    name = "spendsort",
    about = "Import receipts and bank/card statements, find duplicates, and categorize spending."
)]
pub struct Cli {
    /// Owner the command acts for (default: settings or SPENDSORT_OWNER)
    #[arg(long, global = true)]
    pub owner: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write settings, create the database and seed system categories.
    Init {
        /// Path for spendsort data (default: ~/Documents/spendsort)
        #[arg(long = "data-dir")]
        data_dir: Option<String>,
    },
    /// Import files as one batch and process it.
    Import {
        /// What the files contain
        #[arg(long = "type", value_enum, default_value = "auto")]
        import_type: ImportKind,
        /// Read PDFs without a text layer with vision extraction
        #[arg(long)]
        scanned: bool,
        /// Skip AI categorization
        #[arg(long = "no-ai")]
        no_ai: bool,
        /// Local paths or http(s) URLs
        #[arg(required = true)]
        files: Vec<String>,
    },
    /// Inspect and retry import batches.
    Batch {
        #[command(subcommand)]
        command: BatchCommands,
    },
    /// Manage categorization rules.
    Rules {
        #[command(subcommand)]
        command: RulesCommands,
    },
    /// List available categories, or add/delete your own.
    Categories {
        /// Only income or expense categories
        #[arg(long = "type", value_enum)]
        category_type: Option<CategoryTypeArg>,
        #[command(subcommand)]
        command: Option<CategoriesCommands>,
    },
    /// Show or set the owner profile used for categorization.
    Profile {
        /// ISO country code
        #[arg(long)]
        country: Option<String>,
        #[arg(long, value_enum)]
        usage: Option<ScopeArg>,
        /// Add a business by name
        #[arg(long = "add-business")]
        add_business: Option<String>,
    },
    /// Categorize a single transaction and show how it was resolved.
    Categorize {
        #[arg(long)]
        merchant: String,
        #[arg(long)]
        description: Option<String>,
        /// Signed amount: expenses negative
        #[arg(long, allow_hyphen_values = true)]
        amount: String,
        #[arg(long = "no-ai")]
        no_ai: bool,
    },
}

#[derive(Subcommand)]
pub enum BatchCommands {
    /// List your batches.
    List,
    /// Progress and items of a batch.
    Status { batch_id: String },
    /// Details of one item.
    Item { item_id: String },
    /// Retry one failed item.
    Retry {
        item_id: String,
        #[arg(long)]
        scanned: bool,
    },
    /// Retry every failed item of a batch.
    RetryAll {
        batch_id: String,
        #[arg(long)]
        scanned: bool,
    },
    /// Cancel a batch.
    Cancel { batch_id: String },
}

#[derive(Subcommand)]
pub enum RulesCommands {
    /// Add a categorization rule.
    Add {
        /// Text or regex to match
        pattern: String,
        /// Category name to assign
        #[arg(long)]
        category: String,
        #[arg(long = "field", value_enum, default_value = "merchant")]
        match_field: FieldArg,
        #[arg(long = "match-type", value_enum, default_value = "contains")]
        match_type: MatchTypeArg,
        /// Business name to attribute matches to
        #[arg(long)]
        business: Option<String>,
    },
    /// List rules in evaluation order.
    List,
    /// Update an existing rule.
    Update {
        /// Rule ID (shown in `spendsort rules list`)
        id: String,
        #[arg(long)]
        pattern: Option<String>,
        #[arg(long)]
        category: Option<String>,
        #[arg(long = "field", value_enum)]
        match_field: Option<FieldArg>,
        #[arg(long = "match-type", value_enum)]
        match_type: Option<MatchTypeArg>,
    },
    /// Delete a rule.
    Delete { id: String },
    /// Enable or disable a rule.
    Toggle { id: String },
}

#[derive(Subcommand)]
pub enum CategoriesCommands {
    /// Add a custom category.
    Add {
        name: String,
        #[arg(long = "type", value_enum, default_value = "expense")]
        category_type: CategoryTypeArg,
        #[arg(long, value_enum, default_value = "both")]
        scope: ScopeArg,
    },
    /// Delete one of your categories.
    Delete { id: String },
}

#[derive(Clone, Copy, ValueEnum)]
pub enum ImportKind {
    Receipts,
    Bank,
    CreditCard,
    Auto,
}

impl From<ImportKind> for ImportType {
    fn from(kind: ImportKind) -> Self {
        match kind {
            ImportKind::Receipts => ImportType::Receipts,
            ImportKind::Bank => ImportType::BankStatement,
            ImportKind::CreditCard => ImportType::CreditCardStatement,
            ImportKind::Auto => ImportType::Auto,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
pub enum CategoryTypeArg {
    Income,
    Expense,
}

impl From<CategoryTypeArg> for TransactionType {
    fn from(arg: CategoryTypeArg) -> Self {
        match arg {
            CategoryTypeArg::Income => TransactionType::Income,
            CategoryTypeArg::Expense => TransactionType::Expense,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
pub enum ScopeArg {
    Personal,
    Business,
    Both,
}

impl From<ScopeArg> for CategoryScope {
    fn from(arg: ScopeArg) -> Self {
        match arg {
            ScopeArg::Personal => CategoryScope::Personal,
            ScopeArg::Business => CategoryScope::Business,
            ScopeArg::Both => CategoryScope::Both,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
pub enum FieldArg {
    Merchant,
    Description,
}

impl From<FieldArg> for MatchField {
    fn from(arg: FieldArg) -> Self {
        match arg {
            FieldArg::Merchant => MatchField::MerchantName,
            FieldArg::Description => MatchField::Description,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
pub enum MatchTypeArg {
    Exact,
    Contains,
    Regex,
}

impl From<MatchTypeArg> for MatchType {
    fn from(arg: MatchTypeArg) -> Self {
        match arg {
            MatchTypeArg::Exact => MatchType::Exact,
            MatchTypeArg::Contains => MatchType::Contains,
            MatchTypeArg::Regex => MatchType::Regex,
        }
    }
}

/// Settings, database and owner resolved once per command.
pub struct App {
    pub settings: Settings,
    pub db: Database,
    pub owner: String,
    client: reqwest::Client,
}

impl App {
    pub fn open(owner: Option<String>) -> Result<Self> {
        let settings = load_settings();
        let owner = resolve_owner(owner, &settings)?;
        let path = database_path(&settings);
        if !path.exists() {
            return Err(SpendsortError::Settings(format!(
                "no database at {}; run `spendsort init` first",
                path.display()
            )));
        }
        let db = Database::open(&path)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(180))
            .build()?;
        Ok(Self {
            settings,
            db,
            owner,
            client,
        })
    }

    pub fn client(&self) -> reqwest::Client {
        self.client.clone()
    }

    pub fn chain(&self) -> CompletionChain {
        CompletionChain::from_settings(&self.settings.providers, self.client())
            .with_usage_logger(UsageLogger::new(self.db.clone()))
    }
}

pub(crate) fn resolve_owner(flag: Option<String>, settings: &Settings) -> Result<String> {
    flag.or_else(|| settings.default_owner.clone())
        .map(|o| o.trim().to_string())
        .filter(|o| !o.is_empty())
        .ok_or_else(|| {
            SpendsortError::Unauthorized(
                "no owner; pass --owner, set SPENDSORT_OWNER, or run `spendsort init`".into(),
            )
        })
}

pub(crate) fn data_dir(settings: &Settings) -> PathBuf {
    PathBuf::from(&settings.data_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_owner_prefers_flag() {
        let mut settings = Settings::default();
        settings.default_owner = Some("from-settings".into());
        assert_eq!(resolve_owner(Some("cli".into()), &settings).unwrap(), "cli");
        assert_eq!(resolve_owner(None, &settings).unwrap(), "from-settings");
        settings.default_owner = Some("  ".into());
        assert!(matches!(
            resolve_owner(None, &settings).unwrap_err(),
            SpendsortError::Unauthorized(_)
        ));
    }

    #[test]
    fn test_cli_parses_import() {
        let cli = Cli::parse_from([
            "spendsort", "--owner", "me", "import", "--type", "credit-card", "a.csv", "b.pdf",
        ]);
        assert_eq!(cli.owner.as_deref(), Some("me"));
        match cli.command {
            Commands::Import {
                import_type, files, ..
            } => {
                assert_eq!(ImportType::from(import_type), ImportType::CreditCardStatement);
                assert_eq!(files, vec!["a.csv", "b.pdf"]);
            }
            _ => panic!("expected import"),
        }
    }

    #[test]
    fn test_cli_accepts_negative_amount() {
        let cli = Cli::parse_from([
            "spendsort", "categorize", "--merchant", "Shell", "--amount", "-40.00",
        ]);
        assert!(matches!(cli.command, Commands::Categorize { ref amount, .. } if amount == "-40.00"));
    }
}
