use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Declares a fieldless enum persisted and serialized as a fixed string key.
macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $key:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $key)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $key),+
                }
            }

            pub fn parse(raw: &str) -> Option<Self> {
                match raw.trim() {
                    $($key => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl rusqlite::types::ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
                Ok(rusqlite::types::ToSqlOutput::from(self.as_str()))
            }
        }

        impl rusqlite::types::FromSql for $name {
            fn column_result(
                value: rusqlite::types::ValueRef<'_>,
            ) -> rusqlite::types::FromSqlResult<Self> {
                let raw = value.as_str()?;
                Self::parse(raw).ok_or_else(|| {
                    rusqlite::types::FromSqlError::Other(
                        format!("unknown {} value: {raw}", stringify!($name)).into(),
                    )
                })
            }
        }
    };
}

string_enum!(
    BatchStatus {
        Pending => "pending",
        Processing => "processing",
        Completed => "completed",
        Failed => "failed",
        Cancelled => "cancelled",
    }
);

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

string_enum!(
    ItemStatus {
        Pending => "pending",
        Processing => "processing",
        Completed => "completed",
        Failed => "failed",
        Duplicate => "duplicate",
        Skipped => "skipped",
    }
);

impl ItemStatus {
    /// Legal transitions of the item state machine.
    pub fn can_transition_to(&self, next: ItemStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Processing) => true,
            (
                Self::Processing,
                Self::Completed | Self::Failed | Self::Duplicate | Self::Skipped,
            ) => true,
            (Self::Failed, Self::Pending) => true,
            _ => false,
        }
    }
}

string_enum!(
    ImportType {
        Receipts => "receipts",
        BankStatement => "bank_statement",
        CreditCardStatement => "credit_card_statement",
        Auto => "auto",
    }
);

string_enum!(
    /// Statement kind driving sign conventions.
    StatementKind {
        BankAccount => "bank_account",
        CreditCard => "credit_card",
        Unknown => "unknown",
    }
);

impl ImportType {
    pub fn statement_kind(&self) -> StatementKind {
        match self {
            Self::BankStatement => StatementKind::BankAccount,
            Self::CreditCardStatement => StatementKind::CreditCard,
            Self::Receipts | Self::Auto => StatementKind::Unknown,
        }
    }
}

string_enum!(
    CategorizationMethod {
        Rule => "rule",
        History => "history",
        Ai => "ai",
        None => "none",
    }
);

string_enum!(
    MatchField {
        MerchantName => "merchantName",
        Description => "description",
    }
);

string_enum!(
    MatchType {
        Exact => "exact",
        Contains => "contains",
        Regex => "regex",
    }
);

string_enum!(
    DuplicateMatchType {
        ExactImage => "exact_image",
        MerchantDateAmount => "merchant_date_amount",
        Manual => "manual",
    }
);

string_enum!(
    MatchConfidence {
        High => "high",
        Medium => "medium",
        Low => "low",
    }
);

string_enum!(
    CategoryScope {
        Personal => "personal",
        Business => "business",
        Both => "both",
    }
);

string_enum!(
    TransactionType {
        Income => "income",
        Expense => "expense",
    }
);

string_enum!(
    DocumentKind {
        Receipt => "receipt",
        Statement => "statement",
    }
);

#[derive(Debug, Clone, Serialize)]
pub struct ImportBatch {
    pub id: String,
    pub owner_id: String,
    pub import_type: ImportType,
    pub total_files: i64,
    pub processed_files: i64,
    pub successful_files: i64,
    pub failed_files: i64,
    pub duplicate_files: i64,
    pub status: BatchStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub estimated_completion: Option<DateTime<Utc>>,
    pub errors: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportBatchItem {
    pub id: String,
    pub batch_id: String,
    pub file_name: String,
    pub file_url: Option<String>,
    pub file_size: Option<i64>,
    pub processing_order: i64,
    pub status: ItemStatus,
    pub retry_count: i64,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub duplicate_of: Option<String>,
    pub duplicate_match_type: Option<DuplicateMatchType>,
    pub document_id: Option<String>,
}

/// Caller-supplied descriptor for one file of a new batch.
#[derive(Debug, Clone)]
pub struct NewBatchFile {
    pub file_name: String,
    pub file_url: Option<String>,
    pub file_size: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedTransaction {
    pub transaction_date: NaiveDate,
    pub posted_date: Option<NaiveDate>,
    pub description: String,
    pub merchant_name: String,
    /// Expense negative, income positive.
    pub amount: Decimal,
    pub debit: Option<Decimal>,
    pub credit: Option<Decimal>,
    pub balance: Option<Decimal>,
    pub raw_fields: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategorizationResult {
    pub category_id: Option<String>,
    pub category_name: Option<String>,
    pub business_id: Option<String>,
    pub confidence: f64,
    pub method: CategorizationMethod,
    pub matched_rule_id: Option<String>,
    pub suggested_category: Option<String>,
}

impl CategorizationResult {
    pub fn none() -> Self {
        Self {
            category_id: None,
            category_name: None,
            business_id: None,
            confidence: 0.0,
            method: CategorizationMethod::None,
            matched_rule_id: None,
            suggested_category: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CategoryRule {
    pub id: String,
    pub owner_id: String,
    pub match_field: MatchField,
    pub match_type: MatchType,
    pub pattern: String,
    pub category_id: String,
    pub business_id: Option<String>,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateMatch {
    pub document_id: String,
    pub match_type: DuplicateMatchType,
    pub confidence: MatchConfidence,
}

#[derive(Debug, Clone, Serialize)]
pub struct Category {
    pub id: String,
    /// `None` for system categories.
    pub owner_id: Option<String>,
    pub name: String,
    pub scope: CategoryScope,
    pub category_type: TransactionType,
}

#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub owner_id: String,
    pub kind: DocumentKind,
    pub file_name: String,
    pub file_url: Option<String>,
    pub file_size: i64,
    pub content_hash: String,
    pub merchant_name: Option<String>,
    pub document_date: Option<NaiveDate>,
    pub total_amount: Option<Decimal>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct OwnerProfile {
    pub country: Option<String>,
    pub usage_type: Option<CategoryScope>,
    pub businesses: Vec<Business>,
}

#[derive(Debug, Clone)]
pub struct Business {
    pub id: String,
    pub name: String,
}
