use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use rust_decimal::Decimal;

use crate::error::{Result, SpendsortError};

pub const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS owner_profiles (
    owner_id TEXT PRIMARY KEY,
    country TEXT,
    usage_type TEXT
);

CREATE TABLE IF NOT EXISTS businesses (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS categories (
    id TEXT PRIMARY KEY,
    owner_id TEXT,
    name TEXT NOT NULL,
    scope TEXT NOT NULL DEFAULT 'both',
    category_type TEXT NOT NULL,
    deleted_at TEXT,
    created_at TEXT DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS category_rules (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    match_field TEXT NOT NULL,
    match_type TEXT NOT NULL,
    pattern TEXT NOT NULL,
    category_id TEXT NOT NULL,
    business_id TEXT,
    enabled INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    FOREIGN KEY (category_id) REFERENCES categories(id)
);

CREATE TABLE IF NOT EXISTS import_batches (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    import_type TEXT NOT NULL,
    total_files INTEGER NOT NULL,
    processed_files INTEGER NOT NULL DEFAULT 0,
    successful_files INTEGER NOT NULL DEFAULT 0,
    failed_files INTEGER NOT NULL DEFAULT 0,
    duplicate_files INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'pending',
    started_at TEXT,
    completed_at TEXT,
    estimated_completion TEXT,
    errors TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS import_batch_items (
    id TEXT PRIMARY KEY,
    batch_id TEXT NOT NULL,
    file_name TEXT NOT NULL,
    file_url TEXT,
    file_size INTEGER,
    processing_order INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    retry_count INTEGER NOT NULL DEFAULT 0,
    error_code TEXT,
    error_message TEXT,
    duplicate_of TEXT,
    duplicate_match_type TEXT,
    document_id TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    FOREIGN KEY (batch_id) REFERENCES import_batches(id)
);

CREATE TABLE IF NOT EXISTS documents (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    file_name TEXT NOT NULL,
    file_url TEXT,
    file_size INTEGER NOT NULL,
    content_hash TEXT NOT NULL,
    merchant_name TEXT,
    document_date TEXT,
    total_amount TEXT,
    category_id TEXT,
    business_id TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS statement_transactions (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    document_id TEXT NOT NULL,
    transaction_date TEXT NOT NULL,
    posted_date TEXT,
    description TEXT NOT NULL,
    merchant_name TEXT NOT NULL,
    amount TEXT NOT NULL,
    debit TEXT,
    credit TEXT,
    balance TEXT,
    category_id TEXT,
    business_id TEXT,
    categorization_method TEXT NOT NULL DEFAULT 'none',
    confidence REAL NOT NULL DEFAULT 0,
    suggested_category TEXT,
    raw_fields TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS statement_mappings (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    header_signature TEXT NOT NULL,
    mapping TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (owner_id, header_signature)
);

CREATE TABLE IF NOT EXISTS completion_usage (
    id INTEGER PRIMARY KEY,
    provider TEXT NOT NULL,
    model TEXT NOT NULL,
    purpose TEXT NOT NULL,
    input_tokens INTEGER NOT NULL,
    output_tokens INTEGER NOT NULL,
    duration_ms INTEGER NOT NULL,
    success INTEGER NOT NULL,
    created_at TEXT DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_documents_owner_hash ON documents(owner_id, content_hash);
CREATE INDEX IF NOT EXISTS idx_items_batch ON import_batch_items(batch_id);
CREATE INDEX IF NOT EXISTS idx_txn_owner_merchant ON statement_transactions(owner_id, merchant_name);
";

// (name, scope, category_type)
const SYSTEM_CATEGORIES: &[(&str, &str, &str)] = &[
    // Income
    ("Salary", "personal", "income"),
    ("Interest Income", "both", "income"),
    ("Refunds", "both", "income"),
    ("Client Revenue", "business", "income"),
    ("Other Income", "both", "income"),
    // Expenses
    ("Groceries", "personal", "expense"),
    ("Dining", "personal", "expense"),
    ("Transportation", "both", "expense"),
    ("Fuel", "both", "expense"),
    ("Utilities", "both", "expense"),
    ("Rent / Mortgage", "personal", "expense"),
    ("Healthcare", "personal", "expense"),
    ("Entertainment", "personal", "expense"),
    ("Shopping", "personal", "expense"),
    ("Travel", "both", "expense"),
    ("Insurance", "both", "expense"),
    ("Subscriptions", "both", "expense"),
    ("Office Supplies", "business", "expense"),
    ("Software & SaaS", "business", "expense"),
    ("Advertising & Marketing", "business", "expense"),
    ("Professional Services", "business", "expense"),
    ("Meals & Entertainment", "business", "expense"),
    ("Bank Fees", "both", "expense"),
    ("Taxes & Licenses", "business", "expense"),
    ("Transfer", "both", "expense"),
];

pub fn get_connection(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;

    let count: i64 = conn.query_row(
        "SELECT count(*) FROM categories WHERE owner_id IS NULL",
        [],
        |row| row.get(0),
    )?;
    if count == 0 {
        for (name, scope, category_type) in SYSTEM_CATEGORIES {
            conn.execute(
                "INSERT INTO categories (id, owner_id, name, scope, category_type) VALUES (?1, NULL, ?2, ?3, ?4)",
                rusqlite::params![uuid::Uuid::new_v4().to_string(), name, scope, category_type],
            )?;
        }
    }
    Ok(())
}

/// Shared handle to the SQLite store. Every call runs on tokio's blocking
/// pool so callers only ever await it.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = get_connection(db_path)?;
        init_db(&conn)?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    pub async fn call<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| SpendsortError::Other("database lock poisoned".into()))?;
            f(&guard)
        })
        .await
        .map_err(|e| SpendsortError::Other(format!("database task panicked: {e}")))?
    }
}

pub fn decimal_to_sql(value: Option<Decimal>) -> Option<String> {
    value.map(|d| d.normalize().to_string())
}

pub fn decimal_from_sql(raw: Option<String>) -> rusqlite::Result<Option<Decimal>> {
    match raw {
        None => Ok(None),
        Some(s) => Decimal::from_str(&s).map(Some).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        }),
    }
}

#[cfg(test)]
pub(crate) fn test_db() -> (tempfile::TempDir, Database) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(&dir.path().join("test.db")).unwrap();
    (dir, db)
}
