use thiserror::Error;

#[derive(Error, Debug)]
pub enum SpendsortError {
    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Not authorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{message}")]
    DuplicateFile {
        message: String,
        existing_document_id: String,
    },

    #[error("Extraction failed: {0}")]
    Extraction(String),

    #[error("Could not enqueue item: {0}")]
    Enqueue(String),

    #[error("Could not fetch file: {0}")]
    Fetch(String),

    #[error("Completion provider {provider} failed: {message}")]
    Completion { provider: String, message: String },

    #[error("All completion providers failed: {0}")]
    CompletionExhausted(String),

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("{0}")]
    Other(String),
}

impl SpendsortError {
    /// Stable code persisted on failed batch items.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Db(_) => "DATABASE_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Csv(_) => "CSV_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::Http(_) => "HTTP_ERROR",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::DuplicateFile { .. } => "DUPLICATE_FILE",
            Self::Extraction(_) => "EXTRACTION_FAILED",
            Self::Enqueue(_) => "ENQUEUE_FAILED",
            Self::Fetch(_) => "FETCH_FAILED",
            Self::Completion { .. } => "COMPLETION_FAILED",
            Self::CompletionExhausted(_) => "COMPLETION_UNAVAILABLE",
            Self::Settings(_) => "SETTINGS_ERROR",
            Self::Other(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, SpendsortError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(SpendsortError::Validation("x".into()).error_code(), "VALIDATION_ERROR");
        assert_eq!(SpendsortError::Extraction("x".into()).error_code(), "EXTRACTION_FAILED");
        assert_eq!(SpendsortError::Enqueue("x".into()).error_code(), "ENQUEUE_FAILED");
    }

    #[test]
    fn test_duplicate_file_displays_message() {
        let err = SpendsortError::DuplicateFile {
            message: "This file was already uploaded as receipt.jpg".into(),
            existing_document_id: "doc-1".into(),
        };
        assert_eq!(err.to_string(), "This file was already uploaded as receipt.jpg");
    }
}
