use thiserror::Error;

#[derive(Error, Debug)]
pub enum SeshuError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Fetch error: {0}")]
    Fetch(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Extraction error: {0}")]
    Extraction(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{url} is already owned by another user")]
    OwnershipConflict { url: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl From<sqlx::Error> for SeshuError {
    fn from(err: sqlx::Error) -> Self {
        SeshuError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for SeshuError {
    fn from(err: serde_json::Error) -> Self {
        SeshuError::Parse(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SeshuError>;
