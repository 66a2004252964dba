use thiserror::Error;

pub type Result<T> = std::result::Result<T, ScrapingError>;

#[derive(Debug, Error)]
pub enum ScrapingError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// The target URL arrived already percent-encoded. The client encodes it
    /// exactly once, so a pre-encoded URL would be double-escaped upstream.
    #[error("URL must not be encoded: {0}")]
    EncodedUrl(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for ScrapingError {
    fn from(err: reqwest::Error) -> Self {
        ScrapingError::Network(err.to_string())
    }
}
