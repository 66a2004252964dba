use thiserror::Error;

pub type Result<T> = std::result::Result<T, AiError>;

#[derive(Debug, Error)]
pub enum AiError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("OpenAI API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("No content in OpenAI response")]
    EmptyResponse,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for AiError {
    fn from(err: reqwest::Error) -> Self {
        AiError::Network(err.to_string())
    }
}
