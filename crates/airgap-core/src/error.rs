use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Embedding backend unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Dimension mismatch: index expects {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("No token produced within {0:?}")]
    InferenceTimeout(Duration),

    #[error("An inference session is already active on this model")]
    Busy,

    #[error("Unsupported document format: {0}")]
    UnsupportedFormat(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage failure: {0}")]
    Storage(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Transient errors the caller may retry after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Busy | Error::InferenceTimeout(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
