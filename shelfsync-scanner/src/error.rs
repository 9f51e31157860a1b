use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid selector '{selector}' in strategy '{strategy}': {reason}")]
    InvalidSelector {
        strategy: String,
        selector: String,
        reason: String,
    },

    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Task join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    #[error("Other error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, ScanError>;

/// Why a single matched element produced no record. The element is skipped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractError {
    #[error("no title within length bounds")]
    MissingTitle,

    #[error("no usable link")]
    MissingLink,
}

/// A single transport attempt that went wrong.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("network error: {0}")]
    Network(String),

    #[error("HTTP status {0}")]
    Status(u16),

    #[error("response too small: {actual} bytes (minimum {minimum})")]
    TooSmall { actual: usize, minimum: usize },

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("HTTP {status} redirect to {location}")]
    Redirect { status: u16, location: String },

    #[error("stopped after {0} redirects")]
    TooManyRedirects(usize),

    #[error("page task failed: {0}")]
    TaskFailed(String),
}

impl FetchError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Timeout(_) | FetchError::Network(_) | FetchError::TooSmall { .. } => true,
            FetchError::Status(code) => *code == 408 || *code == 429 || *code >= 500,
            FetchError::InvalidUrl(_)
            | FetchError::Redirect { .. }
            | FetchError::TooManyRedirects(_)
            | FetchError::TaskFailed(_) => false,
        }
    }
}
