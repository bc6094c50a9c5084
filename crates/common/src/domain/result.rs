use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Transport error: {0}")]
    Transport(#[source] anyhow::Error),

    #[error("Unexpected HTTP status {status} from {url}")]
    HttpStatus { status: u16, url: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid session transition: cannot {operation} while {state}")]
    InvalidTransition {
        state: String,
        operation: &'static str,
    },

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Storage error: {0}")]
    Storage(#[source] anyhow::Error),

    #[error("Capture device error: {0}")]
    Device(String),
}

impl DomainError {
    /// Whether a retry of the same call may succeed.
    ///
    /// Transient network failures, throttling/server HTTP statuses and
    /// malformed presign/complete responses are retryable. Everything else is
    /// a permanent failure of that call.
    pub fn is_retryable(&self) -> bool {
        match self {
            DomainError::Transport(_) | DomainError::Protocol(_) => true,
            DomainError::HttpStatus { status, .. } => is_retryable_status(*status),
            _ => false,
        }
    }
}

/// Server errors plus request timeout and throttling.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500..=599)
}

impl From<serde_json::Error> for DomainError {
    fn from(e: serde_json::Error) -> Self {
        DomainError::Codec(e.to_string())
    }
}
