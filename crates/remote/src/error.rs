//! Error types for the remote adapter.

use ledgerly_core::Error;
use thiserror::Error;

/// Result type alias for remote adapter operations.
pub type Result<T> = std::result::Result<T, RemoteError>;

/// Retry policy class for API failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiRetryClass {
    Retryable,
    Permanent,
    ReauthRequired,
}

#[derive(Debug, Error)]
pub enum RemoteError {
    /// The request never completed (DNS, refused connection, timeout, reset).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Non-success response from the backend.
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Authentication error: {0}")]
    Auth(String),
}

impl RemoteError {
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Classify error for retry policy.
    pub fn retry_class(&self) -> ApiRetryClass {
        match self {
            Self::Api { status, .. } => match *status {
                401 | 403 => ApiRetryClass::ReauthRequired,
                408 | 425 | 429 => ApiRetryClass::Retryable,
                502..=504 => ApiRetryClass::Retryable,
                _ => ApiRetryClass::Permanent,
            },
            Self::Http(_) => ApiRetryClass::Retryable,
            Self::Json(_) => ApiRetryClass::Permanent,
            Self::InvalidRequest(_) => ApiRetryClass::Permanent,
            Self::Auth(_) => ApiRetryClass::ReauthRequired,
        }
    }
}

impl From<RemoteError> for Error {
    /// Retryable failures become connectivity errors; the rest are rejections.
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Json(inner) => Error::Serialization(inner),
            RemoteError::InvalidRequest(message) => Error::InvalidOperation(message),
            RemoteError::Auth(message) => Error::rejected(401, message),
            other if other.retry_class() == ApiRetryClass::Retryable => {
                Error::connectivity(other.to_string())
            }
            RemoteError::Api { status, message } => Error::rejected(status, message),
            other => Error::connectivity(other.to_string()),
        }
    }
}
