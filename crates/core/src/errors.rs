//! Error taxonomy shared by every Ledgerly crate.

use thiserror::Error;

/// Result type alias for Ledgerly operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the sync engine and its collaborators.
///
/// Only [`Error::Connectivity`] is recovered from internally (by falling back to
/// offline mode). Every other variant is returned to the caller as-is.
#[derive(Debug, Error)]
pub enum Error {
    /// The remote store could not be reached (timeout, refused connection, gateway down).
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// The remote store refused the operation (constraint or validation failure).
    #[error("Remote store rejected the operation ({status}): {message}")]
    RemoteRejected { status: u16, message: String },

    /// Reading or writing the local mirror failed.
    #[error("Local persistence error: {0}")]
    LocalPersistence(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A record does not have the shape of an entity.
    #[error("Invalid entity: {0}")]
    InvalidEntity(String),

    #[error("{collection} with id {id} not found")]
    NotFound { collection: String, id: String },

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl Error {
    pub fn connectivity(message: impl Into<String>) -> Self {
        Self::Connectivity(message.into())
    }

    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self::RemoteRejected {
            status,
            message: message.into(),
        }
    }

    pub fn local(message: impl Into<String>) -> Self {
        Self::LocalPersistence(message.into())
    }

    pub fn invalid_entity(message: impl Into<String>) -> Self {
        Self::InvalidEntity(message.into())
    }

    pub fn not_found(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            collection: collection.into(),
            id: id.into(),
        }
    }

    /// True for transient failures that should flip the engine to offline mode.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connectivity(_))
    }

    /// True when the remote store refused the request outright.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::RemoteRejected { .. })
    }
}
