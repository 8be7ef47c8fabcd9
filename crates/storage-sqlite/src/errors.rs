use ledgerly_core::Error;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database connection failed: {0}")]
    Connection(#[from] diesel::ConnectionError),

    #[error("Connection pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    #[error("Query failed: {0}")]
    Query(#[from] diesel::result::Error),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Invalid database path: {0}")]
    Path(String),

    #[error("Write actor unavailable: {0}")]
    WriterUnavailable(String),

    /// A domain error raised inside a write transaction.
    #[error(transparent)]
    Domain(Error),
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Domain(inner) => inner,
            other => Error::LocalPersistence(other.to_string()),
        }
    }
}
