//! Store error types.

use thiserror::Error;

/// Errors reported by a [`Bucket`](super::Bucket).
#[derive(Debug, Error)]
pub enum BucketError {
    /// Key does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Storage URL could not be parsed or is not supported.
    #[error("invalid storage location: {0}")]
    InvalidLocation(String),

    /// Store call was aborted because the session ended.
    #[error("operation cancelled")]
    Cancelled,

    /// Any other store failure.
    #[error("store error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl BucketError {
    /// Wrap an arbitrary store failure.
    pub fn backend(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Backend(err.into())
    }

    /// Returns true if this is a missing-key error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<object_store::Error> for BucketError {
    fn from(e: object_store::Error) -> Self {
        match e {
            object_store::Error::NotFound { path, .. } => Self::NotFound(path),
            other => Self::Backend(Box::new(other)),
        }
    }
}

/// Store result type.
pub type BucketResult<T> = Result<T, BucketError>;
