//! Filesystem adapter error types.

use thiserror::Error;

use crate::bucket::BucketError;

/// Adapter error taxonomy.
///
/// One of these is returned per failed request; none of them ends the
/// session.
#[derive(Debug, Error)]
pub enum FsError {
    /// Path does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Links, symlinks and readlink.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),

    /// Generic store-call failure.
    #[error("backend error: {0}")]
    Backend(#[from] BucketError),

    /// Upload could not be drained or committed at close.
    #[error("upload failed: {0}")]
    UploadFailed(String),

    /// Rename or rmdir completed some but not all of its steps.
    #[error("partial failure: {0}")]
    PartialFailure(String),

    /// Neither an object nor a directory placeholder exists.
    #[error("stat failed: {0}")]
    StatFailed(String),

    /// Delete rejected by the store.
    #[error("remove failed: {0}")]
    RemoveFailed(String),
}

impl FsError {
    /// Create a NotFound error.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    /// Create an UploadFailed error.
    pub fn upload_failed(msg: impl Into<String>) -> Self {
        Self::UploadFailed(msg.into())
    }

    /// Create a PartialFailure error.
    pub fn partial(msg: impl Into<String>) -> Self {
        Self::PartialFailure(msg.into())
    }

    /// Create a RemoveFailed error.
    pub fn remove_failed(path: impl Into<String>) -> Self {
        Self::RemoveFailed(path.into())
    }

    /// Classify a store error for a read-style request.
    pub(crate) fn from_read(path: &str, err: BucketError) -> Self {
        match err {
            BucketError::NotFound(_) => Self::not_found(path),
            other => Self::Backend(other),
        }
    }

    /// True for errors a client should see as "no such file".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::StatFailed(_))
    }
}

/// Adapter result type.
pub type FsResult<T> = Result<T, FsError>;
