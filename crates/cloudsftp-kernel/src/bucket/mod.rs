//! Object store seam.
//!
//! The adapter never talks to a concrete store client directly. Everything
//! it needs from a backend is expressed by [`Bucket`]: ranged reads, a
//! sequential writer, delimiter or subtree listings, copy, delete and stat.
//!
//! - [`ObjectStoreBucket`] - `object_store`-backed implementation
//! - [`open_bucket`] - opens a bucket from a storage URL

mod error;
mod store;

use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

pub use error::{BucketError, BucketResult};
pub use store::{open_bucket, ObjectStoreBucket};

/// Metadata for one object (or common prefix) as reported by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    /// Store key, never with a leading `/`.
    pub key: String,
    /// Size in bytes (0 for common prefixes).
    pub size: u64,
    /// Last modification time, when the store reports one.
    pub mod_time: Option<SystemTime>,
    /// Content hash (ETag or similar), when the store reports one.
    pub content_hash: Option<String>,
    /// True for common prefixes produced by delimiter grouping.
    pub is_dir: bool,
}

impl ObjectEntry {
    /// Entry for a plain object.
    pub fn object(key: impl Into<String>, size: u64) -> Self {
        Self {
            key: key.into(),
            size,
            mod_time: None,
            content_hash: None,
            is_dir: false,
        }
    }

    /// Entry for a common prefix.
    pub fn prefix(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            size: 0,
            mod_time: None,
            content_hash: None,
            is_dir: true,
        }
    }
}

/// How far below the prefix a listing descends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListScope {
    /// Immediate children only, grouped on `/`.
    Level,
    /// Every key under the prefix.
    Subtree,
}

/// Lazy listing cursor. May end early or yield an error mid-stream.
pub type ListCursor<'a> = BoxStream<'a, BucketResult<ObjectEntry>>;

/// Sequential writer for one object.
///
/// Bytes become visible only after [`ObjectWriter::commit`] succeeds.
#[async_trait]
pub trait ObjectWriter: Send {
    /// Append a chunk.
    async fn write(&mut self, chunk: Bytes) -> BucketResult<()>;

    /// Finalize the upload.
    async fn commit(self: Box<Self>) -> BucketResult<()>;

    /// Discard everything written so far.
    async fn abort(self: Box<Self>) -> BucketResult<()>;
}

/// Store primitives the filesystem adapter is built from.
///
/// Keys are `/`-separated and carry no leading `/`. Prefixes passed to
/// [`Bucket::list`] are either empty (the whole namespace) or end in `/`.
#[async_trait]
pub trait Bucket: Send + Sync {
    /// Read up to `length` bytes starting at `offset`.
    ///
    /// Returns an empty buffer at or past the end of the object and fails
    /// with [`BucketError::NotFound`] when the key is absent.
    async fn read_range(&self, key: &str, offset: u64, length: u64) -> BucketResult<Bytes>;

    /// Open a sequential writer for `key`.
    async fn open_writer(&self, key: &str) -> BucketResult<Box<dyn ObjectWriter>>;

    /// List entries under `prefix`.
    fn list(&self, prefix: &str, scope: ListScope) -> ListCursor<'_>;

    /// Server-side copy of `src` to `dst`.
    async fn copy(&self, src: &str, dst: &str) -> BucketResult<()>;

    /// Delete one key.
    async fn delete(&self, key: &str) -> BucketResult<()>;

    /// Metadata for one key.
    async fn stat(&self, key: &str) -> BucketResult<ObjectEntry>;

    /// Write a whole object in one go.
    async fn write_all(&self, key: &str, data: Bytes) -> BucketResult<()> {
        let mut writer = self.open_writer(key).await?;
        if let Err(e) = writer.write(data).await {
            let _ = writer.abort().await;
            return Err(e);
        }
        writer.commit().await
    }
}
