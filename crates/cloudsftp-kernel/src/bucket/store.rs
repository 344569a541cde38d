//! `object_store`-backed bucket.

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use object_store::buffered::BufWriter;
use object_store::path::Path;
use object_store::prefix::PrefixStore;
use object_store::{ObjectMeta, ObjectStore};
use tokio::io::AsyncWriteExt;
use url::Url;

use super::{Bucket, BucketError, BucketResult, ListCursor, ListScope, ObjectEntry, ObjectWriter};

/// Bucket over any [`ObjectStore`] (memory, local file, S3, GCS, Azure).
#[derive(Clone)]
pub struct ObjectStoreBucket {
    store: Arc<dyn ObjectStore>,
}

impl std::fmt::Debug for ObjectStoreBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStoreBucket")
            .field("store", &self.store.to_string())
            .finish()
    }
}

impl ObjectStoreBucket {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Bucket over a fresh in-memory store.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(object_store::memory::InMemory::new()))
    }
}

/// Open a bucket from a storage URL.
///
/// Supported schemes are whatever `object_store` was built with:
/// `memory:///`, `file:///path`, `s3://bucket/prefix`, `gs://...`, `az://...`.
/// Backend options are taken from the environment with lower-cased names
/// (`AWS_REGION` → `aws_region`). A path component becomes a key prefix.
pub fn open_bucket(location: &str) -> BucketResult<ObjectStoreBucket> {
    let url = Url::parse(location)
        .map_err(|e| BucketError::InvalidLocation(format!("{location}: {e}")))?;

    let options = std::env::vars().map(|(k, v)| (k.to_ascii_lowercase(), v));
    let (store, prefix) = object_store::parse_url_opts(&url, options)
        .map_err(|e| BucketError::InvalidLocation(format!("{location}: {e}")))?;

    let store: Arc<dyn ObjectStore> = if prefix.as_ref().is_empty() {
        Arc::from(store)
    } else {
        Arc::new(PrefixStore::new(store, prefix))
    };

    Ok(ObjectStoreBucket::new(store))
}

/// `None` for the empty prefix (whole namespace).
fn prefix_path(prefix: &str) -> Option<Path> {
    let trimmed = prefix.trim_matches('/');
    (!trimmed.is_empty()).then(|| Path::from(trimmed))
}

fn entry_from_meta(meta: ObjectMeta) -> ObjectEntry {
    ObjectEntry {
        key: meta.location.to_string(),
        size: meta.size as u64,
        mod_time: Some(SystemTime::from(meta.last_modified)),
        content_hash: meta.e_tag,
        is_dir: false,
    }
}

#[async_trait]
impl Bucket for ObjectStoreBucket {
    async fn read_range(&self, key: &str, offset: u64, length: u64) -> BucketResult<Bytes> {
        let path = Path::from(key);
        // get_range rejects ranges that start past the end, so size first
        let meta = self.store.head(&path).await?;
        let size = meta.size as u64;
        if offset >= size || length == 0 {
            return Ok(Bytes::new());
        }
        let end = offset.saturating_add(length).min(size);
        let bytes = self
            .store
            .get_range(&path, offset as usize..end as usize)
            .await?;
        Ok(bytes)
    }

    async fn open_writer(&self, key: &str) -> BucketResult<Box<dyn ObjectWriter>> {
        let writer = BufWriter::new(self.store.clone(), Path::from(key));
        Ok(Box::new(BufObjectWriter { inner: writer }))
    }

    fn list(&self, prefix: &str, scope: ListScope) -> ListCursor<'_> {
        let prefix = prefix_path(prefix);
        match scope {
            ListScope::Subtree => self
                .store
                .list(prefix.as_ref())
                .map(|res| res.map(entry_from_meta).map_err(BucketError::from))
                .boxed(),
            ListScope::Level => {
                let store = self.store.clone();
                stream::once(async move { store.list_with_delimiter(prefix.as_ref()).await })
                    .flat_map(|res| match res {
                        Ok(listing) => {
                            let dirs = listing
                                .common_prefixes
                                .into_iter()
                                .map(|p| Ok(ObjectEntry::prefix(p.to_string())));
                            let files = listing.objects.into_iter().map(|m| Ok(entry_from_meta(m)));
                            stream::iter(dirs.chain(files).collect::<Vec<_>>())
                        }
                        Err(e) => stream::iter(vec![Err(BucketError::from(e))]),
                    })
                    .boxed()
            }
        }
    }

    async fn copy(&self, src: &str, dst: &str) -> BucketResult<()> {
        self.store.copy(&Path::from(src), &Path::from(dst)).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> BucketResult<()> {
        self.store.delete(&Path::from(key)).await?;
        Ok(())
    }

    async fn stat(&self, key: &str) -> BucketResult<ObjectEntry> {
        let meta = self.store.head(&Path::from(key)).await?;
        Ok(entry_from_meta(meta))
    }
}

/// Sequential writer over `object_store`'s buffered multipart writer.
struct BufObjectWriter {
    inner: BufWriter,
}

#[async_trait]
impl ObjectWriter for BufObjectWriter {
    async fn write(&mut self, chunk: Bytes) -> BucketResult<()> {
        self.inner.write_all(&chunk).await.map_err(BucketError::backend)
    }

    async fn commit(mut self: Box<Self>) -> BucketResult<()> {
        self.inner.shutdown().await.map_err(BucketError::backend)
    }

    async fn abort(mut self: Box<Self>) -> BucketResult<()> {
        self.inner.abort().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    async fn keys(bucket: &ObjectStoreBucket, prefix: &str, scope: ListScope) -> Vec<(String, bool)> {
        let mut entries: Vec<_> = bucket
            .list(prefix, scope)
            .map_ok(|e| (e.key, e.is_dir))
            .try_collect()
            .await
            .unwrap();
        entries.sort();
        entries
    }

    #[tokio::test]
    async fn test_write_all_and_read_range() {
        let bucket = ObjectStoreBucket::in_memory();
        bucket
            .write_all("a/b.txt", Bytes::from_static(b"hello world"))
            .await
            .unwrap();

        let data = bucket.read_range("a/b.txt", 6, 5).await.unwrap();
        assert_eq!(&data[..], b"world");

        // clamped at end of object
        let data = bucket.read_range("a/b.txt", 6, 100).await.unwrap();
        assert_eq!(&data[..], b"world");
    }

    #[tokio::test]
    async fn test_read_past_end_is_empty() {
        let bucket = ObjectStoreBucket::in_memory();
        bucket
            .write_all("f", Bytes::from_static(b"abc"))
            .await
            .unwrap();

        assert!(bucket.read_range("f", 3, 10).await.unwrap().is_empty());
        assert!(bucket.read_range("f", 99, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_key_is_not_found() {
        let bucket = ObjectStoreBucket::in_memory();
        assert!(bucket.read_range("nope", 0, 1).await.unwrap_err().is_not_found());
        assert!(bucket.stat("nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_level_and_subtree_listing() {
        let bucket = ObjectStoreBucket::in_memory();
        for key in ["top.txt", "d/one.txt", "d/e/two.txt"] {
            bucket.write_all(key, Bytes::from_static(b"x")).await.unwrap();
        }

        assert_eq!(
            keys(&bucket, "", ListScope::Level).await,
            vec![("d".to_string(), true), ("top.txt".to_string(), false)]
        );
        assert_eq!(
            keys(&bucket, "d/", ListScope::Level).await,
            vec![("d/e".to_string(), true), ("d/one.txt".to_string(), false)]
        );
        assert_eq!(
            keys(&bucket, "d/", ListScope::Subtree).await,
            vec![("d/e/two.txt".to_string(), false), ("d/one.txt".to_string(), false)]
        );
    }

    #[tokio::test]
    async fn test_copy_and_delete() {
        let bucket = ObjectStoreBucket::in_memory();
        bucket.write_all("src", Bytes::from_static(b"data")).await.unwrap();

        bucket.copy("src", "dst").await.unwrap();
        bucket.delete("src").await.unwrap();

        assert!(bucket.stat("src").await.is_err());
        assert_eq!(bucket.stat("dst").await.unwrap().size, 4);
    }

    #[tokio::test]
    async fn test_aborted_writer_leaves_nothing() {
        let bucket = ObjectStoreBucket::in_memory();
        let mut writer = bucket.open_writer("partial").await.unwrap();
        writer.write(Bytes::from_static(b"half")).await.unwrap();
        writer.abort().await.unwrap();

        assert!(bucket.stat("partial").await.is_err());
    }

    #[test]
    fn test_open_bucket_rejects_garbage() {
        assert!(matches!(
            open_bucket("not a url"),
            Err(BucketError::InvalidLocation(_))
        ));
    }

    #[test]
    fn test_open_memory_bucket() {
        assert!(open_bucket("memory:///").is_ok());
    }
}
