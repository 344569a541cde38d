//! CloudFs: hierarchical file operations over a flat bucket.
//!
//! Object stores have no directories, no rename and no partial writes.
//! This adapter manufactures them from the [`Bucket`] primitives:
//!
//! - directories are inferred from delimiter listings, and an empty one is
//!   represented by a placeholder object under its prefix
//! - rename is copy then delete (not atomic)
//! - rmdir deletes every key under the prefix, one by one (not atomic)
//! - writes go through a [`StreamingWriter`]
//!
//! Every store call races the session's cancellation token, so work stops
//! promptly when the client goes away.

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::Span;

use crate::bucket::{Bucket, BucketError, BucketResult, ListScope};
use crate::constants::{PLACEHOLDER_CONTENTS, PLACEHOLDER_NAME};

use super::error::{FsError, FsResult};
use super::pager::Lister;
use super::types::{base_name, dir_prefix, key_for, normalize_path, EntryInfo};
use super::writer::StreamingWriter;

/// File command request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Rename { from: String, to: String },
    Remove { path: String },
    Mkdir { path: String },
    Rmdir { path: String },
    Link { path: String, target: String },
    Symlink { path: String, target: String },
    /// Accepted and ignored: objects carry no settable attributes.
    Setstat { path: String },
}

impl Command {
    /// Method name, for logging.
    pub fn method(&self) -> &'static str {
        match self {
            Command::Rename { .. } => "Rename",
            Command::Remove { .. } => "Remove",
            Command::Mkdir { .. } => "Mkdir",
            Command::Rmdir { .. } => "Rmdir",
            Command::Link { .. } => "Link",
            Command::Symlink { .. } => "Symlink",
            Command::Setstat { .. } => "Setstat",
        }
    }

    fn path(&self) -> &str {
        match self {
            Command::Rename { from: path, .. }
            | Command::Remove { path }
            | Command::Mkdir { path }
            | Command::Rmdir { path }
            | Command::Link { path, .. }
            | Command::Symlink { path, .. }
            | Command::Setstat { path } => path,
        }
    }
}

/// List request flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListMethod {
    /// Immediate children of a directory.
    List,
    /// Single entry describing the path itself.
    Stat,
    /// Always unsupported.
    Readlink,
}

/// Filesystem adapter bound to one session's bucket.
pub struct CloudFs {
    bucket: Arc<dyn Bucket>,
    span: Span,
    cancel: CancellationToken,
}

impl CloudFs {
    /// Bind an adapter to `bucket`.
    ///
    /// `span` carries the session's identifying fields; every log event
    /// is emitted under it. `cancel` fires when the session ends.
    pub fn new(bucket: Arc<dyn Bucket>, span: Span, cancel: CancellationToken) -> Self {
        Self { bucket, span, cancel }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Run one store call unless the session is cancelled first.
    async fn guarded<T>(&self, call: impl Future<Output = BucketResult<T>>) -> BucketResult<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(BucketError::Cancelled),
            res = call => res,
        }
    }

    // ========================================================================
    // Read
    // ========================================================================

    /// Ranged read. Empty at or past end of file.
    pub async fn read(&self, path: &str, offset: u64, length: u64) -> FsResult<Bytes> {
        tracing::debug!(parent: &self.span, path, offset, length, "read");
        let key = data_key(path)?;
        self.guarded(self.bucket.read_range(&key, offset, length))
            .await
            .map_err(|e| FsError::from_read(path, e))
    }

    // ========================================================================
    // Write
    // ========================================================================

    /// Start an upload to `path`.
    pub async fn open_write(&self, path: &str) -> FsResult<StreamingWriter> {
        tracing::info!(parent: &self.span, path, "beginning write");
        let key = data_key(path)?;
        let open = StreamingWriter::open(self.bucket.clone(), key, self.cancel.clone(), self.span.clone());
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(FsError::Backend(BucketError::Cancelled)),
            res = open => res,
        }
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Execute a file command.
    pub async fn command(&self, cmd: Command) -> FsResult<()> {
        tracing::info!(parent: &self.span, method = cmd.method(), path = cmd.path(), "file command");
        let result = match &cmd {
            Command::Setstat { .. } => Ok(()),
            Command::Rename { from, to } => self.rename(from, to).await,
            Command::Remove { path } => self.remove(path).await,
            Command::Mkdir { path } => self.mkdir(path).await,
            Command::Rmdir { path } => self.rmdir(path).await,
            Command::Link { .. } | Command::Symlink { .. } => {
                Err(FsError::UnsupportedOperation("links are not supported"))
            }
        };
        if let Err(e) = &result {
            tracing::warn!(parent: &self.span, method = cmd.method(), error = %e, "file command failed");
        }
        result
    }

    async fn rename(&self, from: &str, to: &str) -> FsResult<()> {
        let src = data_key(from)?;
        let dst = data_key(to)?;
        if src == dst {
            return Ok(());
        }

        self.guarded(self.bucket.copy(&src, &dst))
            .await
            .map_err(|e| FsError::from_read(from, e))?;

        self.guarded(self.bucket.delete(&src)).await.map_err(|e| {
            FsError::partial(format!("copied {src} to {dst} but could not delete source: {e}"))
        })
    }

    async fn remove(&self, path: &str) -> FsResult<()> {
        let key = data_key(path)?;
        self.guarded(self.bucket.delete(&key))
            .await
            .map_err(|e| FsError::remove_failed(format!("{path}: {e}")))
    }

    async fn mkdir(&self, path: &str) -> FsResult<()> {
        let key = placeholder_key(path);
        self.guarded(
            self.bucket
                .write_all(&key, Bytes::from_static(PLACEHOLDER_CONTENTS)),
        )
        .await?;
        Ok(())
    }

    /// Delete the whole subtree under `path/`, stopping at the first failure.
    async fn rmdir(&self, path: &str) -> FsResult<()> {
        let prefix = dir_prefix(path);
        if prefix.is_empty() {
            return Err(FsError::remove_failed("refusing to remove the root directory"));
        }

        // materialize first so deletes don't race the listing cursor
        let keys = {
            let mut cursor = self.bucket.list(&prefix, ListScope::Subtree);
            let mut keys = Vec::new();
            while let Some(entry) = self.guarded(async { Ok(cursor.next().await) }).await? {
                keys.push(entry?.key);
            }
            keys
        };

        let mut deleted = 0usize;
        for key in &keys {
            if let Err(e) = self.guarded(self.bucket.delete(key)).await {
                return Err(if deleted == 0 {
                    FsError::remove_failed(format!("{key}: {e}"))
                } else {
                    FsError::partial(format!(
                        "removed {deleted} of {} objects under {prefix}, failed at {key}: {e}",
                        keys.len()
                    ))
                });
            }
            deleted += 1;
        }
        tracing::debug!(parent: &self.span, prefix = %prefix, deleted, "rmdir complete");
        Ok(())
    }

    // ========================================================================
    // Listing
    // ========================================================================

    /// List or stat `path`.
    pub async fn list(&self, path: &str, method: ListMethod) -> FsResult<Lister> {
        tracing::debug!(parent: &self.span, path, ?method, "file list");
        match method {
            ListMethod::List => self.list_dir(path).await,
            ListMethod::Stat => self.stat(path).await.map(Lister::single),
            ListMethod::Readlink => Err(FsError::UnsupportedOperation("symlinks are not supported")),
        }
    }

    /// Immediate children of `path`.
    ///
    /// An empty level is only a directory if its placeholder exists; a
    /// never-created path or a regular file is NotFound.
    async fn list_dir(&self, path: &str) -> FsResult<Lister> {
        let prefix = dir_prefix(path);
        let cursor = self.bucket.list(&prefix, ListScope::Level);
        let lister = Lister::collect(cursor, &self.cancel).await?;
        if !lister.is_empty() || prefix.is_empty() {
            return Ok(lister);
        }

        match self.guarded(self.bucket.stat(&placeholder_key(path))).await {
            Ok(_) => Ok(lister),
            Err(BucketError::Cancelled) => Err(BucketError::Cancelled.into()),
            Err(_) => Err(FsError::not_found(path)),
        }
    }

    /// Stat as an object first, then as a directory via its placeholder.
    pub async fn stat(&self, path: &str) -> FsResult<EntryInfo> {
        let normalized = normalize_path(path);
        if normalized == "/" {
            return Ok(EntryInfo::directory("/", std::time::SystemTime::UNIX_EPOCH));
        }
        if base_name(&normalized) == PLACEHOLDER_NAME {
            return Err(FsError::StatFailed(normalized));
        }

        match self.guarded(self.bucket.stat(&key_for(&normalized))).await {
            Ok(entry) => {
                let mut info = EntryInfo::from_object(entry);
                info.path = normalized;
                return Ok(info);
            }
            Err(BucketError::Cancelled) => return Err(BucketError::Cancelled.into()),
            Err(e) => {
                tracing::debug!(parent: &self.span, path = %normalized, error = %e, "not an object, checking placeholder");
            }
        }

        match self.guarded(self.bucket.stat(&placeholder_key(&normalized))).await {
            Ok(marker) => Ok(EntryInfo::directory(
                normalized,
                marker.mod_time.unwrap_or(std::time::SystemTime::UNIX_EPOCH),
            )),
            Err(BucketError::Cancelled) => Err(BucketError::Cancelled.into()),
            Err(_) => Err(FsError::StatFailed(normalized)),
        }
    }
}

/// Key for ordinary data access; placeholders are off limits.
fn data_key(path: &str) -> FsResult<String> {
    let key = key_for(path);
    if key.is_empty() || base_name(&key) == PLACEHOLDER_NAME {
        return Err(FsError::not_found(path));
    }
    Ok(key)
}

fn placeholder_key(path: &str) -> String {
    format!("{}{PLACEHOLDER_NAME}", dir_prefix(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::{ListCursor, ObjectEntry, ObjectStoreBucket, ObjectWriter};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Delegates to an in-memory bucket, failing deletes on demand.
    struct FaultyBucket {
        inner: ObjectStoreBucket,
        fail_delete_after: AtomicUsize,
    }

    impl FaultyBucket {
        fn new(fail_delete_after: usize) -> Self {
            Self {
                inner: ObjectStoreBucket::in_memory(),
                fail_delete_after: AtomicUsize::new(fail_delete_after),
            }
        }
    }

    #[async_trait]
    impl Bucket for FaultyBucket {
        async fn read_range(&self, key: &str, offset: u64, length: u64) -> BucketResult<Bytes> {
            self.inner.read_range(key, offset, length).await
        }
        async fn open_writer(&self, key: &str) -> BucketResult<Box<dyn ObjectWriter>> {
            self.inner.open_writer(key).await
        }
        fn list(&self, prefix: &str, scope: ListScope) -> ListCursor<'_> {
            self.inner.list(prefix, scope)
        }
        async fn copy(&self, src: &str, dst: &str) -> BucketResult<()> {
            self.inner.copy(src, dst).await
        }
        async fn delete(&self, key: &str) -> BucketResult<()> {
            let left = self.fail_delete_after.load(Ordering::SeqCst);
            if left == 0 {
                return Err(BucketError::backend("delete refused"));
            }
            self.fail_delete_after.store(left - 1, Ordering::SeqCst);
            self.inner.delete(key).await
        }
        async fn stat(&self, key: &str) -> BucketResult<ObjectEntry> {
            self.inner.stat(key).await
        }
    }

    fn memory_fs() -> CloudFs {
        CloudFs::new(
            Arc::new(ObjectStoreBucket::in_memory()),
            Span::none(),
            CancellationToken::new(),
        )
    }

    async fn put(fs: &CloudFs, path: &str, data: &[u8]) {
        let mut w = fs.open_write(path).await.unwrap();
        w.write_at(0, Bytes::copy_from_slice(data)).await.unwrap();
        w.close().await.unwrap();
    }

    async fn names(fs: &CloudFs, path: &str) -> Vec<String> {
        let mut names: Vec<_> = fs
            .list(path, ListMethod::List)
            .await
            .unwrap()
            .entries()
            .iter()
            .map(|e| e.name().to_string())
            .collect();
        names.sort();
        names
    }

    async fn object_count(bucket: &dyn Bucket) -> usize {
        bucket.list("", ListScope::Subtree).count().await
    }

    #[tokio::test]
    async fn test_hello_scenario() {
        let fs = memory_fs();
        put(&fs, "/hello.txt", b"Hello world!").await;

        let data = fs.read("/hello.txt", 0, 12).await.unwrap();
        assert_eq!(&data[..], b"Hello world!");

        fs.command(Command::Rename {
            from: "/hello.txt".into(),
            to: "/bye.txt".into(),
        })
        .await
        .unwrap();
        assert_eq!(names(&fs, "/").await, vec!["bye.txt"]);

        fs.command(Command::Remove { path: "/bye.txt".into() })
            .await
            .unwrap();
        assert!(fs.list("/bye.txt", ListMethod::Stat).await.is_err());
    }

    #[tokio::test]
    async fn test_read_missing_is_not_found() {
        let fs = memory_fs();
        assert!(matches!(
            fs.read("/missing", 0, 10).await,
            Err(FsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_read_past_end_is_empty() {
        let fs = memory_fs();
        put(&fs, "/f", b"abc").await;
        assert!(fs.read("/f", 3, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mkdir_stat_rmdir() {
        let fs = memory_fs();
        fs.command(Command::Mkdir { path: "/d".into() }).await.unwrap();

        let info = fs.stat("/d").await.unwrap();
        assert!(info.is_dir());
        assert_eq!(info.size, 0);
        assert_eq!(info.name(), "d");

        fs.command(Command::Rmdir { path: "/d".into() }).await.unwrap();
        assert!(matches!(fs.stat("/d").await, Err(FsError::StatFailed(_))));
    }

    #[tokio::test]
    async fn test_stat_never_written_fails() {
        let fs = memory_fs();
        assert!(fs.stat("/ghost").await.is_err());
        assert!(fs.stat("/ghost.txt").await.is_err());
    }

    #[tokio::test]
    async fn test_stat_extensionless_file_is_a_file() {
        let fs = memory_fs();
        put(&fs, "/Makefile", b"all:").await;
        let info = fs.stat("/Makefile").await.unwrap();
        assert!(!info.is_dir());
        assert_eq!(info.size, 4);
    }

    #[tokio::test]
    async fn test_stat_dotted_directory() {
        let fs = memory_fs();
        fs.command(Command::Mkdir { path: "/v1.2".into() }).await.unwrap();
        assert!(fs.stat("/v1.2").await.unwrap().is_dir());
    }

    #[tokio::test]
    async fn test_root_is_a_directory() {
        let fs = memory_fs();
        assert!(fs.stat("/").await.unwrap().is_dir());
        assert!(names(&fs, "/").await.is_empty());
    }

    #[tokio::test]
    async fn test_listing_hides_placeholders() {
        let fs = memory_fs();
        fs.command(Command::Mkdir { path: "/d".into() }).await.unwrap();
        put(&fs, "/d/a.txt", b"a").await;
        fs.command(Command::Mkdir { path: "/d/sub".into() }).await.unwrap();

        assert_eq!(names(&fs, "/").await, vec!["d"]);
        assert_eq!(names(&fs, "/d").await, vec!["a.txt", "sub"]);
        assert!(names(&fs, "/d/sub").await.is_empty());

        let listing = fs.list("/d", ListMethod::List).await.unwrap();
        for entry in listing.entries() {
            assert!(entry.path.starts_with("/d/"));
            assert!(!entry.path.starts_with("//"));
        }
    }

    #[tokio::test]
    async fn test_list_missing_directory_is_not_found() {
        let fs = memory_fs();
        assert!(matches!(
            fs.list("/never/created", ListMethod::List).await,
            Err(FsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_file_path_is_not_found() {
        let fs = memory_fs();
        put(&fs, "/f.txt", b"data").await;
        assert!(matches!(
            fs.list("/f.txt", ListMethod::List).await,
            Err(FsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_implicit_directory() {
        let fs = memory_fs();
        put(&fs, "/implicit/a.txt", b"a").await;
        assert_eq!(names(&fs, "/implicit").await, vec!["a.txt"]);
    }

    #[tokio::test]
    async fn test_placeholders_are_not_data() {
        let fs = memory_fs();
        fs.command(Command::Mkdir { path: "/d".into() }).await.unwrap();
        let marker = format!("/d/{PLACEHOLDER_NAME}");

        assert!(matches!(fs.read(&marker, 0, 100).await, Err(FsError::NotFound(_))));
        assert!(fs.stat(&marker).await.is_err());
        assert!(fs
            .command(Command::Rename { from: marker.clone(), to: "/x".into() })
            .await
            .is_err());
        assert!(fs.command(Command::Remove { path: marker }).await.is_err());
        assert!(fs.stat("/d").await.unwrap().is_dir());
    }

    #[tokio::test]
    async fn test_rename_missing_source_changes_nothing() {
        let fs = memory_fs();
        put(&fs, "/keep", b"k").await;
        assert!(fs
            .command(Command::Rename { from: "/nope".into(), to: "/keep2".into() })
            .await
            .is_err());
        assert_eq!(names(&fs, "/").await, vec!["keep"]);
    }

    #[tokio::test]
    async fn test_rename_with_failed_delete_is_partial() {
        let bucket = Arc::new(FaultyBucket::new(0));
        let fs = CloudFs::new(bucket.clone(), Span::none(), CancellationToken::new());
        put(&fs, "/a", b"data").await;

        let result = fs
            .command(Command::Rename { from: "/a".into(), to: "/b".into() })
            .await;
        assert!(matches!(result, Err(FsError::PartialFailure(_))));

        // documented non-atomicity: both keys exist
        assert!(fs.stat("/a").await.is_ok());
        assert!(fs.stat("/b").await.is_ok());
    }

    #[tokio::test]
    async fn test_rmdir_removes_whole_subtree() {
        let fs = memory_fs();
        fs.command(Command::Mkdir { path: "/t".into() }).await.unwrap();
        for p in ["/t/a", "/t/b", "/t/deep/c", "/t/deep/er/d"] {
            put(&fs, p, b"x").await;
        }
        put(&fs, "/outside", b"y").await;

        fs.command(Command::Rmdir { path: "/t".into() }).await.unwrap();
        assert_eq!(names(&fs, "/").await, vec!["outside"]);
    }

    #[tokio::test]
    async fn test_rmdir_stops_at_first_failure() {
        let bucket = Arc::new(FaultyBucket::new(2));
        let fs = CloudFs::new(bucket.clone(), Span::none(), CancellationToken::new());
        for p in ["/t/a", "/t/b", "/t/c", "/t/d"] {
            put(&fs, p, b"x").await;
        }

        let result = fs.command(Command::Rmdir { path: "/t".into() }).await;
        assert!(matches!(result, Err(FsError::PartialFailure(_))));
        assert_eq!(object_count(bucket.as_ref()).await, 2);
    }

    #[tokio::test]
    async fn test_rmdir_first_delete_failure_is_remove_failed() {
        let bucket = Arc::new(FaultyBucket::new(0));
        let fs = CloudFs::new(bucket.clone(), Span::none(), CancellationToken::new());
        put(&fs, "/t/a", b"x").await;

        let result = fs.command(Command::Rmdir { path: "/t".into() }).await;
        assert!(matches!(result, Err(FsError::RemoveFailed(_))));
        assert_eq!(object_count(bucket.as_ref()).await, 1);
    }

    #[tokio::test]
    async fn test_rmdir_root_is_refused() {
        let fs = memory_fs();
        put(&fs, "/a", b"x").await;
        assert!(matches!(
            fs.command(Command::Rmdir { path: "/".into() }).await,
            Err(FsError::RemoveFailed(_))
        ));
        assert_eq!(names(&fs, "/").await, vec!["a"]);
    }

    #[tokio::test]
    async fn test_links_unsupported() {
        let fs = memory_fs();
        for cmd in [
            Command::Link { path: "/a".into(), target: "/b".into() },
            Command::Symlink { path: "/a".into(), target: "/b".into() },
        ] {
            assert!(matches!(fs.command(cmd).await, Err(FsError::UnsupportedOperation(_))));
        }
        assert!(matches!(
            fs.list("/a", ListMethod::Readlink).await,
            Err(FsError::UnsupportedOperation(_))
        ));
    }

    #[tokio::test]
    async fn test_setstat_is_noop() {
        let fs = memory_fs();
        fs.command(Command::Setstat { path: "/anything".into() })
            .await
            .unwrap();
        assert!(fs.stat("/anything").await.is_err());
    }

    #[tokio::test]
    async fn test_cancelled_session_stops_store_calls() {
        let cancel = CancellationToken::new();
        let fs = CloudFs::new(Arc::new(ObjectStoreBucket::in_memory()), Span::none(), cancel.clone());
        cancel.cancel();

        assert!(matches!(
            fs.read("/x", 0, 1).await,
            Err(FsError::Backend(BucketError::Cancelled))
        ));
        assert!(fs.list("/", ListMethod::List).await.is_err());
        assert!(fs.open_write("/x").await.is_err());
    }
}
