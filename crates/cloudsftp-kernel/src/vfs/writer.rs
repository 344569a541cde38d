//! Streaming write adapter.
//!
//! SFTP writes arrive as `(offset, bytes)` pairs; object stores only take a
//! sequential byte stream. Each open write handle gets a bounded queue and
//! one upload task that drains it, in enqueue order, into the store writer.
//!
//! ```text
//!   write_at(off, bytes)        mpsc (bounded)       upload task
//!   ┌──────────────────┐  ───── Chunk(bytes) ────▶  ┌──────────────────────┐
//!   │ StreamingWriter  │  ───── Finish ──────────▶  │ ObjectWriter::write  │
//!   │                  │  ◀──── JoinHandle ──────── │ ObjectWriter::commit │
//!   └──────────────────┘                            └──────────────────────┘
//! ```
//!
//! Close is two-phase: `Finish` is queued and the sender dropped, then the
//! caller waits for the task to drain and commit. The task commits only
//! after seeing `Finish`; a queue that closes without it (handle dropped,
//! session gone) aborts the upload. A commit that has started runs to
//! completion: a half-finished multipart completion cannot be aborted, so
//! cancellation is only honoured up to that point.
//!
//! Bytes are committed in arrival order. A write whose offset does not match
//! the running byte count is logged and appended anyway, so a client that
//! sends truly out-of-order offsets gets a corrupted object.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Span;

use crate::bucket::{Bucket, BucketError, BucketResult, ObjectWriter};
use crate::constants::WRITE_QUEUE_DEPTH;

use super::error::{FsError, FsResult};

/// Message from the handle to its upload task.
enum UploadMsg {
    Chunk(Bytes),
    Finish,
}

/// Per-handle upload state.
pub struct StreamingWriter {
    key: String,
    tx: Option<mpsc::Sender<UploadMsg>>,
    upload: Option<JoinHandle<BucketResult<u64>>>,
    accepted: u64,
    span: Span,
}

impl std::fmt::Debug for StreamingWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingWriter")
            .field("key", &self.key)
            .field("accepted", &self.accepted)
            .finish()
    }
}

impl StreamingWriter {
    /// Open a store writer for `key` and start its upload task.
    pub async fn open(
        bucket: Arc<dyn Bucket>,
        key: impl Into<String>,
        cancel: CancellationToken,
        span: Span,
    ) -> FsResult<Self> {
        Self::with_depth(bucket, key, cancel, span, WRITE_QUEUE_DEPTH).await
    }

    /// Like [`open`](Self::open) with an explicit queue depth.
    pub async fn with_depth(
        bucket: Arc<dyn Bucket>,
        key: impl Into<String>,
        cancel: CancellationToken,
        span: Span,
        depth: usize,
    ) -> FsResult<Self> {
        let key = key.into();
        let writer = bucket.open_writer(&key).await?;
        let (tx, rx) = mpsc::channel(depth.max(1));
        let upload = tokio::spawn(drain(rx, writer, cancel, span.clone(), key.clone()));
        Ok(Self {
            key,
            tx: Some(tx),
            upload: Some(upload),
            accepted: 0,
            span,
        })
    }

    /// Bytes accepted so far (queued or already uploaded).
    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    /// Queue `data` for upload.
    ///
    /// Waits while the queue is full. `offset` is only checked against the
    /// running byte count; see the module docs.
    pub async fn write_at(&mut self, offset: u64, data: Bytes) -> FsResult<usize> {
        let Some(tx) = self.tx.as_ref() else {
            return Err(FsError::upload_failed(format!("{}: handle closed", self.key)));
        };
        if offset != self.accepted {
            tracing::warn!(
                parent: &self.span,
                key = %self.key,
                offset,
                expected = self.accepted,
                "out-of-order write appended at end of stream"
            );
        }
        let len = data.len();
        if len == 0 {
            return Ok(0);
        }
        tx.send(UploadMsg::Chunk(data))
            .await
            .map_err(|_| FsError::upload_failed(format!("{}: upload task stopped", self.key)))?;
        self.accepted += len as u64;
        Ok(len)
    }

    /// Stop accepting bytes, then wait for drain and commit.
    ///
    /// Returns the committed size. Only returns `Ok` once the object is
    /// visible to readers.
    pub async fn close(mut self) -> FsResult<u64> {
        // phase 1: no more bytes
        let finish_sent = match self.tx.take() {
            Some(tx) => tx.send(UploadMsg::Finish).await.is_ok(),
            None => false,
        };

        // phase 2: drain + commit
        let Some(upload) = self.upload.take() else {
            return Err(FsError::upload_failed(format!("{}: already closed", self.key)));
        };
        let result = upload.await;

        match result {
            Ok(Ok(size)) if finish_sent => {
                tracing::info!(parent: &self.span, key = %self.key, size, "upload committed");
                Ok(size)
            }
            Ok(Ok(_)) => Err(FsError::upload_failed(format!("{}: finish not delivered", self.key))),
            Ok(Err(e)) => {
                tracing::error!(parent: &self.span, key = %self.key, error = %e, "upload failed");
                Err(FsError::upload_failed(format!("{}: {e}", self.key)))
            }
            Err(e) => {
                tracing::error!(parent: &self.span, key = %self.key, error = %e, "upload task panicked");
                Err(FsError::upload_failed(format!("{}: {e}", self.key)))
            }
        }
    }
}

/// Upload task: feed queued chunks to the store writer in order.
async fn drain(
    mut rx: mpsc::Receiver<UploadMsg>,
    mut writer: Box<dyn ObjectWriter>,
    cancel: CancellationToken,
    span: Span,
    key: String,
) -> BucketResult<u64> {
    let mut written = 0u64;
    loop {
        let msg = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            msg = rx.recv() => msg,
        };
        match msg {
            Some(UploadMsg::Chunk(chunk)) => {
                let len = chunk.len() as u64;
                let res = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(BucketError::Cancelled),
                    res = writer.write(chunk) => res,
                };
                if let Err(e) = res {
                    rx.close();
                    abort(writer, &span, &key).await;
                    return Err(e);
                }
                written += len;
            }
            Some(UploadMsg::Finish) => {
                if cancel.is_cancelled() {
                    tracing::warn!(parent: &span, key = %key, written, "session ended before commit");
                    abort(writer, &span, &key).await;
                    return Err(BucketError::Cancelled);
                }
                tracing::debug!(parent: &span, key = %key, written, "draining complete, committing");
                return writer.commit().await.map(|()| written);
            }
            None => {
                tracing::warn!(parent: &span, key = %key, written, "upload abandoned before close");
                abort(writer, &span, &key).await;
                return Err(BucketError::Cancelled);
            }
        }
    }
}

async fn abort(writer: Box<dyn ObjectWriter>, span: &Span, key: &str) {
    if let Err(e) = writer.abort().await {
        tracing::warn!(parent: span, key = %key, error = %e, "failed to abort upload");
    }
}
