//! Listing pager.
//!
//! Store listings are lazy cursors that can end mid-page or fail part way.
//! The protocol wants a randomly addressable list instead, so [`Lister`]
//! drains the cursor completely before the first page is served. That is
//! fine for the directory sizes this server targets; nothing is streamed.

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::bucket::{BucketError, BucketResult, ListCursor};
use crate::constants::PLACEHOLDER_NAME;

use super::types::{base_name, EntryInfo};

/// Result of one [`Lister::list_at`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListAt {
    /// Entries copied into the buffer.
    pub count: usize,
    /// No entries remain after this page.
    pub eof: bool,
}

/// Pre-materialized directory listing.
#[derive(Debug, Clone, Default)]
pub struct Lister {
    entries: Vec<EntryInfo>,
}

impl Lister {
    pub fn new(entries: Vec<EntryInfo>) -> Self {
        Self { entries }
    }

    /// Listing with exactly one entry (stat results).
    pub fn single(entry: EntryInfo) -> Self {
        Self::new(vec![entry])
    }

    /// Drain `cursor` into a lister, dropping directory placeholders.
    ///
    /// Fails on the first cursor error, or with [`BucketError::Cancelled`]
    /// if `cancel` fires first.
    pub async fn collect(
        mut cursor: ListCursor<'_>,
        cancel: &CancellationToken,
    ) -> BucketResult<Self> {
        let mut entries = Vec::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(BucketError::Cancelled),
                next = cursor.next() => next,
            };
            let Some(entry) = next else { break };
            let entry = entry?;
            if !entry.is_dir && base_name(&entry.key) == PLACEHOLDER_NAME {
                continue;
            }
            entries.push(EntryInfo::from_object(entry));
        }
        Ok(Self { entries })
    }

    /// Copy entries starting at `offset` into `buf`.
    pub fn list_at(&self, buf: &mut [EntryInfo], offset: usize) -> ListAt {
        if offset >= self.entries.len() {
            return ListAt { count: 0, eof: true };
        }
        let remaining = &self.entries[offset..];
        let count = remaining.len().min(buf.len());
        buf[..count].clone_from_slice(&remaining[..count]);
        ListAt {
            count,
            eof: count == remaining.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[EntryInfo] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<EntryInfo> {
        self.entries
    }
}
