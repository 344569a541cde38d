//! cloudsftp kernel: hierarchical file semantics over flat object stores.
//!
//! The kernel knows nothing about SSH. It exposes:
//!
//! - [`bucket`] - the store seam and its `object_store` implementation
//! - [`vfs`] - the filesystem adapter, listing pager and streaming writer
//!
//! The server crate binds one [`vfs::CloudFs`] per SFTP session.

pub mod bucket;
pub mod constants;
pub mod vfs;

pub use bucket::{open_bucket, Bucket, BucketError, BucketResult, ObjectStoreBucket};
pub use vfs::{CloudFs, Command, EntryInfo, FsError, FsResult, ListMethod, Lister, StreamingWriter};
