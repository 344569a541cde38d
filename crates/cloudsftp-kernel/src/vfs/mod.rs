//! Virtual filesystem over a flat object store.
//!
//! Paths handed in by the protocol layer are absolute and `/`-separated.
//! Store keys are the same paths without the leading `/`. Directories do
//! not exist in the store; they are common prefixes, or a placeholder object
//! when empty.
//!
//! # Example
//!
//! ```ignore
//! let fs = CloudFs::new(bucket, tracing::info_span!("session"), cancel);
//! let mut w = fs.open_write("/hello.txt").await?;
//! w.write_at(0, Bytes::from_static(b"Hello world!")).await?;
//! w.close().await?;
//! let data = fs.read("/hello.txt", 0, 12).await?;
//! ```

mod cloudfs;
mod error;
mod pager;
mod types;
mod writer;

pub use cloudfs::{CloudFs, Command, ListMethod};
pub use error::{FsError, FsResult};
pub use pager::{ListAt, Lister};
pub use types::{base_name, dir_prefix, key_for, normalize_path, EntryInfo, FileType};
pub use writer::StreamingWriter;
