//! Core VFS types.
//!
//! [`EntryInfo`] is the stat shape handed back to the protocol layer. It is
//! built from store metadata and never carries permission bits of its own;
//! [`EntryInfo::mode`] synthesizes them from the entry kind.

use std::path::{Component, Path};
use std::time::SystemTime;

use crate::bucket::ObjectEntry;

/// `S_IFDIR` file type bit.
const MODE_DIR: u32 = 0o040000;
/// `S_IFREG` file type bit.
const MODE_FILE: u32 = 0o100000;

/// File type enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileType {
    /// Regular file (a store object).
    #[default]
    File,
    /// Directory (a common prefix or placeholder).
    Directory,
}

impl FileType {
    /// Returns true if this is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self, FileType::Directory)
    }
}

/// Stat view of one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    /// Absolute path with exactly one leading `/`.
    pub path: String,
    /// Size in bytes (0 for directories).
    pub size: u64,
    /// Entry type.
    pub kind: FileType,
    /// Last modification time.
    pub mtime: SystemTime,
    /// Store content hash, if any.
    pub content_hash: Option<String>,
}

impl Default for EntryInfo {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            size: 0,
            kind: FileType::File,
            mtime: SystemTime::UNIX_EPOCH,
            content_hash: None,
        }
    }
}

impl EntryInfo {
    /// Build from store metadata, normalizing the key to one leading `/`.
    pub fn from_object(entry: ObjectEntry) -> Self {
        Self {
            path: absolute(&entry.key),
            size: if entry.is_dir { 0 } else { entry.size },
            kind: if entry.is_dir {
                FileType::Directory
            } else {
                FileType::File
            },
            mtime: entry.mod_time.unwrap_or(SystemTime::UNIX_EPOCH),
            content_hash: entry.content_hash,
        }
    }

    /// Directory entry at `path`.
    pub fn directory(path: impl Into<String>, mtime: SystemTime) -> Self {
        Self {
            path: path.into(),
            size: 0,
            kind: FileType::Directory,
            mtime,
            content_hash: None,
        }
    }

    /// Last path segment.
    pub fn name(&self) -> &str {
        base_name(&self.path)
    }

    /// Returns true if this is a directory.
    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    /// Synthesized mode: `0644` files, `0755` directories, with type bits.
    pub fn mode(&self) -> u32 {
        if self.is_dir() {
            MODE_DIR | 0o755
        } else {
            MODE_FILE | 0o644
        }
    }

    /// Modification time as whole seconds since the epoch.
    pub fn mtime_secs(&self) -> u64 {
        self.mtime
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// Normalize a client path: anchor at `/`, resolve `.` and `..`, collapse
/// repeated separators. Never escapes the root.
pub fn normalize_path(path: &str) -> String {
    let mut parts: Vec<String> = Vec::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(s) => parts.push(s.to_string_lossy().into_owned()),
            Component::ParentDir => {
                parts.pop();
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    format!("/{}", parts.join("/"))
}

/// Store key for a client path (normalized, no leading `/`).
pub fn key_for(path: &str) -> String {
    normalize_path(path).trim_start_matches('/').to_string()
}

/// Listing prefix for a directory path: empty for the root, `dir/` otherwise.
pub fn dir_prefix(path: &str) -> String {
    let key = key_for(path);
    if key.is_empty() { key } else { format!("{key}/") }
}

/// Add exactly one leading `/` to a key.
pub fn absolute(key: &str) -> String {
    format!("/{}", key.trim_start_matches('/'))
}

/// Last `/`-separated segment of a path or key.
pub fn base_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}
