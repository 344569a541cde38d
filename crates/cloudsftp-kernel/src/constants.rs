//! Adapter constants.
//!
//! Centralizes hardcoded values for easier configuration and documentation.

/// Name of the sentinel object that marks an otherwise-empty directory.
pub const PLACEHOLDER_NAME: &str = "__sftp_folder_placeholder__.txt";

/// Contents written into every directory placeholder.
pub const PLACEHOLDER_CONTENTS: &[u8] = b"Place Holder";

/// Chunks buffered between an open write handle and its upload task.
///
/// Bounds memory per upload to roughly this many SFTP write payloads.
pub const WRITE_QUEUE_DEPTH: usize = 16;

/// Size of the upload chunks clients are expected to send.
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;
