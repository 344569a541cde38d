//! Server configuration constants.
//!
//! Centralizes hardcoded values for easier configuration and documentation.

use std::time::Duration;

/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Default bind address (all interfaces).
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";

/// SSH authentication rejection delay (prevents timing attacks).
pub const SSH_AUTH_REJECTION_DELAY: Duration = Duration::from_secs(1);

/// Default config source for the CLI.
pub const DEFAULT_CONFIG_SOURCE: &str = "cloudsftp-config.json";

/// Entries returned per SFTP `readdir` reply.
pub const DIR_PAGE_SIZE: usize = 100;

/// Largest read served in one SFTP `read` reply.
pub const MAX_READ_LEN: u32 = 256 * 1024;

/// Subsystem name clients request on a session channel.
pub const SFTP_SUBSYSTEM: &str = "sftp";

/// OpenSSH hard link extension request name.
pub const HARDLINK_EXTENSION: &str = "hardlink@openssh.com";
