//! cloudsftp server library
//!
//! SSH + SFTP front end over the cloudsftp kernel.

pub mod config;
pub mod constants;
pub mod sftp;
pub mod ssh;

pub use config::{
    Authenticator, ConfigError, ConfigFile, ConfigSource, PublicKeyAuth, PublicKeyVerifier,
    ServerDefaults, UserRecord,
};
pub use sftp::SftpSession;
pub use ssh::{BucketResolver, ServerError, SftpServer, SftpServerConfig, StorageLocation};
