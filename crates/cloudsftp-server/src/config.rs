//! Persisted server configuration.
//!
//! The config is a small JSON document:
//!
//! ```json
//! {
//!   "users": [{
//!     "username": "demo",
//!     "password_hash": "$2b$12$...",
//!     "public_keys": ["ssh-ed25519 AAAA... demo@laptop"]
//!   }],
//!   "storage_url": "s3://my-bucket/sftp-root"
//! }
//! ```
//!
//! It lives either in a local file or as an object in a bucket. The source
//! is picked from the string the operator passes on the command line; see
//! [`ConfigSource::parse`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use cloudsftp_kernel::bucket::{open_bucket, Bucket, BucketError};
use russh::keys::{PrivateKey, PublicKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ssh::{SftpServerConfig, StorageLocation};

/// Remote config sources are recognized by these URL prefixes, each mapped
/// to the scheme the bucket URL is opened with.
const REMOTE_PREFIXES: &[(&str, &str)] = &[
    ("s3://", "s3://"),
    ("gs://", "gs://"),
    ("az://", "az://"),
    ("azblob://", "az://"),
];

/// Config errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}: config source must be a .json file")]
    InvalidSource(String),

    #[error("failed to access {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config store error: {0}")]
    Store(#[from] BucketError),

    #[error("user already exists: {0}")]
    DuplicateUser(String),

    #[error("config has no storage_url")]
    MissingStorageUrl,

    #[error("failed to hash password: {0}")]
    Hash(#[from] bcrypt::BcryptError),

    #[error("invalid public key: {0}")]
    PublicKey(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// One login.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub username: String,
    pub password_hash: String,
    /// Authorized keys in OpenSSH format.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub public_keys: Vec<String>,
}

/// On-disk config document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub users: Vec<UserRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_url: Option<String>,
}

impl ConfigFile {
    pub fn user(&self, username: &str) -> Option<&UserRecord> {
        self.users.iter().find(|u| u.username == username)
    }
}

/// Values the CLI supplies that the config file does not carry.
pub struct ServerDefaults {
    pub bind_addr: SocketAddr,
    pub host_key: PrivateKey,
}

/// Password check against bcrypt hashes.
#[derive(Debug, Clone, Default)]
pub struct Authenticator {
    hashes: Arc<HashMap<String, String>>,
}

impl Authenticator {
    /// Build from user records. The first record wins on duplicate names.
    pub fn from_users(users: &[UserRecord]) -> Self {
        let mut hashes = HashMap::with_capacity(users.len());
        for user in users {
            hashes
                .entry(user.username.clone())
                .or_insert_with(|| user.password_hash.clone());
        }
        Self {
            hashes: Arc::new(hashes),
        }
    }

    /// True if `password` matches the stored hash for `username`.
    ///
    /// Unknown users and empty hashes never authenticate.
    pub fn verify(&self, username: &str, password: &str) -> bool {
        let Some(hash) = self.hashes.get(username) else {
            tracing::info!(user = %username, "unknown user");
            return false;
        };
        if hash.is_empty() {
            tracing::info!(user = %username, "user has no password hash");
            return false;
        }
        match bcrypt::verify(password, hash) {
            Ok(ok) => ok,
            Err(e) => {
                tracing::warn!(user = %username, error = %e, "malformed password hash");
                false
            }
        }
    }

    pub fn user_count(&self) -> usize {
        self.hashes.len()
    }
}

/// Custom public-key check, for embedders with their own key store.
pub trait PublicKeyVerifier: Send + Sync {
    fn verify(&self, username: &str, key: &PublicKey) -> bool;
}

/// How public-key logins are checked.
#[derive(Clone, Default)]
pub enum PublicKeyAuth {
    /// Public-key logins are refused.
    #[default]
    Disabled,
    /// Keys listed per user.
    Authorized(Arc<HashMap<String, Vec<PublicKey>>>),
    /// Ask the verifier for every attempt.
    Verifier(Arc<dyn PublicKeyVerifier>),
}

impl PublicKeyAuth {
    /// Authorized keys from user records.
    ///
    /// Unparseable keys are logged and skipped. Disabled when no user has a key.
    pub fn from_users(users: &[UserRecord]) -> Self {
        let mut keys: HashMap<String, Vec<PublicKey>> = HashMap::new();
        for user in users {
            for line in &user.public_keys {
                match PublicKey::from_openssh(line.trim()) {
                    Ok(key) => keys.entry(user.username.clone()).or_default().push(key),
                    Err(e) => {
                        tracing::warn!(user = %user.username, error = %e, "skipping malformed public key");
                    }
                }
            }
        }
        if keys.is_empty() {
            Self::Disabled
        } else {
            Self::Authorized(Arc::new(keys))
        }
    }

    /// True if `key` may log in as `username`.
    pub fn verify(&self, username: &str, key: &PublicKey) -> bool {
        match self {
            Self::Disabled => false,
            Self::Authorized(keys) => keys
                .get(username)
                .is_some_and(|known| known.iter().any(|k| k.key_data() == key.key_data())),
            Self::Verifier(verifier) => verifier.verify(username, key),
        }
    }
}

impl std::fmt::Debug for PublicKeyAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disabled => f.write_str("Disabled"),
            Self::Authorized(keys) => write!(f, "Authorized({} users)", keys.len()),
            Self::Verifier(_) => f.write_str("Verifier"),
        }
    }
}

/// Where the config document lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Local JSON file.
    Local(PathBuf),
    /// JSON object `key` inside the bucket at `bucket_url`.
    Remote { bucket_url: String, key: String },
}

impl ConfigSource {
    /// Parse a file path or `s3://` / `gs://` / `az://` object URL.
    ///
    /// `azblob://` is accepted as an alias for `az://`. Either way the name
    /// must end in `.json`.
    pub fn parse(src: &str) -> ConfigResult<Self> {
        if !src.ends_with(".json") {
            return Err(ConfigError::InvalidSource(src.to_string()));
        }

        if let Some((prefix, scheme)) = REMOTE_PREFIXES.iter().find(|(p, _)| src.starts_with(p)) {
            let rest = &src[prefix.len()..];
            let Some((bucket, key)) = rest.split_once('/') else {
                return Err(ConfigError::InvalidSource(src.to_string()));
            };
            if bucket.is_empty() || key.is_empty() {
                return Err(ConfigError::InvalidSource(src.to_string()));
            }
            return Ok(Self::Remote {
                bucket_url: format!("{scheme}{bucket}"),
                key: key.to_string(),
            });
        }

        let path: PathBuf = shellexpand::tilde(src).as_ref().into();
        Ok(Self::Local(path))
    }

    /// Read the config. Fails if it does not exist.
    pub async fn load(&self) -> ConfigResult<ConfigFile> {
        match self.read_bytes().await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Err(self.missing()),
        }
    }

    /// Read the config, treating a missing document as empty.
    async fn load_or_default(&self) -> ConfigResult<ConfigFile> {
        match self.read_bytes().await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(ConfigFile::default()),
        }
    }

    /// Write the config back.
    pub async fn save(&self, config: &ConfigFile) -> ConfigResult<()> {
        let json = serde_json::to_vec_pretty(config)?;
        match self {
            Self::Local(path) => tokio::fs::write(path, json)
                .await
                .map_err(|source| ConfigError::Io {
                    path: path.display().to_string(),
                    source,
                }),
            Self::Remote { bucket_url, key } => {
                let bucket = open_bucket(bucket_url)?;
                bucket.write_all(key, Bytes::from(json)).await?;
                Ok(())
            }
        }
    }

    /// Hash `password` and append a new user, optionally with one
    /// authorized key in OpenSSH format.
    pub async fn add_user(
        &self,
        username: &str,
        password: &str,
        public_key: Option<&str>,
    ) -> ConfigResult<()> {
        self.add_user_with_cost(username, password, public_key, bcrypt::DEFAULT_COST)
            .await
    }

    pub(crate) async fn add_user_with_cost(
        &self,
        username: &str,
        password: &str,
        public_key: Option<&str>,
        cost: u32,
    ) -> ConfigResult<()> {
        let public_keys = match public_key.map(str::trim) {
            Some(line) => {
                PublicKey::from_openssh(line).map_err(|e| ConfigError::PublicKey(e.to_string()))?;
                vec![line.to_string()]
            }
            None => Vec::new(),
        };

        let mut config = self.load_or_default().await?;
        if config.user(username).is_some() {
            return Err(ConfigError::DuplicateUser(username.to_string()));
        }

        let password_hash = bcrypt::hash(password, cost)?;
        config.users.push(UserRecord {
            username: username.to_string(),
            password_hash,
            public_keys,
        });
        self.save(&config).await?;

        tracing::info!(user = %username, source = %self, "user added");
        Ok(())
    }

    /// Load the config and merge it with CLI defaults.
    pub async fn resolve_server_config(
        &self,
        defaults: ServerDefaults,
    ) -> ConfigResult<SftpServerConfig> {
        let config = self.load().await?;
        let storage_url = config
            .storage_url
            .filter(|url| !url.is_empty())
            .ok_or(ConfigError::MissingStorageUrl)?;

        let authenticator = Authenticator::from_users(&config.users);
        let public_key = PublicKeyAuth::from_users(&config.users);
        tracing::info!(
            source = %self,
            users = authenticator.user_count(),
            public_key = ?public_key,
            storage = %storage_url,
            "loaded server config"
        );

        Ok(SftpServerConfig {
            bind_addr: defaults.bind_addr,
            host_key: defaults.host_key,
            authenticator,
            public_key,
            storage: StorageLocation::Url(storage_url),
        })
    }

    /// Raw document bytes, `None` when it does not exist.
    async fn read_bytes(&self) -> ConfigResult<Option<Vec<u8>>> {
        match self {
            Self::Local(path) => match tokio::fs::read(path).await {
                Ok(bytes) => Ok(Some(bytes)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(source) => Err(ConfigError::Io {
                    path: path.display().to_string(),
                    source,
                }),
            },
            Self::Remote { bucket_url, key } => {
                let bucket = open_bucket(bucket_url)?;
                match bucket.read_range(key, 0, u64::MAX).await {
                    Ok(bytes) => Ok(Some(bytes.to_vec())),
                    Err(e) if e.is_not_found() => Ok(None),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    fn missing(&self) -> ConfigError {
        ConfigError::Io {
            path: self.to_string(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        }
    }
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local(path) => write!(f, "{}", path.display()),
            Self::Remote { bucket_url, key } => write!(f, "{bucket_url}/{key}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TEST_COST: u32 = 4;

    fn host_key() -> PrivateKey {
        PrivateKey::random(&mut rand::thread_rng(), russh::keys::Algorithm::Ed25519).unwrap()
    }

    fn defaults() -> ServerDefaults {
        ServerDefaults {
            bind_addr: "127.0.0.1:2022".parse().unwrap(),
            host_key: host_key(),
        }
    }

    #[test]
    fn test_parse_sources() {
        assert_eq!(
            ConfigSource::parse("conf/cloudsftp.json").unwrap(),
            ConfigSource::Local(PathBuf::from("conf/cloudsftp.json"))
        );
        assert_eq!(
            ConfigSource::parse("s3://my-bucket/cfg/sftp.json").unwrap(),
            ConfigSource::Remote {
                bucket_url: "s3://my-bucket".into(),
                key: "cfg/sftp.json".into(),
            }
        );
        assert!(matches!(
            ConfigSource::parse("gs://b/c.json").unwrap(),
            ConfigSource::Remote { .. }
        ));
    }

    #[test]
    fn test_parse_azblob_alias() {
        assert_eq!(
            ConfigSource::parse("azblob://container/sftp/config.json").unwrap(),
            ConfigSource::Remote {
                bucket_url: "az://container".into(),
                key: "sftp/config.json".into(),
            }
        );
        assert!(ConfigSource::parse("azblob://container-only.json").is_err());
    }

    #[test]
    fn test_parse_rejects_bad_sources() {
        assert!(ConfigSource::parse("config.yaml").is_err());
        assert!(ConfigSource::parse("s3://bucket-only.json").is_err());
        assert!(ConfigSource::parse("s3:///x.json").is_err());
    }

    #[tokio::test]
    async fn test_add_user_creates_missing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let source = ConfigSource::Local(path.clone());

        source
            .add_user_with_cost("alice", "s3cret", None, TEST_COST)
            .await
            .unwrap();

        let config = source.load().await.unwrap();
        assert_eq!(config.users.len(), 1);
        assert_ne!(config.users[0].password_hash, "s3cret");
        assert!(config.storage_url.is_none());
    }

    #[tokio::test]
    async fn test_add_user_rejects_duplicates() {
        let dir = TempDir::new().unwrap();
        let source = ConfigSource::Local(dir.path().join("config.json"));

        source.add_user_with_cost("bob", "one", None, TEST_COST).await.unwrap();
        let err = source
            .add_user_with_cost("bob", "two", None, TEST_COST)
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateUser(_)));
        assert_eq!(source.load().await.unwrap().users.len(), 1);
    }

    #[tokio::test]
    async fn test_add_user_preserves_storage_url() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"users":[],"storage_url":"memory:///"}"#).unwrap();
        let source = ConfigSource::Local(path);

        source.add_user_with_cost("carol", "pw", None, TEST_COST).await.unwrap();
        let config = source.load().await.unwrap();
        assert_eq!(config.storage_url.as_deref(), Some("memory:///"));
        assert!(config.user("carol").is_some());
    }

    #[tokio::test]
    async fn test_resolve_server_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"storage_url":"memory:///"}"#).unwrap();
        let source = ConfigSource::Local(path);
        source.add_user_with_cost("dave", "hunter2", None, TEST_COST).await.unwrap();

        let config = source.resolve_server_config(defaults()).await.unwrap();
        assert_eq!(config.bind_addr.port(), 2022);
        assert!(matches!(&config.storage, StorageLocation::Url(url) if url == "memory:///"));
        assert!(config.authenticator.verify("dave", "hunter2"));
        assert!(!config.authenticator.verify("dave", "hunter3"));
        assert!(!config.authenticator.verify("eve", "hunter2"));
    }

    #[tokio::test]
    async fn test_resolve_requires_storage_url() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"users":[]}"#).unwrap();

        let err = ConfigSource::Local(path)
            .resolve_server_config(defaults())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::MissingStorageUrl));
    }

    #[tokio::test]
    async fn test_resolve_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        let source = ConfigSource::Local(dir.path().join("absent.json"));
        assert!(matches!(
            source.resolve_server_config(defaults()).await.err().unwrap(),
            ConfigError::Io { .. }
        ));
    }

    #[tokio::test]
    async fn test_malformed_config_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            ConfigSource::Local(path).load().await,
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn test_authenticator_rejects_empty_hash() {
        let auth = Authenticator::from_users(&[UserRecord {
            username: "nohash".into(),
            ..Default::default()
        }]);
        assert!(!auth.verify("nohash", ""));
    }

    fn public_key() -> PublicKey {
        host_key().public_key().clone()
    }

    #[test]
    fn test_public_key_auth_from_users() {
        let alice = public_key();
        let stranger = public_key();
        let auth = PublicKeyAuth::from_users(&[
            UserRecord {
                username: "alice".into(),
                public_keys: vec![alice.to_openssh().unwrap(), "not a key".into()],
                ..Default::default()
            },
            UserRecord {
                username: "bob".into(),
                ..Default::default()
            },
        ]);

        assert!(auth.verify("alice", &alice));
        assert!(!auth.verify("alice", &stranger));
        assert!(!auth.verify("bob", &alice));
        assert!(!auth.verify("nobody", &alice));
    }

    #[test]
    fn test_public_key_auth_disabled_without_keys() {
        let auth = PublicKeyAuth::from_users(&[UserRecord {
            username: "alice".into(),
            ..Default::default()
        }]);
        assert!(matches!(auth, PublicKeyAuth::Disabled));
        assert!(!auth.verify("alice", &public_key()));
    }

    #[test]
    fn test_public_key_verifier_strategy() {
        struct OnlyRoot;
        impl PublicKeyVerifier for OnlyRoot {
            fn verify(&self, username: &str, _key: &PublicKey) -> bool {
                username == "root"
            }
        }

        let auth = PublicKeyAuth::Verifier(Arc::new(OnlyRoot));
        assert!(auth.verify("root", &public_key()));
        assert!(!auth.verify("alice", &public_key()));
    }

    #[tokio::test]
    async fn test_add_user_with_public_key() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"storage_url":"memory:///"}"#).unwrap();
        let source = ConfigSource::Local(path);
        let key = public_key();
        let line = key.to_openssh().unwrap();

        source
            .add_user_with_cost("erin", "pw", Some(&format!("{line}\n")), TEST_COST)
            .await
            .unwrap();
        let config = source.resolve_server_config(defaults()).await.unwrap();
        assert!(config.public_key.verify("erin", &key));
        assert!(!config.public_key.verify("erin", &public_key()));
    }

    #[tokio::test]
    async fn test_add_user_rejects_bad_public_key() {
        let dir = TempDir::new().unwrap();
        let source = ConfigSource::Local(dir.path().join("config.json"));
        let err = source
            .add_user_with_cost("frank", "pw", Some("ssh-ed25519 garbage"), TEST_COST)
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::PublicKey(_)));
        assert!(source.load().await.is_err());
    }
}
