//! SSH server for cloudsftp
//!
//! Accepts SSH connections, authenticates by password or public key and
//! serves the `sftp` subsystem over each session channel. Every SFTP channel gets its own
//! bucket handle and its own [`CloudFs`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use cloudsftp_kernel::bucket::{open_bucket, Bucket, BucketResult};
use cloudsftp_kernel::vfs::CloudFs;
use russh::keys::{PrivateKey, PublicKey};
use russh::server::{self, Auth, Msg, Session};
use russh::{Channel, ChannelId};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::{Authenticator, PublicKeyAuth};
use crate::constants::{SFTP_SUBSYSTEM, SSH_AUTH_REJECTION_DELAY};
use crate::sftp::SftpSession;

/// Fatal server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("host key error: {0}")]
    HostKey(String),
}

/// Hands out a bucket for an authenticated user.
pub trait BucketResolver: Send + Sync {
    fn resolve(&self, username: &str) -> BucketResult<Arc<dyn Bucket>>;
}

/// How each SFTP session gets its bucket.
#[derive(Clone)]
pub enum StorageLocation {
    /// Open a fresh handle from this URL for every session.
    Url(String),
    /// Ask the resolver for every session.
    Resolver(Arc<dyn BucketResolver>),
}

impl StorageLocation {
    pub fn resolve(&self, username: &str) -> BucketResult<Arc<dyn Bucket>> {
        match self {
            Self::Url(url) => Ok(Arc::new(open_bucket(url)?)),
            Self::Resolver(resolver) => resolver.resolve(username),
        }
    }
}

impl std::fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Url(url) => f.write_str(url),
            Self::Resolver(_) => f.write_str("resolver"),
        }
    }
}

impl std::fmt::Debug for StorageLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StorageLocation({self})")
    }
}

/// SFTP server configuration
#[derive(Clone)]
pub struct SftpServerConfig {
    pub bind_addr: SocketAddr,
    pub host_key: PrivateKey,
    pub authenticator: Authenticator,
    pub public_key: PublicKeyAuth,
    pub storage: StorageLocation,
}

impl SftpServerConfig {
    /// Loopback config with an ephemeral host key (for testing).
    /// Public-key logins start disabled.
    pub fn ephemeral(
        port: u16,
        authenticator: Authenticator,
        storage: StorageLocation,
    ) -> Result<Self, ServerError> {
        let host_key = PrivateKey::random(&mut rand::thread_rng(), russh::keys::Algorithm::Ed25519)
            .map_err(|e| ServerError::HostKey(e.to_string()))?;
        Ok(Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], port)),
            host_key,
            authenticator,
            public_key: PublicKeyAuth::Disabled,
            storage,
        })
    }
}

/// SFTP server
///
/// `listen_and_serve` and `close` both take `&self`, so the server is
/// usually shared behind an `Arc` between the accept task and whoever
/// shuts it down.
pub struct SftpServer {
    config: SftpServerConfig,
    shutdown: CancellationToken,
    sessions: TaskTracker,
}

impl SftpServer {
    pub fn new(config: SftpServerConfig) -> Self {
        Self {
            config,
            shutdown: CancellationToken::new(),
            sessions: TaskTracker::new(),
        }
    }

    fn ssh_config(&self) -> server::Config {
        server::Config {
            auth_rejection_time: SSH_AUTH_REJECTION_DELAY,
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            keys: vec![self.config.host_key.clone()],
            ..Default::default()
        }
    }

    /// Bind and accept connections until [`close`](Self::close).
    ///
    /// The bound address (useful with port 0) is sent on `ready` once the
    /// socket is listening.
    pub async fn listen_and_serve(
        &self,
        ready: Option<oneshot::Sender<SocketAddr>>,
    ) -> Result<(), ServerError> {
        let addr = self.config.bind_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        tracing::info!(addr = %local_addr, storage = %self.config.storage, "SFTP server listening");
        if let Some(ready) = ready {
            let _ = ready.send(local_addr);
        }

        let ssh_config = Arc::new(self.ssh_config());
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            tracing::debug!(%peer, "connection accepted");
            let handler = ConnectionHandler::new(peer, &self.config);
            self.sessions
                .spawn(serve_connection(ssh_config.clone(), stream, handler, peer));
        }

        tracing::info!(addr = %local_addr, "SFTP server stopped accepting");
        Ok(())
    }

    /// Stop accepting and wait for in-flight connections to finish.
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.sessions.close();
        tracing::info!(in_flight = self.sessions.len(), "waiting for sessions to finish");
        self.sessions.wait().await;
    }
}

async fn serve_connection(
    config: Arc<server::Config>,
    stream: TcpStream,
    handler: ConnectionHandler,
    peer: SocketAddr,
) {
    let session = match server::run_stream(config, stream, handler).await {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!(%peer, error = %e, "SSH handshake failed");
            return;
        }
    };
    match session.await {
        Ok(()) => tracing::debug!(%peer, "connection closed"),
        Err(e) => tracing::warn!(%peer, error = %e, "connection ended with error"),
    }
}

/// Handler for a single SSH connection
struct ConnectionHandler {
    peer: SocketAddr,
    username: Option<String>,
    authenticator: Authenticator,
    public_key: PublicKeyAuth,
    storage: StorageLocation,
    /// Session channels waiting for a subsystem request.
    channels: HashMap<ChannelId, Channel<Msg>>,
    /// Cancellation for each running SFTP session.
    sessions: HashMap<ChannelId, CancellationToken>,
    cancel: CancellationToken,
}

impl ConnectionHandler {
    fn new(peer: SocketAddr, config: &SftpServerConfig) -> Self {
        Self {
            peer,
            username: None,
            authenticator: config.authenticator.clone(),
            public_key: config.public_key.clone(),
            storage: config.storage.clone(),
            channels: HashMap::new(),
            sessions: HashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    fn reject() -> Auth {
        Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        }
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl server::Handler for ConnectionHandler {
    type Error = russh::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        // bcrypt verification blocks
        let authenticator = self.authenticator.clone();
        let (name, secret) = (user.to_string(), password.to_string());
        let accepted = tokio::task::spawn_blocking(move || authenticator.verify(&name, &secret))
            .await
            .unwrap_or(false);

        if accepted {
            tracing::info!(peer = %self.peer, user, "password accepted");
            self.username = Some(user.to_string());
            Ok(Auth::Accept)
        } else {
            tracing::warn!(peer = %self.peer, user, "password rejected");
            Ok(Self::reject())
        }
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        if self.public_key.verify(user, public_key) {
            tracing::info!(peer = %self.peer, user, "public key accepted");
            self.username = Some(user.to_string());
            Ok(Auth::Accept)
        } else {
            tracing::warn!(peer = %self.peer, user, "public key rejected");
            Ok(Self::reject())
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        tracing::debug!(peer = %self.peer, channel = %channel.id(), "session channel opened");
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if name != SFTP_SUBSYSTEM {
            tracing::warn!(peer = %self.peer, subsystem = name, "unsupported subsystem");
            session.channel_failure(channel_id)?;
            return Ok(());
        }
        let Some(channel) = self.channels.remove(&channel_id) else {
            session.channel_failure(channel_id)?;
            return Ok(());
        };

        let username = self.username.clone().unwrap_or_default();
        let bucket = match self.storage.resolve(&username) {
            Ok(bucket) => bucket,
            Err(e) => {
                tracing::error!(
                    peer = %self.peer,
                    user = %username,
                    storage = %self.storage,
                    error = %e,
                    "failed to open storage"
                );
                session.channel_failure(channel_id)?;
                return Ok(());
            }
        };

        let cancel = self.cancel.child_token();
        self.sessions.insert(channel_id, cancel.clone());
        let span = tracing::info_span!(
            "session",
            user = %username,
            peer = %self.peer,
            storage = %self.storage,
            channel = %channel_id,
        );
        let fs = CloudFs::new(bucket, span, cancel);

        session.channel_success(channel_id)?;
        russh_sftp::server::run(channel.into_stream(), SftpSession::new(fs)).await;
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        // half-close: requests already queued still run to completion
        tracing::debug!(peer = %self.peer, %channel, "channel eof");
        self.channels.remove(&channel);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!(peer = %self.peer, %channel, "channel closed");
        self.channels.remove(&channel);
        if let Some(token) = self.sessions.remove(&channel) {
            token.cancel();
        }
        Ok(())
    }
}
