//! cloudsftp server binary
//!
//! SFTP server backed by object storage.
//!
//! ## Usage
//!
//! ```bash
//! # Run the server
//! cloudsftp-server server --private-key ~/.ssh/sftp_host_key --config-source cloudsftp-config.json
//!
//! # Add a login
//! cloudsftp-server user add --config-source cloudsftp-config.json --username demo --password demo
//!
//! # ... with an authorized key
//! cloudsftp-server user add --username demo --password demo --public-key ~/.ssh/id_ed25519.pub
//! ```
//!
//! The config source may also be an object URL such as
//! `s3://my-bucket/cloudsftp-config.json`.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use cloudsftp_server::constants::{DEFAULT_BIND_ADDRESS, DEFAULT_CONFIG_SOURCE, DEFAULT_SSH_PORT};
use cloudsftp_server::{ConfigSource, ServerDefaults, SftpServer};

/// SFTP server over S3, GCS, Azure or local object storage.
#[derive(Parser, Debug)]
#[command(name = "cloudsftp-server")]
#[command(about = "SFTP server backed by object storage")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the SFTP server
    Server(ServerArgs),
    /// Manage users
    User {
        #[command(subcommand)]
        command: UserCommands,
    },
}

#[derive(Args, Debug)]
struct ServerArgs {
    /// SSH/SFTP port
    #[arg(short, long, default_value_t = DEFAULT_SSH_PORT)]
    port: u16,

    /// Address to bind
    #[arg(long, default_value = DEFAULT_BIND_ADDRESS)]
    bind: IpAddr,

    /// Config file path or object URL (s3://, gs://, az://, azblob://)
    #[arg(short, long, default_value = DEFAULT_CONFIG_SOURCE)]
    config_source: String,

    /// Path to the SSH host private key
    #[arg(short = 'k', long)]
    private_key: PathBuf,
}

#[derive(Subcommand, Debug)]
enum UserCommands {
    /// Add a user
    Add {
        /// Config file path or object URL (s3://, gs://, az://, azblob://)
        #[arg(short, long, default_value = DEFAULT_CONFIG_SOURCE)]
        config_source: String,

        #[arg(long)]
        username: String,

        #[arg(long)]
        password: String,

        /// OpenSSH public key file to authorize for this user
        #[arg(long)]
        public_key: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Server(args) => run_server(args).await,
        Commands::User {
            command:
                UserCommands::Add {
                    config_source,
                    username,
                    password,
                    public_key,
                },
        } => add_user(&config_source, &username, &password, public_key.as_deref()).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run_server(args: ServerArgs) -> Result<()> {
    let key_path: PathBuf = shellexpand::tilde(&args.private_key.to_string_lossy())
        .as_ref()
        .into();
    let host_key = russh::keys::load_secret_key(&key_path, None)
        .with_context(|| format!("failed to load private key {}", key_path.display()))?;

    let source = ConfigSource::parse(&args.config_source)?;
    let defaults = ServerDefaults {
        bind_addr: SocketAddr::new(args.bind, args.port),
        host_key,
    };
    let config = source
        .resolve_server_config(defaults)
        .await
        .with_context(|| format!("failed to load config from {source}"))?;

    let server = Arc::new(SftpServer::new(config));
    let mut serve = {
        let server = server.clone();
        tokio::spawn(async move { server.listen_and_serve(None).await })
    };

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("failed to listen for shutdown signal")?;
            tracing::info!("shutdown requested");
            server.close().await;
            serve.await.context("server task panicked")??;
        }
        res = &mut serve => {
            res.context("server task panicked")??;
        }
    }
    Ok(())
}

async fn add_user(
    config_source: &str,
    username: &str,
    password: &str,
    public_key: Option<&Path>,
) -> Result<()> {
    let public_key = match public_key {
        Some(path) => {
            let path: PathBuf = shellexpand::tilde(&path.to_string_lossy()).as_ref().into();
            let line = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("failed to read public key {}", path.display()))?;
            Some(line)
        }
        None => None,
    };

    let source = ConfigSource::parse(config_source)?;
    source
        .add_user(username, password, public_key.as_deref())
        .await
        .with_context(|| format!("failed to add user to {source}"))?;
    println!("Added user '{username}' to {source}");
    Ok(())
}
