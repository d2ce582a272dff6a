//! solstice broker binary

use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use solstice::{auth, BrokerConfig, Credentials, Server};

#[derive(Parser)]
#[command(name = "solstice", version, about = "A lightweight MQTT v3.1.1 broker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Configuration file (TOML)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// TCP bind address, e.g. `0.0.0.0:1883`
    #[arg(long, short = 'H')]
    host: Option<SocketAddr>,

    /// Allow connections that carry no credentials
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    allow_anonymous: Option<bool>,

    /// Password file (one `username:hash` entry per line)
    #[arg(long)]
    password_file: Option<PathBuf>,

    /// Log filter, e.g. `info` or `solstice=debug`
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Command {
    /// Hash a password and append the entry to a password file
    Passwd {
        /// Password file to update (created if missing)
        file: PathBuf,
        username: String,
        password: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Some(Command::Passwd {
        file,
        username,
        password,
    }) = cli.command
    {
        return passwd(&file, &username, &password);
    }

    let mut config = match cli.config {
        Some(ref path) => BrokerConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => BrokerConfig::default(),
    };
    if let Some(host) = cli.host {
        config.bind_address = host;
    }
    if let Some(allow) = cli.allow_anonymous {
        config.allow_anonymous = allow;
    }
    if let Some(file) = cli.password_file {
        config.password_file = Some(file);
    }

    let credentials = match config.password_file {
        Some(ref path) => Credentials::from_file(path)?,
        None => Credentials::new(),
    };
    if !config.allow_anonymous && credentials.is_empty() {
        anyhow::bail!("anonymous access is disabled but no credentials are loaded");
    }

    let server = Server::bind(config, credentials).await?;
    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("ctrl-c received, shutting down");
                let _ = shutdown.send(());
            }
            Err(e) => tracing::error!("failed to listen for ctrl-c: {e}"),
        }
    });

    server.run().await?;
    Ok(())
}

fn passwd(file: &Path, username: &str, password: &str) -> Result<()> {
    if username.contains(':') {
        anyhow::bail!("usernames must not contain ':'");
    }
    let hash = auth::hash_password(password)?;
    let mut out = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(file)
        .with_context(|| format!("opening {}", file.display()))?;
    writeln!(out, "{username}:{hash}")?;
    println!("added user {username} to {}", file.display());
    Ok(())
}
