//! marquee: a movie-catalog REST API over a SQLite document store, with
//! cookie-based JWT sessions.

mod config;
mod error;
mod server;
mod session;
mod store;
mod tokens;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

/// Movie catalog REST API with cookie-based JWT sessions.
#[derive(Parser, Debug)]
#[command(name = "marquee")]
#[command(about = "Movie catalog REST API over a SQLite document store")]
#[command(version)]
struct Cli {
    /// Path to the TOML config file
    #[arg(short, long, env = "MARQUEE_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address (overrides the config file)
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// SQLite database path (overrides the config file)
    #[arg(long)]
    db: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(db) = cli.db {
        config.store.path = db;
    }
    config.validate()?;

    server::run(config).await
}
