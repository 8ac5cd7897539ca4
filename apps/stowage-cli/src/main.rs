//! Stowage command-line uploader entry point.

mod app;
mod config;

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Upload files in parallel chunks to a storage service.
#[derive(Debug, Parser)]
#[command(name = "stowage", version)]
#[command(about = "Chunked, resumable-by-retry file uploader", long_about = None)]
pub struct Args {
    /// Configuration file (defaults to ~/.config/stowage/cli.toml).
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Store into a local directory instead of the configured server.
    #[arg(long, value_name = "DIR")]
    pub local_root: Option<PathBuf>,

    /// Destination directory on the storage side.
    #[arg(long, value_name = "PATH")]
    pub target: Option<String>,

    /// Files to upload.
    #[arg(required = true)]
    pub files: Vec<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), files = args.files.len(), "starting stowage");

    let config = config::CliConfig::load(args.config.as_deref())?;
    tracing::debug!(server = %config.server_url, "configuration loaded");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(args, config))
}
