use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use lbase::Config;
use tracing::error;
use tracing_subscriber::EnvFilter;

use lampyre::Daemon;

/// Live MJPEG feed distribution daemon.
#[derive(Debug, Parser)]
#[command(name = "lampyre", version, about)]
struct Args {
    /// Path to a JSON configuration file; defaults apply without one.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the video storage directory.
    #[arg(long)]
    storage_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match args.config {
        Some(path) => match Config::load(&path) {
            Ok(config) => config,
            Err(error) => {
                error!(%error, "could not load configuration");
                return ExitCode::FAILURE;
            }
        },
        None => Config::default(),
    };
    if let Some(dir) = args.storage_dir {
        config.storage.dir = dir;
    }

    let daemon = match Daemon::bind(config).await {
        Ok(daemon) => daemon,
        Err(error) => {
            error!(%error, "startup failed");
            return ExitCode::FAILURE;
        }
    };

    match daemon.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(%error, "daemon failed");
            ExitCode::FAILURE
        }
    }
}
