use std::{fs::OpenOptions, path::PathBuf, sync::Mutex};

use clap::Parser;
use pplns_pool::{config::PoolConfig, PoolWorker};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(
        short,
        long,
        help = "Path to the TOML configuration file",
        default_value = "pool-config.toml"
    )]
    config: PathBuf,
    #[arg(
        short,
        long,
        help = "Log filter used when RUST_LOG is not set",
        default_value = "info"
    )]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match PoolConfig::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config {}: {e}", args.config.display());
            std::process::exit(1);
        }
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    match config.log_file() {
        Some(path) => {
            let file = match OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => file,
                Err(e) => {
                    eprintln!("Failed to open log file {}: {e}", path.display());
                    std::process::exit(1);
                }
            };
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }

    info!("Starting pool with config {}", args.config.display());
    if let Err(e) = PoolWorker::new(config).start().await {
        error!("Pool exited with error: {e}");
        std::process::exit(1);
    }
}
