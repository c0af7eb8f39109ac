mod broadcast;
mod cli;
mod logging;
mod monitor;

use std::process;

use anyhow::Result;
use clap::Parser;
use tracing::error;

use crate::cli::{Args, Commands};

#[tokio::main]
async fn main() {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!("Application error: {:#}", e);
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let _guard = logging::init_logging(&args.log_dir, args.verbose)?;

    match args.command {
        Commands::Monitor(monitor_args) => monitor::run(monitor_args).await,
        Commands::BroadcastTime(time_args) => broadcast::run(time_args).await,
    }
}
