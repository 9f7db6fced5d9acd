mod commands;
mod config;
mod lock;
mod shutdown;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;

#[derive(Parser)]
#[command(name = "mirror-sync")]
#[command(about = "Keep a fleet of software mirrors in sync with their upstreams")]
struct Cli {
    /// Configuration file (defaults to ~/.config/mirror-sync/mirror.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one sync cycle over every configured site
    Run {
        /// Only sync the given site (repeatable)
        #[arg(long = "site")]
        sites: Vec<String>,
    },
    /// Show the recorded sync state of every site
    Status {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Validate the configuration and list accepted and rejected sites
    Check,
}

fn init_tracing() {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new("mirror_sync=info,mirror_sync_tools=info,mirror_sync_store=info"),
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<PathBuf>) -> Result<AppConfig> {
    let path = match path {
        Some(path) => path,
        None => config::config_path().context("could not determine config directory")?,
    };
    AppConfig::load(&path)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(cli.config)?;

    match cli.command {
        Command::Run { sites } => commands::run::run(&config, &sites).await,
        Command::Status { json } => commands::status::run(&config, json),
        Command::Check => commands::check::run(&config),
    }
}
