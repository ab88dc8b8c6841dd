//! memproxy daemon - reverse proxy giving chat LLM APIs per-credential memory

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use memproxy::config::Config;
use memproxy::error::Result;
use memproxy::proxy::{AppState, ProxyServer};

/// memproxy - transparent reverse proxy that gives chat LLM APIs memory
#[derive(Parser)]
#[command(name = "memproxy")]
#[command(about = "A transparent reverse proxy that gives chat LLM APIs per-credential memory")]
#[command(version)]
pub struct Cli {
    /// Path to config file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the proxy server (default command)
    #[command(name = "serve")]
    Serve,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => serve(cli.config).await,
    }
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,memproxy=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    tracing::info!("Starting memproxy");

    let config = Config::load(config_path.as_deref())?;
    tracing::debug!("Config loaded: {:?}", config);

    tracing::info!(
        decay = config.memory.enable_decay,
        profile = %config.memory.reward_profile,
        persist = config.session.persist_memory,
        "Memory settings"
    );

    let state = AppState::from_config(config)?;
    ProxyServer::new(state).serve().await?;

    tracing::info!("memproxy stopped");
    Ok(())
}
