//! clicast-terminal CLI.

use clap::{Parser, Subcommand};
use clicast_terminal::config::{Config, DEFAULT_PORT};
use clicast_terminal::dev_terminal::DevTerminal;
use clicast_terminal::registry::Registry;
use clicast_terminal::server::{run_server, AppState};
use clicast_terminal::token_store::TokenStore;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "clicast-terminal")]
#[command(about = "Browser-facing PTY terminal broker")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the terminal server
    Run {
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },
    /// Inspect or edit the on-disk configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Print the crate version
    Version,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the current configuration
    Show,
    /// Recreate the configuration file from defaults
    Reset,
}

fn config_path() -> PathBuf {
    std::env::var("CLICAST_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("clicast.config.json"))
}

fn legacy_token_path() -> PathBuf {
    std::env::var("CLICAST_LEGACY_TOKEN")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(".clicast-token"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run {
        port: DEFAULT_PORT,
        host: "127.0.0.1".to_string(),
    }) {
        Commands::Run { port, host } => run(port, host).await,
        Commands::Config { action } => run_config(action),
        Commands::Version => {
            println!("clicast-terminal {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn run(port: u16, host: String) -> anyhow::Result<()> {
    let path = config_path();
    let mut config = Config::load(&path)?;
    config.port = port;
    config.save(&path)?;
    let config = Arc::new(RwLock::new(config));

    let tokens = Arc::new(TokenStore::new(
        config.clone(),
        path.clone(),
        legacy_token_path(),
    ));
    tokens.migrate_legacy().await;

    let state = Arc::new(AppState {
        config,
        config_path: path,
        registry: Registry::new(),
        tokens,
        dev: DevTerminal::new(),
        started_at: Instant::now(),
    });

    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    run_server(state, addr).await
}

fn run_config(action: ConfigAction) -> anyhow::Result<()> {
    let path = config_path();
    match action {
        ConfigAction::Show => {
            let config = Config::load(&path)?;
            println!("{}", serde_json::to_string_pretty(&config.public_view())?);
        }
        ConfigAction::Reset => {
            let config = Config::defaults_from_env();
            config.save(&path)?;
            println!("wrote defaults to {}", path.display());
        }
    }
    Ok(())
}
