//! rptdata - serve recorded test events and messages over HTTP

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rptdata_cli::Runtime;
use rptdata_cli::config::ConfigManager;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Event reconstruction and streaming search server
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log filter; `RUST_LOG` takes precedence when set
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// User config file overlaid on the built-in defaults
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Start {
        /// Override `server.port`
        #[arg(short, long)]
        port: Option<u16>,

        /// Override `storage.fixtures_path`
        #[arg(long)]
        fixtures: Option<PathBuf>,
    },

    /// Inspect the effective configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print one value by dotted key
    Get { key: String },
    /// Print the whole effective configuration
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber).context("failed to install logger")?;

    let mut manager = match cli.config.as_ref() {
        Some(path) => ConfigManager::load_with_path(path)?,
        None => ConfigManager::load_defaults()?,
    };

    match cli.command {
        Commands::Start { port, fixtures } => {
            if let Some(port) = port {
                manager.config_mut().server.port = port;
            }
            if let Some(fixtures) = fixtures {
                manager.config_mut().storage.fixtures_path = fixtures.display().to_string();
            }
            start_server(&manager).await
        }
        Commands::Config { action } => {
            match action {
                ConfigAction::Get { key } => println!("{}", manager.get(&key)?),
                ConfigAction::Show => print!("{}", manager.render()?),
            }
            Ok(())
        }
    }
}

async fn start_server(manager: &ConfigManager) -> Result<()> {
    let config = manager.config();
    let runtime = Runtime::build(config)?;
    let app = runtime.router();

    let addr = format!("{}:{}", config.server.hostname, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(
        %addr,
        config = ?manager.path().map(|path| path.display().to_string()),
        "rptdata server listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    runtime.shutdown().await;
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutdown signal received");
    }
}
