//! preview-sandbox - disposable preview environments over HTTP.
//!
//! Usage:
//!   preview-sandbox serve [--port 8080] [--config path]   # Start HTTP server
//!   preview-sandbox reap [--config path] [--watch 300]    # Remove overdue environments

use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use preview_sandbox::config::Config;
use preview_sandbox::http_server;
use preview_sandbox::reaper::Reaper;
use preview_sandbox::runtime::DockerRuntime;
use preview_sandbox::state::AppState;

#[derive(Parser, Debug)]
#[command(name = "preview-sandbox")]
#[command(about = "Disposable preview environments with an HTTP API")]
struct Args {
    /// Log output format
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to listen on (overrides the config file)
        #[arg(long)]
        port: Option<u16>,

        /// TOML configuration file
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Remove environments older than the lifetime ceiling plus grace
    Reap {
        /// TOML configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Keep running, one pass every SECS seconds
        #[arg(long, value_name = "SECS")]
        watch: Option<u64>,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(err) = init_tracing(args.log_format) {
        eprintln!("Error: {err}");
        exit(1);
    }

    let outcome = match args.command {
        Commands::Serve { port, config } => serve(port, config).await,
        Commands::Reap { config, watch } => reap(config, watch).await,
    };
    if let Err(err) = outcome {
        error!(error = %err, "fatal");
        eprintln!("Error: {err}");
        exit(1);
    }
}

async fn serve(port: Option<u16>, config: Option<PathBuf>) -> Result<(), String> {
    let config = Config::load(config.as_deref()).map_err(|e| e.to_string())?;
    let port = port.unwrap_or(config.server.port);
    let state = AppState::from_config(config).map_err(|e| e.to_string())?;

    let cancel = shutdown_token();
    http_server::run_server(port, state, cancel)
        .await
        .map_err(|e| format!("server: {e}"))
}

async fn reap(config: Option<PathBuf>, watch: Option<u64>) -> Result<(), String> {
    let config = Config::load(config.as_deref()).map_err(|e| e.to_string())?;
    let policy = config.lifetime.policy();
    let reaper = Reaper::new(Arc::new(DockerRuntime::new(config.runtime)), policy);

    match watch {
        Some(secs) => {
            info!(every_secs = secs, "reaper watching");
            reaper
                .watch(Duration::from_secs(secs.max(1)), shutdown_token())
                .await;
            Ok(())
        }
        None => reaper
            .run_once(Utc::now())
            .await
            .map(|_| ())
            .map_err(|e| e.to_string()),
    }
}

/// Token cancelled on Ctrl-C.
fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
        }
        trigger.cancel();
    });
    cancel
}

fn init_tracing(log_format: LogFormat) -> Result<(), String> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber.try_init(),
        LogFormat::Json => subscriber.json().try_init(),
    }
    .map_err(|err| format!("failed to init tracing: {err}"))
}
