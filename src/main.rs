#![forbid(unsafe_code)]

//! `agent-sidecar`: JSON-RPC bridge between a desktop client and agent CLIs.
//!
//! Loads configuration, binds the local socket, prints `SOCKET_PATH=<path>`
//! on stdout for the parent process, and serves connections until SIGINT or
//! SIGTERM. All logging goes to stderr.

use std::io::Write;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use agent_sidecar::config::GlobalConfig;
use agent_sidecar::ipc::server::{default_socket_path, ConnectionServer, ConnectionSettings};
use agent_sidecar::orchestrator::Orchestrators;
use agent_sidecar::registry::SessionRegistry;
use agent_sidecar::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-sidecar", about = "JSON-RPC sidecar for Claude and Codex agents", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Socket path to listen on; overrides the configuration file.
    #[arg(long)]
    socket_path: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() {
    let args = Cli::parse();
    if let Err(err) = bootstrap(args) {
        error!(%err, "agent-sidecar failed");
        eprintln!("agent-sidecar: {err}");
        std::process::exit(1);
    }
}

fn bootstrap(args: Cli) -> Result<()> {
    init_tracing(args.log_format)?;
    info!(version = env!("CARGO_PKG_VERSION"), "agent-sidecar bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let config = match &args.config {
        Some(path) => GlobalConfig::load_from_path(path)?,
        None => GlobalConfig::default(),
    };
    info!(
        busy_policy = ?config.busy_policy,
        reverse_timeout = ?config.timeouts.reverse_request(),
        "configuration loaded"
    );

    let socket_path = args
        .socket_path
        .or_else(|| config.socket_path.clone())
        .unwrap_or_else(default_socket_path);

    let registry = SessionRegistry::new();
    let orchestrators = Orchestrators::from_config(&config, registry);
    let server = ConnectionServer::bind(
        &socket_path,
        orchestrators,
        ConnectionSettings::from(&config),
    )?;

    announce_socket_path(server.socket_path())?;

    let ct = CancellationToken::new();
    let server_handle = tokio::spawn(server.run(ct.clone()));
    info!("agent-sidecar ready");

    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    if let Err(err) = server_handle.await {
        error!(%err, "connection server task failed");
    }
    info!("agent-sidecar shut down");
    Ok(())
}

/// The parent process reads this single line from stdout to find the socket.
fn announce_socket_path(path: &std::path::Path) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "SOCKET_PATH={}", path.display())?;
    stdout.flush()?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // stdout is reserved for the SOCKET_PATH announcement.
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
