//! vtunnel CLI - VPN tunnel client
//!
//! Brings up a single tunnel session from a configuration file, or runs as a
//! daemon service controlled through a local REST API.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use vtunnel::daemon::DEFAULT_HTTP_PORT;
use vtunnel::{
    DaemonService, NetworkConnector, SessionConfig, SessionSupervisor, TunRsPlatform, VtunnelError,
};

/// vtunnel - VPN tunnel client
#[derive(Parser, Debug)]
#[command(name = "vtunnel")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to session configuration file
    #[arg(short, long, required_unless_present = "daemon")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Run as a daemon service (REST API)
    #[arg(long, conflicts_with = "config")]
    daemon: bool,

    /// HTTP port for daemon REST API
    #[arg(long, requires = "daemon")]
    http_port: Option<u16>,

    /// Path to write the auth token file (default: /var/run/vtunnel/auth-token)
    #[arg(long, requires = "daemon")]
    token_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // RUST_LOG wins over the verbosity flag
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    fmt().with_env_filter(filter).with_target(false).init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => match e.downcast_ref::<VtunnelError>() {
            Some(err) => {
                eprintln!("Error: {}", err.user_message());
                ExitCode::from(u8::try_from(err.exit_code()).unwrap_or(255))
            }
            None => {
                eprintln!("Error: {:#}", e);
                ExitCode::from(255)
            }
        },
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    if args.daemon {
        return run_daemon(args).await;
    }

    let config_path = args
        .config
        .context("a configuration file is required unless --daemon is given")?;
    tracing::info!("Loading configuration from: {}", config_path.display());
    let config = SessionConfig::from_file(&config_path).map_err(VtunnelError::from)?;

    run_foreground(config).await
}

/// Run one session until a signal arrives or the session ends on its own
async fn run_foreground(config: SessionConfig) -> anyhow::Result<()> {
    tracing::info!("vtunnel starting...");

    let supervisor = SessionSupervisor::new(
        Arc::new(TunRsPlatform::new()),
        Arc::new(NetworkConnector),
    );
    supervisor.connect(config).await?;

    tokio::select! {
        reason = supervisor.session_ended() => {
            supervisor.disconnect().await;
            let reason = reason.map_or_else(|| "no session".to_string(), |r| r.to_string());
            anyhow::bail!("tunnel session ended: {}", reason);
        }
        signal = shutdown_signal() => {
            tracing::info!("Received {}, shutting down...", signal);
        }
    }

    supervisor.disconnect().await;
    Ok(())
}

/// Run in daemon mode (REST API service)
async fn run_daemon(args: Args) -> anyhow::Result<()> {
    tracing::info!("vtunnel daemon starting (REST API mode)...");

    let daemon = DaemonService::new();
    let port = args.http_port.unwrap_or(DEFAULT_HTTP_PORT);

    tokio::select! {
        result = daemon.run_http(port, args.token_path) => {
            result.context("daemon REST API failed")?;
        }
        signal = shutdown_signal() => {
            tracing::info!("Received {}, shutting down daemon...", signal);
        }
    }

    daemon.cleanup().await?;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM, returning which one arrived
async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "Ctrl+C",
        _ = terminate => "SIGTERM",
    }
}
