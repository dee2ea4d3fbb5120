//! Action Injector - synthetic load for EVM JSON-RPC nodes
//!
//! Submits signed transfers and contract calls at a fixed rate from a pool of
//! test accounts, keeping per-account nonces in sync with the node.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod accounts;
mod action;
mod client;
mod config;
mod dispatch;
mod error;
mod metrics;
mod nonce;
mod retry;
mod session;

use config::{ActionPolicy, Overrides, Settings};
use metrics::MetricsServer;
use session::InjectionSession;

/// Command-line arguments
#[derive(Debug, Parser)]
#[command(name = "action-injector", version, about)]
struct Cli {
    /// Configuration file (defaults to $INJECTOR_CONFIG, then config/default.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Target actions per second
    #[arg(long = "aps")]
    actions_per_second: Option<u32>,

    /// Run duration in seconds
    #[arg(long)]
    duration_secs: Option<u64>,

    /// Kind of actions to send
    #[arg(long, value_enum)]
    action_type: Option<ActionPolicy>,

    /// Check receipts of submitted actions
    #[arg(long)]
    check_receipt: bool,

    /// Emit logs as JSON
    #[arg(long, env = "INJECTOR_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.log_json);

    info!("Starting Action Injector v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let overrides = Overrides {
        actions_per_second: cli.actions_per_second,
        duration_secs: cli.duration_secs,
        policy: cli.action_type,
        check_receipt: cli.check_receipt,
    };
    let settings = Settings::load(cli.config.as_deref(), &overrides)?;
    info!(
        "Loaded configuration: {} actions/s, {:?} policy, {}s",
        settings.injector.actions_per_second,
        settings.actions.policy,
        settings.injector.duration_secs
    );

    // Connect and build the session
    let metrics_config = settings.metrics.clone();
    let session = InjectionSession::connect(settings)
        .await
        .context("Failed to start injection session")?;
    info!(
        "Session {} connected to chain {}",
        session.id(),
        session.chain_id()
    );

    // Start metrics server
    let metrics_handle = if metrics_config.enabled {
        let server = MetricsServer::new(metrics_config.port, session.app_state());
        info!("Metrics: http://0.0.0.0:{}/metrics", metrics_config.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Stop on Ctrl+C / SIGTERM
    let shutdown = CancellationToken::new();
    let signal_handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            info!("Shutdown signal received, stopping...");
            shutdown.cancel();
        }
    });

    let result = session.run(shutdown).await;

    signal_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    let report = result.context("Injection failed")?;
    info!(
        "Session {} stopped: {} dispatched, {} rejected, {} abandoned",
        report.session_id, report.dispatched, report.rejected, report.abandoned
    );
    Ok(())
}

fn init_logging(json: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,action_injector=debug,hyper=warn"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides() {
        let cli = Cli::parse_from([
            "action-injector",
            "--aps",
            "50",
            "--action-type",
            "mixed",
            "--check-receipt",
        ]);
        assert_eq!(cli.actions_per_second, Some(50));
        assert_eq!(cli.action_type, Some(ActionPolicy::Mixed));
        assert!(cli.check_receipt);
        assert!(cli.config.is_none());
    }
}
