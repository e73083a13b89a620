//! Module broker daemon
//!
//! Runs the orchestrator in the console. Ctrl+C and SIGTERM shut the
//! broker down; on unix, SIGHUP re-derives the desired hosts from the
//! current user sessions.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tm_broker::{NativePlatform, Orchestrator, OrchestratorHandle};
use tm_core::config::{self, BrokerSettings};

#[derive(Parser)]
#[command(name = "tm-broker")]
#[command(about = "Module broker: supervises host processes and routes their messages")]
#[command(version)]
struct Args {
    /// Path to settings file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding the host executables (overrides settings)
    #[arg(long)]
    host_dir: Option<PathBuf>,

    /// Run in service mode regardless of detection
    #[arg(long)]
    service: bool,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.foreground { "debug" } else { args.log_level.as_str() };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Module broker starting...");

    let mut settings = load_settings(args.config.as_ref())?;
    if let Some(dir) = args.host_dir {
        settings.host_dir = Some(dir);
    }
    if args.service {
        settings.run_as_service = Some(true);
    }

    let host_dir = settings
        .resolved_host_dir()
        .context("Failed to resolve host directory")?;
    tracing::info!("Host images from {:?}", host_dir);

    let platform = Arc::new(NativePlatform::new(&settings));
    let (orchestrator, handle) = Orchestrator::new(platform, settings);
    let containment = orchestrator.containment();
    let run = tokio::spawn(orchestrator.run());

    handle
        .initialize()
        .await
        .context("Failed to start bootstrap")?;

    tokio::spawn(forward_signals(handle.clone()));

    run.await.context("Orchestrator task failed")?;

    // Closing the broker's own containment group would kill this process;
    // the groups are released when the process exits.
    std::mem::forget(containment);

    tracing::info!("Module broker shutdown complete");
    Ok(())
}

/// Load settings from `path`, or from the default location when present
fn load_settings(path: Option<&PathBuf>) -> Result<BrokerSettings> {
    if let Some(path) = path {
        return config::load_config(path)
            .with_context(|| format!("Failed to load settings from {:?}", path));
    }

    let default_path = config::default_config_path();
    if default_path.exists() {
        Ok(config::load_config(&default_path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load settings from {:?}: {}", default_path, e);
            BrokerSettings::default()
        }))
    } else {
        tracing::info!("Using default settings");
        Ok(BrokerSettings::default())
    }
}

/// Turn OS signals into orchestrator events until shutdown has been posted
async fn forward_signals(handle: OrchestratorHandle) {
    #[cfg(unix)]
    let mut signals = {
        use tokio::signal::unix::{signal, SignalKind};
        match (signal(SignalKind::terminate()), signal(SignalKind::hangup())) {
            (Ok(terminate), Ok(hangup)) => Some((terminate, hangup)),
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!("Failed to install signal handlers: {}", e);
                None
            }
        }
    };

    loop {
        #[cfg(unix)]
        let event = match signals {
            Some((ref mut terminate, ref mut hangup)) => tokio::select! {
                _ = wait_ctrl_c() => Signal::Stop("Ctrl+C"),
                _ = terminate.recv() => Signal::Stop("SIGTERM"),
                _ = hangup.recv() => Signal::SessionChange,
            },
            None => {
                wait_ctrl_c().await;
                Signal::Stop("Ctrl+C")
            }
        };

        #[cfg(not(unix))]
        let event = {
            wait_ctrl_c().await;
            Signal::Stop("Ctrl+C")
        };

        match event {
            Signal::Stop(name) => {
                tracing::info!("Received {}, initiating shutdown...", name);
                if let Err(e) = handle.shutdown().await {
                    tracing::warn!("Shutdown not delivered: {}", e);
                }
                return;
            }
            Signal::SessionChange => {
                tracing::info!("Received SIGHUP, re-evaluating user sessions");
                if let Err(e) = handle.session_changed().await {
                    tracing::warn!("Session change not delivered: {}", e);
                    return;
                }
            }
        }
    }
}

/// Resolve on Ctrl+C
///
/// Never resolves when the handler cannot be installed, so a failure is
/// not mistaken for a shutdown request.
async fn wait_ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}

enum Signal {
    Stop(&'static str),
    #[cfg_attr(not(unix), allow(dead_code))]
    SessionChange,
}
