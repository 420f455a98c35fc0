//! relayd
//!
//! Multi-service TCP/UDP layer-4 relay.
//!
//! This binary:
//! - Loads the service configuration from a TOML file
//! - Starts a relay per configured service (TCP and/or UDP)
//! - Forwards traffic to the first reachable backend, with failover,
//!   per-backend cooldown, and cached DNS resolution
//! - Re-applies the configuration on SIGHUP without disturbing unchanged
//!   services
//! - Shuts down gracefully on SIGINT/SIGTERM

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use relayd::config::RelayConfig;
use relayd::manager::{ApplySummary, ServiceManager};
use relayd::resolver::DnsResolver;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path =
        std::env::var("RELAYD_CONFIG").unwrap_or_else(|_| "relayd.toml".to_string());
    let log_level = std::env::var("RELAYD_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

    // Initialize tracing (prefer RUST_LOG, fallback to RELAYD_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| log_level.into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting relayd");

    let config = RelayConfig::from_file(&config_path)
        .with_context(|| format!("failed to load configuration from {config_path}"))?;
    info!(
        config_path = %config_path,
        service_count = config.services.len(),
        "Configuration loaded"
    );

    let resolver = Arc::new(DnsResolver::new());
    let manager = Arc::new(ServiceManager::new(resolver));

    let summary = manager.apply(&config).await;
    log_summary(&summary);
    if summary.started.is_empty() && !config.services.is_empty() {
        manager.shutdown().await;
        anyhow::bail!("no service could be started");
    }

    let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("install SIGHUP handler")?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received interrupt, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
                break;
            }
            _ = sighup.recv() => {
                info!(config_path = %config_path, "Received SIGHUP, reloading configuration");
                match RelayConfig::from_file(&config_path) {
                    Ok(new_config) => {
                        let summary = manager.apply(&new_config).await;
                        log_summary(&summary);
                    }
                    Err(e) => {
                        error!(error = %e, "Reload failed, keeping previous configuration");
                    }
                }
            }
        }
    }

    manager.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}

fn log_summary(summary: &ApplySummary) {
    for (service, error) in &summary.failed {
        error!(service = %service, error = %error, "service could not be brought up");
    }
    info!(
        started = summary.started.len(),
        stopped = summary.stopped.len(),
        updated = summary.updated.len(),
        unchanged = summary.unchanged.len(),
        failed = summary.failed.len(),
        "Configuration applied"
    );
}
