//! Headless updater host for stdin/stdout JSON communication.
//!
//! Reads `CommandEnvelope` messages as newline-delimited JSON from stdin,
//! dispatches them to the update state machine, and writes
//! `ResponseEnvelope` and `EventEnvelope` messages to stdout.
//!
//! All tracing/diagnostic output goes to stderr so that stdout remains a
//! clean JSON protocol channel.

use app_updater::UpdaterConfig;
use app_updater::host::stdio::run_stdio_bridge;
use app_updater::update::{UpdateStateMachine, UpdateWatcher};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout is reserved for the JSON protocol.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = load_config()?;
    tracing::info!(
        version = %config.current_version,
        target = %config.target,
        endpoints = config.endpoints.len(),
        "app-updater-host starting"
    );

    let check_on_startup = config.check_on_startup;
    let check_interval = config.check_interval_secs.map(Duration::from_secs);
    let machine = Arc::new(
        UpdateStateMachine::from_config(Arc::new(config))
            .map_err(|e| anyhow::anyhow!("cannot start updater: {e}"))?,
    );

    let cancel = CancellationToken::new();
    if check_on_startup {
        let machine = Arc::clone(&machine);
        tokio::spawn(async move {
            if let Err(e) = machine.check_for_update().await {
                tracing::warn!(error = %e, "startup update check failed");
            }
        });
    }
    if let Some(interval) = check_interval {
        let watcher = UpdateWatcher::new(Arc::clone(&machine), interval, cancel.child_token());
        tokio::spawn(watcher.run());
    }

    let result = run_stdio_bridge(machine).await;
    cancel.cancel();
    result.map_err(|e| {
        tracing::error!(error = %e, "app-updater-host exited with error");
        anyhow::anyhow!("app-updater-host failed: {e}")
    })?;

    tracing::info!("app-updater-host shut down cleanly");
    Ok(())
}

/// Config file if present, defaults otherwise.
fn load_config() -> anyhow::Result<UpdaterConfig> {
    let path = UpdaterConfig::default_config_path();
    let config = if path.exists() {
        tracing::info!(path = %path.display(), "loading updater config");
        UpdaterConfig::from_file(&path)
            .map_err(|e| anyhow::anyhow!("cannot load {}: {e}", path.display()))?
    } else {
        tracing::info!(path = %path.display(), "no updater config; using defaults");
        UpdaterConfig::default()
    };
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid updater config: {e}"))?;
    Ok(config)
}
