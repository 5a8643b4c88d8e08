//! Long running supervisor: state file, reconcile, static manifests.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::config::SupervisorConfig;
use crate::exec::CommandLauncher;
use crate::lifecycle::Supervisor;
use crate::registry::Registry;

pub mod static_procs;

use static_procs::StaticProcs;

/// Build a supervisor from `config`, loading the state file when it exists.
pub async fn build(config: SupervisorConfig) -> anyhow::Result<Supervisor> {
    let registry = match &config.state_file {
        Some(path) if path.exists() => {
            let registry = Registry::load(path)
                .await
                .with_context(|| format!("Failed to load state from {}", path.display()))?;
            info!(
                "loaded {} processes from {}",
                registry.len().await,
                path.display()
            );
            registry
        }
        _ => Registry::new(),
    };
    Ok(Supervisor::with_parts(
        config,
        registry,
        Arc::new(CommandLauncher),
    ))
}

/// Log every supervisor event until the bus closes.
fn log_events(sup: &Supervisor) {
    let mut rx = sup.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(ev) => debug!(key = %ev.key, pid = ev.pid, "{:?} {}", ev.kind, ev.message),
                Err(RecvError::Lagged(n)) => warn!("event log lagged, {n} events dropped"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

/// Run until Ctrl-C, then persist the registry.
pub async fn run(config: SupervisorConfig) -> anyhow::Result<()> {
    let sup = build(config).await?;
    log_events(&sup);
    sup.reconcile().await;

    let mut static_procs = sup.config().manifests_dir.clone().map(StaticProcs::new);
    let mut ticker = interval(sup.config().manifest_sync_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!("rkp daemon started");
    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res.context("Failed to listen for ctrl-c")?;
                break;
            }
            _ = ticker.tick() => {
                if let Some(procs) = static_procs.as_mut() {
                    procs.sync(&sup).await;
                }
            }
        }
    }

    info!("shutting down");
    sup.persist().await;
    Ok(())
}
