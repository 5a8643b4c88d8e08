//! The lifecycle controller.
//!
//! [`Supervisor`] owns the registry and drives every managed process through
//! `Stopped -> Pending -> Running -> Stopping -> Stopped`, with `Failed` for
//! start and kill failures and `Unknown` for state loaded from disk.

use std::sync::Arc;

use chrono::Utc;
use common::{AppConfig, ManagedProcess, Phase, process_key};
use tokio::sync::{Mutex, broadcast};
use tracing::{error, info, warn};

use crate::config::SupervisorConfig;
use crate::error::{Result, SupervisorError};
use crate::events::{EventBus, SupervisorEvent};
use crate::exec::{CommandLauncher, Launcher};
use crate::mount::{MountOrchestrator, dedup_mounts};
use crate::probe::SystemProbe;
use crate::registry::Registry;
use crate::scanner::Scanner;

mod start;
mod stop;

pub(crate) use start::process_env;

/// Handle to the supervision engine. Cloning is cheap and every clone shares
/// the same registry.
#[derive(Clone)]
pub struct Supervisor {
    pub(crate) registry: Arc<Registry>,
    pub(crate) config: Arc<SupervisorConfig>,
    pub(crate) events: EventBus,
    pub(crate) mounts: Arc<MountOrchestrator>,
    pub(crate) launcher: Arc<dyn Launcher>,
    pub(crate) probe: Arc<SystemProbe>,
    pub(crate) scanner: Scanner,
    /// Serializes writes of the state file.
    persist_lock: Arc<Mutex<()>>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self::with_parts(config, Registry::new(), Arc::new(CommandLauncher))
    }

    /// Build a supervisor over an existing registry, e.g. one from [`Registry::load`].
    pub fn with_parts(
        config: SupervisorConfig,
        registry: Registry,
        launcher: Arc<dyn Launcher>,
    ) -> Self {
        let probe = Arc::new(SystemProbe::new());
        Supervisor {
            registry: Arc::new(registry),
            mounts: Arc::new(MountOrchestrator::new(
                config.volumes_dir.clone(),
                config.default_tmpfs_size_mb,
            )),
            scanner: Scanner::new(probe.clone(), config.scan_timeout()),
            probe,
            events: EventBus::default(),
            launcher,
            config: Arc::new(config),
            persist_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn scanner(&self) -> &Scanner {
        &self.scanner
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    /// Snapshots of the OS processes selected by `query`.
    ///
    /// See [`Scanner::scan`] for the query syntax.
    pub async fn scan(&self, query: &str) -> Result<Vec<ManagedProcess>> {
        self.scanner.scan(query).await
    }

    /// Register a new process in phase `Stopped`.
    pub async fn create(&self, mut process: ManagedProcess) -> Result<ManagedProcess> {
        if process.metadata.namespace.is_empty() {
            process.metadata.namespace = common::default_namespace();
        }
        validate(&process)?;

        process.spec.mounts = dedup_mounts(&process.spec.mounts);
        process.metadata.uid = uuid::Uuid::new_v4().to_string();
        process.metadata.creation_timestamp = Some(Utc::now());
        process.status = Default::default();

        let key = process.key();
        self.registry.insert(process.clone()).await?;
        info!(key = %key, uid = %process.metadata.uid, "process created");
        self.persist().await;
        Ok(process)
    }

    pub async fn get_status(&self, namespace: &str, name: &str) -> Result<ManagedProcess> {
        self.registry.get(&process_key(namespace, name)).await
    }

    /// All processes, or those of one namespace, sorted by key.
    pub async fn list(&self, namespace: Option<&str>) -> Vec<ManagedProcess> {
        let namespace = namespace.map(|ns| {
            if ns.is_empty() {
                common::DEFAULT_NAMESPACE
            } else {
                ns
            }
        });
        self.registry.list(namespace).await
    }

    /// Stop (tolerating an already stopped process), pause, then start.
    pub async fn restart(&self, namespace: &str, name: &str) -> Result<()> {
        match self.stop(namespace, name).await {
            Ok(()) | Err(SupervisorError::AlreadyStopped(_)) => {}
            Err(e) => return Err(e),
        }
        tokio::time::sleep(self.config.restart_delay()).await;
        self.start(namespace, name).await
    }

    /// Stop the process if it may still be alive, then forget it.
    pub async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        let key = process_key(namespace, name);
        let process = self.registry.get(&key).await?;
        // A failed stop leaves the pid behind, and that process may still be alive.
        let active = matches!(
            process.status.phase,
            Phase::Running | Phase::Pending | Phase::Stopping | Phase::Unknown | Phase::Failed
        );
        if active && process.status.pid != 0 {
            match self.stop(namespace, name).await {
                Ok(()) | Err(SupervisorError::AlreadyStopped(_)) => {}
                Err(e) => return Err(e),
            }
        }

        self.registry.remove(&key).await?;
        info!(key = %key, "process deleted");
        self.persist().await;
        Ok(())
    }

    /// Replace the application config, restarting the process if it runs.
    ///
    /// When that restart fails the previous config is put back and the
    /// process is started with it again; the restart error is returned.
    pub async fn update_config(&self, namespace: &str, name: &str, config: AppConfig) -> Result<()> {
        let key = process_key(namespace, name);
        let (old, active) = self
            .registry
            .update(&key, |e| {
                let old = std::mem::replace(&mut e.process.spec.app_config, config);
                let active = matches!(e.process.status.phase, Phase::Running | Phase::Pending);
                Ok((old, active))
            })
            .await?;

        if active && let Err(e) = self.restart(namespace, name).await {
            warn!(key = %key, "restart with new config failed, rolling back: {e}");
            self.registry
                .update(&key, |entry| {
                    entry.process.spec.app_config = old;
                    Ok(())
                })
                .await?;
            match self.start(namespace, name).await {
                Ok(()) | Err(SupervisorError::AlreadyRunning(_)) => {}
                Err(e) => error!(key = %key, "failed to start with the previous config: {e}"),
            }
            self.persist().await;
            return Err(e);
        }

        self.persist().await;
        Ok(())
    }

    /// Write the registry to the configured state file, if any.
    ///
    /// Called after every phase change so a restarted daemon can find and
    /// reattach the processes that outlived it.
    pub async fn persist(&self) {
        let Some(path) = &self.config.state_file else {
            return;
        };
        let _guard = self.persist_lock.lock().await;
        if let Err(e) = self.registry.save(path).await {
            error!("Failed to persist registry to {}: {e}", path.display());
        }
    }
}

fn validate(process: &ManagedProcess) -> Result<()> {
    let name = &process.metadata.name;
    if name.is_empty() || name.contains('/') {
        return Err(SupervisorError::InvalidSpec(format!(
            "invalid process name {name:?}"
        )));
    }
    if process.metadata.namespace.contains('/') {
        return Err(SupervisorError::InvalidSpec(format!(
            "invalid namespace {:?}",
            process.metadata.namespace
        )));
    }
    if process.spec.exec.command.trim().is_empty() {
        return Err(SupervisorError::InvalidSpec(format!(
            "{}: empty command",
            process.key()
        )));
    }
    for (i, m) in process.spec.mounts.iter().enumerate() {
        m.validate()
            .map_err(|e| SupervisorError::InvalidSpec(format!("mount #{i}: {e}")))?;
    }
    Ok(())
}
