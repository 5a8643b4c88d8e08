use std::fs::Permissions;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use common::{
    ConditionType, ConfigFile, ExecConfig, LastTerminationInfo, ManagedProcess, Mount, Phase,
    ProcessSpec, process_key,
};
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::process::Child;
use tracing::{debug, error, info, warn};

use super::Supervisor;
use crate::error::{Result, SupervisorError};
use crate::events::EventKind;
use crate::exec::{LaunchRequest, launch_with_timeout, run_checked, termination_info};
use crate::probe::{resolve_gid, resolve_uid};

/// Declared env followed by the application env, so the latter wins.
pub(crate) fn process_env(spec: &ProcessSpec) -> Vec<(String, String)> {
    spec.env
        .iter()
        .chain(&spec.app_config.env)
        .map(|e| (e.name.clone(), e.value.clone()))
        .collect()
}

pub(crate) fn log_paths(process: &ManagedProcess, default_dir: &Path) -> (PathBuf, PathBuf) {
    let dir = process
        .spec
        .log_dir
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| default_dir.to_path_buf());
    let stem = format!("{}_{}", process.metadata.namespace, process.metadata.name);
    (
        dir.join(format!("{stem}.stdout.log")),
        dir.join(format!("{stem}.stderr.log")),
    )
}

async fn write_config_files(files: &[ConfigFile], working_dir: &Path) -> std::io::Result<()> {
    for f in files {
        let path = working_dir.join(&f.path);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &f.content).await?;
        if let Some(mode) = f.mode {
            tokio::fs::set_permissions(&path, Permissions::from_mode(mode)).await?;
        }
        debug!("wrote config file {}", path.display());
    }
    Ok(())
}

impl Supervisor {
    /// Launch a stopped, failed or unknown process.
    pub async fn start(&self, namespace: &str, name: &str) -> Result<()> {
        let key = process_key(namespace, name);
        let generation = self
            .registry
            .update(&key, |e| match e.process.status.phase {
                Phase::Running | Phase::Pending | Phase::Stopping => {
                    Err(SupervisorError::AlreadyRunning(key.clone()))
                }
                _ => {
                    e.process.status.phase = Phase::Pending;
                    e.generation += 1;
                    Ok(e.generation)
                }
            })
            .await?;
        self.launch(key, generation).await
    }

    /// Bring up the `Pending` entry claimed for `generation`.
    ///
    /// Boxed because the exit watcher it spawns may come back here.
    pub(crate) fn launch(&self, key: String, generation: u64) -> BoxFuture<'static, Result<()>> {
        let this = self.clone();
        async move { this.launch_generation(&key, generation).await }.boxed()
    }

    async fn launch_generation(&self, key: &str, generation: u64) -> Result<()> {
        let process = self.registry.get(key).await?;
        let spec = &process.spec;
        let env = process_env(spec);
        let working_dir = match &spec.working_dir {
            Some(dir) => PathBuf::from(dir),
            None => match std::env::current_dir() {
                Ok(dir) => dir,
                Err(e) => return Err(self.fail_start(key, generation, e.into()).await),
            },
        };
        let start_error = |reason: String| SupervisorError::StartError {
            key: key.to_string(),
            reason,
        };

        if let Some(hook) = &spec.lifecycle.pre_start
            && let Err(e) = run_checked(
                hook,
                &[],
                &env,
                Some(&working_dir),
                self.config.hook_timeout(),
            )
            .await
        {
            return Err(self
                .fail_start(key, generation, start_error(format!("preStart hook: {e}")))
                .await);
        }

        if let Err(e) = write_config_files(&spec.app_config.files, &working_dir).await {
            return Err(self
                .fail_start(key, generation, start_error(format!("config files: {e}")))
                .await);
        }

        let mounts = spec.mounts.clone();
        if let Err(e) = self.apply_mounts(key, mounts.clone()).await {
            self.cleanup_mounts(key, mounts).await;
            return Err(self.fail_start(key, generation, e).await);
        }

        let req = match self.launch_request(&process, env, working_dir) {
            Ok(req) => req,
            Err(e) => {
                self.cleanup_mounts(key, mounts).await;
                return Err(self.fail_start(key, generation, e).await);
            }
        };
        let mut child =
            match launch_with_timeout(self.launcher.clone(), req, self.config.start_timeout()).await
            {
                Ok(child) => child,
                Err(e) => {
                    self.cleanup_mounts(key, mounts).await;
                    return Err(self.fail_start(key, generation, e).await);
                }
            };
        let pid = child.id().unwrap_or_default();

        let health = self
            .registry
            .try_update(key, |e| {
                if e.generation != generation || e.process.status.phase != Phase::Pending {
                    return None;
                }
                let status = &mut e.process.status;
                status.phase = Phase::Running;
                status.pid = pid;
                status.start_time = Some(Utc::now());
                status.restart_count += 1;
                e.watched = true;
                Some(e.process.spec.health_check.clone())
            })
            .await
            .flatten();
        let Some(health) = health else {
            warn!(key = %key, pid, "process was stopped or deleted while starting, killing it");
            let _ = child.start_kill();
            let _ = child.wait().await;
            self.cleanup_mounts(key, mounts).await;
            return Err(start_error("stopped or deleted while starting".to_string()));
        };

        info!(key = %key, pid, "process started");
        self.events.emit(key, EventKind::Started, pid, "");
        tokio::spawn(self.clone().watch_exit(key.to_string(), generation, pid, child));
        self.spawn_monitors(key, generation, health);
        self.persist().await;
        Ok(())
    }

    fn launch_request(
        &self,
        process: &ManagedProcess,
        env: Vec<(String, String)>,
        working_dir: PathBuf,
    ) -> Result<LaunchRequest> {
        let key = process.key();
        let spec = &process.spec;
        let uid = match &spec.user {
            Some(user) => Some(resolve_uid(user).ok_or_else(|| SupervisorError::StartError {
                key: key.clone(),
                reason: format!("unknown user {user}"),
            })?),
            None => None,
        };
        let gid = match &spec.group {
            Some(group) => Some(resolve_gid(group).ok_or_else(|| SupervisorError::StartError {
                key: key.clone(),
                reason: format!("unknown group {group}"),
            })?),
            None => None,
        };
        let (stdout_path, stderr_path) = log_paths(process, &self.config.log_dir);

        Ok(LaunchRequest {
            key,
            program: spec.exec.command.clone(),
            args: spec.exec.args.clone(),
            env,
            working_dir,
            stdout_path,
            stderr_path,
            uid,
            gid,
        })
    }

    /// Record a start failure for `generation` and hand the error back.
    async fn fail_start(&self, key: &str, generation: u64, err: SupervisorError) -> SupervisorError {
        error!(key = %key, "failed to start: {err}");
        self.registry
            .try_update(key, |e| {
                if e.generation == generation {
                    e.process.status.phase = Phase::Failed;
                    e.process.status.pid = 0;
                }
            })
            .await;
        self.events
            .emit(key, EventKind::StartFailed, 0, err.to_string());
        self.persist().await;
        err
    }

    pub(crate) async fn apply_mounts(&self, key: &str, mounts: Vec<Mount>) -> Result<()> {
        if mounts.is_empty() {
            return Ok(());
        }
        let orchestrator = self.mounts.clone();
        tokio::task::spawn_blocking(move || orchestrator.apply(&mounts))
            .await
            .map_err(|e| SupervisorError::StartError {
                key: key.to_string(),
                reason: format!("mount task failed: {e}"),
            })?
    }

    /// Best-effort unmount; failures are only logged.
    pub(crate) async fn cleanup_mounts(&self, key: &str, mounts: Vec<Mount>) {
        if mounts.is_empty() {
            return;
        }
        let orchestrator = self.mounts.clone();
        match tokio::task::spawn_blocking(move || orchestrator.cleanup(&mounts)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(key = %key, "mount cleanup failed: {e}"),
            Err(e) => warn!(key = %key, "mount cleanup task failed: {e}"),
        }
    }

    pub(crate) async fn run_hook(&self, key: &str, hook: &ExecConfig, spec: &ProcessSpec) {
        let cwd = spec.working_dir.as_ref().map(PathBuf::from);
        if let Err(e) = run_checked(
            hook,
            &[],
            &process_env(spec),
            cwd.as_deref(),
            self.config.hook_timeout(),
        )
        .await
        {
            warn!(key = %key, "hook failed: {e}");
        }
    }

    /// Owns the child of one generation until it exits.
    async fn watch_exit(self, key: String, generation: u64, pid: u32, mut child: Child) {
        let info = match child.wait().await {
            Ok(status) => termination_info(&status),
            Err(e) => LastTerminationInfo {
                exit_code: None,
                signal: None,
                message: format!("wait failed: {e}"),
                finished_at: Utc::now(),
            },
        };

        let owned = self
            .registry
            .try_update(&key, |e| {
                // Unless a newer run is attached already.
                if e.process.status.pid == pid || e.process.status.pid == 0 {
                    e.process.status.last_termination = Some(info.clone());
                }
                if e.generation != generation {
                    return None;
                }
                e.watched = false;
                e.process.status.phase = Phase::Stopped;
                e.process.status.pid = 0;
                Some(e.process.spec.clone())
            })
            .await
            .flatten();
        let Some(spec) = owned else {
            debug!(key = %key, pid, "exit already handled: {}", info.message);
            return;
        };

        info!(key = %key, pid, "process exited: {}", info.message);
        self.persist().await;
        self.events
            .emit(&key, EventKind::Exited, pid, info.message.clone());
        self.cleanup_mounts(&key, spec.mounts.clone()).await;
        if let Some(hook) = &spec.lifecycle.post_stop {
            self.run_hook(&key, hook, &spec).await;
        }

        if spec.restart_policy.should_restart(&info) {
            let delay = spec.restart_interval();
            info!(key = %key, "restarting in {delay:?} ({:?})", spec.restart_policy);
            self.events.emit(
                &key,
                EventKind::RestartScheduled,
                pid,
                format!("in {delay:?}"),
            );
            self.schedule_restart(key, generation, delay);
        }
    }

    /// Start the entry again after `delay`, unless it was touched in between.
    pub(crate) fn schedule_restart(&self, key: String, generation: u64, delay: Duration) {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.restart_generation(&key, generation).await;
        });
    }

    /// Restart a `Stopped` entry that still sits at `generation`.
    pub(crate) async fn restart_generation(&self, key: &str, generation: u64) {
        let claimed = self
            .registry
            .try_update(key, |e| {
                if e.generation != generation || e.process.status.phase != Phase::Stopped {
                    return None;
                }
                e.process.status.phase = Phase::Pending;
                e.generation += 1;
                Some(e.generation)
            })
            .await
            .flatten();
        let Some(next) = claimed else {
            debug!(key = %key, "restart superseded");
            return;
        };

        let outcome = self.launch(key.to_string(), next).await;
        let (ok, reason, message) = match &outcome {
            Ok(()) => (true, "Restarted", String::new()),
            Err(e) => {
                error!(key = %key, "automatic restart failed: {e}");
                self.events
                    .emit(key, EventKind::RestartFailed, 0, e.to_string());
                (false, "RestartFailed", e.to_string())
            }
        };
        self.registry
            .try_update(key, |e| {
                e.process
                    .status
                    .set_condition(ConditionType::AutoRestart, ok, reason, message)
            })
            .await;
        self.persist().await;
    }
}
