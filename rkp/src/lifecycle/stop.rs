use std::path::PathBuf;

use common::{Phase, ProcessSpec, process_key};
use tracing::{error, info, warn};

use super::Supervisor;
use super::start::process_env;
use crate::error::{Result, SupervisorError};
use crate::events::EventKind;
use crate::exec::{run_command, terminate, wait_for_exit};

impl Supervisor {
    /// Stop a process: its stop command first if declared, then signals.
    pub async fn stop(&self, namespace: &str, name: &str) -> Result<()> {
        let key = process_key(namespace, name);
        let (pid, generation, spec) = self
            .registry
            .update(&key, |e| {
                if e.process.status.phase == Phase::Stopped {
                    return Err(SupervisorError::AlreadyStopped(key.clone()));
                }
                e.process.status.phase = Phase::Stopping;
                e.generation += 1;
                e.watched = false;
                Ok((
                    e.process.status.pid,
                    e.generation,
                    e.process.spec.clone(),
                ))
            })
            .await?;

        if let Err(err) = self.terminate_process(&key, pid, &spec).await {
            error!(key = %key, pid, "failed to stop: {err}");
            self.registry
                .try_update(&key, |e| {
                    if e.generation == generation {
                        e.process.status.phase = Phase::Failed;
                    }
                })
                .await;
            self.persist().await;
            return Err(err);
        }

        self.registry
            .try_update(&key, |e| {
                if e.generation == generation {
                    e.process.status.phase = Phase::Stopped;
                    e.process.status.pid = 0;
                }
            })
            .await;
        self.persist().await;
        self.cleanup_mounts(&key, spec.mounts.clone()).await;
        if let Some(hook) = &spec.lifecycle.post_stop {
            self.run_hook(&key, hook, &spec).await;
        }

        info!(key = %key, pid, "process stopped");
        self.events.emit(&key, EventKind::Stopped, pid, "");
        Ok(())
    }

    async fn terminate_process(&self, key: &str, pid: u32, spec: &ProcessSpec) -> Result<()> {
        if pid == 0 {
            return Ok(());
        }
        let grace = self.config.kill_grace();

        if let Some(stop) = &spec.stop_command {
            let cwd = spec.working_dir.as_ref().map(PathBuf::from);
            match run_command(
                stop,
                &[],
                &process_env(spec),
                cwd.as_deref(),
                self.config.stop_timeout(),
            )
            .await
            {
                Ok(out) if out.status.success() => {
                    if wait_for_exit(pid, grace).await {
                        return Ok(());
                    }
                    warn!(key = %key, pid, "still alive after stop command, terminating");
                }
                Ok(out) => warn!(key = %key, "stop command failed with {}, terminating", out.status),
                Err(e) => warn!(key = %key, "stop command failed: {e}, terminating"),
            }
        }

        terminate(pid, grace).await
    }
}
