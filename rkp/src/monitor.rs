//! Background loops that keep `Status` of running processes current.
//!
//! Every loop is bound to the generation it was spawned for and ends as soon
//! as the entry moves on (stop, restart, reattach, delete).

use std::time::Duration;

use common::{
    ConditionType, HealthCheck, Phase, ResourceStats, RestartPolicy, process_key,
};
use tokio::time::{MissedTickBehavior, interval, sleep};
use tracing::{debug, info, warn};

use crate::error::{Result, SupervisorError};
use crate::events::EventKind;
use crate::exec::pid_alive;
use crate::health;
use crate::lifecycle::Supervisor;
use crate::probe::{SysProcess, stats_of, with_probe};
use crate::scanner::matcher_for;

enum Loss {
    /// The entry moved on; nothing to do.
    Superseded,
    /// The exit watcher owns the child and will record the exit.
    Watched,
    /// Marked as lost; carries the new generation.
    Claimed(u64, RestartPolicy),
}

impl Supervisor {
    pub(crate) fn spawn_monitors(&self, key: &str, generation: u64, health: Option<HealthCheck>) {
        tokio::spawn(self.clone().stats_loop(key.to_string(), generation));
        tokio::spawn(self.clone().liveness_loop(key.to_string(), generation));
        if let Some(check) = health {
            tokio::spawn(self.clone().health_loop(key.to_string(), generation, check));
        }
    }

    /// Pid of the entry if it is still `Running` at `generation`.
    async fn running_pid(&self, key: &str, generation: u64) -> Option<u32> {
        self.registry
            .try_update(key, |e| {
                (e.generation == generation && e.process.status.phase == Phase::Running)
                    .then_some(e.process.status.pid)
            })
            .await
            .flatten()
    }

    async fn sample(&self, pid: u32) -> Result<ResourceStats> {
        with_probe(&self.probe, move |probe| probe.stats(pid))
            .await
            .and_then(|res| res)
    }

    async fn stats_loop(self, key: String, generation: u64) {
        let mut ticker = interval(self.config.stats_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(pid) = self.running_pid(&key, generation).await else {
                break;
            };
            match self.sample(pid).await {
                Ok(stats) => {
                    self.registry
                        .try_update(&key, |e| {
                            if e.generation == generation {
                                e.process.status.resources = stats;
                            }
                        })
                        .await;
                }
                Err(SupervisorError::ProcessNotFound(_)) => {
                    debug!(key = %key, pid, "gone before stats sample")
                }
                Err(e) => warn!(key = %key, pid, "stats sample failed: {e}"),
            }
        }
        debug!(key = %key, generation, "stats loop finished");
    }

    async fn liveness_loop(self, key: String, generation: u64) {
        loop {
            sleep(self.config.liveness_interval()).await;
            let Some(pid) = self.running_pid(&key, generation).await else {
                break;
            };
            if pid_alive(pid) {
                continue;
            }

            let loss = self
                .registry
                .try_update(&key, |e| {
                    if e.generation != generation || e.process.status.phase != Phase::Running {
                        return Loss::Superseded;
                    }
                    if e.watched {
                        return Loss::Watched;
                    }
                    e.process.status.phase = Phase::Stopped;
                    e.process.status.pid = 0;
                    e.generation += 1;
                    Loss::Claimed(e.generation, e.process.spec.restart_policy)
                })
                .await
                .unwrap_or(Loss::Superseded);

            match loss {
                Loss::Superseded => {}
                Loss::Watched => debug!(key = %key, pid, "gone, left to the exit watcher"),
                Loss::Claimed(next, policy) => {
                    warn!(key = %key, pid, "process disappeared");
                    self.persist().await;
                    self.events
                        .emit(&key, EventKind::Lost, pid, "no longer alive");
                    if policy.recovers_lost_process() {
                        self.spawn_reattach(key.clone(), next);
                    }
                }
            }
            break;
        }
        debug!(key = %key, generation, "liveness loop finished");
    }

    async fn health_loop(self, key: String, generation: u64, check: HealthCheck) {
        let period = Duration::from_secs(check.period_secs.max(1));
        let limit = Duration::from_secs(check.timeout_secs.max(1));
        let mut failures = 0u32;
        loop {
            sleep(period).await;
            if self.running_pid(&key, generation).await.is_none() {
                break;
            }
            let Ok(process) = self.registry.get(&key).await else {
                break;
            };

            let (healthy, reason, message) =
                match health::probe(&check.probe, &process.spec, limit).await {
                    Ok(()) => {
                        failures = 0;
                        (true, "ProbeSucceeded", String::new())
                    }
                    Err(e) => {
                        failures += 1;
                        debug!(key = %key, failures, "health probe failed: {e:#}");
                        if failures < check.failure_threshold {
                            continue;
                        }
                        (false, "ProbeFailed", format!("{e:#}"))
                    }
                };

            let changed = self
                .registry
                .try_update(&key, |e| {
                    if e.generation != generation {
                        return None;
                    }
                    let status = &mut e.process.status;
                    let before = status.condition(ConditionType::Healthy).map(|c| c.status);
                    status.set_condition(ConditionType::Healthy, healthy, reason, message.clone());
                    Some(before != Some(healthy))
                })
                .await
                .flatten();
            match changed {
                None => break,
                Some(true) => {
                    info!(key = %key, healthy, "health changed");
                    self.events
                        .emit(&key, EventKind::HealthChanged, process.status.pid, message);
                }
                Some(false) => {}
            }
        }
    }

    fn spawn_reattach(&self, key: String, generation: u64) {
        let this = self.clone();
        tokio::spawn(async move { this.reattach(&key, generation).await });
    }

    /// Search the process table for a vanished process, starting it anew
    /// when nothing matches.
    async fn reattach(&self, key: &str, generation: u64) {
        let Ok(process) = self.registry.get(key).await else {
            return;
        };
        match self.find_process(key, &process.spec).await {
            Some(found) => {
                self.attach(key, generation, &found).await;
            }
            None => {
                info!(key = %key, "no matching process, starting a new one");
                self.events
                    .emit(key, EventKind::ReattachFailed, 0, "no matching process");
                self.registry
                    .try_update(key, |e| {
                        e.process.status.set_condition(
                            ConditionType::Reattached,
                            false,
                            "ProcessNotFound",
                            "",
                        )
                    })
                    .await;
                self.cleanup_mounts(key, process.spec.mounts.clone()).await;
                self.restart_generation(key, generation).await;
            }
        }
    }

    /// Live process matching `spec`, skipping pids other entries already own.
    async fn find_process(&self, key: &str, spec: &common::ProcessSpec) -> Option<SysProcess> {
        let owned: Vec<u32> = self
            .registry
            .list(None)
            .await
            .into_iter()
            .filter(|p| p.key() != key && p.status.pid != 0)
            .map(|p| p.status.pid)
            .collect();
        let matcher = matcher_for(spec, self.config.check_alive_timeout());
        match self.scanner.find(matcher.as_ref(), &owned).await {
            Ok(found) => found,
            Err(e) => {
                warn!(key = %key, "process table scan failed: {e}");
                None
            }
        }
    }

    /// Adopt `found` as the process of the entry at `generation`.
    async fn attach(&self, key: &str, generation: u64, found: &SysProcess) -> bool {
        let sampled = found.clone();
        let stats = tokio::task::spawn_blocking(move || stats_of(&sampled))
            .await
            .unwrap_or_default();
        let attached = self
            .registry
            .try_update(key, |e| {
                if e.generation != generation {
                    return None;
                }
                e.generation += 1;
                e.watched = false;
                let status = &mut e.process.status;
                status.phase = Phase::Running;
                status.pid = found.pid;
                status.start_time = found.start_time;
                status.resources = stats;
                status.set_condition(
                    ConditionType::Reattached,
                    true,
                    "ProcessFound",
                    format!("pid {}", found.pid),
                );
                Some((e.generation, e.process.spec.health_check.clone()))
            })
            .await
            .flatten();
        let Some((next, health)) = attached else {
            debug!(key = %key, "reattach superseded");
            return false;
        };

        info!(key = %key, pid = found.pid, "reattached");
        self.persist().await;
        self.events
            .emit(key, EventKind::Reattached, found.pid, "");
        self.spawn_monitors(key, next, health);
        true
    }

    /// Resolve every `Unknown` entry, typically right after loading state.
    ///
    /// The recorded pid is kept when it is alive and still matches the spec;
    /// otherwise the process table is searched. Entries with no live process
    /// become `Stopped` and are started again under `Always`/`OnFailure`.
    pub async fn reconcile(&self) {
        let keys = self
            .registry
            .keys_where(|e| e.process.status.phase == Phase::Unknown)
            .await;
        for key in keys {
            self.reconcile_one(&key).await;
        }
    }

    async fn reconcile_one(&self, key: &str) {
        let Some((generation, process)) = self
            .registry
            .try_update(key, |e| (e.generation, e.process.clone()))
            .await
        else {
            return;
        };
        if process.status.phase != Phase::Unknown {
            return;
        }

        let pid = process.status.pid;
        if pid != 0 {
            let recorded = with_probe(&self.probe, move |probe| probe.process(pid))
                .await
                .ok()
                .flatten();
            if let Some(p) = recorded {
                let matcher = matcher_for(&process.spec, self.config.check_alive_timeout());
                if matcher.matches(&p).await.is_match() {
                    self.attach(key, generation, &p).await;
                    return;
                }
            }
        }
        if let Some(found) = self.find_process(key, &process.spec).await {
            self.attach(key, generation, &found).await;
            return;
        }

        let lost = self
            .registry
            .try_update(key, |e| {
                if e.generation != generation || e.process.status.phase != Phase::Unknown {
                    return None;
                }
                e.process.status.phase = Phase::Stopped;
                e.process.status.pid = 0;
                e.generation += 1;
                Some((e.generation, e.process.spec.restart_policy))
            })
            .await
            .flatten();
        if let Some((next, policy)) = lost {
            info!(key = %key, "no live process found, marked stopped");
            self.persist().await;
            if policy.recovers_lost_process() {
                self.restart_generation(key, next).await;
            }
        }
    }

    /// Sample and store the stats of a running process on demand.
    pub async fn monitor_process(&self, namespace: &str, name: &str) -> Result<ResourceStats> {
        let key = process_key(namespace, name);
        let process = self.registry.get(&key).await?;
        let pid = process.status.pid;
        if !process.is_running() || pid == 0 {
            return Err(SupervisorError::NotRunning(key));
        }

        let stats = self.sample(pid).await?;
        self.registry
            .update(&key, |e| {
                if e.process.status.pid == pid {
                    e.process.status.resources = stats.clone();
                }
                Ok(())
            })
            .await?;
        Ok(stats)
    }
}
