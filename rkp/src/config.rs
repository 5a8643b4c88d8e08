use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Supervisor settings, loaded from YAML. Every field has a default.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Where the registry is persisted after mutating operations.
    pub state_file: Option<PathBuf>,
    /// Default directory for process stdout/stderr logs.
    pub log_dir: PathBuf,
    /// Backing directories of `named` mounts live here.
    pub volumes_dir: PathBuf,
    /// Static process manifests watched by the daemon.
    pub manifests_dir: Option<PathBuf>,
    pub start_timeout_secs: u64,
    pub stop_timeout_secs: u64,
    /// Grace period between SIGTERM and SIGKILL.
    pub kill_grace_secs: u64,
    /// Pause between stop and start in `restart`.
    pub restart_delay_secs: u64,
    pub check_alive_timeout_secs: u64,
    pub scan_timeout_secs: u64,
    pub hook_timeout_secs: u64,
    pub stats_interval_secs: u64,
    pub liveness_interval_secs: u64,
    pub manifest_sync_interval_secs: u64,
    pub default_tmpfs_size_mb: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        SupervisorConfig {
            state_file: None,
            log_dir: PathBuf::from("/var/log/rkp"),
            volumes_dir: PathBuf::from("/var/lib/rkp/volumes"),
            manifests_dir: None,
            start_timeout_secs: 30,
            stop_timeout_secs: 30,
            kill_grace_secs: 10,
            restart_delay_secs: 1,
            check_alive_timeout_secs: 5,
            scan_timeout_secs: 30,
            hook_timeout_secs: 30,
            stats_interval_secs: 5,
            liveness_interval_secs: 30,
            manifest_sync_interval_secs: 5,
            default_tmpfs_size_mb: 64,
        }
    }
}

impl SupervisorConfig {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_secs)
    }

    pub fn check_alive_timeout(&self) -> Duration {
        Duration::from_secs(self.check_alive_timeout_secs)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn hook_timeout(&self) -> Duration {
        Duration::from_secs(self.hook_timeout_secs)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_interval_secs)
    }

    pub fn manifest_sync_interval(&self) -> Duration {
        Duration::from_secs(self.manifest_sync_interval_secs)
    }

    /// Apply `RKP_*` environment overrides on top of the file values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("RKP_STATE_FILE") {
            self.state_file = Some(PathBuf::from(v));
        }
        if let Ok(v) = env::var("RKP_LOG_DIR") {
            self.log_dir = PathBuf::from(v);
        }
        if let Ok(v) = env::var("RKP_VOLUMES_DIR") {
            self.volumes_dir = PathBuf::from(v);
        }
        if let Ok(v) = env::var("RKP_MANIFESTS_DIR") {
            self.manifests_dir = Some(PathBuf::from(v));
        }
    }
}

pub fn load_config(path: &str) -> Result<SupervisorConfig> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read config from {path}"))?;
    let cfg: SupervisorConfig =
        serde_yaml::from_str(&content).context("Failed to parse YAML config")?;
    Ok(cfg)
}
