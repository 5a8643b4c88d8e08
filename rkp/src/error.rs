use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("process {0} is already managed")]
    AlreadyManaged(String),

    #[error("process {0} is not managed")]
    NotManaged(String),

    #[error("process {0} is already running")]
    AlreadyRunning(String),

    #[error("process {0} is already stopped")]
    AlreadyStopped(String),

    #[error("process {0} is not running")]
    NotRunning(String),

    #[error("mount #{index} on {target} failed: {reason}")]
    Mount {
        index: usize,
        target: String,
        reason: String,
    },

    #[error("process {key} did not start within {timeout:?}")]
    StartTimeout { key: String, timeout: Duration },

    #[error("failed to start process {key}: {reason}")]
    StartError { key: String, reason: String },

    #[error("pid {pid} still alive after {waited:?}")]
    StopTimeout { pid: u32, waited: Duration },

    #[error("failed to kill pid {pid}: {reason}")]
    ForceKill { pid: u32, reason: String },

    #[error("script `{command}` failed: {reason}")]
    ScriptExecution { command: String, reason: String },

    #[error("resource probe failed: {0}")]
    ResourceProbe(String),

    #[error("invalid process spec: {0}")]
    InvalidSpec(String),

    #[error("invalid scan query: {0}")]
    InvalidQuery(String),

    #[error("no such process: {0}")]
    ProcessNotFound(u32),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
