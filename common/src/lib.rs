use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

pub mod mount;
pub mod stats;

pub use mount::{Mount, MountType, Propagation};
pub use stats::{ListeningPort, PortProtocol, ResourceStats};

pub const DEFAULT_NAMESPACE: &str = "default";

/// Restart interval applied when a spec does not declare one.
pub const DEFAULT_RESTART_INTERVAL_SECS: u64 = 5;

pub fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

/// Registry key of a managed process, `namespace/name`.
///
/// An empty namespace is treated as [`DEFAULT_NAMESPACE`].
pub fn process_key(namespace: &str, name: &str) -> String {
    let namespace = if namespace.is_empty() {
        DEFAULT_NAMESPACE
    } else {
        namespace
    };
    format!("{namespace}/{name}")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Generated when the process is created.
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub creation_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

impl ObjectMeta {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        ObjectMeta {
            name: name.into(),
            namespace: namespace.into(),
            uid: String::new(),
            creation_timestamp: None,
            labels: HashMap::new(),
            annotations: HashMap::new(),
        }
    }

    pub fn key(&self) -> String {
        process_key(&self.namespace, &self.name)
    }
}

/// A command line: the executable and its arguments.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ExecConfig {
    pub fn new<S: Into<String>>(command: impl Into<String>, args: Vec<S>) -> Self {
        ExecConfig {
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnvVar {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

impl EnvVar {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        EnvVar {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleHooks {
    #[serde(default)]
    pub pre_start: Option<ExecConfig>,
    #[serde(default)]
    pub post_stop: Option<ExecConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum Probe {
    Exec(ExecConfig),
    Tcp {
        #[serde(default = "default_probe_host")]
        host: String,
        port: u16,
    },
    /// Any 2xx or 3xx answer counts as healthy.
    Http { url: String },
}

fn default_probe_host() -> String {
    "127.0.0.1".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    pub probe: Probe,
    #[serde(default = "default_period_secs")]
    pub period_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

fn default_period_secs() -> u64 {
    10
}

fn default_timeout_secs() -> u64 {
    1
}

fn default_failure_threshold() -> u32 {
    3
}

/// A file written before the process is launched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigFile {
    pub path: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub mode: Option<u32>,
}

/// Application level configuration, swapped as a unit by `update_config`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub files: Vec<ConfigFile>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum RestartPolicy {
    Always,
    OnFailure,
    OnSuccess,
    #[default]
    Never,
}

impl RestartPolicy {
    /// Whether a process that terminated with `outcome` should be started again.
    pub fn should_restart(&self, outcome: &LastTerminationInfo) -> bool {
        match self {
            RestartPolicy::Always => true,
            RestartPolicy::OnFailure => !outcome.succeeded(),
            RestartPolicy::OnSuccess => outcome.succeeded(),
            RestartPolicy::Never => false,
        }
    }

    /// Policies under which an unexplained disappearance is worth recovering from.
    pub fn recovers_lost_process(&self) -> bool {
        matches!(self, RestartPolicy::Always | RestartPolicy::OnFailure)
    }
}

/// Desired state of a managed process.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSpec {
    pub exec: ExecConfig,
    #[serde(default)]
    pub stop_command: Option<ExecConfig>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    #[serde(default)]
    pub restart_interval_secs: Option<u64>,
    #[serde(default)]
    pub lifecycle: LifecycleHooks,
    #[serde(default)]
    pub health_check: Option<HealthCheck>,
    /// Script used to recognise the process in the OS process table.
    /// It is invoked with the candidate pid appended to its arguments.
    #[serde(default)]
    pub check_alive: Option<ExecConfig>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub log_dir: Option<String>,
    #[serde(default)]
    pub app_config: AppConfig,
}

impl ProcessSpec {
    pub fn restart_interval(&self) -> Duration {
        Duration::from_secs(
            self.restart_interval_secs
                .unwrap_or(DEFAULT_RESTART_INTERVAL_SECS),
        )
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Phase {
    Pending,
    Running,
    Stopping,
    #[default]
    Stopped,
    Failed,
    Unknown,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Pending => "Pending",
            Phase::Running => "Running",
            Phase::Stopping => "Stopping",
            Phase::Stopped => "Stopped",
            Phase::Failed => "Failed",
            Phase::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LastTerminationInfo {
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub signal: Option<i32>,
    #[serde(default)]
    pub message: String,
    pub finished_at: DateTime<Utc>,
}

impl LastTerminationInfo {
    /// A clean exit: status code 0 and no terminating signal.
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0) && self.signal.is_none()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConditionType {
    /// Result of the declared health probe.
    Healthy,
    /// Outcome of the last restart scheduled by the restart policy.
    AutoRestart,
    /// Outcome of the last attempt to find a vanished process again.
    Reattached,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    pub status: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

/// Observed state of a managed process.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessStatus {
    #[serde(default)]
    pub phase: Phase,
    /// 0 when no OS process is attached.
    #[serde(default)]
    pub pid: u32,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_termination: Option<LastTerminationInfo>,
    #[serde(default)]
    pub restart_count: u32,
    #[serde(default)]
    pub resources: ResourceStats,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl ProcessStatus {
    /// Set a condition, keeping its transition time unless the status flips.
    pub fn set_condition(
        &mut self,
        condition_type: ConditionType,
        status: bool,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) {
        let reason = reason.into();
        let message = message.into();
        match self
            .conditions
            .iter_mut()
            .find(|c| c.condition_type == condition_type)
        {
            Some(c) => {
                if c.status != status {
                    c.last_transition_time = Utc::now();
                }
                c.status = status;
                c.reason = reason;
                c.message = message;
            }
            None => self.conditions.push(Condition {
                condition_type,
                status,
                reason,
                message,
                last_transition_time: Utc::now(),
            }),
        }
    }

    pub fn condition(&self, condition_type: ConditionType) -> Option<&Condition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }
}

/// The unit of supervision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManagedProcess {
    pub metadata: ObjectMeta,
    pub spec: ProcessSpec,
    #[serde(default)]
    pub status: ProcessStatus,
}

impl ManagedProcess {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: ProcessSpec) -> Self {
        ManagedProcess {
            metadata: ObjectMeta::new(namespace, name),
            spec,
            status: ProcessStatus::default(),
        }
    }

    pub fn key(&self) -> String {
        self.metadata.key()
    }

    pub fn is_running(&self) -> bool {
        self.status.phase == Phase::Running
    }
}
