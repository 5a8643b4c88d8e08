use std::fs::{self, File, OpenOptions};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Output, Stdio};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{ExecConfig, LastTerminationInfo};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::error::{Result, SupervisorError};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// How long a SIGKILLed process gets to disappear.
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Everything needed to exec one run of a managed process.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub key: String,
    pub program: String,
    pub args: Vec<String>,
    /// Added on top of the supervisor's own environment.
    pub env: Vec<(String, String)>,
    pub working_dir: PathBuf,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

/// Turns a [`LaunchRequest`] into a running child.
///
/// Always called from a blocking thread, so implementations may block.
pub trait Launcher: Send + Sync {
    fn launch(&self, req: &LaunchRequest) -> std::io::Result<Child>;
}

/// Launches through [`tokio::process::Command`].
pub struct CommandLauncher;

impl Launcher for CommandLauncher {
    fn launch(&self, req: &LaunchRequest) -> std::io::Result<Child> {
        let stdout = open_log(&req.stdout_path)?;
        let stderr = open_log(&req.stderr_path)?;

        let mut cmd = Command::new(&req.program);
        cmd.args(&req.args)
            .envs(req.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(&req.working_dir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        if let Some(gid) = req.gid {
            cmd.gid(gid);
        }
        if let Some(uid) = req.uid {
            cmd.uid(uid);
        }
        cmd.spawn()
    }
}

/// Open a log file for appending, creating it and its directory if needed.
pub fn open_log(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Launch on a blocking thread, giving up after `limit`.
///
/// A child that only appears after the deadline is killed straight away.
pub async fn launch_with_timeout(
    launcher: Arc<dyn Launcher>,
    req: LaunchRequest,
    limit: Duration,
) -> Result<Child> {
    let key = req.key.clone();
    let (tx, rx) = oneshot::channel();
    tokio::task::spawn_blocking(move || {
        let res = launcher.launch(&req);
        if let Err(Ok(mut child)) = tx.send(res) {
            warn!(
                "{} started after its deadline, killing pid {:?}",
                req.key,
                child.id()
            );
            let _ = child.start_kill();
        }
    });

    match timeout(limit, rx).await {
        Err(_) => Err(SupervisorError::StartTimeout {
            key,
            timeout: limit,
        }),
        Ok(Err(_)) => Err(SupervisorError::StartError {
            key,
            reason: "launcher exited without a result".to_string(),
        }),
        Ok(Ok(Err(e))) => Err(SupervisorError::StartError {
            key,
            reason: e.to_string(),
        }),
        Ok(Ok(Ok(child))) => Ok(child),
    }
}

/// Describe an exit status the way [`LastTerminationInfo`] stores it.
pub fn termination_info(status: &ExitStatus) -> LastTerminationInfo {
    LastTerminationInfo {
        exit_code: status.code(),
        signal: status.signal(),
        message: status.to_string(),
        finished_at: Utc::now(),
    }
}

fn describe(exec: &ExecConfig) -> String {
    if exec.args.is_empty() {
        exec.command.clone()
    } else {
        format!("{} {}", exec.command, exec.args.join(" "))
    }
}

/// Run a user declared command to completion and capture its output.
///
/// `extra_args` are appended after the declared arguments. The command is
/// killed if it outlives `limit`. A non-zero exit is returned as a normal
/// [`Output`]; only spawn failures and timeouts are errors.
pub async fn run_command(
    exec: &ExecConfig,
    extra_args: &[String],
    env: &[(String, String)],
    cwd: Option<&Path>,
    limit: Duration,
) -> Result<Output> {
    let mut cmd = Command::new(&exec.command);
    cmd.args(&exec.args)
        .args(extra_args)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }

    let child = cmd.spawn().map_err(|e| SupervisorError::ScriptExecution {
        command: describe(exec),
        reason: e.to_string(),
    })?;
    match timeout(limit, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(SupervisorError::ScriptExecution {
            command: describe(exec),
            reason: e.to_string(),
        }),
        // Dropping the future drops the child, which kills it.
        Err(_) => Err(SupervisorError::ScriptExecution {
            command: describe(exec),
            reason: format!("timed out after {limit:?}"),
        }),
    }
}

/// Like [`run_command`], but a non-zero exit is an error as well.
pub async fn run_checked(
    exec: &ExecConfig,
    extra_args: &[String],
    env: &[(String, String)],
    cwd: Option<&Path>,
    limit: Duration,
) -> Result<Output> {
    let output = run_command(exec, extra_args, env, cwd, limit).await?;
    if output.status.success() {
        return Ok(output);
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(SupervisorError::ScriptExecution {
        command: describe(exec),
        reason: format!("{}: {}", output.status, stderr.trim()),
    })
}

/// Probe a pid with signal 0.
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        // Exists, but owned by someone else.
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Poll until `pid` is gone or `limit` passes. Returns whether it exited.
pub async fn wait_for_exit(pid: u32, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while pid_alive(pid) {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        sleep(EXIT_POLL_INTERVAL).await;
    }
    true
}

fn signal(pid: u32, sig: Signal) -> Result<bool> {
    match kill(Pid::from_raw(pid as i32), sig) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(SupervisorError::ForceKill {
            pid,
            reason: format!("{sig:?}: {e}"),
        }),
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL.
pub async fn terminate(pid: u32, grace: Duration) -> Result<()> {
    if pid == 0 || !pid_alive(pid) {
        return Ok(());
    }

    debug!("sending SIGTERM to {pid}");
    if !signal(pid, Signal::SIGTERM)? || wait_for_exit(pid, grace).await {
        return Ok(());
    }

    warn!("pid {pid} ignored SIGTERM for {grace:?}, sending SIGKILL");
    if !signal(pid, Signal::SIGKILL)? || wait_for_exit(pid, KILL_WAIT).await {
        return Ok(());
    }
    Err(SupervisorError::StopTimeout {
        pid,
        waited: grace + KILL_WAIT,
    })
}
