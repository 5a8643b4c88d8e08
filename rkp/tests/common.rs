#![allow(dead_code)]

use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ::common::{ExecConfig, ManagedProcess, ProcessSpec, RestartPolicy};
use rkp::config::SupervisorConfig;
use rkp::exec::{CommandLauncher, LaunchRequest, Launcher};
use rkp::{Registry, Supervisor};
use tokio::process::Child;

/// Short timeouts and intervals, everything written below `dir`.
pub fn test_config(dir: &Path) -> SupervisorConfig {
    SupervisorConfig {
        log_dir: dir.join("logs"),
        volumes_dir: dir.join("volumes"),
        start_timeout_secs: 5,
        stop_timeout_secs: 2,
        kill_grace_secs: 2,
        restart_delay_secs: 0,
        check_alive_timeout_secs: 2,
        scan_timeout_secs: 5,
        hook_timeout_secs: 5,
        stats_interval_secs: 1,
        liveness_interval_secs: 1,
        ..Default::default()
    }
}

pub fn supervisor(dir: &Path) -> Supervisor {
    Supervisor::new(test_config(dir))
}

pub fn process<S: Into<String>>(name: &str, command: &str, args: Vec<S>) -> ManagedProcess {
    ManagedProcess::new(
        "",
        name,
        ProcessSpec {
            exec: ExecConfig::new(command, args),
            ..Default::default()
        },
    )
}

/// `sh -c <script>` with the given restart policy and a zero restart interval.
pub fn shell(name: &str, script: &str, policy: RestartPolicy) -> ManagedProcess {
    let mut p = process(name, "sh", vec!["-c", script]);
    p.spec.restart_policy = policy;
    p.spec.restart_interval_secs = Some(0);
    p
}

/// Poll the process until `pred` holds, panicking after `limit`.
pub async fn wait_for(
    sup: &Supervisor,
    name: &str,
    limit: Duration,
    pred: impl Fn(&ManagedProcess) -> bool,
) -> ManagedProcess {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        let p = sup.get_status("default", name).await.unwrap();
        if pred(&p) {
            return p;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {limit:?}, last status: {:?}", p.status);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Sleeps before delegating to [`CommandLauncher`], remembering the pid it got.
pub struct SlowLauncher {
    pub delay: Duration,
    pub last_pid: Arc<Mutex<Option<u32>>>,
}

impl SlowLauncher {
    pub fn new(delay: Duration) -> Self {
        SlowLauncher {
            delay,
            last_pid: Arc::new(Mutex::new(None)),
        }
    }
}

impl Launcher for SlowLauncher {
    fn launch(&self, req: &LaunchRequest) -> io::Result<Child> {
        std::thread::sleep(self.delay);
        let child = CommandLauncher.launch(req)?;
        *self.last_pid.lock().unwrap() = child.id();
        Ok(child)
    }
}

pub fn slow_supervisor(config: SupervisorConfig, launcher: SlowLauncher) -> Supervisor {
    Supervisor::with_parts(config, Registry::new(), Arc::new(launcher))
}

pub fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}
