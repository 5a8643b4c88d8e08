use std::process::{Child, Command};
use std::sync::Arc;
use std::time::Duration;

use ::common::{ConditionType, ExecConfig, Phase, RestartPolicy};
use rkp::exec::CommandLauncher;
use rkp::probe::SystemProbe;
use rkp::scanner::{AttributeMatcher, Scanner};
use rkp::{EventKind, Registry, Supervisor, SupervisorError};
use serial_test::serial;

mod common;
use crate::common::*;

/// A `sleep` with a distinctive argument, owned by the test rather than a supervisor.
struct Sleeper(Child);

impl Sleeper {
    fn spawn(secs: &str) -> Self {
        let child = Command::new("sleep").arg(secs).spawn().unwrap();
        std::thread::sleep(Duration::from_millis(100));
        Sleeper(child)
    }

    fn pid(&self) -> u32 {
        self.0.id()
    }

    fn kill(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

impl Drop for Sleeper {
    fn drop(&mut self) {
        self.kill();
    }
}

fn scanner() -> Scanner {
    Scanner::new(Arc::new(SystemProbe::new()), Duration::from_secs(5))
}

#[tokio::test]
#[serial]
async fn test_scan_without_match_is_empty() {
    let res = scanner().scan("rkp-no-such-process-7f3a").await.unwrap();
    assert!(res.is_empty());
}

#[tokio::test]
#[serial]
async fn test_scan_by_pattern() {
    let sleeper = Sleeper::spawn("4321");
    let res = scanner().scan(r"^sleep 4321$").await.unwrap();
    assert_eq!(res.len(), 1);

    let p = &res[0];
    assert_eq!(p.status.pid, sleeper.pid());
    assert_eq!(p.status.phase, Phase::Running);
    assert_eq!(p.spec.exec.command, "sleep");
    assert_eq!(p.spec.exec.args, vec!["4321"]);
    assert!(p.spec.working_dir.is_some());
    assert!(p.spec.user.is_some());
    assert!(p.status.start_time.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn test_scan_skips_threads() {
    let exe = std::env::current_exe().unwrap();
    let name = exe.file_name().unwrap().to_string_lossy().into_owned();
    // Our own pid is excluded, so only our threads could show up.
    let res = scanner().scan(&regex::escape(&name)).await.unwrap();
    let pids: Vec<u32> = res.iter().map(|p| p.status.pid).collect();
    assert!(pids.is_empty(), "threads reported as processes: {pids:?}");
}

#[tokio::test]
#[serial]
async fn test_scan_by_script_file() {
    let sleeper = Sleeper::spawn("4322");
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("find.sh");
    std::fs::write(&script, format!("echo {}\necho garbage\n", sleeper.pid())).unwrap();

    let res = scanner()
        .scan(&format!("file:{}", script.display()))
        .await
        .unwrap();
    assert_eq!(res.len(), 1);
    assert_eq!(res[0].status.pid, sleeper.pid());

    let missing = scanner().scan("file:/nonexistent/find.sh").await;
    assert!(matches!(
        missing,
        Err(SupervisorError::ScriptExecution { .. })
    ));
}

#[tokio::test]
#[serial]
async fn test_get_by_pid() {
    let me = scanner().get_by_pid(std::process::id()).await.unwrap();
    assert_eq!(me.status.pid, std::process::id());
    assert!(me.status.resources.memory_rss_bytes > 0);
    assert!(!me.spec.env.is_empty());

    assert!(matches!(
        scanner().get_by_pid(4_194_305).await,
        Err(SupervisorError::ProcessNotFound(4_194_305))
    ));
}

#[tokio::test]
#[serial]
async fn test_find_with_exclusions() {
    let sleeper = Sleeper::spawn("4323");
    let matcher = AttributeMatcher::new(&ExecConfig::new("/bin/sleep", vec!["4323"]), None);

    let found = scanner().find(&matcher, &[]).await.unwrap().unwrap();
    assert_eq!(found.pid, sleeper.pid());
    assert!(
        scanner()
            .find(&matcher, &[sleeper.pid()])
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_reconcile_reattaches_and_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("state.yaml");
    let mut sleeper = Sleeper::spawn("3141");

    let mut p = process("orphan", "sleep", vec!["3141"]);
    p.spec.restart_policy = RestartPolicy::Always;
    p.status.phase = Phase::Running;
    p.status.pid = sleeper.pid();
    let saved = Registry::new();
    saved.insert(p).await.unwrap();
    saved.save(&state).await.unwrap();

    let loaded = Registry::load(&state).await.unwrap();
    let sup = Supervisor::with_parts(
        test_config(dir.path()),
        loaded,
        Arc::new(CommandLauncher),
    );
    assert_eq!(
        sup.get_status("default", "orphan").await.unwrap().status.phase,
        Phase::Unknown
    );

    sup.reconcile().await;
    let p = sup.get_status("default", "orphan").await.unwrap();
    assert_eq!(p.status.phase, Phase::Running);
    assert_eq!(p.status.pid, sleeper.pid());
    assert!(
        p.status
            .condition(ConditionType::Reattached)
            .is_some_and(|c| c.status)
    );

    // Not our child: only the liveness loop notices it is gone, and nothing
    // else matches, so a fresh process is started.
    let old_pid = sleeper.pid();
    sleeper.kill();
    let p = wait_for(&sup, "orphan", Duration::from_secs(10), |p| {
        p.status.phase == Phase::Running && p.status.pid != old_pid
    })
    .await;
    assert_eq!(p.status.restart_count, 1);
    assert!(
        p.status
            .condition(ConditionType::Reattached)
            .is_some_and(|c| !c.status)
    );

    sup.delete("default", "orphan").await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_reconcile_by_check_alive_script() {
    let dir = tempfile::tempdir().unwrap();
    let sleeper = Sleeper::spawn("2719");

    let mut p = process("scripted", "sleep", vec!["9999"]);
    p.spec.check_alive = Some(ExecConfig::new(
        "sh",
        vec![
            "-c".to_string(),
            format!("[ \"$1\" = {} ]", sleeper.pid()),
            "check".to_string(),
        ],
    ));
    p.status.phase = Phase::Unknown;
    let registry = Registry::new();
    registry.insert(p).await.unwrap();
    let sup = Supervisor::with_parts(
        test_config(dir.path()),
        registry,
        Arc::new(CommandLauncher),
    );

    sup.reconcile().await;
    let p = sup.get_status("default", "scripted").await.unwrap();
    assert_eq!(p.status.phase, Phase::Running);
    assert_eq!(p.status.pid, sleeper.pid());
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_reconcile_without_match() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Registry::new();

    let mut gone = process("gone", "sleep", vec!["2718"]);
    gone.status.phase = Phase::Unknown;
    gone.status.pid = 4_194_305;
    registry.insert(gone).await.unwrap();

    let mut revived = process("revived", "sleep", vec!["2717"]);
    revived.spec.restart_policy = RestartPolicy::OnFailure;
    revived.status.phase = Phase::Unknown;
    registry.insert(revived).await.unwrap();

    let sup = Supervisor::with_parts(
        test_config(dir.path()),
        registry,
        Arc::new(CommandLauncher),
    );
    sup.reconcile().await;

    let gone = sup.get_status("default", "gone").await.unwrap();
    assert_eq!(gone.status.phase, Phase::Stopped);
    assert_eq!(gone.status.pid, 0);
    assert_eq!(gone.status.restart_count, 0);

    let revived = sup.get_status("default", "revived").await.unwrap();
    assert_eq!(revived.status.phase, Phase::Running);
    assert_eq!(revived.status.restart_count, 1);
    sup.delete("default", "revived").await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_reload_state_while_running() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("state.yaml");
    let mut config = test_config(dir.path());
    config.state_file = Some(state.clone());

    let first = Supervisor::new(config.clone());
    first
        .create(process("survivor", "sleep", vec!["2999"]))
        .await
        .unwrap();
    first.start("default", "survivor").await.unwrap();
    let pid = first
        .get_status("default", "survivor")
        .await
        .unwrap()
        .status
        .pid;

    // The first supervisor never shuts down; only its state file is left.
    let loaded = Registry::load(&state).await.unwrap();
    let saved = loaded.get("default/survivor").await.unwrap();
    assert_eq!(saved.status.phase, Phase::Unknown);
    assert_eq!(saved.status.pid, pid);

    let second = Supervisor::with_parts(config, loaded, Arc::new(CommandLauncher));
    second.reconcile().await;
    let p = second.get_status("default", "survivor").await.unwrap();
    assert_eq!(p.status.phase, Phase::Running);
    assert_eq!(p.status.pid, pid);
    assert!(
        p.status
            .condition(ConditionType::Reattached)
            .is_some_and(|c| c.status)
    );

    second.stop("default", "survivor").await.unwrap();
    let saved = Registry::load(&state)
        .await
        .unwrap()
        .get("default/survivor")
        .await
        .unwrap();
    assert_eq!(saved.status.pid, 0);
    assert_ne!(saved.status.phase, Phase::Running);
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_lost_process_without_recovery() {
    for (secs, policy) in [("2998", RestartPolicy::Never), ("2997", RestartPolicy::OnSuccess)] {
        let dir = tempfile::tempdir().unwrap();
        let mut sleeper = Sleeper::spawn(secs);

        let mut p = process("adopted", "sleep", vec![secs]);
        p.spec.restart_policy = policy;
        p.status.phase = Phase::Unknown;
        p.status.pid = sleeper.pid();
        let registry = Registry::new();
        registry.insert(p).await.unwrap();
        let sup = Supervisor::with_parts(
            test_config(dir.path()),
            registry,
            Arc::new(CommandLauncher),
        );

        sup.reconcile().await;
        let p = sup.get_status("default", "adopted").await.unwrap();
        assert_eq!(p.status.phase, Phase::Running);
        assert_eq!(p.status.pid, sleeper.pid());

        let mut events = sup.subscribe();
        sleeper.kill();
        wait_for(&sup, "adopted", Duration::from_secs(10), |p| {
            p.status.phase == Phase::Stopped
        })
        .await;
        tokio::time::sleep(Duration::from_millis(1500)).await;

        let p = sup.get_status("default", "adopted").await.unwrap();
        assert_eq!(p.status.phase, Phase::Stopped, "{policy:?}");
        assert_eq!(p.status.pid, 0);
        assert_eq!(p.status.restart_count, 0);

        let mut kinds = Vec::new();
        while let Ok(ev) = events.try_recv() {
            kinds.push(ev.kind);
        }
        assert!(kinds.contains(&EventKind::Lost), "{kinds:?}");
        assert!(
            !kinds.iter().any(|k| matches!(
                k,
                EventKind::Started | EventKind::Reattached | EventKind::ReattachFailed
            )),
            "{policy:?}: {kinds:?}"
        );
    }
}
