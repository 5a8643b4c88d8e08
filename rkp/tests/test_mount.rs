#![cfg(target_os = "linux")]

use std::path::{Path, PathBuf};
use std::time::Duration;

use ::common::{Mount, Phase};
use rkp::SupervisorError;
use rkp::mount::MountOrchestrator;
use serial_test::serial;

mod common;
use crate::common::*;

fn is_mounted(target: &Path) -> bool {
    procfs::process::Process::myself()
        .and_then(|p| p.mountinfo())
        .unwrap()
        .into_iter()
        .any(|mi| mi.mount_point == target)
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_tmpfs_lives_with_the_process() {
    if !is_root() {
        eprintln!("skipping: mounting needs root");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("x");
    let mut tmpfs = Mount::tmpfs(target.to_str().unwrap(), 16);
    tmpfs.create_target = true;

    let sup = supervisor(dir.path());
    let mut p = process("scratch", "sleep", vec!["30"]);
    p.spec.mounts = vec![tmpfs];
    sup.create(p).await.unwrap();
    sup.start("default", "scratch").await.unwrap();
    assert!(is_mounted(&target));

    sup.stop("default", "scratch").await.unwrap();
    assert!(!is_mounted(&target));
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_mounts_cleaned_after_exit() {
    if !is_root() {
        eprintln!("skipping: mounting needs root");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src");
    std::fs::create_dir_all(&src).unwrap();
    std::fs::write(src.join("hello"), "hi").unwrap();
    let bind_target = dir.path().join("bound");
    let named_target = dir.path().join("named");

    let mut bind = Mount::bind(src.to_str().unwrap(), bind_target.to_str().unwrap());
    bind.create_target = true;
    bind.read_only = true;
    let mut named = Mount::named("cache", named_target.to_str().unwrap());
    named.create_target = true;

    let sup = supervisor(dir.path());
    let mut p = process("short", "sleep", vec!["1"]);
    p.spec.mounts = vec![bind, named];
    sup.create(p).await.unwrap();
    sup.start("default", "short").await.unwrap();

    assert_eq!(
        std::fs::read_to_string(bind_target.join("hello")).unwrap(),
        "hi"
    );
    assert!(std::fs::write(bind_target.join("nope"), "x").is_err());
    assert!(is_mounted(&named_target));
    assert!(dir.path().join("volumes/cache").is_dir());

    wait_for(&sup, "short", Duration::from_secs(10), |p| {
        p.status.phase == Phase::Stopped
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!is_mounted(&bind_target));
    assert!(!is_mounted(&named_target));
}

#[tokio::test]
#[serial]
async fn test_mount_failure_fails_start() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("target");
    let mut first = Mount::tmpfs(target.to_str().unwrap(), 16);
    first.create_target = true;
    let missing_source = Mount::bind(
        "/nonexistent/rkp-source",
        dir.path().join("second").to_str().unwrap(),
    );

    let sup = supervisor(dir.path());
    let mut p = process("broken", "sleep", vec!["30"]);
    p.spec.mounts = vec![first, missing_source];
    sup.create(p).await.unwrap();

    let err = sup.start("default", "broken").await.unwrap_err();
    let expected_index = if is_root() { 1 } else { 0 };
    assert!(
        matches!(err, SupervisorError::Mount { index, .. } if index == expected_index),
        "{err}"
    );
    let p = sup.get_status("default", "broken").await.unwrap();
    assert_eq!(p.status.phase, Phase::Failed);
    assert!(!is_mounted(&target));
}

#[test]
#[serial]
fn test_cleanup_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let target: PathBuf = dir.path().join("t");
    let mut tmpfs = Mount::tmpfs(target.to_str().unwrap(), 8);
    tmpfs.create_target = true;
    let mounts = vec![tmpfs];

    let orchestrator = MountOrchestrator::new(dir.path().join("volumes"), 64);
    if is_root() {
        orchestrator.apply(&mounts).unwrap();
        assert!(is_mounted(&target));
    }
    orchestrator.cleanup(&mounts).unwrap();
    orchestrator.cleanup(&mounts).unwrap();
    assert!(!is_mounted(&target));
}
