use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::{Path, PathBuf};

use anyhow::Context;
use common::ManagedProcess;
use tokio::fs::read_dir;
use tracing::{error, info, warn};

use crate::error::SupervisorError;
use crate::lifecycle::Supervisor;
use crate::mount::dedup_mounts;

/// Keeps the processes described by a manifest directory in the registry.
///
/// A manifest is a YAML `ManagedProcess`. New manifests are created and
/// started, removed ones are stopped and deleted, and a changed manifest is
/// treated as a removal followed by an addition.
pub struct StaticProcs {
    dir: PathBuf,
    /// Key to manifest hash of everything this loop created.
    applied: HashMap<String, u64>,
}

/// Hash of a manifest's YAML, insensitive to map ordering.
fn calculate_hash(p: &ManagedProcess) -> u64 {
    let t = serde_yaml::to_string(p).unwrap_or_default();
    let mut lines: Vec<_> = t.lines().collect();
    lines.sort();
    let mut s = DefaultHasher::new();
    lines.hash(&mut s);
    s.finish()
}

fn split_key(key: &str) -> (&str, &str) {
    key.split_once('/').unwrap_or(("", key))
}

impl StaticProcs {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        StaticProcs {
            dir: dir.into(),
            applied: HashMap::new(),
        }
    }

    pub fn applied(&self) -> impl Iterator<Item = &String> {
        self.applied.keys()
    }

    /// One pass of the sync loop. Errors are logged and retried on the next pass.
    pub async fn sync(&mut self, sup: &Supervisor) {
        let manifests = match read_manifests(&self.dir).await {
            Ok(m) => m,
            Err(e) => {
                error!("Failed to check static processes: {e:#}");
                return;
            }
        };
        let wanted: HashMap<String, (u64, ManagedProcess)> = manifests
            .into_iter()
            .map(|p| (p.key(), (calculate_hash(&p), p)))
            .collect();

        self.stop_removed(sup, &wanted).await;
        self.run_new(sup, wanted).await;
    }

    async fn stop_removed(&mut self, sup: &Supervisor, wanted: &HashMap<String, (u64, ManagedProcess)>) {
        let stale: Vec<String> = self
            .applied
            .iter()
            .filter(|(key, hash)| wanted.get(*key).is_none_or(|(h, _)| h != *hash))
            .map(|(key, _)| key.clone())
            .collect();

        for key in stale {
            let (namespace, name) = split_key(&key);
            match sup.delete(namespace, name).await {
                Ok(()) | Err(SupervisorError::NotManaged(_)) => {
                    info!(key = %key, "static process removed");
                    self.applied.remove(&key);
                }
                Err(e) => error!(key = %key, "Failed to remove static process: {e}"),
            }
        }
    }

    async fn run_new(&mut self, sup: &Supervisor, wanted: HashMap<String, (u64, ManagedProcess)>) {
        for (key, (hash, process)) in wanted {
            if self.applied.contains_key(&key) {
                continue;
            }
            let (namespace, name) = split_key(&key);

            match sup.create(process.clone()).await {
                Ok(_) => {}
                Err(SupervisorError::AlreadyManaged(_)) => {
                    // Left over from a previous run, e.g. loaded from the state file.
                    if !self.adopt(sup, &key, &process).await {
                        continue;
                    }
                    self.applied.insert(key, hash);
                    continue;
                }
                Err(e) => {
                    error!(key = %key, "Failed to create static process: {e}");
                    continue;
                }
            }

            match sup.start(namespace, name).await {
                Ok(()) => info!(key = %key, "static process started"),
                Err(e) => error!(key = %key, "Failed to start static process: {e}"),
            }
            self.applied.insert(key, hash);
        }
    }

    /// Take over a registered process whose spec equals the manifest;
    /// a differing one is deleted so the next pass recreates it.
    async fn adopt(&self, sup: &Supervisor, key: &str, manifest: &ManagedProcess) -> bool {
        let (namespace, name) = split_key(key);
        let Ok(existing) = sup.get_status(namespace, name).await else {
            return false;
        };
        let mut spec = manifest.spec.clone();
        spec.mounts = dedup_mounts(&spec.mounts);
        if existing.spec == spec {
            info!(key = %key, "adopted static process");
            return true;
        }
        warn!(key = %key, "manifest differs from registered process, replacing it");
        if let Err(e) = sup.delete(namespace, name).await {
            error!(key = %key, "Failed to replace static process: {e}");
        }
        false
    }
}

/// Parse every `*.yaml`/`*.yml` file in `path`; unparsable files are skipped.
async fn read_manifests<P: AsRef<Path>>(path: P) -> anyhow::Result<Vec<ManagedProcess>> {
    let path = path.as_ref();
    let mut entries = read_dir(path)
        .await
        .with_context(|| format!("Failed to read manifests dir {}", path.display()))?;
    let mut res = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("Failed to read entries of {}", path.display()))?
    {
        let file_path = entry.path();
        let is_yaml = file_path
            .extension()
            .is_some_and(|ext| ext == "yaml" || ext == "yml");
        if !is_yaml {
            continue;
        }
        match tokio::fs::read_to_string(&file_path).await {
            Ok(content) => match serde_yaml::from_str(&content) {
                Ok(p) => res.push(p),
                Err(e) => warn!("Failed to parse manifest {file_path:?}: {e}. Skipped."),
            },
            Err(e) => warn!("Failed to read manifest {file_path:?}: {e}. Skipped."),
        }
    }
    Ok(res)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::SupervisorConfig;
    use common::Phase;

    const MANIFEST: &str = r#"
metadata:
  name: idle
  labels:
    tier: test
    owner: rkp
spec:
  exec:
    command: sleep
    args: ["30"]
"#;

    fn supervisor(dir: &Path) -> Supervisor {
        Supervisor::new(SupervisorConfig {
            log_dir: dir.join("logs"),
            kill_grace_secs: 2,
            ..Default::default()
        })
    }

    #[test]
    fn test_hash_ignores_label_order() {
        let a: ManagedProcess = serde_yaml::from_str(MANIFEST).unwrap();
        let swapped = MANIFEST.replace(
            "    tier: test\n    owner: rkp",
            "    owner: rkp\n    tier: test",
        );
        let b: ManagedProcess = serde_yaml::from_str(&swapped).unwrap();
        assert_eq!(calculate_hash(&a), calculate_hash(&b));

        let mut c = a.clone();
        c.spec.exec.args = vec!["31".to_string()];
        assert_ne!(calculate_hash(&a), calculate_hash(&c));
    }

    #[tokio::test]
    async fn test_sync_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let manifests = dir.path().join("manifests");
        std::fs::create_dir_all(&manifests).unwrap();
        std::fs::write(manifests.join("broken.yaml"), "metadata: [").unwrap();
        std::fs::write(manifests.join("notes.txt"), "not a manifest").unwrap();

        let sup = supervisor(dir.path());
        let mut procs = StaticProcs::new(&manifests);
        procs.sync(&sup).await;
        assert!(sup.list(None).await.is_empty());
        assert_eq!(procs.applied().count(), 0);
    }

    #[tokio::test]
    async fn test_sync_starts_and_removes() {
        let dir = tempfile::tempdir().unwrap();
        let manifests = dir.path().join("manifests");
        std::fs::create_dir_all(&manifests).unwrap();
        std::fs::write(manifests.join("idle.yaml"), MANIFEST).unwrap();

        let sup = supervisor(dir.path());
        let mut procs = StaticProcs::new(&manifests);
        procs.sync(&sup).await;
        let p = sup.get_status("default", "idle").await.unwrap();
        assert_eq!(p.status.phase, Phase::Running);

        // A second pass with no change leaves the process alone.
        procs.sync(&sup).await;
        let again = sup.get_status("default", "idle").await.unwrap();
        assert_eq!(again.status.pid, p.status.pid);

        std::fs::remove_file(manifests.join("idle.yaml")).unwrap();
        procs.sync(&sup).await;
        assert!(sup.get_status("default", "idle").await.is_err());
        assert!(!crate::exec::pid_alive(p.status.pid));
    }
}
