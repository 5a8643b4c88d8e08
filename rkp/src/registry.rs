use std::collections::HashMap;
use std::path::Path;

use common::{ManagedProcess, Phase};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Result, SupervisorError};

/// A registry slot: the owned process plus supervisor bookkeeping.
pub(crate) struct Entry {
    pub process: ManagedProcess,
    /// Bumped by every start, stop, reattach and lost-process transition.
    /// Background tasks remember the generation they were spawned for and
    /// give up once it moves on.
    pub generation: u64,
    /// An exit watcher currently owns the OS child of this entry.
    pub watched: bool,
}

impl Entry {
    fn new(process: ManagedProcess) -> Self {
        Entry {
            process,
            generation: 0,
            watched: false,
        }
    }
}

/// Owner of every managed process, keyed by `namespace/name`.
///
/// All reads and in-place mutations go through one mutex. Closures passed to
/// [`Registry::update`] run inside the critical section and must not block.
#[derive(Default)]
pub struct Registry {
    entries: Mutex<HashMap<String, Entry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a process, failing if its key is already taken.
    pub async fn insert(&self, process: ManagedProcess) -> Result<()> {
        let key = process.key();
        let mut entries = self.entries.lock().await;
        if entries.contains_key(&key) {
            return Err(SupervisorError::AlreadyManaged(key));
        }
        entries.insert(key, Entry::new(process));
        Ok(())
    }

    /// A copy of the process stored under `key`.
    pub async fn get(&self, key: &str) -> Result<ManagedProcess> {
        let entries = self.entries.lock().await;
        entries
            .get(key)
            .map(|e| e.process.clone())
            .ok_or_else(|| SupervisorError::NotManaged(key.to_string()))
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.entries.lock().await.contains_key(key)
    }

    /// Copies of all processes, optionally restricted to one namespace, sorted by key.
    pub async fn list(&self, namespace: Option<&str>) -> Vec<ManagedProcess> {
        let entries = self.entries.lock().await;
        let mut res: Vec<_> = entries
            .values()
            .filter(|e| namespace.is_none_or(|ns| e.process.metadata.namespace == ns))
            .map(|e| e.process.clone())
            .collect();
        res.sort_by_key(|p| p.key());
        res
    }

    pub async fn remove(&self, key: &str) -> Result<ManagedProcess> {
        let mut entries = self.entries.lock().await;
        entries
            .remove(key)
            .map(|e| e.process)
            .ok_or_else(|| SupervisorError::NotManaged(key.to_string()))
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Run `f` on the entry under the registry lock.
    pub(crate) async fn update<T>(
        &self,
        key: &str,
        f: impl FnOnce(&mut Entry) -> Result<T>,
    ) -> Result<T> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .get_mut(key)
            .ok_or_else(|| SupervisorError::NotManaged(key.to_string()))?;
        f(entry)
    }

    /// Like [`Registry::update`] for background tasks, where a vanished entry is not an error.
    pub(crate) async fn try_update<T>(&self, key: &str, f: impl FnOnce(&mut Entry) -> T) -> Option<T> {
        let mut entries = self.entries.lock().await;
        entries.get_mut(key).map(f)
    }

    /// Keys of all entries matching `pred`.
    pub(crate) async fn keys_where(&self, pred: impl Fn(&Entry) -> bool) -> Vec<String> {
        let entries = self.entries.lock().await;
        let mut keys: Vec<_> = entries
            .iter()
            .filter(|(_, e)| pred(e))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Serialize every process to a YAML file, replacing it atomically.
    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let processes = self.list(None).await;
        let content = serde_yaml::to_string(&processes)?;
        if let Some(parent) = path.as_ref().parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut tmp = path.as_ref().as_os_str().to_owned();
        tmp.push(".tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, path.as_ref()).await?;
        debug!(
            "saved {} processes to {}",
            processes.len(),
            path.as_ref().display()
        );
        Ok(())
    }

    /// Build a registry from a file written by [`Registry::save`].
    ///
    /// Processes that were active when saved come back as [`Phase::Unknown`]
    /// because nothing has checked them since.
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Registry> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        let processes: Vec<ManagedProcess> = if content.trim().is_empty() {
            Vec::new()
        } else {
            serde_yaml::from_str(&content)?
        };

        let registry = Registry::new();
        for mut p in processes {
            if matches!(
                p.status.phase,
                Phase::Pending | Phase::Running | Phase::Stopping
            ) {
                p.status.phase = Phase::Unknown;
            }
            if let Err(e) = registry.insert(p).await {
                warn!("Skipping duplicate entry in {}: {e}", path.as_ref().display());
            }
        }
        Ok(registry)
    }
}
