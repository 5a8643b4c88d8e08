//! Bind, tmpfs and named-volume mounts scoped to a process run.
//!
//! Mount syscalls only exist on Linux; elsewhere [`MountOrchestrator::apply`]
//! and [`MountOrchestrator::cleanup`] do nothing.

use std::collections::HashSet;
use std::path::PathBuf;

use common::Mount;

use crate::error::Result;

/// Keep the first declaration of every mount key, preserving order.
///
/// The key is the mount id when present, otherwise `type|target|source|name`.
pub fn dedup_mounts(mounts: &[Mount]) -> Vec<Mount> {
    let mut seen = HashSet::new();
    mounts
        .iter()
        .filter(|m| seen.insert(m.dedup_key()))
        .cloned()
        .collect()
}

#[derive(Debug, Clone)]
pub struct MountOrchestrator {
    volumes_dir: PathBuf,
    default_tmpfs_size_mb: u64,
}

impl MountOrchestrator {
    pub fn new(volumes_dir: impl Into<PathBuf>, default_tmpfs_size_mb: u64) -> Self {
        MountOrchestrator {
            volumes_dir: volumes_dir.into(),
            default_tmpfs_size_mb,
        }
    }

    /// Backing directory of a named volume.
    pub fn volume_path(&self, name: &str) -> PathBuf {
        self.volumes_dir.join(name)
    }

    /// Attach every mount in order, stopping at the first failure.
    ///
    /// Mounts applied before the failing one stay in place; the caller owns
    /// cleaning them up.
    pub fn apply(&self, mounts: &[Mount]) -> Result<()> {
        if mounts.is_empty() {
            return Ok(());
        }
        self.apply_mounts(mounts)
    }

    /// Lazily detach every declared target that is currently mounted.
    ///
    /// Targets that are not mount points are skipped, so calling this twice is harmless.
    pub fn cleanup(&self, mounts: &[Mount]) -> Result<()> {
        if mounts.is_empty() {
            return Ok(());
        }
        self.cleanup_mounts(mounts)
    }

    #[cfg(not(target_os = "linux"))]
    fn apply_mounts(&self, mounts: &[Mount]) -> Result<()> {
        tracing::debug!("mounts are not supported on this platform, skipped {}", mounts.len());
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn cleanup_mounts(&self, _mounts: &[Mount]) -> Result<()> {
        Ok(())
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use std::collections::HashSet;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    use common::{Mount, MountType, Propagation};
    use nix::errno::Errno;
    use nix::mount::{MntFlags, MsFlags, mount, umount2};
    use nix::unistd::{Gid, Uid, chown};
    use tracing::{debug, info, warn};

    use super::MountOrchestrator;
    use crate::error::{Result, SupervisorError};

    fn mount_error(index: usize, m: &Mount, reason: impl ToString) -> SupervisorError {
        SupervisorError::Mount {
            index,
            target: m.target.clone(),
            reason: reason.to_string(),
        }
    }

    fn propagation_flags(p: Propagation) -> MsFlags {
        let base = match p {
            Propagation::Private | Propagation::Rprivate => MsFlags::MS_PRIVATE,
            Propagation::Shared | Propagation::Rshared => MsFlags::MS_SHARED,
            Propagation::Slave | Propagation::Rslave => MsFlags::MS_SLAVE,
            Propagation::Unbindable | Propagation::Runbindable => MsFlags::MS_UNBINDABLE,
        };
        if p.is_recursive() {
            base | MsFlags::MS_REC
        } else {
            base
        }
    }

    fn prepare_target(m: &Mount) -> std::io::Result<()> {
        let target = Path::new(&m.target);
        fs::create_dir_all(target)?;
        if let Some(mode) = m.mode {
            fs::set_permissions(target, fs::Permissions::from_mode(mode))?;
        }
        if m.uid.is_some() || m.gid.is_some() {
            chown(target, m.uid.map(Uid::from_raw), m.gid.map(Gid::from_raw))?;
        }
        Ok(())
    }

    fn bind(source: &Path, m: &Mount) -> nix::Result<()> {
        let target = Path::new(&m.target);
        let mut flags = MsFlags::MS_BIND;
        if m.recursive {
            flags |= MsFlags::MS_REC;
        }
        mount(Some(source), target, None::<&str>, flags, None::<&str>)?;

        if m.read_only {
            // MS_RDONLY is ignored on the initial bind and needs a remount.
            mount(
                None::<&str>,
                target,
                None::<&str>,
                flags | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                None::<&str>,
            )?;
        }

        if let Some(p) = m.propagation {
            if p.is_recursive() && !m.recursive {
                warn!(
                    "recursive propagation {p:?} on non-recursive bind {}",
                    m.target
                );
            }
            mount(
                None::<&str>,
                target,
                None::<&str>,
                propagation_flags(p),
                None::<&str>,
            )?;
        }
        Ok(())
    }

    fn tmpfs(m: &Mount, size_mb: u64) -> nix::Result<()> {
        let mut data = format!("size={size_mb}m");
        if let Some(mode) = m.mode {
            data.push_str(&format!(",mode={mode:o}"));
        }
        let mut flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV;
        if m.read_only {
            flags |= MsFlags::MS_RDONLY;
        }
        mount(
            Some("tmpfs"),
            Path::new(&m.target),
            Some("tmpfs"),
            flags,
            Some(data.as_str()),
        )
    }

    /// Mount points of the current mount namespace.
    fn mounted_targets() -> Option<HashSet<PathBuf>> {
        let infos = procfs::process::Process::myself()
            .and_then(|p| p.mountinfo())
            .map_err(|e| warn!("Failed to read mountinfo: {e}"))
            .ok()?;
        Some(infos.into_iter().map(|mi| mi.mount_point).collect())
    }

    impl MountOrchestrator {
        pub(super) fn apply_mounts(&self, mounts: &[Mount]) -> Result<()> {
            for (index, m) in mounts.iter().enumerate() {
                m.validate().map_err(|e| mount_error(index, m, e))?;

                if m.create_target {
                    prepare_target(m).map_err(|e| mount_error(index, m, e))?;
                }

                let res = match m.mount_type {
                    MountType::Bind => bind(Path::new(&m.source), m),
                    MountType::Tmpfs => {
                        tmpfs(m, m.tmpfs_size_mb.unwrap_or(self.default_tmpfs_size_mb))
                    }
                    MountType::Named => {
                        let source = self.volume_path(&m.name);
                        fs::create_dir_all(&source).map_err(|e| mount_error(index, m, e))?;
                        bind(&source, m)
                    }
                };
                res.map_err(|e| mount_error(index, m, e))?;
                info!("mounted {} on {}", m.mount_type, m.target);
            }
            Ok(())
        }

        pub(super) fn cleanup_mounts(&self, mounts: &[Mount]) -> Result<()> {
            let mounted = mounted_targets();
            let mut first_err = None;

            for (index, m) in mounts.iter().enumerate().rev() {
                let target = Path::new(&m.target);
                if let Some(mounted) = &mounted
                    && !mounted.contains(target)
                {
                    debug!("{} is not mounted, skipped", m.target);
                    continue;
                }
                match umount2(target, MntFlags::MNT_DETACH) {
                    Ok(()) => info!("unmounted {}", m.target),
                    Err(Errno::EINVAL) | Err(Errno::ENOENT) => {
                        debug!("{} is already unmounted", m.target)
                    }
                    Err(e) => {
                        warn!("Failed to unmount {}: {e}", m.target);
                        if first_err.is_none() {
                            first_err = Some(mount_error(index, m, e));
                        }
                    }
                }
            }

            match first_err {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
    }
}
