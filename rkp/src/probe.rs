//! Read-only views of live OS processes.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use common::{ListeningPort, ResourceStats};
use nix::unistd::{Gid, Group, Uid, User};
use sysinfo::{Pid, ProcessRefreshKind, System, ThreadKind};
use tracing::warn;

use crate::error::{Result, SupervisorError};

/// One entry of the OS process table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SysProcess {
    pub pid: u32,
    pub name: String,
    pub exe: Option<PathBuf>,
    pub cmdline: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// `KEY=VALUE` strings; empty when the environment is unreadable.
    pub environ: Vec<String>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub start_time: Option<DateTime<Utc>>,
    pub cpu_percent: f32,
    pub memory_rss_bytes: u64,
    pub disk_read_bytes: u64,
    pub disk_write_bytes: u64,
}

impl SysProcess {
    pub fn command_line(&self) -> String {
        self.cmdline.join(" ")
    }

    fn from_sysinfo(pid: Pid, p: &sysinfo::Process) -> Self {
        let disk = p.disk_usage();
        SysProcess {
            pid: pid.as_u32(),
            name: p.name().to_string(),
            exe: p.exe().map(|e| e.to_path_buf()),
            cmdline: p.cmd().to_vec(),
            cwd: p.cwd().map(|c| c.to_path_buf()),
            environ: p.environ().to_vec(),
            uid: p.user_id().map(|u| **u),
            gid: p.group_id().map(|g| *g),
            start_time: DateTime::from_timestamp(p.start_time() as i64, 0),
            cpu_percent: p.cpu_usage(),
            memory_rss_bytes: p.memory(),
            disk_read_bytes: disk.total_read_bytes,
            disk_write_bytes: disk.total_written_bytes,
        }
    }
}

/// Process table access shared by the scanner and the monitor.
///
/// CPU usage is computed between two refreshes of the same table, so one
/// probe should live as long as the supervisor. All methods block.
pub struct SystemProbe {
    system: Mutex<System>,
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProbe {
    pub fn new() -> Self {
        SystemProbe {
            system: Mutex::new(System::new()),
        }
    }

    fn system(&self) -> std::sync::MutexGuard<'_, System> {
        self.system.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Refresh and return the whole process table.
    pub fn processes(&self) -> Vec<SysProcess> {
        let mut sys = self.system();
        sys.refresh_cpu();
        sys.refresh_processes_specifics(ProcessRefreshKind::everything());
        let mut res: Vec<_> = sys
            .processes()
            .iter()
            .filter(|(_, p)| !is_thread(p))
            .map(|(pid, p)| SysProcess::from_sysinfo(*pid, p))
            .collect();
        res.sort_by_key(|p| p.pid);
        res
    }

    /// Refresh and return a single process, `None` if it does not exist.
    pub fn process(&self, pid: u32) -> Option<SysProcess> {
        let mut sys = self.system();
        let spid = Pid::from_u32(pid);
        sys.refresh_cpu();
        if !sys.refresh_process_specifics(spid, ProcessRefreshKind::everything()) {
            return None;
        }
        sys.process(spid)
            .filter(|p| !is_thread(p) && !is_thread_id(pid))
            .map(|p| SysProcess::from_sysinfo(spid, p))
    }

    /// Sample every stat category for `pid`.
    ///
    /// Network counters and listening ports are best effort: failures are
    /// logged and leave those fields empty.
    pub fn stats(&self, pid: u32) -> Result<ResourceStats> {
        let p = self
            .process(pid)
            .ok_or(SupervisorError::ProcessNotFound(pid))?;
        Ok(stats_of(&p))
    }
}

/// sysinfo lists the tasks of a multi-threaded process next to it.
fn is_thread(p: &sysinfo::Process) -> bool {
    p.thread_kind() == Some(ThreadKind::Userland)
}

/// A task id that is not a thread group leader, looked up directly.
#[cfg(target_os = "linux")]
fn is_thread_id(pid: u32) -> bool {
    procfs::process::Process::new(pid as i32)
        .and_then(|p| p.status())
        .is_ok_and(|s| s.tgid != pid as i32)
}

#[cfg(not(target_os = "linux"))]
fn is_thread_id(_pid: u32) -> bool {
    false
}

/// Run `f` against the probe on the blocking pool.
pub async fn with_probe<T, F>(probe: &Arc<SystemProbe>, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&SystemProbe) -> T + Send + 'static,
{
    let probe = probe.clone();
    tokio::task::spawn_blocking(move || f(&probe))
        .await
        .map_err(|e| SupervisorError::ResourceProbe(format!("probe task failed: {e}")))
}

/// Build a stats sample from an already refreshed process.
pub fn stats_of(p: &SysProcess) -> ResourceStats {
    let (net_rx_bytes, net_tx_bytes) = network_io(p.pid).unwrap_or_else(|e| {
        warn!("{e}");
        (0, 0)
    });
    let listening_ports = listening_ports(p.pid).unwrap_or_else(|e| {
        warn!("{e}");
        Vec::new()
    });
    ResourceStats {
        cpu_percent: p.cpu_percent,
        memory_rss_bytes: p.memory_rss_bytes,
        disk_read_bytes: p.disk_read_bytes,
        disk_write_bytes: p.disk_write_bytes,
        net_rx_bytes,
        net_tx_bytes,
        listening_ports,
        sampled_at: Some(Utc::now()),
    }
}

pub fn user_name(uid: u32) -> Option<String> {
    User::from_uid(Uid::from_raw(uid))
        .ok()
        .flatten()
        .map(|u| u.name)
}

pub fn group_name(gid: u32) -> Option<String> {
    Group::from_gid(Gid::from_raw(gid))
        .ok()
        .flatten()
        .map(|g| g.name)
}

/// Resolve a user given by name or numeric id.
pub fn resolve_uid(user: &str) -> Option<u32> {
    if let Ok(uid) = user.parse() {
        return Some(uid);
    }
    User::from_name(user)
        .ok()
        .flatten()
        .map(|u| u.uid.as_raw())
}

/// Resolve a group given by name or numeric id.
pub fn resolve_gid(group: &str) -> Option<u32> {
    if let Ok(gid) = group.parse() {
        return Some(gid);
    }
    Group::from_name(group)
        .ok()
        .flatten()
        .map(|g| g.gid.as_raw())
}

#[cfg(target_os = "linux")]
fn probe_error(pid: u32, what: &str, e: impl std::fmt::Display) -> SupervisorError {
    SupervisorError::ResourceProbe(format!("{what} of pid {pid}: {e}"))
}

/// Received and sent bytes over all non-loopback interfaces of the
/// process's network namespace.
#[cfg(target_os = "linux")]
pub fn network_io(pid: u32) -> Result<(u64, u64)> {
    let process =
        procfs::process::Process::new(pid as i32).map_err(|e| probe_error(pid, "network io", e))?;
    let devices = process
        .dev_status()
        .map_err(|e| probe_error(pid, "network io", e))?;
    Ok(devices
        .values()
        .filter(|d| d.name != "lo")
        .fold((0, 0), |(rx, tx), d| (rx + d.recv_bytes, tx + d.sent_bytes)))
}

/// TCP sockets in LISTEN state and bound UDP sockets owned by the process.
#[cfg(target_os = "linux")]
pub fn listening_ports(pid: u32) -> Result<Vec<ListeningPort>> {
    use common::PortProtocol;
    use procfs::net::TcpState;
    use procfs::process::FDTarget;
    use std::collections::HashSet;

    let process = procfs::process::Process::new(pid as i32)
        .map_err(|e| probe_error(pid, "listening ports", e))?;
    let inodes: HashSet<u64> = process
        .fd()
        .map_err(|e| probe_error(pid, "listening ports", e))?
        .filter_map(|fd| fd.ok())
        .filter_map(|fd| match fd.target {
            FDTarget::Socket(inode) => Some(inode),
            _ => None,
        })
        .collect();
    if inodes.is_empty() {
        return Ok(Vec::new());
    }

    let mut ports = Vec::new();
    let tcp = process
        .tcp()
        .into_iter()
        .chain(process.tcp6())
        .flatten();
    for entry in tcp {
        if entry.state == TcpState::Listen && inodes.contains(&entry.inode) {
            ports.push(ListeningPort {
                protocol: PortProtocol::Tcp,
                address: entry.local_address.ip().to_string(),
                port: entry.local_address.port(),
            });
        }
    }
    let udp = process
        .udp()
        .into_iter()
        .chain(process.udp6())
        .flatten();
    for entry in udp {
        if entry.remote_address.port() == 0 && inodes.contains(&entry.inode) {
            ports.push(ListeningPort {
                protocol: PortProtocol::Udp,
                address: entry.local_address.ip().to_string(),
                port: entry.local_address.port(),
            });
        }
    }
    ports.sort_by(|a, b| (a.port, &a.address).cmp(&(b.port, &b.address)));
    ports.dedup();
    Ok(ports)
}

#[cfg(not(target_os = "linux"))]
pub fn network_io(_pid: u32) -> Result<(u64, u64)> {
    Ok((0, 0))
}

#[cfg(not(target_os = "linux"))]
pub fn listening_ports(_pid: u32) -> Result<Vec<ListeningPort>> {
    Ok(Vec::new())
}
