//! Discovery of OS processes, independent of the registry.

use std::sync::Arc;
use std::time::Duration;

use common::{EnvVar, ExecConfig, ManagedProcess, Phase, ProcessSpec};
use regex::Regex;
use tracing::{debug, warn};

use crate::error::{Result, SupervisorError};
use crate::exec::run_checked;
use crate::probe::{self, SysProcess, SystemProbe, with_probe};

pub mod matcher;

pub use matcher::{AttributeMatcher, MatchOutcome, ProcessMatcher, ScriptMatcher, matcher_for};

const SCRIPT_PREFIX: &str = "script:";
const FILE_PREFIX: &str = "file:";

/// How a scan query selects processes.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanQuery {
    /// Inline shell run with `sh -c`, printing one pid per line.
    Script(String),
    /// Shell file run with `sh`, printing one pid per line.
    File(String),
    /// Regular expression over the space-joined command line.
    Pattern(String),
}

impl ScanQuery {
    pub fn parse(query: &str) -> Self {
        if let Some(script) = query.strip_prefix(SCRIPT_PREFIX) {
            ScanQuery::Script(script.trim().to_string())
        } else if let Some(path) = query.strip_prefix(FILE_PREFIX) {
            ScanQuery::File(path.trim().to_string())
        } else {
            ScanQuery::Pattern(query.to_string())
        }
    }
}

#[derive(Clone)]
pub struct Scanner {
    probe: Arc<SystemProbe>,
    scan_timeout: Duration,
}

impl Scanner {
    pub fn new(probe: Arc<SystemProbe>, scan_timeout: Duration) -> Self {
        Scanner {
            probe,
            scan_timeout,
        }
    }

    /// Snapshots of every process selected by `query`.
    pub async fn scan(&self, query: &str) -> Result<Vec<ManagedProcess>> {
        let pids = match ScanQuery::parse(query) {
            ScanQuery::Script(script) => {
                self.pids_from_script(ExecConfig::new("sh", vec!["-c".to_string(), script]))
                    .await?
            }
            ScanQuery::File(path) => self.pids_from_script(ExecConfig::new("sh", vec![path])).await?,
            ScanQuery::Pattern(pattern) => {
                let re = Regex::new(&pattern)
                    .map_err(|e| SupervisorError::InvalidQuery(format!("{pattern}: {e}")))?;
                let me = std::process::id();
                return with_probe(&self.probe, move |probe| {
                    probe
                        .processes()
                        .iter()
                        .filter(|p| p.pid != me && re.is_match(&p.command_line()))
                        .map(snapshot)
                        .collect()
                })
                .await;
            }
        };

        let mut res = Vec::with_capacity(pids.len());
        for pid in pids {
            match self.get_by_pid(pid).await {
                Ok(p) => res.push(p),
                Err(SupervisorError::ProcessNotFound(_)) => debug!("pid {pid} is gone, skipped"),
                Err(e) => return Err(e),
            }
        }
        Ok(res)
    }

    async fn pids_from_script(&self, script: ExecConfig) -> Result<Vec<u32>> {
        let output = run_checked(&script, &[], &[], None, self.scan_timeout).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut pids = Vec::new();
        for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match line.parse::<u32>() {
                Ok(pid) if !pids.contains(&pid) => pids.push(pid),
                Ok(_) => {}
                Err(_) => warn!("scan script printed {line:?}, which is not a pid"),
            }
        }
        Ok(pids)
    }

    /// Snapshot of a single live process.
    pub async fn get_by_pid(&self, pid: u32) -> Result<ManagedProcess> {
        with_probe(&self.probe, move |probe| probe.process(pid).map(|p| snapshot(&p)))
            .await?
            .ok_or(SupervisorError::ProcessNotFound(pid))
    }

    /// The whole process table, refreshed.
    pub async fn processes(&self) -> Result<Vec<SysProcess>> {
        with_probe(&self.probe, |probe| probe.processes()).await
    }

    /// First live process accepted by `matcher`, ignoring the supervisor
    /// itself and the pids in `exclude`.
    pub async fn find(
        &self,
        matcher: &dyn ProcessMatcher,
        exclude: &[u32],
    ) -> Result<Option<SysProcess>> {
        let me = std::process::id();
        let candidates = self
            .processes()
            .await?
            .into_iter()
            .filter(|p| p.pid != me && !exclude.contains(&p.pid));
        for candidate in candidates {
            match matcher.matches(&candidate).await {
                MatchOutcome::Matched => return Ok(Some(candidate)),
                MatchOutcome::NotMatched => {}
                MatchOutcome::Inconclusive(reason) => {
                    debug!("pid {} inconclusive: {reason}", candidate.pid)
                }
            }
        }
        Ok(None)
    }
}

/// Describe a live process in the managed process model.
pub fn snapshot(p: &SysProcess) -> ManagedProcess {
    if p.environ.is_empty() && p.pid != std::process::id() {
        warn!("environment of pid {} is not readable", p.pid);
    }

    let (command, args) = match p.cmdline.split_first() {
        Some((cmd, args)) => (cmd.clone(), args.to_vec()),
        None => (
            p.exe
                .as_ref()
                .map(|e| e.display().to_string())
                .unwrap_or_else(|| p.name.clone()),
            Vec::new(),
        ),
    };
    let env = p
        .environ
        .iter()
        .filter_map(|kv| kv.split_once('='))
        .map(|(k, v)| EnvVar::new(k, v))
        .collect();

    let spec = ProcessSpec {
        exec: ExecConfig { command, args },
        working_dir: p.cwd.as_ref().map(|c| c.display().to_string()),
        env,
        user: p
            .uid
            .map(|uid| probe::user_name(uid).unwrap_or_else(|| uid.to_string())),
        group: p
            .gid
            .map(|gid| probe::group_name(gid).unwrap_or_else(|| gid.to_string())),
        ..Default::default()
    };

    let mut process = ManagedProcess::new(common::DEFAULT_NAMESPACE, p.name.clone(), spec);
    process.status.phase = Phase::Running;
    process.status.pid = p.pid;
    process.status.start_time = p.start_time;
    process.status.resources = probe::stats_of(p);
    process
}
