use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use common::{ExecConfig, ProcessSpec};
use tracing::debug;

use crate::exec::run_command;
use crate::probe::SysProcess;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    Matched,
    NotMatched,
    /// The matcher could not decide, e.g. its script failed to run.
    Inconclusive(String),
}

impl MatchOutcome {
    pub fn is_match(&self) -> bool {
        matches!(self, MatchOutcome::Matched)
    }
}

/// Decides whether a live OS process is the one a spec describes.
#[async_trait]
pub trait ProcessMatcher: Send + Sync {
    async fn matches(&self, candidate: &SysProcess) -> MatchOutcome;
}

/// Runs the declared `checkAlive` command with the candidate pid appended.
pub struct ScriptMatcher {
    script: ExecConfig,
    env: Vec<(String, String)>,
    working_dir: Option<PathBuf>,
    timeout: Duration,
}

impl ScriptMatcher {
    pub fn new(script: ExecConfig, timeout: Duration) -> Self {
        ScriptMatcher {
            script,
            env: Vec::new(),
            working_dir: None,
            timeout,
        }
    }

    pub fn env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }

    pub fn working_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.working_dir = dir;
        self
    }
}

#[async_trait]
impl ProcessMatcher for ScriptMatcher {
    async fn matches(&self, candidate: &SysProcess) -> MatchOutcome {
        let pid = candidate.pid.to_string();
        match run_command(
            &self.script,
            std::slice::from_ref(&pid),
            &self.env,
            self.working_dir.as_deref(),
            self.timeout,
        )
        .await
        {
            Ok(out) if out.status.success() => MatchOutcome::Matched,
            Ok(out) => {
                debug!("check alive rejected pid {pid}: {}", out.status);
                MatchOutcome::NotMatched
            }
            Err(e) => MatchOutcome::Inconclusive(e.to_string()),
        }
    }
}

/// Compares the command line and working directory of the candidate.
///
/// Each declared argument must occur in the candidate's command line. The
/// command itself is only required when no arguments are declared, so that
/// wrappers like `env` or `nohup` that exec the real program still match. A
/// declared working directory must be equal to the candidate's cwd.
pub struct AttributeMatcher {
    command: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl AttributeMatcher {
    pub fn new(exec: &ExecConfig, working_dir: Option<PathBuf>) -> Self {
        let command = Path::new(&exec.command)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| exec.command.clone());
        AttributeMatcher {
            command,
            args: exec.args.clone(),
            working_dir,
        }
    }
}

#[async_trait]
impl ProcessMatcher for AttributeMatcher {
    async fn matches(&self, candidate: &SysProcess) -> MatchOutcome {
        let cmdline = candidate.command_line();
        if cmdline.is_empty() {
            return MatchOutcome::NotMatched;
        }
        let found = if self.args.is_empty() {
            cmdline.contains(&self.command)
        } else {
            self.args.iter().all(|a| cmdline.contains(a.as_str()))
        };
        if !found {
            return MatchOutcome::NotMatched;
        }
        if let Some(dir) = &self.working_dir
            && candidate.cwd.as_deref() != Some(dir.as_path())
        {
            return MatchOutcome::NotMatched;
        }
        MatchOutcome::Matched
    }
}

/// The script matcher when `checkAlive` is declared, the attribute matcher otherwise.
pub fn matcher_for(spec: &ProcessSpec, check_alive_timeout: Duration) -> Box<dyn ProcessMatcher> {
    let working_dir = spec.working_dir.as_ref().map(PathBuf::from);
    match &spec.check_alive {
        Some(script) => Box::new(
            ScriptMatcher::new(script.clone(), check_alive_timeout)
                .env(
                    spec.env
                        .iter()
                        .map(|e| (e.name.clone(), e.value.clone()))
                        .collect(),
                )
                .working_dir(working_dir),
        ),
        None => Box::new(AttributeMatcher::new(&spec.exec, working_dir)),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn candidate(pid: u32, cmdline: &[&str], cwd: &str) -> SysProcess {
        SysProcess {
            pid,
            cmdline: cmdline.iter().map(|s| s.to_string()).collect(),
            cwd: Some(PathBuf::from(cwd)),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_attribute_matcher() {
        let exec = ExecConfig::new("/usr/bin/python3", vec!["-m", "http.server"]);
        let m = AttributeMatcher::new(&exec, None);
        assert_eq!(
            m.matches(&candidate(10, &["python3", "-m", "http.server", "80"], "/"))
                .await,
            MatchOutcome::Matched
        );
        assert_eq!(
            m.matches(&candidate(11, &["python3", "-m", "venv"], "/")).await,
            MatchOutcome::NotMatched
        );
        assert_eq!(
            m.matches(&candidate(12, &[], "/")).await,
            MatchOutcome::NotMatched
        );
    }

    #[tokio::test]
    async fn test_attribute_matcher_through_wrapper() {
        let wrapped = ExecConfig::new("env", vec!["python3", "app.py"]);
        let m = AttributeMatcher::new(&wrapped, None);
        assert!(
            m.matches(&candidate(20, &["python3", "app.py"], "/"))
                .await
                .is_match()
        );

        let bare = AttributeMatcher::new(&ExecConfig::new("/usr/sbin/crond", Vec::<String>::new()), None);
        assert!(bare.matches(&candidate(21, &["crond", "-n"], "/")).await.is_match());
        assert!(!bare.matches(&candidate(22, &["sshd"], "/")).await.is_match());
    }

    #[tokio::test]
    async fn test_attribute_matcher_working_dir() {
        let exec = ExecConfig::new("sleep", vec!["30"]);
        let m = AttributeMatcher::new(&exec, Some(PathBuf::from("/srv/app")));
        assert!(
            m.matches(&candidate(10, &["sleep", "30"], "/srv/app"))
                .await
                .is_match()
        );
        assert!(
            !m.matches(&candidate(10, &["sleep", "30"], "/srv/app/sub"))
                .await
                .is_match()
        );
    }

    #[tokio::test]
    async fn test_script_matcher() {
        let script = ExecConfig::new("sh", vec!["-c", "[ \"$1\" = 42 ]", "check"]);
        let m = ScriptMatcher::new(script, Duration::from_secs(5));
        assert_eq!(
            m.matches(&candidate(42, &["x"], "/")).await,
            MatchOutcome::Matched
        );
        assert_eq!(
            m.matches(&candidate(43, &["x"], "/")).await,
            MatchOutcome::NotMatched
        );
    }

    #[tokio::test]
    async fn test_script_matcher_inconclusive() {
        let slow = ScriptMatcher::new(ExecConfig::new("sleep", vec!["10"]), Duration::from_millis(200));
        assert!(matches!(
            slow.matches(&candidate(1, &["x"], "/")).await,
            MatchOutcome::Inconclusive(_)
        ));

        let missing = ScriptMatcher::new(
            ExecConfig::new("/nonexistent/check-alive", Vec::<String>::new()),
            Duration::from_secs(1),
        );
        assert!(matches!(
            missing.matches(&candidate(1, &["x"], "/")).await,
            MatchOutcome::Inconclusive(_)
        ));
    }

    #[tokio::test]
    async fn test_matcher_for_prefers_script() {
        let mut spec = ProcessSpec {
            exec: ExecConfig::new("sleep", vec!["30"]),
            ..Default::default()
        };
        let by_attr = matcher_for(&spec, Duration::from_secs(1));
        assert!(
            by_attr
                .matches(&candidate(7, &["sleep", "30"], "/"))
                .await
                .is_match()
        );

        spec.check_alive = Some(ExecConfig::new("false", Vec::<String>::new()));
        let by_script = matcher_for(&spec, Duration::from_secs(1));
        assert_eq!(
            by_script.matches(&candidate(7, &["sleep", "30"], "/")).await,
            MatchOutcome::NotMatched
        );
    }
}
