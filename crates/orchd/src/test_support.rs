//! Git fixtures and scripted collaborators shared by the orchd tests.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use orch_agents::{AgentError, WorkerAdapter, WorkerRequest, WorkerResult, WorkerStatus};
use orch_core::config::WorkerKind;
use orch_core::state::{Phase, VerifyResult, VerifyTier};
use orch_core::task::TaskFileError;
use orch_core::types::{RunId, StepResult, StepStatus};
use orch_git::{ChangedFile, FileState, GitCli, GitError, WorktreeInfo};
use orch_verify::{Verifier, VerifyError};

use crate::launcher::{RunLauncher, RunProgress};
use crate::supervisor::{Clock, SupervisorError};
use crate::workspace::{Checkpointer, Workspace};

pub fn git_cli() -> GitCli {
    GitCli::default().with_identity("Test User", "test@example.com")
}

pub fn git_in(cwd: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(["-c", "user.name=Test User", "-c", "user.email=test@example.com"])
        .args(args)
        .current_dir(cwd)
        .output()
        .expect("spawn git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Repo on `main` with one commit and `.relay/` ignored.
pub fn init_repo(dir: &Path) {
    git_in(dir, &["init", "--quiet"]);
    git_in(dir, &["checkout", "--quiet", "-b", "main"]);
    fs::write(dir.join("README.md"), "init\n").expect("write readme");
    fs::create_dir_all(dir.join(".relay")).expect("relay dir");
    fs::write(dir.join(".relay/.gitignore"), "*\n").expect("relay gitignore");
    git_in(dir, &["add", "README.md"]);
    git_in(dir, &["commit", "--quiet", "-m", "init"]);
}

pub fn commit_file(root: &Path, path: &str, body: &str, message: &str) -> String {
    let full = root.join(path);
    if let Some(parent) = full.parent() {
        fs::create_dir_all(parent).expect("create parent");
    }
    fs::write(&full, body).expect("write file");
    git_in(root, &["add", path]);
    git_in(root, &["commit", "--quiet", "-m", message]);
    git_in(root, &["rev-parse", "HEAD"])
}

pub fn write_task(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).expect("write task");
    path
}

/// Returns scripted results in order, then `fallback` forever.
/// Clock that never runs ahead of the `now` a test passes in.
pub fn frozen_clock() -> Clock {
    Arc::new(|| DateTime::<Utc>::MIN_UTC)
}

/// Hand-set wall clock shared between a test and its fakes.
#[derive(Clone)]
pub struct TestClock(Arc<Mutex<DateTime<Utc>>>);

impl TestClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self(Arc::new(Mutex::new(now)))
    }

    pub fn now(&self) -> DateTime<Utc> {
        *self.0.lock().expect("clock")
    }

    pub fn advance(&self, by: ChronoDuration) {
        let mut now = self.0.lock().expect("clock");
        *now = *now + by;
    }

    pub fn clock(&self) -> Clock {
        let inner = Arc::clone(&self.0);
        Arc::new(move || *inner.lock().expect("clock"))
    }
}

pub struct FakeWorker {
    script: Mutex<VecDeque<Result<WorkerResult, AgentError>>>,
    fallback: WorkerResult,
    calls: Mutex<Vec<(Phase, String)>>,
    busy: Option<(TestClock, ChronoDuration)>,
}

impl FakeWorker {
    pub fn new(fallback: WorkerResult) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            calls: Mutex::new(Vec::new()),
            busy: None,
        }
    }

    /// Every call moves `clock` forward by `by` before returning.
    pub fn busy_for(mut self, clock: &TestClock, by: ChronoDuration) -> Self {
        self.busy = Some((clock.clone(), by));
        self
    }

    pub fn approving() -> Self {
        let mut result = WorkerResult::ok();
        result.output = "LGTM".to_string();
        Self::new(result)
    }

    pub fn then(self, result: Result<WorkerResult, AgentError>) -> Self {
        self.script.lock().expect("script").push_back(result);
        self
    }

    pub fn reply(status: WorkerStatus, output: &str) -> Result<WorkerResult, AgentError> {
        let mut result = WorkerResult::with_status(status);
        result.output = output.to_string();
        Ok(result)
    }

    pub fn phases(&self) -> Vec<Phase> {
        self.calls
            .lock()
            .expect("calls")
            .iter()
            .map(|(phase, _)| *phase)
            .collect()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.calls
            .lock()
            .expect("calls")
            .iter()
            .map(|(_, prompt)| prompt.clone())
            .collect()
    }
}

impl WorkerAdapter for FakeWorker {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Command
    }

    fn invoke(&self, request: &WorkerRequest) -> Result<WorkerResult, AgentError> {
        self.calls
            .lock()
            .expect("calls")
            .push((request.phase, request.prompt.clone()));
        if let Some((clock, by)) = &self.busy {
            clock.advance(*by);
        }
        match self.script.lock().expect("script").pop_front() {
            Some(result) => result,
            None => Ok(self.fallback.clone()),
        }
    }
}

/// Verdicts in order, then pass.
#[derive(Default)]
pub struct FakeVerifier {
    verdicts: Mutex<VecDeque<bool>>,
    calls: Mutex<Vec<VerifyTier>>,
}

impl FakeVerifier {
    pub fn with_verdicts(verdicts: &[bool]) -> Self {
        Self {
            verdicts: Mutex::new(verdicts.iter().copied().collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().expect("calls").len()
    }
}

impl Verifier for FakeVerifier {
    fn run_tier(
        &self,
        _cwd: &Path,
        tier: VerifyTier,
        commands: &[String],
        _budget: Duration,
    ) -> Result<VerifyResult, VerifyError> {
        self.calls.lock().expect("calls").push(tier);
        let ok = self.verdicts.lock().expect("verdicts").pop_front().unwrap_or(true);
        Ok(VerifyResult {
            tier,
            commands: commands.to_vec(),
            ok,
            duration_ms: 5,
            output: if ok { String::new() } else { "assertion failed".to_string() },
            failed_command: (!ok).then(|| commands.first().cloned().unwrap_or_default()),
            timed_out: false,
        })
    }
}

/// Worktree under a temp dir whose "changed files" are whatever the test sets.
pub struct FakeWorkspace {
    root: PathBuf,
    changed: Mutex<Vec<ChangedFile>>,
    restores: Mutex<Vec<String>>,
    releases: Mutex<Vec<PathBuf>>,
}

impl FakeWorkspace {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            changed: Mutex::new(Vec::new()),
            restores: Mutex::new(Vec::new()),
            releases: Mutex::new(Vec::new()),
        }
    }

    pub fn releases(&self) -> Vec<PathBuf> {
        self.releases.lock().expect("releases").clone()
    }

    pub fn set_changed(&self, paths: &[&str]) {
        *self.changed.lock().expect("changed") = paths
            .iter()
            .map(|path| ChangedFile {
                path: path.to_string(),
                previous_path: None,
                state: FileState::Modified,
            })
            .collect();
    }

    pub fn restores(&self) -> Vec<String> {
        self.restores.lock().expect("restores").clone()
    }
}

impl Workspace for FakeWorkspace {
    fn prepare(&self, run_id: &RunId) -> Result<WorktreeInfo, GitError> {
        let path = self.root.join("worktrees").join(&run_id.0);
        fs::create_dir_all(&path).map_err(|source| GitError::WorktreeDir {
            path: path.clone(),
            source,
        })?;
        Ok(WorktreeInfo {
            run_id: run_id.clone(),
            branch: run_id.branch_name(),
            path,
            base_sha: "base0".to_string(),
        })
    }

    fn changed_files(&self, _worktree: &Path, _base: &str) -> Result<Vec<ChangedFile>, GitError> {
        Ok(self.changed.lock().expect("changed").clone())
    }

    fn restore(&self, _worktree: &Path, sha: &str) -> Result<(), GitError> {
        self.restores.lock().expect("restores").push(sha.to_string());
        self.changed.lock().expect("changed").clear();
        Ok(())
    }

    fn diff(&self, _worktree: &Path, _base: &str) -> Result<String, GitError> {
        Ok("+change\n".to_string())
    }

    fn diffstat(&self, _worktree: &Path, _base: &str) -> Result<String, GitError> {
        Ok(" 1 file changed\n".to_string())
    }

    fn release(&self, worktree: &Path) -> Result<(), GitError> {
        self.releases.lock().expect("releases").push(worktree.to_path_buf());
        Ok(())
    }
}

/// Counts commits as `c1`, `c2`, ...
#[derive(Default)]
pub struct FakeCheckpointer {
    commits: Mutex<Vec<String>>,
}

impl FakeCheckpointer {
    pub fn commits(&self) -> Vec<String> {
        self.commits.lock().expect("commits").clone()
    }
}

impl Checkpointer for FakeCheckpointer {
    fn commit(
        &self,
        _worktree: &Path,
        _message: &str,
        _exclude: &[String],
    ) -> Result<Option<String>, GitError> {
        let mut commits = self.commits.lock().expect("commits");
        let sha = format!("c{}", commits.len() + 1);
        commits.push(sha.clone());
        Ok(Some(sha))
    }

    fn head(&self, _worktree: &Path) -> Result<String, GitError> {
        Ok(self
            .commits
            .lock()
            .expect("commits")
            .last()
            .cloned()
            .unwrap_or_else(|| "base0".to_string()))
    }
}

/// Launcher whose runs finish `Completed` after a fixed number of advances.
pub struct FakeLauncher {
    advances_to_finish: u32,
    fail_task: Option<String>,
    remaining: HashMap<RunId, u32>,
    started: Vec<PathBuf>,
    reconciled: Vec<RunId>,
}

impl FakeLauncher {
    pub fn finishing_after(advances: u32) -> Self {
        Self {
            advances_to_finish: advances,
            fail_task: None,
            remaining: HashMap::new(),
            started: Vec::new(),
            reconciled: Vec::new(),
        }
    }

    /// Refuse to start any task whose file name is `name`.
    pub fn failing_on(mut self, name: &str) -> Self {
        self.fail_task = Some(name.to_string());
        self
    }

    pub fn started(&self) -> &[PathBuf] {
        &self.started
    }

    pub fn reconciled(&self) -> &[RunId] {
        &self.reconciled
    }

    fn tick_down(&mut self, run_id: &RunId) -> RunProgress {
        let remaining = self
            .remaining
            .entry(run_id.clone())
            .or_insert(self.advances_to_finish);
        *remaining = remaining.saturating_sub(1);
        if *remaining > 0 {
            return RunProgress::Running;
        }
        self.remaining.remove(run_id);
        RunProgress::Finished(StepResult {
            status: StepStatus::Completed,
            stop_reason: None,
            elapsed_ms: 10,
            detail: None,
        })
    }
}

impl RunLauncher for FakeLauncher {
    fn start(&mut self, task: &Path, _owns: &[String], _now: DateTime<Utc>) -> Result<RunId, SupervisorError> {
        let name = task
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        if self.fail_task.as_deref() == Some(name.as_str()) {
            return Err(SupervisorError::Task(TaskFileError::Read {
                path: task.to_path_buf(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            }));
        }
        let stem = task
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        let run_id = RunId::new(format!("run-{stem}-{}", self.started.len() + 1));
        self.started.push(task.to_path_buf());
        self.remaining.insert(run_id.clone(), self.advances_to_finish);
        Ok(run_id)
    }

    fn advance(&mut self, run_id: &RunId, _now: DateTime<Utc>) -> Result<RunProgress, SupervisorError> {
        Ok(self.tick_down(run_id))
    }

    fn reconcile(&mut self, run_id: &RunId, _now: DateTime<Utc>) -> Result<RunProgress, SupervisorError> {
        self.reconciled.push(run_id.clone());
        self.remaining
            .entry(run_id.clone())
            .or_insert(self.advances_to_finish);
        Ok(RunProgress::Running)
    }
}
