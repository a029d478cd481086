//! How the orchestrator starts and advances runs, and the production wiring
//! from config to supervisor collaborators.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use orch_agents::{default_adapter_for, AgentError, CancelToken, WorkerAdapter};
use orch_core::config::RunConfig;
use orch_core::state::Phase;
use orch_core::types::{Run, RunId, StepResult, StepStatus};
use orch_git::{GitCli, RepoHandle};
use orch_verify::{Verifier, VerifyRunner};
use tracing::{debug, info};

use crate::context::RelayPaths;
use crate::persistence::RunIndex;
use crate::supervisor::{
    system_clock, Clock, RunRequest, StepOutcome, Supervisor, SupervisorDeps, SupervisorError,
};
use crate::workspace::{Checkpointer, GitCheckpointer, GitWorkspace, Workspace};

/// Where a run stands after the orchestrator touched it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunProgress {
    Running,
    /// Halted with an automatic resume scheduled.
    Waiting { resume_at: DateTime<Utc> },
    Finished(StepResult),
}

pub trait RunLauncher {
    fn start(&mut self, task: &Path, owns: &[String], now: DateTime<Utc>) -> Result<RunId, SupervisorError>;

    /// One supervisor step, or the due automatic resume of a waiting run.
    fn advance(&mut self, run_id: &RunId, now: DateTime<Utc>) -> Result<RunProgress, SupervisorError>;

    /// Reload a run after an orchestrator restart. A due pending resume is
    /// taken; a live run is adopted with a fresh stall window.
    fn reconcile(&mut self, run_id: &RunId, now: DateTime<Utc>) -> Result<RunProgress, SupervisorError>;
}

/// Everything a supervisor step calls out to, owned.
pub struct Collaborators {
    pub worker: Box<dyn WorkerAdapter>,
    pub reviewer: Box<dyn WorkerAdapter>,
    pub verifier: Box<dyn Verifier>,
    pub workspace: Box<dyn Workspace>,
    pub checkpointer: Box<dyn Checkpointer>,
}

impl Collaborators {
    /// Configured workers, shell verification and git in `repo`.
    pub fn from_config(repo: RepoHandle, config: &RunConfig) -> Result<Self, AgentError> {
        let git = GitCli::default().with_identity(
            config.checkpoint.author_name.clone(),
            config.checkpoint.author_email.clone(),
        );
        Ok(Self {
            worker: default_adapter_for(&config.worker, config.worker.kind)?,
            reviewer: default_adapter_for(&config.worker, config.worker.reviewer_kind())?,
            verifier: Box::new(VerifyRunner::from_settings(&config.verify)),
            workspace: Box::new(GitWorkspace::new(repo, git.clone())),
            checkpointer: Box::new(GitCheckpointer::new(git)),
        })
    }

    pub fn deps(&self) -> SupervisorDeps<'_> {
        SupervisorDeps {
            worker: self.worker.as_ref(),
            reviewer: self.reviewer.as_ref(),
            verifier: self.verifier.as_ref(),
            workspace: self.workspace.as_ref(),
            checkpointer: self.checkpointer.as_ref(),
        }
    }
}

/// Real launcher: one [`Supervisor`] per run, cached between ticks.
pub struct SupervisorLauncher {
    paths: RelayPaths,
    config: RunConfig,
    collaborators: Collaborators,
    index_path: Option<PathBuf>,
    cancel: CancelToken,
    clock: Clock,
    runs: HashMap<RunId, Supervisor>,
}

impl SupervisorLauncher {
    pub fn new(paths: RelayPaths, config: RunConfig, collaborators: Collaborators) -> Self {
        Self {
            paths,
            config,
            collaborators,
            index_path: None,
            cancel: CancelToken::new(),
            clock: system_clock(),
            runs: HashMap::new(),
        }
    }

    pub fn with_index(mut self, path: impl Into<PathBuf>) -> Self {
        self.index_path = Some(path.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    fn attach(&self, supervisor: Supervisor) -> Result<Supervisor, SupervisorError> {
        let supervisor = supervisor
            .with_cancel(self.cancel.clone())
            .with_clock(self.clock.clone());
        match &self.index_path {
            Some(path) => supervisor.with_index(RunIndex::open(path)?),
            None => Ok(supervisor),
        }
    }

    fn supervisor(&mut self, run_id: &RunId) -> Result<&mut Supervisor, SupervisorError> {
        if !self.runs.contains_key(run_id) {
            let opened = Supervisor::open(&self.paths, self.config.clone(), run_id)?;
            let opened = self.attach(opened)?;
            self.runs.insert(run_id.clone(), opened);
        }
        self.runs
            .get_mut(run_id)
            .ok_or_else(|| SupervisorError::RunNotFound {
                run_id: run_id.clone(),
                path: self.paths.run_dir(run_id),
            })
    }
}

impl RunLauncher for SupervisorLauncher {
    fn start(&mut self, task: &Path, owns: &[String], now: DateTime<Utc>) -> Result<RunId, SupervisorError> {
        let request = RunRequest {
            task_path: task.to_path_buf(),
            owns: owns.to_vec(),
            milestones: Vec::new(),
        };
        let created = Supervisor::create(
            &self.paths,
            self.config.clone(),
            request,
            self.collaborators.workspace.as_ref(),
            now,
        )?;
        let supervisor = self.attach(created)?;
        let run_id = supervisor.run().run_id.clone();
        self.runs.insert(run_id.clone(), supervisor);
        Ok(run_id)
    }

    fn advance(&mut self, run_id: &RunId, now: DateTime<Utc>) -> Result<RunProgress, SupervisorError> {
        self.supervisor(run_id)?;
        let deps = self.collaborators.deps();
        let Some(supervisor) = self.runs.get_mut(run_id) else {
            return Err(SupervisorError::RunNotFound {
                run_id: run_id.clone(),
                path: self.paths.run_dir(run_id),
            });
        };

        if supervisor.resume_if_due(now)? {
            return Ok(RunProgress::Running);
        }
        let outcome = supervisor.step(&deps, now)?;
        debug!(run_id = %run_id, ?outcome, "advanced run");
        let progress = progress_of(supervisor.run(), now);
        if matches!(progress, RunProgress::Finished(_)) || outcome == StepOutcome::Done {
            self.runs.remove(run_id);
        }
        Ok(progress)
    }

    fn reconcile(&mut self, run_id: &RunId, now: DateTime<Utc>) -> Result<RunProgress, SupervisorError> {
        self.runs.remove(run_id);
        let supervisor = self.supervisor(run_id)?;
        if !supervisor.resume_if_due(now)? {
            supervisor.adopt(now)?;
        }
        let progress = progress_of(supervisor.run(), now);
        info!(run_id = %run_id, phase = %supervisor.run().phase, "reconciled active run");
        Ok(progress)
    }
}

/// Map a run snapshot to orchestrator terms.
pub fn progress_of(run: &Run, now: DateTime<Utc>) -> RunProgress {
    let elapsed_ms = now
        .signed_duration_since(run.started_at)
        .num_milliseconds()
        .max(0) as u64;
    if run.phase == Phase::Done {
        return RunProgress::Finished(StepResult {
            status: StepStatus::Completed,
            stop_reason: None,
            elapsed_ms,
            detail: None,
        });
    }
    if !run.phase.is_halted() {
        return RunProgress::Running;
    }
    if let Some(resume_at) = run.next_resume_at {
        return RunProgress::Waiting { resume_at };
    }
    RunProgress::Finished(StepResult {
        status: StepStatus::Stopped,
        stop_reason: run.stop_reason,
        elapsed_ms,
        detail: Some(format!(
            "halted in {} at milestone {}",
            run.phase,
            run.milestone_index + 1
        )),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        frozen_clock, write_task, FakeCheckpointer, FakeVerifier, FakeWorker, FakeWorkspace,
    };
    use chrono::{Duration as ChronoDuration, TimeZone};
    use orch_agents::WorkerResult;
    use orch_core::state::StopReason;

    fn at(sec: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 3, 8, 0, sec).unwrap()
    }

    fn launcher(dir: &Path, worker: FakeWorker, config: RunConfig) -> SupervisorLauncher {
        let workspace = FakeWorkspace::new(dir);
        workspace.set_changed(&["src/a.rs"]);
        let collaborators = Collaborators {
            worker: Box::new(worker),
            reviewer: Box::new(FakeWorker::approving()),
            verifier: Box::new(FakeVerifier::default()),
            workspace: Box::new(workspace),
            checkpointer: Box::new(FakeCheckpointer::default()),
        };
        SupervisorLauncher::new(RelayPaths::new(dir), config, collaborators).with_clock(frozen_clock())
    }

    fn config() -> RunConfig {
        let mut config = RunConfig::default();
        config.verify.tier0 = vec!["true".to_string()];
        config
    }

    #[test]
    fn advance_drives_a_run_to_a_completed_step_result() {
        let dir = tempfile::tempdir().expect("tempdir");
        let task = write_task(dir.path(), "a.md", "---\ntitle: A\nmilestones: [one]\n---\n");
        let mut launcher = launcher(dir.path(), FakeWorker::new(WorkerResult::ok()), config());

        let run_id = launcher.start(&task, &["src/**".to_string()], at(0)).expect("start");
        let mut progress = RunProgress::Running;
        for _ in 0..20 {
            progress = launcher.advance(&run_id, at(3)).expect("advance");
            if progress != RunProgress::Running {
                break;
            }
        }
        match progress {
            RunProgress::Finished(result) => {
                assert_eq!(result.status, StepStatus::Completed);
                assert_eq!(result.elapsed_ms, 3_000);
            }
            other => panic!("unexpected progress {other:?}"),
        }
    }

    #[test]
    fn reconcile_takes_a_pending_auto_resume() {
        let dir = tempfile::tempdir().expect("tempdir");
        let task = write_task(dir.path(), "a.md", "---\ntitle: A\nmilestones: [one]\n---\n");
        let worker = FakeWorker::new(WorkerResult::ok()).then(Err(AgentError::Timeout { elapsed_ms: 9 }));
        let mut config = config();
        config.resilience.auto_resume_delays_ms = vec![30_000];
        let mut launcher = launcher(dir.path(), worker, config);

        let run_id = launcher.start(&task, &[], at(0)).expect("start");
        let mut progress = RunProgress::Running;
        for _ in 0..10 {
            progress = launcher.advance(&run_id, at(1)).expect("advance");
            if progress != RunProgress::Running {
                break;
            }
        }
        assert_eq!(progress, RunProgress::Waiting { resume_at: at(31) });

        let early = launcher.reconcile(&run_id, at(2)).expect("reconcile");
        assert_eq!(early, RunProgress::Waiting { resume_at: at(31) });

        let progress = launcher.reconcile(&run_id, at(40)).expect("reconcile");
        assert_eq!(progress, RunProgress::Running);
        let snapshot = Supervisor::open(&RelayPaths::new(dir.path()), RunConfig::default(), &run_id)
            .expect("open");
        assert_eq!(snapshot.run().phase, Phase::Implement);
        assert_eq!(snapshot.run().auto_resumes, 1);
        assert_eq!(snapshot.run().stop_reason, None::<StopReason>);
    }

    #[test]
    fn reconcile_after_downtime_continues_the_run() {
        let dir = tempfile::tempdir().expect("tempdir");
        let task = write_task(dir.path(), "a.md", "---\ntitle: A\nmilestones: [one]\n---\n");
        let mut first = launcher(dir.path(), FakeWorker::new(WorkerResult::ok()), config());
        let run_id = first.start(&task, &[], at(0)).expect("start");
        assert_eq!(first.advance(&run_id, at(1)).expect("advance"), RunProgress::Running);
        drop(first);

        let restarted = at(1) + ChronoDuration::minutes(20);
        let mut second = launcher(dir.path(), FakeWorker::new(WorkerResult::ok()), config());
        assert_eq!(second.reconcile(&run_id, restarted).expect("reconcile"), RunProgress::Running);

        let mut progress = RunProgress::Running;
        for _ in 0..20 {
            progress = second.advance(&run_id, restarted).expect("advance");
            if progress != RunProgress::Running {
                break;
            }
        }
        match progress {
            RunProgress::Finished(result) => {
                assert_eq!(result.status, StepStatus::Completed);
                assert_eq!(result.stop_reason, None);
            }
            other => panic!("unexpected progress {other:?}"),
        }
    }
}
