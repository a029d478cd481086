//! Drives one run through its phases, one phase per [`Supervisor::step`].
//!
//! Every state change is appended to the run's event log before the snapshot
//! is rewritten, so a crash between the two is repaired by replay on open.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use orch_agents::{AgentError, CancelToken, WorkerAdapter, WorkerRequest, WorkerResult, WorkerStatus};
use orch_core::config::RunConfig;
use orch_core::events::{Event, EventKind};
use orch_core::state::{Phase, StopReason, VerifyResult};
use orch_core::task::{load_task_file, TaskFile, TaskFileError};
use orch_core::types::{Milestone, Run, RunId};
use orch_git::GitError;
use orch_verify::{run_tiers, select_tier, write_verify_log, Verifier, VerifyError};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::context::{LayoutError, RelayPaths, RunContext};
use crate::diagnostics::{write_diff_artifacts, write_stop_diagnostics, DiagnosticsError, StopDiagnostics};
use crate::event_log::{read_json, replay_run, write_json_atomic, EventLog, EventLogError};
use crate::persistence::{PersistenceError, RunIndex};
use crate::prompt_builder::{build_prompt, PromptInput};
use crate::retry::{evaluate_auto_resume, is_resume_due, is_stalled, resume_at};
use crate::review_loop::{is_review_loop, parse_review, request_signature};
use crate::scope_guard::{check_changes, plan_violations};
use crate::state_machine::{transition_run, PhaseEvent, StateMachineError};
use crate::workspace::{checkpoint_message, Checkpointer, Workspace};

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error(transparent)]
    EventLog(#[from] EventLogError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Diagnostics(#[from] DiagnosticsError),
    #[error(transparent)]
    Task(#[from] TaskFileError),
    #[error(transparent)]
    Git(#[from] GitError),
    #[error(transparent)]
    Verify(#[from] VerifyError),
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error(transparent)]
    Transition(#[from] StateMachineError),
    #[error("run {run_id} not found (no state.json under {path})")]
    RunNotFound { run_id: RunId, path: PathBuf },
    #[error("run {run_id} stopped with {reason}, which cannot be resumed")]
    NotResumable { run_id: RunId, reason: StopReason },
    #[error("run {run_id} has no worktree recorded")]
    MissingWorktree { run_id: RunId },
    #[error("run {run_id} has no milestone at index {index}")]
    MissingMilestone { run_id: RunId, index: usize },
}

/// Collaborators a step may call. Borrowed so the caller keeps ownership.
#[derive(Clone, Copy)]
pub struct SupervisorDeps<'a> {
    pub worker: &'a dyn WorkerAdapter,
    pub reviewer: &'a dyn WorkerAdapter,
    pub verifier: &'a dyn Verifier,
    pub workspace: &'a dyn Workspace,
    pub checkpointer: &'a dyn Checkpointer,
}

/// What a new run should work on.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RunRequest {
    pub task_path: PathBuf,
    /// Replaces the task file's `owns` when non-empty.
    pub owns: Vec<String>,
    /// Pre-planned milestones; skips the worker in PLAN when non-empty.
    pub milestones: Vec<Milestone>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// A phase ran and the run is still live.
    Progressed,
    Halted(StopReason),
    Done,
    /// Cancelled mid-call; the run is unchanged and can be stepped again.
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// Run was not halted; it continues from its current phase.
    Continued(Phase),
    Resumed { from: Phase, to: Phase },
    /// Run already reached DONE.
    AlreadyDone,
}

/// Wall clock read after blocking calls. Swapped out in tests.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

enum WorkerCall {
    /// Carries the time the call returned.
    Finished(WorkerResult, DateTime<Utc>),
    Halted(StopReason),
    Interrupted,
}

/// Event log, snapshot and index writes for one run.
#[derive(Debug)]
pub struct RunJournal {
    ctx: RunContext,
    log: EventLog,
    index: Option<RunIndex>,
}

impl RunJournal {
    pub fn open(ctx: RunContext) -> Result<Self, SupervisorError> {
        let log = EventLog::open(ctx.events_path(), "supervisor")?;
        Ok(Self {
            ctx,
            log,
            index: None,
        })
    }

    pub fn with_index(mut self, index: RunIndex) -> Self {
        self.index = Some(index);
        self
    }

    pub fn events(&self) -> Result<Vec<Event>, SupervisorError> {
        Ok(self.log.read_all()?)
    }

    /// Append `kind` and mirror its seq onto the run.
    pub fn record(
        &mut self,
        run: &mut Run,
        kind: EventKind,
        at: DateTime<Utc>,
    ) -> Result<Event, SupervisorError> {
        let progress = kind.is_progress();
        let event = self.log.append(kind, at, Some(run.run_id.0.clone()))?;
        run.last_event_seq = event.seq;
        if progress {
            run.last_progress_at = run.last_progress_at.max(at);
        }
        run.updated_at = run.updated_at.max(at);
        Ok(event)
    }

    pub fn save(&self, run: &Run) -> Result<(), SupervisorError> {
        write_json_atomic(&self.ctx.state_path(), run)?;
        if let Some(index) = &self.index {
            index.upsert_run(run)?;
        }
        Ok(())
    }
}

pub struct Supervisor {
    ctx: RunContext,
    config: RunConfig,
    run: Run,
    task: TaskFile,
    journal: RunJournal,
    cancel: CancelToken,
    clock: Clock,
}

impl Supervisor {
    /// Create the run directory, prepare the worktree and record `run_started`.
    pub fn create(
        paths: &RelayPaths,
        config: RunConfig,
        request: RunRequest,
        workspace: &dyn Workspace,
        now: DateTime<Utc>,
    ) -> Result<Self, SupervisorError> {
        let task = load_task_file(&request.task_path)?;
        let run_id = RunId::generate(now);
        let ctx = paths.run_context(run_id.clone());
        ctx.ensure_layout()?;

        let owns = if request.owns.is_empty() {
            task.owns.clone()
        } else {
            request.owns
        };
        let mut run = Run::new(run_id.clone(), request.task_path, task.title.clone(), now)
            .with_scope(task.merged_scope(&config.scope.scope_lock()))
            .with_owns(owns);
        run.milestones = request.milestones;

        let worktree = workspace.prepare(&run_id)?;
        run.base_sha = Some(worktree.base_sha.clone());
        run.worktree_path = Some(worktree.path.clone());
        run.branch = Some(worktree.branch.clone());

        let mut journal = RunJournal::open(ctx.clone())?;
        let started = EventKind::RunStarted {
            task_path: run.task_path.display().to_string(),
            task_title: run.task_title.clone(),
            base_sha: run.base_sha.clone(),
            worktree_path: Some(worktree.path.display().to_string()),
            branch: run.branch.clone(),
        };
        journal.record(&mut run, started, now)?;
        journal.save(&run)?;
        info!(run_id = %run_id, task = %run.task_title, "run created");

        Ok(Self {
            ctx,
            config,
            run,
            task,
            journal,
            cancel: CancelToken::new(),
            clock: system_clock(),
        })
    }

    /// Load `state.json` and replay any events it has not seen.
    pub fn open(
        paths: &RelayPaths,
        config: RunConfig,
        run_id: &RunId,
    ) -> Result<Self, SupervisorError> {
        let ctx = paths.run_context(run_id.clone());
        let state_path = ctx.state_path();
        let mut run: Run = read_json(&state_path)?.ok_or_else(|| SupervisorError::RunNotFound {
            run_id: run_id.clone(),
            path: state_path.clone(),
        })?;
        let journal = RunJournal::open(ctx.clone())?;
        let applied = replay_run(&mut run, &journal.events()?);
        if applied > 0 {
            debug!(run_id = %run_id, applied, "replayed events past snapshot");
            journal.save(&run)?;
        }
        let task = load_task_file(&run.task_path)?;
        Ok(Self {
            ctx,
            config,
            run,
            task,
            journal,
            cancel: CancelToken::new(),
            clock: system_clock(),
        })
    }

    pub fn with_index(mut self, index: RunIndex) -> Result<Self, SupervisorError> {
        index.upsert_run(&self.run)?;
        self.journal = self.journal.with_index(index);
        Ok(self)
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn run(&self) -> &Run {
        &self.run
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    /// Execute the current phase. Halted runs are left alone.
    pub fn step(
        &mut self,
        deps: &SupervisorDeps<'_>,
        now: DateTime<Utc>,
    ) -> Result<StepOutcome, SupervisorError> {
        if self.run.phase == Phase::Done {
            return Ok(StepOutcome::Done);
        }
        if self.run.phase.is_halted() {
            let reason = self.run.stop_reason.unwrap_or(StopReason::WorkerFailed);
            return Ok(StepOutcome::Halted(reason));
        }
        if is_stalled(
            self.run.last_progress_at,
            now,
            self.config.resilience.stall_timeout_minutes,
        ) {
            let idle_ms = now
                .signed_duration_since(self.run.last_progress_at)
                .num_milliseconds();
            return self.halt(
                deps,
                StopReason::StalledTimeout,
                json!({ "idle_ms": idle_ms }),
                now,
            );
        }

        debug!(run_id = %self.run.run_id, phase = %self.run.phase, "supervisor step");
        match self.run.phase {
            Phase::Init => {
                self.transition(PhaseEvent::Start, now)?;
                Ok(StepOutcome::Progressed)
            }
            Phase::Plan => self.plan(deps, now),
            Phase::MilestoneStart => self.start_milestone(now),
            Phase::Implement => self.implement(deps, now),
            Phase::Verify => self.verify(deps, now),
            Phase::Review => self.review(deps, now),
            Phase::Checkpoint => self.checkpoint(deps, now),
            Phase::Done | Phase::Blocked | Phase::Escalated | Phase::Stopped => {
                Ok(StepOutcome::Progressed)
            }
        }
    }

    /// Step until the run is done, halted for an operator, or interrupted.
    /// Due automatic resumes are waited for and taken.
    pub fn run_to_completion(
        &mut self,
        deps: &SupervisorDeps<'_>,
    ) -> Result<StepOutcome, SupervisorError> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(StepOutcome::Interrupted);
            }
            match self.step(deps, Utc::now())? {
                StepOutcome::Progressed => continue,
                StepOutcome::Halted(reason) => {
                    let Some(due) = self.run.next_resume_at else {
                        return Ok(StepOutcome::Halted(reason));
                    };
                    let wait = due
                        .signed_duration_since(Utc::now())
                        .to_std()
                        .unwrap_or(Duration::ZERO);
                    let wait_ms = wait.as_millis() as u64;
                    info!(run_id = %self.run.run_id, %reason, wait_ms, "waiting for auto-resume");
                    thread::sleep(wait);
                    if self.cancel.is_cancelled() {
                        return Ok(StepOutcome::Interrupted);
                    }
                    self.resume(true, Utc::now())?;
                }
                other => return Ok(other),
            }
        }
    }

    /// Take over a live run after a restart. The time the run sat without a
    /// supervisor does not count towards the stall window.
    pub fn adopt(&mut self, now: DateTime<Utc>) -> Result<bool, SupervisorError> {
        let phase = self.run.phase;
        if phase == Phase::Done || phase.is_halted() {
            return Ok(false);
        }
        self.journal
            .record(&mut self.run, EventKind::RunAdopted { phase }, now)?;
        self.journal.save(&self.run)?;
        info!(run_id = %self.run.run_id, %phase, "run adopted");
        Ok(true)
    }

    /// Automatic resume for a halted run whose scheduled time has come.
    pub fn resume_if_due(&mut self, now: DateTime<Utc>) -> Result<bool, SupervisorError> {
        if self.run.phase.is_halted() && is_resume_due(&self.run, now) {
            self.resume(true, now)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Re-enter a halted run. A live run is left as is; resuming twice is a no-op.
    pub fn resume(
        &mut self,
        automatic: bool,
        now: DateTime<Utc>,
    ) -> Result<ResumeOutcome, SupervisorError> {
        let from = self.run.phase;
        if from == Phase::Done {
            return Ok(ResumeOutcome::AlreadyDone);
        }
        if !from.is_halted() {
            return Ok(ResumeOutcome::Continued(from));
        }

        let reason = self.run.stop_reason;
        if let Some(reason) = reason {
            if !reason.is_resumable() {
                return Err(SupervisorError::NotResumable {
                    run_id: self.run.run_id.clone(),
                    reason,
                });
            }
        }

        let to = match reason {
            Some(
                StopReason::VerificationFailedMaxRetries
                | StopReason::ReviewLoopDetected
                | StopReason::ScopeViolation
                | StopReason::OwnershipViolation
                | StopReason::WorkerFailed,
            ) => Phase::Implement,
            Some(StopReason::PlanScopeViolation) => Phase::Plan,
            _ => self
                .run
                .last_active_phase
                .filter(|phase| phase.is_working())
                .unwrap_or(Phase::Plan),
        };

        if reason.is_some_and(StopReason::is_scope_related) {
            self.refresh_scope()?;
        }
        if to == Phase::Implement {
            self.run.reset_milestone_counters();
        }
        if automatic {
            self.run.auto_resumes += 1;
        }

        transition_run(&mut self.run, PhaseEvent::Resume { to }, now)?;
        self.journal.record(
            &mut self.run,
            EventKind::RunResumed {
                from,
                to,
                reason,
                automatic,
            },
            now,
        )?;
        self.journal.save(&self.run)?;
        info!(run_id = %self.run.run_id, %from, %to, automatic, "run resumed");
        Ok(ResumeOutcome::Resumed { from, to })
    }

    fn refresh_scope(&mut self) -> Result<(), SupervisorError> {
        self.task = load_task_file(&self.run.task_path)?;
        self.run.scope_lock = self.task.merged_scope(&self.config.scope.scope_lock());
        if !self.task.owns.is_empty() {
            self.run.owns = self.task.owns.clone();
        }
        Ok(())
    }

    fn transition(&mut self, event: PhaseEvent, now: DateTime<Utc>) -> Result<(), SupervisorError> {
        let transition = transition_run(&mut self.run, event, now)?;
        self.journal.record(
            &mut self.run,
            EventKind::PhaseChanged {
                from: transition.from,
                to: transition.to,
                trigger: event.name().to_string(),
            },
            now,
        )?;
        self.journal.save(&self.run)?;
        info!(
            run_id = %self.run.run_id,
            from = %transition.from,
            to = %transition.to,
            trigger = event.name(),
            "phase transition"
        );
        Ok(())
    }

    fn halt(
        &mut self,
        deps: &SupervisorDeps<'_>,
        reason: StopReason,
        evidence: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<StepOutcome, SupervisorError> {
        transition_run(&mut self.run, PhaseEvent::Halt(reason), now)?;
        let stopped = EventKind::RunStopped {
            reason,
            phase: self.run.phase,
            milestone_index: self.run.milestone_index,
        };
        self.journal.record(&mut self.run, stopped, now)?;

        self.write_diff_artifacts(deps);
        let diagnostics = StopDiagnostics::for_run(&self.run, reason, evidence, now);
        write_stop_diagnostics(&self.ctx, &diagnostics)?;

        let decision = evaluate_auto_resume(&self.run, reason, &self.config.resilience);
        if decision.should_resume {
            let due = resume_at(now, decision.delay);
            self.run.next_resume_at = Some(due);
            self.journal.record(
                &mut self.run,
                EventKind::AutoResumeScheduled {
                    attempt: decision.attempt,
                    delay_ms: decision.delay.as_millis() as u64,
                    resume_at: due,
                },
                now,
            )?;
        }
        self.journal.save(&self.run)?;
        warn!(
            run_id = %self.run.run_id,
            %reason,
            phase = %self.run.phase,
            milestone = self.run.milestone_index,
            auto_resume = decision.should_resume,
            "run halted"
        );
        Ok(StepOutcome::Halted(reason))
    }

    fn write_diff_artifacts(&self, deps: &SupervisorDeps<'_>) {
        let (Some(worktree), Some(base)) = (&self.run.worktree_path, &self.run.base_sha) else {
            return;
        };
        let artifacts = deps
            .workspace
            .diff(worktree, base)
            .and_then(|patch| Ok((patch, deps.workspace.diffstat(worktree, base)?)));
        match artifacts {
            Ok((patch, stat)) => {
                if let Err(err) = write_diff_artifacts(&self.ctx, &patch, &stat) {
                    warn!(run_id = %self.run.run_id, error = %err, "failed to write diff artifacts");
                }
            }
            Err(err) => warn!(run_id = %self.run.run_id, error = %err, "failed to collect diff"),
        }
    }

    fn worktree(&self) -> Result<(PathBuf, String), SupervisorError> {
        match (&self.run.worktree_path, &self.run.base_sha) {
            (Some(path), Some(base)) => Ok((path.clone(), base.clone())),
            _ => Err(SupervisorError::MissingWorktree {
                run_id: self.run.run_id.clone(),
            }),
        }
    }

    fn current_milestone(&self) -> Result<Milestone, SupervisorError> {
        self.run
            .current_milestone()
            .cloned()
            .ok_or(SupervisorError::MissingMilestone {
                run_id: self.run.run_id.clone(),
                index: self.run.milestone_index,
            })
    }

    fn prompt(&self, milestone: Option<&Milestone>, diff: Option<&str>, evidence: &[VerifyResult]) -> String {
        build_prompt(&PromptInput {
            phase: self.run.phase,
            task_title: &self.run.task_title,
            task_body: &self.task.body,
            milestone,
            milestone_index: self.run.milestone_index,
            milestone_count: self.run.milestones.len(),
            scope: &self.run.scope_lock,
            owns: &self.run.owns,
            pending_review_requests: &self.run.pending_review_requests,
            last_verify_failure: self.run.last_verify_failure.as_deref(),
            diff,
            evidence,
        })
    }

    fn call_worker(
        &mut self,
        deps: &SupervisorDeps<'_>,
        adapter: &dyn WorkerAdapter,
        prompt: String,
        now: DateTime<Utc>,
    ) -> Result<WorkerCall, SupervisorError> {
        let (cwd, _) = self.worktree()?;
        let phase = self.run.phase;
        let invoked = EventKind::WorkerInvoked {
            phase,
            milestone_index: self.run.milestone_index,
        };
        self.journal.record(&mut self.run, invoked, now)?;

        let request = WorkerRequest {
            run_id: self.run.run_id.clone(),
            phase,
            prompt,
            cwd: cwd.clone(),
            timeout: Duration::from_secs(self.config.resilience.max_worker_call_minutes.saturating_mul(60)),
            cancel: self.cancel.clone(),
        };
        let invoked = adapter.invoke(&request);
        let finished_at = self.after_blocking(now);
        match invoked {
            Ok(result) => {
                self.journal.record(
                    &mut self.run,
                    EventKind::WorkerCompleted {
                        phase,
                        status: result.status.as_str().to_string(),
                        commands_run: result.commands_run.clone(),
                        observations: result.observations.clone(),
                        patch: result.patch.clone(),
                        handoff_memo: result.handoff_memo.clone(),
                    },
                    finished_at,
                )?;
                self.journal.save(&self.run)?;
                Ok(WorkerCall::Finished(result, finished_at))
            }
            Err(AgentError::Timeout { elapsed_ms }) => {
                self.journal.record(
                    &mut self.run,
                    EventKind::WorkerTimedOut { phase, elapsed_ms },
                    finished_at,
                )?;
                self.halt(
                    deps,
                    StopReason::WorkerCallTimeout,
                    json!({ "phase": phase, "elapsed_ms": elapsed_ms }),
                    finished_at,
                )?;
                Ok(WorkerCall::Halted(StopReason::WorkerCallTimeout))
            }
            Err(AgentError::Cancelled) => {
                info!(run_id = %self.run.run_id, %phase, "worker call cancelled");
                Ok(WorkerCall::Interrupted)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Time after a blocking call returned, never earlier than `started`.
    fn after_blocking(&self, started: DateTime<Utc>) -> DateTime<Utc> {
        (self.clock)().max(started)
    }

    /// Blocked escalates; failed spends a milestone retry or halts.
    fn worker_setback(
        &mut self,
        deps: &SupervisorDeps<'_>,
        result: &WorkerResult,
        now: DateTime<Utc>,
    ) -> Result<StepOutcome, SupervisorError> {
        let evidence = json!({
            "phase": self.run.phase,
            "status": result.status.as_str(),
            "exit_code": result.exit_code,
            "handoff_memo": result.handoff_memo,
            "output_tail": tail(&result.output, 4_000),
        });
        if result.status == WorkerStatus::Blocked {
            return self.halt(deps, StopReason::WorkerBlocked, evidence, now);
        }
        if self.run.milestone_retries >= self.config.resilience.max_milestone_retries {
            return self.halt(deps, StopReason::WorkerFailed, evidence, now);
        }
        self.run.milestone_retries += 1;
        self.run.retries += 1;
        self.transition(PhaseEvent::WorkerRetry, now)?;
        Ok(StepOutcome::Progressed)
    }

    fn plan(
        &mut self,
        deps: &SupervisorDeps<'_>,
        now: DateTime<Utc>,
    ) -> Result<StepOutcome, SupervisorError> {
        let (milestones, from_worker, now) = if !self.run.milestones.is_empty() {
            (self.run.milestones.clone(), false, now)
        } else if !self.task.milestones.is_empty() {
            (self.task.planned_milestones(), false, now)
        } else {
            let prompt = self.prompt(None, None, &[]);
            let (result, now) = match self.call_worker(deps, deps.worker, prompt, now)? {
                WorkerCall::Finished(result, at) => (result, at),
                WorkerCall::Halted(reason) => return Ok(StepOutcome::Halted(reason)),
                WorkerCall::Interrupted => return Ok(StepOutcome::Interrupted),
            };
            if result.status != WorkerStatus::Ok {
                return self.worker_setback(deps, &result, now);
            }
            let mut milestones = result.milestones;
            if milestones.is_empty() {
                milestones.push(
                    Milestone::new(self.run.task_title.clone())
                        .with_risk(self.task.risk.unwrap_or_default()),
                );
            }
            (milestones, true, now)
        };

        let violations = plan_violations(&milestones, &self.run.scope_lock, &self.run.owns);
        if !violations.is_empty() {
            self.journal.record(
                &mut self.run,
                EventKind::ScopeViolated {
                    reason: StopReason::PlanScopeViolation,
                    violating_files: violations.clone(),
                },
                now,
            )?;
            return self.halt(
                deps,
                StopReason::PlanScopeViolation,
                json!({ "violating_files": violations, "milestones": milestones }),
                now,
            );
        }

        info!(run_id = %self.run.run_id, milestones = milestones.len(), from_worker, "plan accepted");
        self.run.milestones = milestones.clone();
        self.run.milestone_retries = 0;
        self.journal.record(
            &mut self.run,
            EventKind::PlanRecorded {
                milestones,
                from_worker,
            },
            now,
        )?;
        self.transition(PhaseEvent::PlanAccepted, now)?;
        Ok(StepOutcome::Progressed)
    }

    fn start_milestone(&mut self, now: DateTime<Utc>) -> Result<StepOutcome, SupervisorError> {
        let milestone = self.current_milestone()?;
        self.run.reset_milestone_counters();
        let started = EventKind::MilestoneStarted {
            index: self.run.milestone_index,
            goal: milestone.goal,
        };
        self.journal.record(&mut self.run, started, now)?;
        self.transition(PhaseEvent::MilestoneBegun, now)?;
        Ok(StepOutcome::Progressed)
    }

    fn implement(
        &mut self,
        deps: &SupervisorDeps<'_>,
        now: DateTime<Utc>,
    ) -> Result<StepOutcome, SupervisorError> {
        let milestone = self.current_milestone()?;
        let prompt = self.prompt(Some(&milestone), None, &[]);
        let (result, now) = match self.call_worker(deps, deps.worker, prompt, now)? {
            WorkerCall::Finished(result, at) => (result, at),
            WorkerCall::Halted(reason) => return Ok(StepOutcome::Halted(reason)),
            WorkerCall::Interrupted => return Ok(StepOutcome::Interrupted),
        };
        if result.status != WorkerStatus::Ok {
            return self.worker_setback(deps, &result, now);
        }
        self.run.pending_review_requests.clear();
        self.run.last_verify_failure = None;
        self.transition(PhaseEvent::WorkerOk, now)?;
        Ok(StepOutcome::Progressed)
    }

    fn verify(
        &mut self,
        deps: &SupervisorDeps<'_>,
        now: DateTime<Utc>,
    ) -> Result<StepOutcome, SupervisorError> {
        let (worktree, base) = self.worktree()?;
        let milestone = self.current_milestone()?;

        let changed = deps.workspace.changed_files(&worktree, &base)?;
        let guard = check_changes(
            &changed,
            &self.run.scope_lock,
            &self.run.owns,
            &self.config.scope.env_allowlist,
        );
        self.journal.record(
            &mut self.run,
            EventKind::GuardChecked {
                changed_files: guard.semantic_changed.clone(),
                ok: guard.ok,
            },
            now,
        )?;
        if let Some(reason) = guard.reason {
            return self.stop_for_scope(deps, reason, &guard.violating_files, &guard.semantic_changed, now);
        }

        self.run.verify_attempts += 1;
        let attempt = self.run.verify_attempts;
        let selection = select_tier(
            milestone.risk_level,
            &guard.semantic_changed,
            &self.config.verify.risk_triggers,
        );
        self.journal.record(
            &mut self.run,
            EventKind::TierSelected {
                tier: selection.tier,
                reasons: selection.reasons.clone(),
            },
            now,
        )?;

        let results = run_tiers(deps.verifier, &worktree, &selection.tiers(), &self.config.verify)?;
        let now = self.after_blocking(now);
        for result in &results {
            let log_path = self.ctx.verify_log_path(attempt, result.tier);
            write_verify_log(&log_path, result)?;
            self.journal.record(
                &mut self.run,
                EventKind::VerifyCompleted {
                    attempt,
                    result: result.clone(),
                    log_path: Some(log_path.display().to_string()),
                },
                now,
            )?;
        }

        let Some(failed) = results.iter().find(|result| !result.ok) else {
            info!(run_id = %self.run.run_id, attempt, tier = %selection.tier, "verification passed");
            self.run.last_verify_failure = None;
            self.transition(PhaseEvent::VerifyPassed, now)?;
            return Ok(StepOutcome::Progressed);
        };

        let summary = format!(
            "{} failed on `{}`{}\n{}",
            failed.tier,
            failed.failed_command.as_deref().unwrap_or("?"),
            if failed.timed_out { " (timed out)" } else { "" },
            tail(&failed.output, 4_000)
        );
        if self.run.milestone_retries >= self.config.resilience.max_milestone_retries {
            return self.halt(
                deps,
                StopReason::VerificationFailedMaxRetries,
                json!({
                    "attempt": attempt,
                    "milestone_retries": self.run.milestone_retries,
                    "tier": failed.tier,
                    "failed_command": failed.failed_command,
                    "output_tail": tail(&failed.output, 4_000),
                }),
                now,
            );
        }
        self.run.milestone_retries += 1;
        self.run.retries += 1;
        self.run.last_verify_failure = Some(summary);
        self.transition(PhaseEvent::VerifyFailed, now)?;
        Ok(StepOutcome::Progressed)
    }

    fn stop_for_scope(
        &mut self,
        deps: &SupervisorDeps<'_>,
        reason: StopReason,
        violating_files: &[String],
        semantic_changed: &[String],
        now: DateTime<Utc>,
    ) -> Result<StepOutcome, SupervisorError> {
        let (worktree, base) = self.worktree()?;
        self.journal.record(
            &mut self.run,
            EventKind::ScopeViolated {
                reason,
                violating_files: violating_files.to_vec(),
            },
            now,
        )?;
        // Artifacts first: the restore below discards the offending diff.
        self.write_diff_artifacts(deps);
        let restore_to = self.run.checkpoint_commit_sha.clone().unwrap_or(base);
        deps.workspace.restore(&worktree, &restore_to)?;
        warn!(
            run_id = %self.run.run_id,
            %reason,
            violating = violating_files.len(),
            restored_to = %restore_to,
            "scope guard rejected changes"
        );
        self.halt(
            deps,
            reason,
            json!({
                "violating_files": violating_files,
                "semantic_changed": semantic_changed,
                "owns": self.run.owns,
                "allowlist": self.run.scope_lock.allowlist,
                "denylist": self.run.scope_lock.denylist,
                "restored_to": restore_to,
            }),
            now,
        )
    }

    fn review(
        &mut self,
        deps: &SupervisorDeps<'_>,
        now: DateTime<Utc>,
    ) -> Result<StepOutcome, SupervisorError> {
        let (worktree, base) = self.worktree()?;
        let milestone = self.current_milestone()?;
        let since = self.run.checkpoint_commit_sha.clone().unwrap_or(base);
        let diff = deps.workspace.diff(&worktree, &since)?;
        let evidence = self.evidence_for_attempt(self.run.verify_attempts)?;
        let prompt = self.prompt(Some(&milestone), Some(&diff), &evidence);

        let (result, now) = match self.call_worker(deps, deps.reviewer, prompt, now)? {
            WorkerCall::Finished(result, at) => (result, at),
            WorkerCall::Halted(reason) => return Ok(StepOutcome::Halted(reason)),
            WorkerCall::Interrupted => return Ok(StepOutcome::Interrupted),
        };
        if result.status != WorkerStatus::Ok {
            return self.worker_setback(deps, &result, now);
        }

        let candidates: Vec<String> = self.config.verify.all_commands().cloned().collect();
        let feedback = parse_review(&result.output, &candidates);
        let signature = request_signature(&feedback.requests);
        let round = self.run.review_rounds + 1;
        self.journal.record(
            &mut self.run,
            EventKind::ReviewCompleted {
                round,
                approved: feedback.is_approved,
                requests: feedback.requests.clone(),
                commands_to_satisfy: feedback.commands_to_satisfy.clone(),
                signature: signature.clone(),
            },
            now,
        )?;

        if feedback.is_approved {
            self.transition(PhaseEvent::ReviewApproved, now)?;
            return Ok(StepOutcome::Progressed);
        }

        self.run.review_rounds = round;
        if is_review_loop(
            self.run.review_rounds,
            self.config.resilience.max_review_rounds,
            &signature,
            self.run.last_review_signature.as_deref(),
        ) {
            return self.halt(
                deps,
                StopReason::ReviewLoopDetected,
                json!({
                    "review_rounds": self.run.review_rounds,
                    "signature": signature,
                    "requests": feedback.requests,
                }),
                now,
            );
        }

        let mut requests = feedback.requests;
        for command in &feedback.commands_to_satisfy {
            requests.push(format!("Make sure `{command}` passes"));
        }
        self.run.last_review_signature = Some(signature);
        self.run.pending_review_requests = requests;
        self.transition(PhaseEvent::ChangesRequested, now)?;
        Ok(StepOutcome::Progressed)
    }

    fn evidence_for_attempt(&self, attempt: u32) -> Result<Vec<VerifyResult>, SupervisorError> {
        Ok(self
            .journal
            .events()?
            .into_iter()
            .filter_map(|event| match event.kind {
                EventKind::VerifyCompleted {
                    attempt: seen,
                    result,
                    ..
                } if seen == attempt => Some(result),
                _ => None,
            })
            .collect())
    }

    /// Whether `milestone_completed` was already recorded since the run last
    /// entered CHECKPOINT, i.e. a crash hit between the two writes.
    fn checkpoint_already_recorded(&self) -> Result<bool, SupervisorError> {
        let events = self.journal.events()?;
        let entered = events.iter().rposition(|event| {
            matches!(
                event.kind,
                EventKind::PhaseChanged {
                    to: Phase::Checkpoint,
                    ..
                }
            )
        });
        let Some(entered) = entered else {
            return Ok(false);
        };
        Ok(events[entered..]
            .iter()
            .any(|event| matches!(event.kind, EventKind::MilestoneCompleted { .. })))
    }

    fn checkpoint(
        &mut self,
        deps: &SupervisorDeps<'_>,
        now: DateTime<Utc>,
    ) -> Result<StepOutcome, SupervisorError> {
        if !self.checkpoint_already_recorded()? {
            let (worktree, base) = self.worktree()?;
            let milestone = self.current_milestone()?;
            let message = checkpoint_message(&self.run.run_id, self.run.milestone_index, &milestone.goal);
            let index = self.run.milestone_index;

            let committed = deps
                .checkpointer
                .commit(&worktree, &message, &self.config.scope.env_allowlist)
                .and_then(|sha| match sha {
                    Some(sha) => Ok((Some(sha), true)),
                    None => deps.checkpointer.head(&worktree).map(|head| (Some(head), false)),
                });
            let (sha, created) = match committed {
                Ok(found) => found,
                Err(err) => {
                    return self.halt(
                        deps,
                        StopReason::CheckpointFailed,
                        json!({ "error": err.to_string() }),
                        now,
                    );
                }
            };

            let kind = match sha {
                Some(sha) if created => EventKind::CheckpointCreated {
                    milestone_index: index,
                    sha,
                },
                Some(sha) if sha != base => EventKind::CheckpointReused {
                    milestone_index: index,
                    sha,
                },
                _ => EventKind::CheckpointSkipped {
                    milestone_index: index,
                },
            };
            if let EventKind::CheckpointCreated { sha, .. } | EventKind::CheckpointReused { sha, .. } = &kind {
                self.run.record_checkpoint(Some(sha.clone()), now);
                info!(run_id = %self.run.run_id, milestone = index, sha = %sha, "checkpoint recorded");
            }
            self.journal.record(&mut self.run, kind, now)?;
            self.run.milestone_index = index + 1;
            self.journal
                .record(&mut self.run, EventKind::MilestoneCompleted { index }, now)?;
        }

        if self.run.has_remaining_milestones() {
            self.transition(PhaseEvent::CheckpointNext, now)?;
            return Ok(StepOutcome::Progressed);
        }
        self.transition(PhaseEvent::CheckpointFinal, now)?;
        self.write_diff_artifacts(deps);
        if let Some(worktree) = &self.run.worktree_path {
            if let Err(err) = deps.workspace.release(worktree) {
                warn!(run_id = %self.run.run_id, error = %err, "failed to remove finished worktree");
            }
        }
        info!(run_id = %self.run.run_id, milestones = self.run.milestones.len(), "run done");
        Ok(StepOutcome::Done)
    }
}

/// Last `max_bytes` of `text`, on a char boundary.
fn tail(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
