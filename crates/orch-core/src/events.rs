use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::{Phase, StopReason, VerifyResult, VerifyTier};
use crate::types::{Milestone, OrchestratorStatus, RunId, StepResult, TrackId};

/// Everything recorded in a run or orchestration log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum EventKind {
    RunStarted {
        task_path: String,
        task_title: String,
        base_sha: Option<String>,
        worktree_path: Option<String>,
        branch: Option<String>,
    },
    PhaseChanged {
        from: Phase,
        to: Phase,
        trigger: String,
    },
    PlanRecorded {
        milestones: Vec<Milestone>,
        from_worker: bool,
    },
    MilestoneStarted {
        index: usize,
        goal: String,
    },
    WorkerInvoked {
        phase: Phase,
        milestone_index: usize,
    },
    WorkerCompleted {
        phase: Phase,
        status: String,
        #[serde(default)]
        commands_run: Vec<String>,
        #[serde(default)]
        observations: Vec<String>,
        #[serde(default)]
        patch: Option<String>,
        #[serde(default)]
        handoff_memo: Option<String>,
    },
    WorkerTimedOut {
        phase: Phase,
        elapsed_ms: u64,
    },
    TierSelected {
        tier: VerifyTier,
        reasons: Vec<String>,
    },
    VerifyCompleted {
        attempt: u32,
        result: VerifyResult,
        #[serde(default)]
        log_path: Option<String>,
    },
    GuardChecked {
        changed_files: Vec<String>,
        ok: bool,
    },
    ScopeViolated {
        reason: StopReason,
        violating_files: Vec<String>,
    },
    ReviewCompleted {
        round: u32,
        approved: bool,
        requests: Vec<String>,
        #[serde(default)]
        commands_to_satisfy: Vec<String>,
        signature: String,
    },
    CheckpointCreated {
        milestone_index: usize,
        sha: String,
    },
    CheckpointReused {
        milestone_index: usize,
        sha: String,
    },
    CheckpointSkipped {
        milestone_index: usize,
    },
    MilestoneCompleted {
        index: usize,
    },
    RunStopped {
        reason: StopReason,
        phase: Phase,
        milestone_index: usize,
    },
    RunResumed {
        from: Phase,
        to: Phase,
        #[serde(default)]
        reason: Option<StopReason>,
        automatic: bool,
    },
    /// A live run taken over by a new supervisor process.
    RunAdopted {
        phase: Phase,
    },
    AutoResumeScheduled {
        attempt: u32,
        delay_ms: u64,
        resume_at: DateTime<Utc>,
    },
    SubmitStarted {
        target: String,
        dry_run: bool,
    },
    SubmitCompleted {
        target: String,
        head_sha: String,
        pushed: bool,
    },
    SubmitDryRun {
        target: String,
        clean: bool,
        conflicted_files: Vec<String>,
    },
    SubmitConflict {
        target: String,
        conflicted_files: Vec<String>,
    },
    TrackStepStarted {
        track: TrackId,
        step: usize,
        run_id: RunId,
    },
    TrackStepDeferred {
        track: TrackId,
        step: usize,
        blocked_by: TrackId,
    },
    TrackStepCompleted {
        track: TrackId,
        step: usize,
        #[serde(default)]
        run_id: Option<RunId>,
        result: StepResult,
    },
    OrchestrationStopped {
        status: OrchestratorStatus,
        ticks: u64,
    },
    OrchestrationResumed {
        ticks: u64,
        active_runs: usize,
    },
}

impl EventKind {
    /// Snake-case tag, identical to the serialized `type`.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::RunStarted { .. } => "run_started",
            EventKind::PhaseChanged { .. } => "phase_changed",
            EventKind::PlanRecorded { .. } => "plan_recorded",
            EventKind::MilestoneStarted { .. } => "milestone_started",
            EventKind::WorkerInvoked { .. } => "worker_invoked",
            EventKind::WorkerCompleted { .. } => "worker_completed",
            EventKind::WorkerTimedOut { .. } => "worker_timed_out",
            EventKind::TierSelected { .. } => "tier_selected",
            EventKind::VerifyCompleted { .. } => "verify_completed",
            EventKind::GuardChecked { .. } => "guard_checked",
            EventKind::ScopeViolated { .. } => "scope_violated",
            EventKind::ReviewCompleted { .. } => "review_completed",
            EventKind::CheckpointCreated { .. } => "checkpoint_created",
            EventKind::CheckpointReused { .. } => "checkpoint_reused",
            EventKind::CheckpointSkipped { .. } => "checkpoint_skipped",
            EventKind::MilestoneCompleted { .. } => "milestone_completed",
            EventKind::RunStopped { .. } => "run_stopped",
            EventKind::RunResumed { .. } => "run_resumed",
            EventKind::RunAdopted { .. } => "run_adopted",
            EventKind::AutoResumeScheduled { .. } => "auto_resume_scheduled",
            EventKind::SubmitStarted { .. } => "submit_started",
            EventKind::SubmitCompleted { .. } => "submit_completed",
            EventKind::SubmitDryRun { .. } => "submit_dry_run",
            EventKind::SubmitConflict { .. } => "submit_conflict",
            EventKind::TrackStepStarted { .. } => "track_step_started",
            EventKind::TrackStepDeferred { .. } => "track_step_deferred",
            EventKind::TrackStepCompleted { .. } => "track_step_completed",
            EventKind::OrchestrationStopped { .. } => "orchestration_stopped",
            EventKind::OrchestrationResumed { .. } => "orchestration_resumed",
        }
    }

    /// Events that count as forward progress for stall detection.
    pub fn is_progress(&self) -> bool {
        !matches!(
            self,
            EventKind::AutoResumeScheduled { .. }
                | EventKind::RunStopped { .. }
                | EventKind::WorkerTimedOut { .. }
                | EventKind::SubmitStarted { .. }
                | EventKind::SubmitCompleted { .. }
                | EventKind::SubmitDryRun { .. }
                | EventKind::SubmitConflict { .. }
        )
    }
}

/// One log line. `seq` is gapless from 1 within a log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
    pub source: String,
    #[serde(default)]
    pub correlation_id: Option<String>,
}
