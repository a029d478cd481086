//! Core records: runs, milestones, tracks and orchestrator state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::state::{Phase, StopReason};

static RUN_ID_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Unique, lexicographically sortable run identifier (`YYYYMMDDHHMMSSmmm-NNNN`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate(now: DateTime<Utc>) -> Self {
        let seq = RUN_ID_COUNTER.fetch_add(1, Ordering::Relaxed) % 10_000;
        Self(format!("{}-{seq:04}", now.format("%Y%m%d%H%M%S%3f")))
    }

    /// Branch name used for this run's worktree.
    pub fn branch_name(&self) -> String {
        format!("relay/{}", self.0)
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RunId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrackId(pub String);

impl TrackId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TrackId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrchestratorId(pub String);

impl OrchestratorId {
    pub fn generate(now: DateTime<Utc>) -> Self {
        Self(format!("orch-{}", RunId::generate(now)))
    }
}

impl std::fmt::Display for OrchestratorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for OrchestratorId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

impl std::str::FromStr for RiskLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            other => Err(format!(
                "invalid risk level '{other}'. valid values: low, medium, high"
            )),
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Milestone {
    pub goal: String,
    #[serde(default)]
    pub files_expected: Vec<String>,
    #[serde(default)]
    pub done_checks: Vec<String>,
    #[serde(default)]
    pub risk_level: RiskLevel,
}

impl Milestone {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            files_expected: Vec::new(),
            done_checks: Vec::new(),
            risk_level: RiskLevel::default(),
        }
    }

    pub fn with_risk(mut self, risk_level: RiskLevel) -> Self {
        self.risk_level = risk_level;
        self
    }

    pub fn with_files(mut self, files: &[&str]) -> Self {
        self.files_expected = files.iter().map(|file| file.to_string()).collect();
        self
    }
}

/// Allow/deny glob patterns a run's changes must respect.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScopeLock {
    #[serde(default)]
    pub allowlist: Vec<String>,
    #[serde(default)]
    pub denylist: Vec<String>,
}

impl ScopeLock {
    pub fn is_unrestricted(&self) -> bool {
        self.allowlist.is_empty() && self.denylist.is_empty()
    }
}

/// One supervised unit of work. Owned by its supervisor, never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: RunId,
    pub phase: Phase,
    pub task_path: PathBuf,
    pub task_title: String,
    #[serde(default)]
    pub milestone_index: usize,
    #[serde(default)]
    pub milestones: Vec<Milestone>,
    #[serde(default)]
    pub scope_lock: ScopeLock,
    #[serde(default)]
    pub owns: Vec<String>,
    /// Total retries across all milestones.
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub milestone_retries: u32,
    #[serde(default)]
    pub verify_attempts: u32,
    #[serde(default)]
    pub checkpoint_commit_sha: Option<String>,
    #[serde(default)]
    pub stop_reason: Option<StopReason>,
    #[serde(default)]
    pub base_sha: Option<String>,
    #[serde(default)]
    pub worktree_path: Option<PathBuf>,
    #[serde(default)]
    pub branch: Option<String>,

    #[serde(default)]
    pub review_rounds: u32,
    #[serde(default)]
    pub last_review_signature: Option<String>,
    #[serde(default)]
    pub pending_review_requests: Vec<String>,
    /// Summary of the most recent failing verification, handed to the worker.
    #[serde(default)]
    pub last_verify_failure: Option<String>,

    #[serde(default)]
    pub auto_resumes: u32,
    #[serde(default)]
    pub next_resume_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_active_phase: Option<Phase>,
    /// Seq of the newest log event this snapshot reflects.
    #[serde(default)]
    pub last_event_seq: u64,
    pub last_progress_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn new(
        run_id: RunId,
        task_path: PathBuf,
        task_title: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id,
            phase: Phase::Init,
            task_path,
            task_title: task_title.into(),
            milestone_index: 0,
            milestones: Vec::new(),
            scope_lock: ScopeLock::default(),
            owns: Vec::new(),
            retries: 0,
            milestone_retries: 0,
            verify_attempts: 0,
            checkpoint_commit_sha: None,
            stop_reason: None,
            base_sha: None,
            worktree_path: None,
            branch: None,
            review_rounds: 0,
            last_review_signature: None,
            pending_review_requests: Vec::new(),
            last_verify_failure: None,
            auto_resumes: 0,
            next_resume_at: None,
            last_active_phase: None,
            last_event_seq: 0,
            last_progress_at: now,
            started_at: now,
            updated_at: now,
        }
    }

    pub fn with_scope(mut self, scope_lock: ScopeLock) -> Self {
        self.scope_lock = scope_lock;
        self
    }

    pub fn with_owns(mut self, owns: Vec<String>) -> Self {
        self.owns = owns;
        self
    }

    pub fn current_milestone(&self) -> Option<&Milestone> {
        self.milestones.get(self.milestone_index)
    }

    pub fn has_remaining_milestones(&self) -> bool {
        self.milestone_index < self.milestones.len()
    }

    /// Enter `phase` while the run is live.
    pub fn enter_phase(&mut self, phase: Phase, now: DateTime<Utc>) {
        self.phase = phase;
        self.updated_at = now;
        self.last_progress_at = now;
    }

    /// Halt with `reason`, remembering where the run was.
    pub fn halt(&mut self, reason: StopReason, now: DateTime<Utc>) {
        if !self.phase.is_halted() {
            self.last_active_phase = Some(self.phase);
        }
        self.phase = reason.halt_phase();
        self.stop_reason = Some(reason);
        self.updated_at = now;
    }

    /// Advance the checkpoint. A checkpoint is never cleared.
    pub fn record_checkpoint(&mut self, sha: Option<String>, now: DateTime<Utc>) {
        if let Some(sha) = sha {
            self.checkpoint_commit_sha = Some(sha);
        }
        self.updated_at = now;
    }

    /// Reset per-milestone counters when a milestone starts or a run is re-entered.
    pub fn reset_milestone_counters(&mut self) {
        self.milestone_retries = 0;
        self.review_rounds = 0;
        self.last_review_signature = None;
        self.pending_review_requests.clear();
        self.last_verify_failure = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Run reached DONE.
    Completed,
    /// Run halted with a stop reason.
    Stopped,
    /// Run could not be launched at all.
    Failed,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Completed => "completed",
            StepStatus::Stopped => "stopped",
            StepStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    pub status: StepStatus,
    #[serde(default)]
    pub stop_reason: Option<StopReason>,
    pub elapsed_ms: u64,
    #[serde(default)]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackStep {
    pub task: PathBuf,
    #[serde(default)]
    pub owns: Vec<String>,
    #[serde(default)]
    pub run_id: Option<RunId>,
    #[serde(default)]
    pub result: Option<StepResult>,
}

impl TrackStep {
    pub fn new(task: impl Into<PathBuf>, owns: Vec<String>) -> Self {
        Self {
            task: task.into(),
            owns,
            run_id: None,
            result: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub id: TrackId,
    pub name: String,
    #[serde(default)]
    pub steps: Vec<TrackStep>,
}

impl Track {
    /// Index of the first step without a recorded result.
    pub fn cursor(&self) -> Option<usize> {
        self.steps.iter().position(|step| step.result.is_none())
    }

    pub fn is_complete(&self) -> bool {
        self.cursor().is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    #[default]
    Serialize,
    Parallel,
}

impl CollisionPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            CollisionPolicy::Serialize => "serialize",
            CollisionPolicy::Parallel => "parallel",
        }
    }
}

impl std::str::FromStr for CollisionPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "serialize" => Ok(CollisionPolicy::Serialize),
            "parallel" => Ok(CollisionPolicy::Parallel),
            other => Err(format!(
                "invalid collision policy '{other}'. valid values: serialize, parallel"
            )),
        }
    }
}

impl std::fmt::Display for CollisionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorStatus {
    #[default]
    Running,
    Completed,
    MaxTicksReached,
    TimeBudgetExceeded,
    /// Interrupted by a signal; resumable.
    Interrupted,
}

impl OrchestratorStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrchestratorStatus::Running => "running",
            OrchestratorStatus::Completed => "completed",
            OrchestratorStatus::MaxTicksReached => "max_ticks_reached",
            OrchestratorStatus::TimeBudgetExceeded => "time_budget_exceeded",
            OrchestratorStatus::Interrupted => "interrupted",
        }
    }

    pub fn is_finished(self) -> bool {
        self != OrchestratorStatus::Running
    }
}

impl std::fmt::Display for OrchestratorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorState {
    pub orchestrator_id: OrchestratorId,
    pub tracks: Vec<Track>,
    #[serde(default)]
    pub active_runs: BTreeMap<TrackId, RunId>,
    #[serde(default)]
    pub collision_policy: CollisionPolicy,
    pub time_budget_minutes: u64,
    pub max_ticks: u64,
    /// Budgets as first configured; a resume after exhaustion grants them again.
    #[serde(default)]
    pub tick_allowance: u64,
    #[serde(default)]
    pub time_allowance_minutes: u64,
    #[serde(default)]
    pub status: OrchestratorStatus,
    #[serde(default)]
    pub stop_reason: Option<StopReason>,
    #[serde(default)]
    pub ticks: u64,
    /// Wall time spent inside ticks; time spent crashed or paused is excluded.
    #[serde(default)]
    pub active_elapsed_ms: u64,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrchestratorState {
    pub fn new(
        orchestrator_id: OrchestratorId,
        tracks: Vec<Track>,
        collision_policy: CollisionPolicy,
        time_budget_minutes: u64,
        max_ticks: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            orchestrator_id,
            tracks,
            active_runs: BTreeMap::new(),
            collision_policy,
            time_budget_minutes,
            max_ticks,
            tick_allowance: max_ticks,
            time_allowance_minutes: time_budget_minutes,
            status: OrchestratorStatus::Running,
            stop_reason: None,
            ticks: 0,
            active_elapsed_ms: 0,
            started_at: now,
            updated_at: now,
        }
    }

    pub fn track(&self, id: &TrackId) -> Option<&Track> {
        self.tracks.iter().find(|track| &track.id == id)
    }

    pub fn track_mut(&mut self, id: &TrackId) -> Option<&mut Track> {
        self.tracks.iter_mut().find(|track| &track.id == id)
    }

    pub fn all_tracks_complete(&self) -> bool {
        self.active_runs.is_empty() && self.tracks.iter().all(Track::is_complete)
    }

    pub fn time_budget_ms(&self) -> u64 {
        self.time_budget_minutes.saturating_mul(60_000)
    }
}
