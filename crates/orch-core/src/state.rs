//! Run phases, stop reasons and verification records.

use serde::{Deserialize, Serialize};

/// Supervisor phases for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    /// Run directory and worktree exist, nothing executed yet
    Init,
    /// Milestone breakdown requested or loaded
    Plan,
    /// Cursor positioned on a milestone, counters reset
    MilestoneStart,
    /// Worker is changing code for the current milestone
    Implement,
    /// Scope guard and tiered verification
    Verify,
    /// Reviewer inspects diff and evidence
    Review,
    /// Verified milestone is committed
    Checkpoint,
    /// All milestones checkpointed
    Done,
    /// Halted on a failure that needs a fix before resuming
    Blocked,
    /// Halted because the worker asked for a human
    Escalated,
    /// Halted for good unless resumed explicitly
    Stopped,
}

impl Phase {
    pub const ALL: [Phase; 11] = [
        Phase::Init,
        Phase::Plan,
        Phase::MilestoneStart,
        Phase::Implement,
        Phase::Verify,
        Phase::Review,
        Phase::Checkpoint,
        Phase::Done,
        Phase::Blocked,
        Phase::Escalated,
        Phase::Stopped,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Init => "INIT",
            Phase::Plan => "PLAN",
            Phase::MilestoneStart => "MILESTONE_START",
            Phase::Implement => "IMPLEMENT",
            Phase::Verify => "VERIFY",
            Phase::Review => "REVIEW",
            Phase::Checkpoint => "CHECKPOINT",
            Phase::Done => "DONE",
            Phase::Blocked => "BLOCKED",
            Phase::Escalated => "ESCALATED",
            Phase::Stopped => "STOPPED",
        }
    }

    /// Returns true for `DONE` and `STOPPED`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Done | Phase::Stopped)
    }

    /// Returns true when no further phase executes without an explicit resume.
    pub fn is_halted(self) -> bool {
        matches!(
            self,
            Phase::Done | Phase::Stopped | Phase::Blocked | Phase::Escalated
        )
    }

    /// Returns true for phases that do work (not halted, not INIT).
    pub fn is_working(self) -> bool {
        !self.is_halted() && self != Phase::Init
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let needle = value.trim().to_ascii_uppercase();
        Phase::ALL
            .into_iter()
            .find(|phase| phase.as_str() == needle)
            .ok_or_else(|| {
                format!(
                    "invalid phase '{value}'. valid values: {}",
                    Phase::ALL.map(Phase::as_str).join(", ")
                )
            })
    }
}

/// Named terminal condition for a run or an orchestration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    VerificationFailedMaxRetries,
    ScopeViolation,
    OwnershipViolation,
    PlanScopeViolation,
    ReviewLoopDetected,
    StalledTimeout,
    WorkerCallTimeout,
    WorkerBlocked,
    WorkerFailed,
    CheckpointFailed,
    MaxTicksReached,
    TimeBudgetExceeded,
    SubmitConflict,
    DirtyTree,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::VerificationFailedMaxRetries => "verification_failed_max_retries",
            StopReason::ScopeViolation => "scope_violation",
            StopReason::OwnershipViolation => "ownership_violation",
            StopReason::PlanScopeViolation => "plan_scope_violation",
            StopReason::ReviewLoopDetected => "review_loop_detected",
            StopReason::StalledTimeout => "stalled_timeout",
            StopReason::WorkerCallTimeout => "worker_call_timeout",
            StopReason::WorkerBlocked => "worker_blocked",
            StopReason::WorkerFailed => "worker_failed",
            StopReason::CheckpointFailed => "checkpoint_failed",
            StopReason::MaxTicksReached => "max_ticks_reached",
            StopReason::TimeBudgetExceeded => "time_budget_exceeded",
            StopReason::SubmitConflict => "submit_conflict",
            StopReason::DirtyTree => "dirty_tree",
        }
    }

    /// Phase a run lands in when it halts for this reason.
    pub fn halt_phase(self) -> Phase {
        match self {
            StopReason::VerificationFailedMaxRetries
            | StopReason::ReviewLoopDetected
            | StopReason::WorkerFailed
            | StopReason::CheckpointFailed
            | StopReason::DirtyTree => Phase::Blocked,
            StopReason::WorkerBlocked => Phase::Escalated,
            _ => Phase::Stopped,
        }
    }

    /// Whether an explicit resume may pick the run back up.
    pub fn is_resumable(self) -> bool {
        !matches!(self, StopReason::SubmitConflict)
    }

    /// Whether the supervisor may resume without an operator.
    pub fn is_auto_resumable(self) -> bool {
        matches!(
            self,
            StopReason::StalledTimeout | StopReason::WorkerCallTimeout
        )
    }

    /// Reasons that are about files outside the run's allowed scope.
    pub fn is_scope_related(self) -> bool {
        matches!(
            self,
            StopReason::ScopeViolation
                | StopReason::OwnershipViolation
                | StopReason::PlanScopeViolation
        )
    }

    /// One-line operator hint written into stop diagnostics.
    pub fn remedy(self) -> &'static str {
        match self {
            StopReason::VerificationFailedMaxRetries => {
                "fix the failing verification command in the worktree, then resume"
            }
            StopReason::ScopeViolation | StopReason::OwnershipViolation => {
                "widen the scope (allowlist/owns) or narrow the task, then resume"
            }
            StopReason::PlanScopeViolation => "adjust the plan or scope, then resume",
            StopReason::ReviewLoopDetected => {
                "address the repeated reviewer requests manually, then resume"
            }
            StopReason::StalledTimeout | StopReason::WorkerCallTimeout => {
                "resume; raise max_worker_call_minutes if this repeats"
            }
            StopReason::WorkerBlocked => "answer the worker's question in the task file, then resume",
            StopReason::WorkerFailed => "inspect worker output in the event log, then resume",
            StopReason::CheckpointFailed => "inspect the worktree git state, then resume",
            StopReason::MaxTicksReached | StopReason::TimeBudgetExceeded => {
                "resume the orchestration with a larger budget"
            }
            StopReason::SubmitConflict => "resolve the conflict outside relay and integrate manually",
            StopReason::DirtyTree => "commit or stash local changes, then retry",
        }
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StopReason {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let all = [
            StopReason::VerificationFailedMaxRetries,
            StopReason::ScopeViolation,
            StopReason::OwnershipViolation,
            StopReason::PlanScopeViolation,
            StopReason::ReviewLoopDetected,
            StopReason::StalledTimeout,
            StopReason::WorkerCallTimeout,
            StopReason::WorkerBlocked,
            StopReason::WorkerFailed,
            StopReason::CheckpointFailed,
            StopReason::MaxTicksReached,
            StopReason::TimeBudgetExceeded,
            StopReason::SubmitConflict,
            StopReason::DirtyTree,
        ];
        let needle = value.trim().to_ascii_lowercase();
        all.into_iter()
            .find(|reason| reason.as_str() == needle)
            .ok_or_else(|| format!("unknown stop reason '{value}'"))
    }
}

/// Verification tiers, cheapest first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum VerifyTier {
    /// Fast checks (format, lint)
    #[default]
    Tier0,
    /// Build-level checks
    Tier1,
    /// Full test suite
    Tier2,
}

impl VerifyTier {
    pub const ALL: [VerifyTier; 3] = [VerifyTier::Tier0, VerifyTier::Tier1, VerifyTier::Tier2];

    pub fn as_str(self) -> &'static str {
        match self {
            VerifyTier::Tier0 => "tier0",
            VerifyTier::Tier1 => "tier1",
            VerifyTier::Tier2 => "tier2",
        }
    }

    /// Every tier up to and including `self`.
    pub fn up_to(self) -> Vec<VerifyTier> {
        VerifyTier::ALL
            .into_iter()
            .filter(|tier| *tier <= self)
            .collect()
    }
}

impl std::fmt::Display for VerifyTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one verification attempt for one tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyResult {
    pub tier: VerifyTier,
    /// Commands actually executed, in order.
    pub commands: Vec<String>,
    pub ok: bool,
    pub duration_ms: u64,
    /// Combined stdout/stderr, bounded.
    pub output: String,
    #[serde(default)]
    pub failed_command: Option<String>,
    #[serde(default)]
    pub timed_out: bool,
}

impl VerifyResult {
    pub fn skipped(tier: VerifyTier) -> Self {
        Self {
            tier,
            commands: Vec::new(),
            ok: true,
            duration_ms: 0,
            output: String::new(),
            failed_command: None,
            timed_out: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_serializes_as_screaming_snake_case() {
        let json = serde_json::to_string(&Phase::MilestoneStart).unwrap();
        assert_eq!(json, "\"MILESTONE_START\"");
        let decoded: Phase = serde_json::from_str("\"CHECKPOINT\"").unwrap();
        assert_eq!(decoded, Phase::Checkpoint);
    }

    #[test]
    fn phase_parses_its_own_tag() {
        for phase in Phase::ALL {
            assert_eq!(phase.as_str().parse::<Phase>().unwrap(), phase);
        }
        assert_eq!("milestone_start".parse::<Phase>().unwrap(), Phase::MilestoneStart);
        assert!("WAITING".parse::<Phase>().is_err());
    }

    #[test]
    fn only_done_and_stopped_are_terminal() {
        for phase in Phase::ALL {
            let expected = matches!(phase, Phase::Done | Phase::Stopped);
            assert_eq!(phase.is_terminal(), expected, "{phase}");
        }
    }

    #[test]
    fn blocked_and_escalated_are_halted_but_not_terminal() {
        assert!(Phase::Blocked.is_halted());
        assert!(Phase::Escalated.is_halted());
        assert!(!Phase::Blocked.is_terminal());
        assert!(!Phase::Implement.is_halted());
        assert!(!Phase::Init.is_working());
        assert!(Phase::Verify.is_working());
    }

    #[test]
    fn display_matches_serialized_tag() {
        for phase in Phase::ALL {
            let json = serde_json::to_string(&phase).unwrap();
            assert_eq!(json, format!("\"{phase}\""));
        }
    }

    #[test]
    fn stop_reason_serializes_in_snake_case_and_parses_back() {
        let json = serde_json::to_string(&StopReason::VerificationFailedMaxRetries).unwrap();
        assert_eq!(json, "\"verification_failed_max_retries\"");
        let parsed: StopReason = "review_loop_detected".parse().unwrap();
        assert_eq!(parsed, StopReason::ReviewLoopDetected);
        assert!("nope".parse::<StopReason>().is_err());
    }

    #[test]
    fn stop_reason_halt_phases() {
        assert_eq!(
            StopReason::VerificationFailedMaxRetries.halt_phase(),
            Phase::Blocked
        );
        assert_eq!(StopReason::WorkerBlocked.halt_phase(), Phase::Escalated);
        assert_eq!(StopReason::ScopeViolation.halt_phase(), Phase::Stopped);
        assert_eq!(StopReason::WorkerCallTimeout.halt_phase(), Phase::Stopped);
    }

    #[test]
    fn only_timeouts_auto_resume_and_conflicts_never_resume() {
        assert!(StopReason::StalledTimeout.is_auto_resumable());
        assert!(StopReason::WorkerCallTimeout.is_auto_resumable());
        assert!(!StopReason::ScopeViolation.is_auto_resumable());
        assert!(!StopReason::SubmitConflict.is_resumable());
        assert!(StopReason::ScopeViolation.is_resumable());
    }

    #[test]
    fn tier_up_to_is_cumulative_and_ordered() {
        assert_eq!(VerifyTier::Tier0.up_to(), vec![VerifyTier::Tier0]);
        assert_eq!(
            VerifyTier::Tier2.up_to(),
            vec![VerifyTier::Tier0, VerifyTier::Tier1, VerifyTier::Tier2]
        );
        assert!(VerifyTier::Tier1 > VerifyTier::Tier0);
    }
}
