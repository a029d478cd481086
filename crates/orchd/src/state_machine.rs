//! Run phase transitions as an explicit `(Phase, PhaseEvent) -> Phase` table.

use chrono::{DateTime, Utc};
use orch_core::state::{Phase, StopReason};
use orch_core::types::Run;

#[derive(Debug, thiserror::Error)]
pub enum StateMachineError {
    #[error("invalid run phase transition: {from} on {event}")]
    InvalidTransition { from: Phase, event: &'static str },
}

/// Everything that can move a run between phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    /// Worktree prepared.
    Start,
    PlanAccepted,
    MilestoneBegun,
    WorkerOk,
    /// Worker failed but the milestone retry budget allows another call.
    WorkerRetry,
    VerifyPassed,
    VerifyFailed,
    ReviewApproved,
    ChangesRequested,
    /// Checkpoint committed and milestones remain.
    CheckpointNext,
    /// Checkpoint committed for the last milestone.
    CheckpointFinal,
    Halt(StopReason),
    /// Explicit or automatic resume of a halted run into `to`.
    Resume { to: Phase },
}

impl PhaseEvent {
    pub fn name(self) -> &'static str {
        match self {
            PhaseEvent::Start => "start",
            PhaseEvent::PlanAccepted => "plan_accepted",
            PhaseEvent::MilestoneBegun => "milestone_begun",
            PhaseEvent::WorkerOk => "worker_ok",
            PhaseEvent::WorkerRetry => "worker_retry",
            PhaseEvent::VerifyPassed => "verify_passed",
            PhaseEvent::VerifyFailed => "verify_failed",
            PhaseEvent::ReviewApproved => "review_approved",
            PhaseEvent::ChangesRequested => "changes_requested",
            PhaseEvent::CheckpointNext => "checkpoint_next",
            PhaseEvent::CheckpointFinal => "checkpoint_final",
            PhaseEvent::Halt(_) => "halt",
            PhaseEvent::Resume { .. } => "resume",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseTransition {
    pub from: Phase,
    pub to: Phase,
    pub event: PhaseEvent,
    pub at: DateTime<Utc>,
}

/// The transition table. `None` means the event is not valid in `from`.
pub fn next_phase(from: Phase, event: PhaseEvent) -> Option<Phase> {
    use Phase::*;

    match (from, event) {
        (Init, PhaseEvent::Start) => Some(Plan),
        (Plan, PhaseEvent::PlanAccepted) => Some(MilestoneStart),
        (MilestoneStart, PhaseEvent::MilestoneBegun) => Some(Implement),
        (Implement, PhaseEvent::WorkerOk) => Some(Verify),
        (Plan | Implement | Review, PhaseEvent::WorkerRetry) => Some(from),
        (Verify, PhaseEvent::VerifyPassed) => Some(Review),
        (Verify, PhaseEvent::VerifyFailed) => Some(Implement),
        (Review, PhaseEvent::ReviewApproved) => Some(Checkpoint),
        (Review, PhaseEvent::ChangesRequested) => Some(Implement),
        (Checkpoint, PhaseEvent::CheckpointNext) => Some(MilestoneStart),
        (Checkpoint, PhaseEvent::CheckpointFinal) => Some(Done),
        // Escapes from any non-terminal phase, including a halted BLOCKED or
        // ESCALATED run that is stopped for good.
        (from, PhaseEvent::Halt(reason)) if !from.is_terminal() => Some(reason.halt_phase()),
        (Blocked | Escalated | Stopped, PhaseEvent::Resume { to }) if to.is_working() => Some(to),
        _ => None,
    }
}

/// Apply `event` to the run, or fail without touching it.
pub fn transition_run(
    run: &mut Run,
    event: PhaseEvent,
    at: DateTime<Utc>,
) -> Result<PhaseTransition, StateMachineError> {
    let from = run.phase;
    let to = next_phase(from, event).ok_or(StateMachineError::InvalidTransition {
        from,
        event: event.name(),
    })?;

    match event {
        PhaseEvent::Halt(reason) => run.halt(reason, at),
        PhaseEvent::Resume { .. } => {
            run.stop_reason = None;
            run.next_resume_at = None;
            run.enter_phase(to, at);
        }
        _ => run.enter_phase(to, at),
    }

    Ok(PhaseTransition {
        from,
        to,
        event,
        at,
    })
}
