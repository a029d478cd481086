//! Auto-resume scheduling and stall detection for halted runs.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use orch_core::config::ResilienceConfig;
use orch_core::state::StopReason;
use orch_core::types::Run;
use std::time::Duration;

/// When and how a halted run should be picked back up automatically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeDecision {
    pub should_resume: bool,
    /// 1-based number of the automatic resume being scheduled.
    pub attempt: u32,
    pub delay: Duration,
    pub reason: String,
}

/// Delay before automatic resume number `attempt` (1-based). The last
/// configured delay repeats. `None` once the resume budget is spent or when
/// auto-resume is off.
pub fn auto_resume_delay(config: &ResilienceConfig, attempt: u32) -> Option<Duration> {
    if !config.auto_resume || attempt == 0 || attempt > config.max_auto_resumes {
        return None;
    }
    let last = config.auto_resume_delays_ms.len().saturating_sub(1);
    let index = (attempt as usize - 1).min(last);
    let delay_ms = config
        .auto_resume_delays_ms
        .get(index)
        .copied()
        .unwrap_or(0);
    Some(Duration::from_millis(delay_ms))
}

/// Decide whether a run halted with `reason` gets another automatic resume.
pub fn evaluate_auto_resume(
    run: &Run,
    reason: StopReason,
    config: &ResilienceConfig,
) -> ResumeDecision {
    let attempt = run.auto_resumes + 1;
    if !reason.is_auto_resumable() {
        return ResumeDecision {
            should_resume: false,
            attempt,
            delay: Duration::ZERO,
            reason: format!("{reason} needs an operator"),
        };
    }
    if !config.auto_resume {
        return ResumeDecision {
            should_resume: false,
            attempt,
            delay: Duration::ZERO,
            reason: "auto_resume disabled".to_string(),
        };
    }
    match auto_resume_delay(config, attempt) {
        Some(delay) => ResumeDecision {
            should_resume: true,
            attempt,
            delay,
            reason: format!(
                "auto-resume {attempt}/{} in {}ms",
                config.max_auto_resumes,
                delay.as_millis()
            ),
        },
        None => ResumeDecision {
            should_resume: false,
            attempt,
            delay: Duration::ZERO,
            reason: format!(
                "max auto resumes ({}) exhausted",
                config.max_auto_resumes
            ),
        },
    }
}

/// Absolute time at which a resume scheduled now with `delay` becomes due.
pub fn resume_at(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    let millis = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
    now.checked_add_signed(ChronoDuration::milliseconds(millis))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub fn is_resume_due(run: &Run, now: DateTime<Utc>) -> bool {
    run.next_resume_at.is_some_and(|at| at <= now)
}

/// No progress event for `stall_timeout_minutes`. Zero disables detection.
pub fn is_stalled(
    last_progress_at: DateTime<Utc>,
    now: DateTime<Utc>,
    stall_timeout_minutes: u64,
) -> bool {
    if stall_timeout_minutes == 0 {
        return false;
    }
    let idle_minutes = now.signed_duration_since(last_progress_at).num_minutes();
    u64::try_from(idle_minutes).is_ok_and(|idle| idle >= stall_timeout_minutes)
}
