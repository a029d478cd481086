//! Turning raw worker output into a [`WorkerResult`].

use orch_core::types::Milestone;
use serde::Deserialize;

use crate::signal::{detect_common_signal, AgentSignalKind};
use crate::types::{WorkerResult, WorkerStatus};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireMilestone {
    Goal(String),
    Full(Milestone),
}

#[derive(Debug, Deserialize)]
struct WireResult {
    status: WorkerStatus,
    #[serde(default)]
    patch: Option<String>,
    #[serde(default)]
    commands_run: Vec<String>,
    #[serde(default)]
    observations: Vec<String>,
    #[serde(default)]
    handoff_memo: Option<String>,
    #[serde(default)]
    milestones: Vec<WireMilestone>,
}

/// The last line that parses as a JSON result object wins. Without one, the
/// `[needs_human]` / `[patch_ready]` markers decide, then the exit code.
pub fn parse_worker_output(output: &str, exit_code: Option<i32>) -> WorkerResult {
    let structured = output
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{') && line.ends_with('}'))
        .find_map(|line| serde_json::from_str::<WireResult>(line).ok());

    let mut result = match structured {
        Some(wire) => WorkerResult {
            status: wire.status,
            patch: wire.patch,
            commands_run: wire.commands_run,
            observations: wire.observations,
            handoff_memo: wire.handoff_memo,
            milestones: wire
                .milestones
                .into_iter()
                .map(|milestone| match milestone {
                    WireMilestone::Goal(goal) => Milestone::new(goal),
                    WireMilestone::Full(full) => full,
                })
                .collect(),
            ..WorkerResult::ok()
        },
        None => WorkerResult::with_status(fallback_status(output, exit_code)),
    };

    result.output = output.to_string();
    result.exit_code = exit_code;
    result
}

fn fallback_status(output: &str, exit_code: Option<i32>) -> WorkerStatus {
    let signals: Vec<AgentSignalKind> = output.lines().filter_map(detect_common_signal).collect();
    if signals.contains(&AgentSignalKind::NeedsHuman) {
        WorkerStatus::Blocked
    } else if signals.contains(&AgentSignalKind::PatchReady) || exit_code == Some(0) {
        WorkerStatus::Ok
    } else {
        WorkerStatus::Failed
    }
}
