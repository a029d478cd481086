//! Artifacts written when a run stops: `stop_diagnostics.json`, `diff.patch`
//! and `diffstat.txt`.

use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use orch_core::state::{Phase, StopReason};
use orch_core::types::{Run, RunId};
use serde::{Deserialize, Serialize};

use crate::context::RunContext;
use crate::event_log::{read_json, write_json_atomic, EventLogError};

#[derive(Debug, thiserror::Error)]
pub enum DiagnosticsError {
    #[error("failed to write artifact {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Snapshot(#[from] EventLogError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopDiagnostics {
    pub run_id: RunId,
    pub reason: StopReason,
    pub phase: Phase,
    #[serde(default)]
    pub last_active_phase: Option<Phase>,
    pub milestone_index: usize,
    #[serde(default)]
    pub milestone_goal: Option<String>,
    /// Reason-specific detail such as violating files or failing tier output.
    pub evidence: serde_json::Value,
    pub remedy: String,
    pub suggested_command: String,
    pub written_at: DateTime<Utc>,
}

impl StopDiagnostics {
    pub fn for_run(
        run: &Run,
        reason: StopReason,
        evidence: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id: run.run_id.clone(),
            reason,
            phase: run.phase,
            last_active_phase: run.last_active_phase,
            milestone_index: run.milestone_index,
            milestone_goal: run.current_milestone().map(|milestone| milestone.goal.clone()),
            evidence,
            remedy: reason.remedy().to_string(),
            suggested_command: suggested_command(&run.run_id, reason),
            written_at: now,
        }
    }
}

/// The CLI invocation an operator should try next.
pub fn suggested_command(run_id: &RunId, reason: StopReason) -> String {
    if reason.is_resumable() {
        format!("relay resume {run_id}")
    } else {
        format!("relay status {run_id}")
    }
}

pub fn write_stop_diagnostics(
    ctx: &RunContext,
    diagnostics: &StopDiagnostics,
) -> Result<PathBuf, DiagnosticsError> {
    let path = ctx.diagnostics_path();
    write_json_atomic(&path, diagnostics)?;
    Ok(path)
}

pub fn read_stop_diagnostics(
    ctx: &RunContext,
) -> Result<Option<StopDiagnostics>, DiagnosticsError> {
    Ok(read_json(&ctx.diagnostics_path())?)
}

/// Write `diff.patch` and `diffstat.txt` into the run's artifacts directory.
pub fn write_diff_artifacts(
    ctx: &RunContext,
    patch: &str,
    stat: &str,
) -> Result<(), DiagnosticsError> {
    let dir = ctx.artifacts_dir();
    fs::create_dir_all(&dir).map_err(|source| DiagnosticsError::Write {
        path: dir.clone(),
        source,
    })?;
    for (name, body) in [("diff.patch", patch), ("diffstat.txt", stat)] {
        let path = dir.join(name);
        fs::write(&path, body).map_err(|source| DiagnosticsError::Write { path, source })?;
    }
    Ok(())
}
