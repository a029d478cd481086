use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use orch_core::state::Phase;
use orch_core::types::{Milestone, RunId};
use serde::{Deserialize, Serialize};

/// Shared flag checked by long-running worker calls.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share an existing flag, e.g. one registered with a signal handler.
    pub fn from_flag(flag: Arc<AtomicBool>) -> Self {
        Self(flag)
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCommand {
    pub executable: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Written to the child's stdin, then stdin is closed.
    pub stdin: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WorkerRequest {
    pub run_id: RunId,
    pub phase: Phase,
    pub prompt: String,
    pub cwd: PathBuf,
    /// Hard wall-clock cap for this call.
    pub timeout: Duration,
    pub cancel: CancelToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Ok,
    Blocked,
    Failed,
}

impl WorkerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerStatus::Ok => "ok",
            WorkerStatus::Blocked => "blocked",
            WorkerStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerResult {
    pub status: WorkerStatus,
    #[serde(default)]
    pub patch: Option<String>,
    #[serde(default)]
    pub commands_run: Vec<String>,
    #[serde(default)]
    pub observations: Vec<String>,
    #[serde(default)]
    pub handoff_memo: Option<String>,
    /// Milestone breakdown, PLAN phase only.
    #[serde(default)]
    pub milestones: Vec<Milestone>,
    /// Raw worker output; the reviewer's feedback for REVIEW.
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub elapsed_ms: u64,
}

impl WorkerResult {
    pub fn with_status(status: WorkerStatus) -> Self {
        Self {
            status,
            patch: None,
            commands_run: Vec::new(),
            observations: Vec::new(),
            handoff_memo: None,
            milestones: Vec::new(),
            output: String::new(),
            exit_code: None,
            elapsed_ms: 0,
        }
    }

    pub fn ok() -> Self {
        Self::with_status(WorkerStatus::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn cancel_token_observes_external_flag() {
        let flag = Arc::new(AtomicBool::new(false));
        let token = CancelToken::from_flag(flag.clone());
        flag.store(true, Ordering::SeqCst);
        assert!(token.is_cancelled());
    }

    #[test]
    fn worker_result_deserializes_minimal_object() {
        let result: WorkerResult = serde_json::from_str(r#"{"status":"blocked"}"#).unwrap();
        assert_eq!(result.status, WorkerStatus::Blocked);
        assert!(result.commands_run.is_empty());
        assert!(result.milestones.is_empty());
    }
}
