use orch_core::config::WorkerKind;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("no worker configured for kind {kind}: {message}")]
    Unconfigured { kind: WorkerKind, message: String },
    #[error("invalid worker request: {message}")]
    InvalidRequest { message: String },
    #[error("worker spawn failed ({command}): {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("worker runtime error ({command}): {source}")]
    Runtime {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("worker call exceeded its deadline after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },
    #[error("worker call was cancelled")]
    Cancelled,
}

impl AgentError {
    /// Errors that are a verdict on the call rather than broken plumbing.
    pub fn is_deadline(&self) -> bool {
        matches!(self, AgentError::Timeout { .. } | AgentError::Cancelled)
    }
}
