use orch_core::config::{WorkerConfig, WorkerKind};
use tracing::info;

use crate::error::AgentError;
use crate::parse::parse_worker_output;
use crate::runner::ProcessRunner;
use crate::types::{AgentCommand, WorkerRequest, WorkerResult};

/// Builds the argv for one worker CLI.
pub trait AgentAdapter: Send + Sync {
    fn kind(&self) -> WorkerKind;
    fn build_command(&self, request: &WorkerRequest) -> AgentCommand;
}

/// A worker the supervisor can call once per phase.
pub trait WorkerAdapter: Send + Sync {
    fn kind(&self) -> WorkerKind;
    fn invoke(&self, request: &WorkerRequest) -> Result<WorkerResult, AgentError>;
}

fn run_env(request: &WorkerRequest) -> Vec<(String, String)> {
    vec![
        ("RELAY_RUN_ID".to_string(), request.run_id.0.clone()),
        ("RELAY_PHASE".to_string(), request.phase.as_str().to_string()),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaudeAdapter {
    pub executable: String,
}

impl Default for ClaudeAdapter {
    fn default() -> Self {
        Self {
            executable: "claude".to_string(),
        }
    }
}

impl AgentAdapter for ClaudeAdapter {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Claude
    }

    fn build_command(&self, request: &WorkerRequest) -> AgentCommand {
        AgentCommand {
            executable: self.executable.clone(),
            args: vec!["-p".to_string(), request.prompt.clone()],
            env: run_env(request),
            stdin: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodexAdapter {
    pub executable: String,
}

impl Default for CodexAdapter {
    fn default() -> Self {
        Self {
            executable: "codex".to_string(),
        }
    }
}

impl AgentAdapter for CodexAdapter {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Codex
    }

    fn build_command(&self, request: &WorkerRequest) -> AgentCommand {
        AgentCommand {
            executable: self.executable.clone(),
            args: vec!["exec".to_string(), request.prompt.clone()],
            env: run_env(request),
            stdin: None,
        }
    }
}

/// Arbitrary argv from config; the prompt goes to stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandAdapter {
    pub argv: Vec<String>,
}

impl AgentAdapter for CommandAdapter {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Command
    }

    fn build_command(&self, request: &WorkerRequest) -> AgentCommand {
        let (executable, args) = match self.argv.split_first() {
            Some((head, tail)) => (head.clone(), tail.to_vec()),
            None => (String::new(), Vec::new()),
        };
        AgentCommand {
            executable,
            args,
            env: run_env(request),
            stdin: Some(request.prompt.clone()),
        }
    }
}

/// Runs an [`AgentAdapter`]'s command and parses its output.
pub struct CliWorker {
    adapter: Box<dyn AgentAdapter>,
    runner: ProcessRunner,
}

impl CliWorker {
    pub fn new(adapter: Box<dyn AgentAdapter>) -> Self {
        Self {
            adapter,
            runner: ProcessRunner::default(),
        }
    }

    pub fn with_runner(mut self, runner: ProcessRunner) -> Self {
        self.runner = runner;
        self
    }
}

impl WorkerAdapter for CliWorker {
    fn kind(&self) -> WorkerKind {
        self.adapter.kind()
    }

    fn invoke(&self, request: &WorkerRequest) -> Result<WorkerResult, AgentError> {
        let command = self.adapter.build_command(request);
        if command.executable.trim().is_empty() {
            return Err(AgentError::Unconfigured {
                kind: self.adapter.kind(),
                message: "empty executable".to_string(),
            });
        }

        let output = self
            .runner
            .run(&command, &request.cwd, request.timeout, &request.cancel)?;
        let mut result = parse_worker_output(&output.output, output.exit_code);
        result.elapsed_ms = output.elapsed.as_millis() as u64;

        info!(
            run_id = %request.run_id,
            phase = %request.phase,
            worker = %self.adapter.kind(),
            status = %result.status,
            elapsed_ms = result.elapsed_ms,
            "worker call finished"
        );
        Ok(result)
    }
}

pub fn default_adapter_for(
    config: &WorkerConfig,
    kind: WorkerKind,
) -> Result<Box<dyn WorkerAdapter>, AgentError> {
    let adapter: Box<dyn AgentAdapter> = match kind {
        WorkerKind::Claude => Box::new(ClaudeAdapter::default()),
        WorkerKind::Codex => Box::new(CodexAdapter::default()),
        WorkerKind::Command => {
            if config.command.is_empty() {
                return Err(AgentError::Unconfigured {
                    kind,
                    message: "worker.command is empty".to_string(),
                });
            }
            Box::new(CommandAdapter {
                argv: config.command.clone(),
            })
        }
    };
    Ok(Box::new(CliWorker::new(adapter)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CancelToken, WorkerStatus};
    use orch_core::state::Phase;
    use orch_core::types::RunId;
    use std::time::Duration;

    fn request(prompt: &str) -> WorkerRequest {
        WorkerRequest {
            run_id: RunId("20260101000000000-0001".to_string()),
            phase: Phase::Implement,
            prompt: prompt.to_string(),
            cwd: std::env::temp_dir(),
            timeout: Duration::from_secs(10),
            cancel: CancelToken::new(),
        }
    }

    #[test]
    fn claude_and_codex_pass_prompt_as_argument() {
        let claude = ClaudeAdapter::default().build_command(&request("fix it"));
        assert_eq!(claude.executable, "claude");
        assert_eq!(claude.args, vec!["-p", "fix it"]);
        assert!(claude.stdin.is_none());
        assert!(claude
            .env
            .contains(&("RELAY_PHASE".to_string(), "IMPLEMENT".to_string())));

        let codex = CodexAdapter::default().build_command(&request("fix it"));
        assert_eq!(codex.executable, "codex");
        assert_eq!(codex.args, vec!["exec", "fix it"]);
    }

    #[test]
    fn command_adapter_writes_prompt_to_stdin() {
        let adapter = CommandAdapter {
            argv: vec!["./worker.sh".to_string(), "--json".to_string()],
        };
        let command = adapter.build_command(&request("plan this"));
        assert_eq!(command.executable, "./worker.sh");
        assert_eq!(command.args, vec!["--json"]);
        assert_eq!(command.stdin.as_deref(), Some("plan this"));
    }

    #[test]
    fn command_kind_requires_argv() {
        let config = WorkerConfig {
            kind: WorkerKind::Command,
            reviewer: None,
            command: Vec::new(),
        };
        let err = default_adapter_for(&config, WorkerKind::Command)
            .err()
            .expect("empty command must be rejected");
        assert!(matches!(err, AgentError::Unconfigured { .. }));
        assert!(default_adapter_for(&config, WorkerKind::Claude).is_ok());
    }

    #[test]
    fn cli_worker_parses_structured_result() {
        let config = WorkerConfig {
            kind: WorkerKind::Command,
            reviewer: None,
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                "read line; echo \"got $line\"; echo '{\"status\":\"ok\",\"commands_run\":[\"true\"]}'"
                    .to_string(),
            ],
        };
        let worker = default_adapter_for(&config, WorkerKind::Command).expect("adapter");
        assert_eq!(worker.kind(), WorkerKind::Command);
        let result = worker.invoke(&request("hello\n")).expect("invoke");
        assert_eq!(result.status, WorkerStatus::Ok);
        assert_eq!(result.commands_run, vec!["true"]);
        assert!(result.output.contains("got hello"));
        assert_eq!(result.exit_code, Some(0));
    }

    #[test]
    fn cli_worker_reports_timeouts() {
        let config = WorkerConfig {
            kind: WorkerKind::Command,
            reviewer: None,
            command: vec!["sh".to_string(), "-c".to_string(), "sleep 30".to_string()],
        };
        let worker = default_adapter_for(&config, WorkerKind::Command).expect("adapter");
        let mut req = request("");
        req.timeout = Duration::from_millis(150);
        let err = worker.invoke(&req).expect_err("timeout");
        assert!(err.is_deadline());
    }
}
