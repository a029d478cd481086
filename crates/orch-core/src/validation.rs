//! Validation for run and orchestration configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::config::{preset_patterns, OrchestrationConfig, RunConfig, WorkerKind};
use crate::pattern::invalid_patterns;
use crate::types::Milestone;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationLevel {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub level: ValidationLevel,
    pub code: &'static str,
    pub message: String,
}

pub trait Validate {
    fn validate(&self) -> Vec<ValidationIssue>;
}

pub fn has_errors(issues: &[ValidationIssue]) -> bool {
    issues
        .iter()
        .any(|issue| issue.level == ValidationLevel::Error)
}

fn push_invalid_globs(issues: &mut Vec<ValidationIssue>, field: &str, patterns: &[String]) {
    for pattern in invalid_patterns(patterns) {
        issues.push(ValidationIssue {
            level: ValidationLevel::Error,
            code: "pattern.invalid",
            message: format!("{field}: '{pattern}' is not a valid glob pattern"),
        });
    }
}

impl Validate for RunConfig {
    fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        push_invalid_globs(&mut issues, "scope.allowlist", &self.scope.allowlist);
        push_invalid_globs(&mut issues, "scope.denylist", &self.scope.denylist);
        push_invalid_globs(&mut issues, "scope.env_allowlist", &self.scope.env_allowlist);

        for preset in &self.scope.presets {
            if preset_patterns(preset).is_none() {
                issues.push(ValidationIssue {
                    level: ValidationLevel::Error,
                    code: "scope.preset.unknown",
                    message: format!(
                        "unknown scope preset '{preset}'. valid values: rust, typescript, python, docs"
                    ),
                });
            }
        }

        if self.verify.timeout_secs == 0 {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "verify.timeout.zero",
                message: "verify.timeout_secs must be greater than zero".to_string(),
            });
        }

        if self.verify.max_output_bytes == 0 {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "verify.max_output_bytes.zero",
                message: "verify.max_output_bytes must be greater than zero".to_string(),
            });
        }

        for trigger in &self.verify.risk_triggers {
            if trigger.patterns.is_empty() {
                issues.push(ValidationIssue {
                    level: ValidationLevel::Warning,
                    code: "verify.risk_trigger.empty",
                    message: format!("risk trigger '{}' has no patterns", trigger.name),
                });
            }
            push_invalid_globs(&mut issues, "verify.risk_triggers", &trigger.patterns);
        }

        if self.resilience.max_worker_call_minutes == 0 {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "resilience.max_worker_call_minutes.zero",
                message: "max_worker_call_minutes must be greater than zero".to_string(),
            });
        }

        if self.resilience.auto_resume
            && self.resilience.max_auto_resumes > 0
            && self.resilience.auto_resume_delays_ms.is_empty()
        {
            issues.push(ValidationIssue {
                level: ValidationLevel::Warning,
                code: "resilience.auto_resume_delays.empty",
                message: "auto_resume is enabled without delays; runs resume immediately"
                    .to_string(),
            });
        }

        if self.resilience.stall_timeout_minutes == 0 {
            issues.push(ValidationIssue {
                level: ValidationLevel::Warning,
                code: "resilience.stall_timeout.zero",
                message: "stall_timeout_minutes is 0; stall detection is disabled".to_string(),
            });
        }

        if self.worker.kind == WorkerKind::Command && self.worker.command.is_empty() {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "worker.command.empty",
                message: "worker.kind is 'command' but worker.command is empty".to_string(),
            });
        }

        if self.worker.reviewer == Some(WorkerKind::Command)
            && self.worker.kind != WorkerKind::Command
            && self.worker.command.is_empty()
        {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "worker.reviewer.command.empty",
                message: "reviewer is 'command' but worker.command is empty".to_string(),
            });
        }

        if self.checkpoint.author_email.trim().is_empty() {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "checkpoint.author_email.empty",
                message: "checkpoint.author_email must not be empty".to_string(),
            });
        }

        issues
    }
}

impl Validate for OrchestrationConfig {
    fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        if self.tracks.is_empty() {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "tracks.empty",
                message: "no tracks declared".to_string(),
            });
        }

        let mut names = HashSet::new();
        for track in &self.tracks {
            if track.name.trim().is_empty() {
                issues.push(ValidationIssue {
                    level: ValidationLevel::Error,
                    code: "tracks.name.empty",
                    message: "track name must not be empty".to_string(),
                });
            } else if !names.insert(track.name.as_str()) {
                issues.push(ValidationIssue {
                    level: ValidationLevel::Error,
                    code: "tracks.name.duplicate",
                    message: format!("track '{}' is declared more than once", track.name),
                });
            }

            if track.steps.is_empty() {
                issues.push(ValidationIssue {
                    level: ValidationLevel::Warning,
                    code: "tracks.steps.empty",
                    message: format!("track '{}' has no steps", track.name),
                });
            }

            for step in &track.steps {
                push_invalid_globs(&mut issues, "tracks.steps.owns", &step.owns);
            }
        }

        if self.max_ticks == 0 {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "orchestration.max_ticks.zero",
                message: "max_ticks must be greater than zero".to_string(),
            });
        }

        if self.time_budget_minutes == 0 {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "orchestration.time_budget.zero",
                message: "time_budget_minutes must be greater than zero".to_string(),
            });
        }

        issues
    }
}

impl Validate for Milestone {
    fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        if self.goal.trim().is_empty() {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "milestone.goal.empty",
                message: "milestone goal must not be empty".to_string(),
            });
        }
        push_invalid_globs(&mut issues, "milestone.files_expected", &self.files_expected);
        issues
    }
}
