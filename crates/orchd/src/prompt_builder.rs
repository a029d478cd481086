//! Prompt assembly for worker calls in PLAN, IMPLEMENT and REVIEW.

use orch_core::state::{Phase, VerifyResult};
use orch_core::types::{Milestone, ScopeLock};

/// Everything a worker prompt may mention. Sections with no content are left out.
#[derive(Debug, Clone)]
pub struct PromptInput<'a> {
    pub phase: Phase,
    pub task_title: &'a str,
    pub task_body: &'a str,
    pub milestone: Option<&'a Milestone>,
    pub milestone_index: usize,
    pub milestone_count: usize,
    pub scope: &'a ScopeLock,
    pub owns: &'a [String],
    pub pending_review_requests: &'a [String],
    pub last_verify_failure: Option<&'a str>,
    /// REVIEW only.
    pub diff: Option<&'a str>,
    /// REVIEW only.
    pub evidence: &'a [VerifyResult],
}

pub fn build_prompt(input: &PromptInput<'_>) -> String {
    let mut sections: Vec<String> = Vec::new();

    let role = match input.phase {
        Phase::Plan => "You are planning. Break the task into small, independently verifiable milestones.",
        Phase::Review => "You are reviewing. Approve only if the change fully meets the milestone goal.",
        _ => "You are implementing the current milestone. Change only files inside the allowed scope.",
    };
    sections.push(format!("# Role\n\n{role}\n"));

    sections.push(format!(
        "# Task\n\n**Title:** {}\n\n{}\n",
        input.task_title,
        input.task_body.trim()
    ));

    if let Some(milestone) = input.milestone {
        let mut section = format!(
            "# Milestone {}/{}\n\n**Goal:** {}\n**Risk:** {}\n",
            input.milestone_index + 1,
            input.milestone_count,
            milestone.goal,
            milestone.risk_level
        );
        if !milestone.files_expected.is_empty() {
            section.push_str(&format!(
                "**Files expected:** {}\n",
                milestone.files_expected.join(", ")
            ));
        }
        if !milestone.done_checks.is_empty() {
            section.push_str("\nDone when:\n");
            for check in &milestone.done_checks {
                section.push_str(&format!("- {check}\n"));
            }
        }
        sections.push(section);
    }

    if let Some(scope) = render_scope(input.scope, input.owns) {
        sections.push(scope);
    }

    if !input.pending_review_requests.is_empty() {
        let mut section = "# Reviewer Requests\n\nAddress every item:\n".to_string();
        for request in input.pending_review_requests {
            section.push_str(&format!("- {request}\n"));
        }
        sections.push(section);
    }

    if let Some(failure) = input.last_verify_failure {
        sections.push(format!(
            "# Last Verification Failure\n\n```\n{}\n```\n\nFix the cause. Do not weaken the checks.\n",
            failure.trim_end()
        ));
    }

    if input.phase == Phase::Review {
        if let Some(diff) = input.diff {
            sections.push(format!("# Diff\n\n```diff\n{}\n```\n", diff.trim_end()));
        }
        if !input.evidence.is_empty() {
            let mut section = "# Verification Evidence\n\n".to_string();
            for result in input.evidence {
                let verdict = if result.ok { "passed" } else { "failed" };
                section.push_str(&format!(
                    "- {} {verdict} ({} ms): {}\n",
                    result.tier,
                    result.duration_ms,
                    result.commands.join("; ")
                ));
            }
            sections.push(section);
        }
    }

    sections.push(result_contract(input.phase));
    sections.join("\n---\n\n")
}

fn render_scope(scope: &ScopeLock, owns: &[String]) -> Option<String> {
    if scope.is_unrestricted() && owns.is_empty() {
        return None;
    }
    let mut section = "# Scope\n\n".to_string();
    if !owns.is_empty() {
        section.push_str(&format!("**Owned paths:** {}\n", owns.join(", ")));
    }
    if !scope.allowlist.is_empty() {
        section.push_str(&format!("**Allowed:** {}\n", scope.allowlist.join(", ")));
    }
    if !scope.denylist.is_empty() {
        section.push_str(&format!("**Forbidden:** {}\n", scope.denylist.join(", ")));
    }
    Some(section)
}

fn result_contract(phase: Phase) -> String {
    let mut contract = "# Result\n\n\
         Finish by printing one JSON object on a single line:\n\
         `{\"status\": \"ok\" | \"blocked\" | \"failed\", \"commands_run\": [], \"observations\": [], \"handoff_memo\": null}`\n"
        .to_string();
    match phase {
        Phase::Plan => contract.push_str(
            "\nInclude `\"milestones\": [{\"goal\": \"...\", \"files_expected\": [], \"risk_level\": \"low\"}]`.\n",
        ),
        Phase::Review => contract.push_str(
            "\nBefore the JSON line, write `LGTM` to approve, or a numbered list of requested changes.\n",
        ),
        _ => {}
    }
    contract.push_str(
        "\nIf you cannot emit JSON, print `[patch_ready]` when done or `[needs_human]` when blocked.\n",
    );
    contract
}
