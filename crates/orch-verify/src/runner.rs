//! Tiered verification: ordered shell commands, first failure stops.

use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use orch_core::config::VerifySettings;
use orch_core::state::{VerifyResult, VerifyTier};
use tracing::{debug, info};

use crate::command::{combine_output, run_shell_command};
use crate::discover::resolve_verify_commands;
use crate::error::VerifyError;

/// Executes one tier's commands. No retries.
pub trait Verifier {
    fn run_tier(
        &self,
        cwd: &Path,
        tier: VerifyTier,
        commands: &[String],
        budget: Duration,
    ) -> Result<VerifyResult, VerifyError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyRunner {
    pub shell_bin: String,
    pub max_output_bytes: usize,
}

impl Default for VerifyRunner {
    fn default() -> Self {
        Self {
            shell_bin: "sh".to_string(),
            max_output_bytes: 64 * 1024,
        }
    }
}

impl VerifyRunner {
    pub fn from_settings(settings: &VerifySettings) -> Self {
        Self {
            max_output_bytes: settings.max_output_bytes,
            ..Self::default()
        }
    }
}

impl Verifier for VerifyRunner {
    fn run_tier(
        &self,
        cwd: &Path,
        tier: VerifyTier,
        commands: &[String],
        budget: Duration,
    ) -> Result<VerifyResult, VerifyError> {
        let started = Instant::now();
        let mut executed = Vec::new();
        let mut transcript = Vec::new();
        let mut failed_command = None;
        let mut timed_out = false;

        for command in commands {
            let remaining = budget.saturating_sub(started.elapsed());
            executed.push(command.clone());
            transcript.extend_from_slice(format!("$ {command}\n").as_bytes());

            if remaining.is_zero() {
                transcript.extend_from_slice(b"[tier time budget exhausted]\n");
                failed_command = Some(command.clone());
                timed_out = true;
                break;
            }

            let output =
                run_shell_command(cwd, &self.shell_bin, command, remaining, self.max_output_bytes)?;
            transcript.extend_from_slice(output.output.as_bytes());
            if !output.success {
                if output.timed_out {
                    transcript.extend_from_slice(b"\n[killed: tier time budget exceeded]\n");
                } else {
                    transcript.extend_from_slice(
                        format!("\n[exit code {:?}]\n", output.exit_code).as_bytes(),
                    );
                }
                failed_command = Some(command.clone());
                timed_out = output.timed_out;
                break;
            }
        }

        let (output, _) = combine_output(&transcript, &[], 0, self.max_output_bytes);
        let ok = failed_command.is_none();
        debug!(%tier, ok, commands = executed.len(), "tier finished");
        Ok(VerifyResult {
            tier,
            commands: executed,
            ok,
            duration_ms: started.elapsed().as_millis() as u64,
            output,
            failed_command,
            timed_out,
        })
    }
}

/// Run `tiers` in order with the configured (or discovered) commands. All
/// tiers share one time budget. Stops after the first failing tier.
pub fn run_tiers(
    verifier: &dyn Verifier,
    cwd: &Path,
    tiers: &[VerifyTier],
    settings: &VerifySettings,
) -> Result<Vec<VerifyResult>, VerifyError> {
    let budget = Duration::from_secs(settings.timeout_secs);
    let started = Instant::now();
    let mut results = Vec::new();
    for tier in tiers {
        let commands = resolve_verify_commands(cwd, *tier, settings.commands_for(*tier));
        let remaining = budget.saturating_sub(started.elapsed());
        let result = verifier.run_tier(cwd, *tier, &commands, remaining)?;
        info!(
            tier = %result.tier,
            ok = result.ok,
            duration_ms = result.duration_ms,
            failed_command = result.failed_command.as_deref().unwrap_or(""),
            "verification tier completed"
        );
        let ok = result.ok;
        results.push(result);
        if !ok {
            break;
        }
    }
    Ok(results)
}

/// Persist a tier transcript, e.g. `verify/3-tier1.log`.
pub fn write_verify_log(path: &Path, result: &VerifyResult) -> Result<(), VerifyError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| VerifyError::Log {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let header = format!(
        "tier: {}\nok: {}\nduration_ms: {}\ntimed_out: {}\n\n",
        result.tier, result.ok, result.duration_ms, result.timed_out
    );
    fs::write(path, header + &result.output).map_err(|source| VerifyError::Log {
        path: path.to_path_buf(),
        source,
    })
}
