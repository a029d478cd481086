//! Integrates a run's checkpoints into a shared branch by cherry-pick.
//!
//! A real submit holds `.relay/submit.lock` for its whole critical section.
//! On conflict the target branch is reset to where it was and the original
//! branch is checked out again, so the shared tree never keeps a partial
//! integration.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use orch_core::events::EventKind;
use orch_core::pattern::PatternSet;
use orch_core::state::StopReason;
use orch_core::types::{Run, RunId};
use orch_git::{
    abort_cherry_pick, branch_exists, checkout, cherry_pick_range, current_branch, head_sha,
    push, reset_tracked, rev_parse, status_porcelain, CherryPickOutcome, GitCli, GitError,
    RepoHandle, WorktreeManager, DEFAULT_WORKTREE_ROOT,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::context::RelayPaths;
use crate::diagnostics::{write_stop_diagnostics, DiagnosticsError, StopDiagnostics};
use crate::event_log::{read_json, replay_run, write_json_atomic, EventLog, EventLogError};

const LOCK_RETRY_MS: u64 = 50;
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("run {run_id} not found")]
    RunNotFound { run_id: RunId },
    #[error("run {run_id} has no checkpoint commit to submit")]
    NoCheckpoint { run_id: RunId },
    #[error("run {run_id} has no passing verification on record")]
    NoVerificationEvidence { run_id: RunId },
    #[error("working tree at {path} has uncommitted changes: {}", files.join(", "))]
    DirtyTree { path: PathBuf, files: Vec<String> },
    #[error("target branch {branch} does not exist")]
    TargetBranchMissing { branch: String },
    #[error("failed to open submit lock {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("timed out after {waited_ms}ms waiting for submit lock {path}")]
    LockTimeout { path: PathBuf, waited_ms: u64 },
    #[error("tree still dirty after aborting conflicted submit: {}", files.join(", "))]
    AbortLeftChanges { files: Vec<String> },
    #[error("could not restore {target} after submit: {}", failures.join("; "))]
    RestoreFailed { target: String, failures: Vec<String> },
    #[error(transparent)]
    Git(#[from] GitError),
    #[error(transparent)]
    EventLog(#[from] EventLogError),
    #[error(transparent)]
    Diagnostics(#[from] DiagnosticsError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRequest {
    pub target: String,
    pub dry_run: bool,
    pub push: bool,
    pub remote: String,
}

impl SubmitRequest {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            dry_run: false,
            push: false,
            remote: "origin".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResult {
    pub target: String,
    pub clean: bool,
    pub conflicted_files: Vec<String>,
    /// Target tip after a clean real submit.
    pub head_sha: Option<String>,
    pub pushed: bool,
    pub dry_run: bool,
}

/// Exclusive hold on the submit lock file; released on drop.
#[derive(Debug)]
pub struct SubmitLock {
    file: File,
    path: PathBuf,
}

impl SubmitLock {
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self, SubmitError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|source| SubmitError::Lock {
                path: path.to_path_buf(),
                source,
            })?;

        let start = Instant::now();
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => break,
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    if start.elapsed() >= timeout {
                        return Err(SubmitError::LockTimeout {
                            path: path.to_path_buf(),
                            waited_ms: start.elapsed().as_millis() as u64,
                        });
                    }
                    thread::sleep(Duration::from_millis(LOCK_RETRY_MS));
                }
                Err(source) => {
                    return Err(SubmitError::Lock {
                        path: path.to_path_buf(),
                        source,
                    })
                }
            }
        }
        debug!(path = %path.display(), "submit lock acquired");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for SubmitLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %err, "failed to release submit lock");
        }
    }
}

pub struct Submitter {
    paths: RelayPaths,
    repo: RepoHandle,
    git: GitCli,
    lock_timeout: Duration,
    env_allowlist: PatternSet,
}

impl Submitter {
    /// `git` should carry the identity cherry-picked commits are made with.
    pub fn new(paths: RelayPaths, repo: RepoHandle, git: GitCli) -> Self {
        Self {
            paths,
            repo,
            git,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            env_allowlist: PatternSet::default(),
        }
    }

    /// Generated files that never count as uncommitted changes.
    pub fn with_env_allowlist<S: AsRef<str>>(mut self, patterns: &[S]) -> Self {
        self.env_allowlist = PatternSet::new(patterns);
        self
    }

    fn dirty_files(&self) -> Result<Vec<String>, SubmitError> {
        Ok(status_porcelain(&self.repo.root, &self.git)?
            .into_iter()
            .map(|file| file.path)
            .filter(|path| !self.env_allowlist.matches(path))
            .collect())
    }

    pub fn submit(
        &self,
        run_id: &RunId,
        request: &SubmitRequest,
        now: DateTime<Utc>,
    ) -> Result<SubmitResult, SubmitError> {
        let ctx = self.paths.run_context(run_id.clone());
        let mut run: Run = read_json(&ctx.state_path())?.ok_or_else(|| SubmitError::RunNotFound {
            run_id: run_id.clone(),
        })?;
        let mut log = EventLog::open(ctx.events_path(), "submit")?;
        let events = log.read_all()?;
        if replay_run(&mut run, &events) > 0 {
            write_json_atomic(&ctx.state_path(), &run)?;
        }

        let (Some(base), Some(tip)) = (run.base_sha.clone(), run.checkpoint_commit_sha.clone())
        else {
            return Err(SubmitError::NoCheckpoint {
                run_id: run_id.clone(),
            });
        };
        let verified = events
            .iter()
            .rev()
            .find_map(|event| match &event.kind {
                EventKind::VerifyCompleted { result, .. } => Some(result.ok),
                _ => None,
            })
            .unwrap_or(false);
        if !verified {
            return Err(SubmitError::NoVerificationEvidence {
                run_id: run_id.clone(),
            });
        }
        if !branch_exists(&self.repo.root, &self.git, &request.target)? {
            return Err(SubmitError::TargetBranchMissing {
                branch: request.target.clone(),
            });
        }
        let dirty = self.dirty_files()?;
        if !dirty.is_empty() {
            return Err(SubmitError::DirtyTree {
                path: self.repo.root.clone(),
                files: dirty,
            });
        }

        let correlation = Some(run_id.0.clone());
        log.append(
            EventKind::SubmitStarted {
                target: request.target.clone(),
                dry_run: request.dry_run,
            },
            now,
            correlation.clone(),
        )?;
        info!(run_id = %run_id, target = %request.target, dry_run = request.dry_run, "submit started");

        if request.dry_run {
            let (clean, conflicted_files) = self.dry_run(run_id, &request.target, &base, &tip, now)?;
            log.append(
                EventKind::SubmitDryRun {
                    target: request.target.clone(),
                    clean,
                    conflicted_files: conflicted_files.clone(),
                },
                now,
                correlation,
            )?;
            return Ok(SubmitResult {
                target: request.target.clone(),
                clean,
                conflicted_files,
                head_sha: None,
                pushed: false,
                dry_run: true,
            });
        }

        let _lock = SubmitLock::acquire(&self.paths.submit_lock_path(), self.lock_timeout)?;
        let original = match current_branch(&self.repo.root, &self.git)? {
            Some(branch) => branch,
            None => head_sha(&self.repo.root, &self.git)?,
        };
        let pre_submit = rev_parse(&self.repo.root, &self.git, &request.target)?;

        checkout(&self.repo.root, &self.git, &request.target)?;
        let outcome = match cherry_pick_range(&self.repo.root, &self.git, &base, &tip) {
            Ok(outcome) => outcome,
            Err(err) => {
                self.roll_back(&pre_submit, &original, true);
                return Err(err.into());
            }
        };

        match outcome {
            CherryPickOutcome::Conflict { files } => {
                let failures = self.roll_back(&pre_submit, &original, true);
                if !failures.is_empty() {
                    return Err(SubmitError::RestoreFailed {
                        target: request.target.clone(),
                        failures,
                    });
                }
                let left = self.dirty_files()?;
                if !left.is_empty() {
                    return Err(SubmitError::AbortLeftChanges { files: left });
                }

                log.append(
                    EventKind::SubmitConflict {
                        target: request.target.clone(),
                        conflicted_files: files.clone(),
                    },
                    now,
                    correlation,
                )?;
                let diagnostics = StopDiagnostics::for_run(
                    &run,
                    StopReason::SubmitConflict,
                    json!({
                        "target": request.target,
                        "conflicted_files": files,
                        "target_sha": pre_submit,
                    }),
                    now,
                );
                write_stop_diagnostics(&ctx, &diagnostics)?;
                warn!(run_id = %run_id, target = %request.target, conflicted = files.len(), "submit conflicted; target left untouched");
                Ok(SubmitResult {
                    target: request.target.clone(),
                    clean: false,
                    conflicted_files: files,
                    head_sha: None,
                    pushed: false,
                    dry_run: false,
                })
            }
            CherryPickOutcome::Applied { .. } | CherryPickOutcome::Empty => {
                let head = head_sha(&self.repo.root, &self.git)?;
                if request.push {
                    if let Err(err) = push(&self.repo.root, &self.git, &request.remote, &request.target) {
                        let mut failures = self.roll_back(&pre_submit, &original, false);
                        if failures.is_empty() {
                            return Err(err.into());
                        }
                        failures.insert(0, format!("push: {err}"));
                        return Err(SubmitError::RestoreFailed {
                            target: request.target.clone(),
                            failures,
                        });
                    }
                }
                checkout(&self.repo.root, &self.git, &original)?;
                log.append(
                    EventKind::SubmitCompleted {
                        target: request.target.clone(),
                        head_sha: head.clone(),
                        pushed: request.push,
                    },
                    now,
                    correlation,
                )?;
                info!(run_id = %run_id, target = %request.target, head = %head, pushed = request.push, "submit completed");
                Ok(SubmitResult {
                    target: request.target.clone(),
                    clean: true,
                    conflicted_files: Vec::new(),
                    head_sha: Some(head),
                    pushed: request.push,
                    dry_run: false,
                })
            }
        }
    }

    /// Cherry-pick onto a throwaway detached worktree of `target`.
    fn dry_run(
        &self,
        run_id: &RunId,
        target: &str,
        base: &str,
        tip: &str,
        now: DateTime<Utc>,
    ) -> Result<(bool, Vec<String>), SubmitError> {
        let worktrees = WorktreeManager::new(self.git.clone(), DEFAULT_WORKTREE_ROOT);
        let path = self
            .paths
            .tmp_dir()
            .join(format!("submit-{run_id}-{}", now.timestamp_millis()));
        worktrees.add_detached(&self.repo, &path, target)?;

        let outcome = cherry_pick_range(&path, &self.git, base, tip).and_then(|outcome| {
            if let CherryPickOutcome::Conflict { files } = outcome {
                abort_cherry_pick(&path, &self.git)?;
                return Ok((false, files));
            }
            Ok((true, Vec::new()))
        });
        if let Err(err) = worktrees.remove(&self.repo, &path, true) {
            warn!(path = %path.display(), error = %err, "failed to remove dry-run worktree");
        }
        let (clean, files) = outcome?;
        info!(run_id = %run_id, target, clean, conflicted = files.len(), "submit dry run finished");
        Ok((clean, files))
    }

    /// Put the target back at `pre_submit` and check out `original`. Every
    /// step runs even when an earlier one fails; failures are returned.
    fn roll_back(&self, pre_submit: &str, original: &str, in_cherry_pick: bool) -> Vec<String> {
        let root = &self.repo.root;
        let mut failures = Vec::new();
        if in_cherry_pick {
            if let Err(err) = abort_cherry_pick(root, &self.git) {
                warn!(error = %err, "failed to abort cherry-pick during submit rollback");
                failures.push(format!("abort cherry-pick: {err}"));
            }
        }
        if let Err(err) = reset_tracked(root, &self.git, pre_submit) {
            warn!(error = %err, "failed to reset target during submit rollback");
            failures.push(format!("reset to {pre_submit}: {err}"));
        }
        if let Err(err) = checkout(root, &self.git, original) {
            warn!(error = %err, "failed to restore original branch during submit rollback");
            failures.push(format!("checkout {original}: {err}"));
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::read_stop_diagnostics;
    use crate::event_log::read_events;
    use crate::test_support::{commit_file, git_cli, git_in, init_repo};
    use chrono::TimeZone;
    use orch_core::state::{Phase, VerifyResult, VerifyTier};
    use orch_git::discover_repo;
    use std::fs;
    use tempfile::TempDir;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 2, 12, 0, 0).unwrap()
    }

    struct Setup {
        _dir: TempDir,
        root: PathBuf,
        paths: RelayPaths,
        submitter: Submitter,
        run_id: RunId,
    }

    /// Repo whose run `r1` checkpointed `src/limiter.rs` on `relay/r1`.
    fn setup(checkpoint: bool, verified: bool) -> Setup {
        let dir = tempfile::tempdir().expect("tempdir");
        init_repo(dir.path());
        let repo = discover_repo(dir.path(), &git_cli()).expect("repo");
        let root = repo.root.clone();
        let base = git_in(&root, &["rev-parse", "HEAD"]);
        git_in(&root, &["checkout", "--quiet", "-b", "relay/r1"]);
        let tip = commit_file(&root, "src/limiter.rs", "pub fn refill() {}\n", "milestone 1");
        git_in(&root, &["checkout", "--quiet", "main"]);

        let paths = RelayPaths::new(&root);
        let run_id = RunId::new("r1");
        let ctx = paths.run_context(run_id.clone());
        ctx.ensure_layout().expect("layout");

        let mut run = Run::new(run_id.clone(), PathBuf::from("task.md"), "Limiter", at());
        run.phase = Phase::Done;
        run.base_sha = Some(base);
        if checkpoint {
            run.checkpoint_commit_sha = Some(tip);
        }
        let mut log = EventLog::open(ctx.events_path(), "supervisor").expect("log");
        let mut result = VerifyResult::skipped(VerifyTier::Tier0);
        result.ok = verified;
        log.append(
            EventKind::VerifyCompleted {
                attempt: 1,
                result,
                log_path: None,
            },
            at(),
            Some("r1".to_string()),
        )
        .expect("append");
        run.last_event_seq = 1;
        write_json_atomic(&ctx.state_path(), &run).expect("snapshot");

        Setup {
            submitter: Submitter::new(paths.clone(), repo, git_cli()).with_env_allowlist(&["target/**"]),
            _dir: dir,
            root,
            paths,
            run_id,
        }
    }

    fn event_names(setup: &Setup) -> Vec<&'static str> {
        let ctx = setup.paths.run_context(setup.run_id.clone());
        read_events(&ctx.events_path())
            .expect("events")
            .iter()
            .map(|event| event.kind.name())
            .collect()
    }

    #[test]
    fn clean_submit_advances_target_and_restores_branch() {
        let setup = setup(true, true);
        let result = setup
            .submitter
            .submit(&setup.run_id, &SubmitRequest::new("main"), at())
            .expect("submit");

        assert!(result.clean);
        let head = result.head_sha.expect("head");
        assert_eq!(git_in(&setup.root, &["rev-parse", "main"]), head);
        assert_eq!(git_in(&setup.root, &["symbolic-ref", "--short", "HEAD"]), "main");
        assert!(setup.root.join("src/limiter.rs").exists());
        assert_eq!(event_names(&setup).last(), Some(&"submit_completed"));
    }

    #[test]
    fn conflict_aborts_and_leaves_target_exactly_as_before() {
        let setup = setup(true, true);
        let before = commit_file(&setup.root, "src/limiter.rs", "pub fn other() {}\n", "diverge");

        let result = setup
            .submitter
            .submit(&setup.run_id, &SubmitRequest::new("main"), at())
            .expect("submit");

        assert!(!result.clean);
        assert_eq!(result.conflicted_files, vec!["src/limiter.rs"]);
        assert_eq!(git_in(&setup.root, &["rev-parse", "main"]), before);
        assert_eq!(git_in(&setup.root, &["status", "--porcelain"]), "");
        assert_eq!(git_in(&setup.root, &["symbolic-ref", "--short", "HEAD"]), "main");
        assert!(!setup.root.join(".git/CHERRY_PICK_HEAD").exists());
        assert_eq!(event_names(&setup).last(), Some(&"submit_conflict"));

        let ctx = setup.paths.run_context(setup.run_id.clone());
        let diagnostics = read_stop_diagnostics(&ctx).expect("read").expect("written");
        assert_eq!(diagnostics.reason, StopReason::SubmitConflict);
        assert_eq!(diagnostics.evidence["conflicted_files"][0], "src/limiter.rs");
    }

    #[test]
    fn dry_run_reports_conflicts_without_touching_any_branch() {
        let setup = setup(true, true);
        let before = commit_file(&setup.root, "src/limiter.rs", "pub fn other() {}\n", "diverge");

        let mut request = SubmitRequest::new("main");
        request.dry_run = true;
        let result = setup
            .submitter
            .submit(&setup.run_id, &request, at())
            .expect("dry run");

        assert!(result.dry_run);
        assert!(!result.clean);
        assert_eq!(result.conflicted_files, vec!["src/limiter.rs"]);
        assert_eq!(git_in(&setup.root, &["rev-parse", "main"]), before);
        assert_eq!(git_in(&setup.root, &["status", "--porcelain"]), "");
        let leftovers = fs::read_dir(setup.paths.tmp_dir())
            .map(|entries| entries.count())
            .unwrap_or(0);
        assert_eq!(leftovers, 0);
        assert_eq!(event_names(&setup).last(), Some(&"submit_dry_run"));
    }

    #[test]
    fn preconditions_fail_without_recording_anything() {
        let missing = setup(false, true);
        let err = missing
            .submitter
            .submit(&missing.run_id, &SubmitRequest::new("main"), at())
            .expect_err("no checkpoint");
        assert!(matches!(err, SubmitError::NoCheckpoint { .. }));

        let unverified = setup(true, false);
        let err = unverified
            .submitter
            .submit(&unverified.run_id, &SubmitRequest::new("main"), at())
            .expect_err("no evidence");
        assert!(matches!(err, SubmitError::NoVerificationEvidence { .. }));

        let ready = setup(true, true);
        let err = ready
            .submitter
            .submit(&ready.run_id, &SubmitRequest::new("release"), at())
            .expect_err("missing target");
        assert!(matches!(err, SubmitError::TargetBranchMissing { .. }));

        fs::write(ready.root.join("notes.txt"), "wip\n").expect("write");
        let err = ready
            .submitter
            .submit(&ready.run_id, &SubmitRequest::new("main"), at())
            .expect_err("dirty");
        assert!(matches!(err, SubmitError::DirtyTree { ref files, .. } if files == &["notes.txt"]));
        assert_eq!(event_names(&ready), vec!["verify_completed"]);
        assert_eq!(git_in(&ready.root, &["rev-parse", "main"]), git_in(&ready.root, &["rev-parse", "HEAD"]));
    }

    #[test]
    fn env_allowlist_files_do_not_block_submit() {
        let setup = setup(true, true);
        fs::create_dir_all(setup.root.join("target")).expect("target");
        fs::write(setup.root.join("target/app.o"), "obj\n").expect("write");

        let result = setup
            .submitter
            .submit(&setup.run_id, &SubmitRequest::new("main"), at())
            .expect("submit");
        assert!(result.clean);
        assert!(setup.root.join("target/app.o").exists());
        assert_eq!(event_names(&setup).last(), Some(&"submit_completed"));
    }

    #[test]
    fn failed_push_rolls_target_back_to_pre_submit() {
        let setup = setup(true, true);
        let before = git_in(&setup.root, &["rev-parse", "main"]);
        fs::create_dir_all(setup.root.join("target")).expect("target");
        fs::write(setup.root.join("target/app.o"), "obj\n").expect("write");

        let mut request = SubmitRequest::new("main");
        request.push = true;
        request.remote = "nowhere".to_string();
        let err = setup
            .submitter
            .submit(&setup.run_id, &request, at())
            .expect_err("push must fail");
        assert!(matches!(err, SubmitError::Git(_)));
        assert_eq!(git_in(&setup.root, &["rev-parse", "main"]), before);
        assert_eq!(git_in(&setup.root, &["symbolic-ref", "--short", "HEAD"]), "main");
        assert_eq!(git_in(&setup.root, &["status", "--porcelain"]), "?? target/");
        assert!(setup.root.join("target/app.o").exists());
        assert!(!setup.root.join("src/limiter.rs").exists());
        assert_eq!(event_names(&setup).last(), Some(&"submit_started"));
    }

    #[test]
    fn submit_lock_is_exclusive_until_dropped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("submit.lock");
        let held = SubmitLock::acquire(&path, Duration::from_millis(100)).expect("first");
        let err = SubmitLock::acquire(&path, Duration::from_millis(100)).expect_err("contended");
        assert!(matches!(err, SubmitError::LockTimeout { .. }));
        drop(held);
        SubmitLock::acquire(&path, Duration::from_millis(100)).expect("after release");
    }
}
