//! Git seams the supervisor works through: the run's worktree and its
//! checkpoint commits.

use std::path::Path;

use orch_core::types::RunId;
use orch_git::{
    changed_files_since, commit_all, diff_patch, diffstat, head_sha, reset_hard, ChangedFile,
    GitCli, GitError, RepoHandle, WorktreeInfo, WorktreeManager,
};
use tracing::{debug, info};

/// A run's isolated checkout.
pub trait Workspace {
    /// Create the worktree and branch for `run_id` at the current HEAD.
    fn prepare(&self, run_id: &RunId) -> Result<WorktreeInfo, GitError>;

    fn changed_files(&self, worktree: &Path, base: &str) -> Result<Vec<ChangedFile>, GitError>;

    /// Discard everything in `worktree` past `sha`, untracked files included.
    fn restore(&self, worktree: &Path, sha: &str) -> Result<(), GitError>;

    fn diff(&self, worktree: &Path, base: &str) -> Result<String, GitError>;

    fn diffstat(&self, worktree: &Path, base: &str) -> Result<String, GitError>;

    /// Remove a finished run's worktree. Its branch and commits stay.
    fn release(&self, worktree: &Path) -> Result<(), GitError>;
}

/// Commits verified milestones.
pub trait Checkpointer {
    /// Stage everything except `exclude` and commit. `None` when nothing was staged.
    fn commit(
        &self,
        worktree: &Path,
        message: &str,
        exclude: &[String],
    ) -> Result<Option<String>, GitError>;

    fn head(&self, worktree: &Path) -> Result<String, GitError>;
}

#[derive(Debug, Clone)]
pub struct GitWorkspace {
    repo: RepoHandle,
    git: GitCli,
    worktrees: WorktreeManager,
}

impl GitWorkspace {
    pub fn new(repo: RepoHandle, git: GitCli) -> Self {
        Self {
            worktrees: WorktreeManager::new(git.clone(), orch_git::DEFAULT_WORKTREE_ROOT),
            repo,
            git,
        }
    }
}

impl Workspace for GitWorkspace {
    fn prepare(&self, run_id: &RunId) -> Result<WorktreeInfo, GitError> {
        let base = head_sha(&self.repo.root, &self.git)?;
        let info = self.worktrees.create_for_run(&self.repo, run_id, &base)?;
        info!(
            run_id = %run_id,
            branch = %info.branch,
            base_sha = %info.base_sha,
            "prepared run worktree"
        );
        Ok(info)
    }

    fn changed_files(&self, worktree: &Path, base: &str) -> Result<Vec<ChangedFile>, GitError> {
        changed_files_since(worktree, &self.git, base)
    }

    fn restore(&self, worktree: &Path, sha: &str) -> Result<(), GitError> {
        debug!(worktree = %worktree.display(), sha, "restoring worktree");
        reset_hard(worktree, &self.git, sha)
    }

    fn diff(&self, worktree: &Path, base: &str) -> Result<String, GitError> {
        diff_patch(worktree, &self.git, base)
    }

    fn diffstat(&self, worktree: &Path, base: &str) -> Result<String, GitError> {
        diffstat(worktree, &self.git, base)
    }

    fn release(&self, worktree: &Path) -> Result<(), GitError> {
        // Forced: leftovers matching env_allowlist are never committed.
        self.worktrees.remove(&self.repo, worktree, true)?;
        info!(worktree = %worktree.display(), "removed run worktree");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct GitCheckpointer {
    git: GitCli,
}

impl GitCheckpointer {
    /// `git` should carry the checkpoint author identity.
    pub fn new(git: GitCli) -> Self {
        Self { git }
    }
}

impl Checkpointer for GitCheckpointer {
    fn commit(
        &self,
        worktree: &Path,
        message: &str,
        exclude: &[String],
    ) -> Result<Option<String>, GitError> {
        commit_all(worktree, &self.git, message, exclude)
    }

    fn head(&self, worktree: &Path) -> Result<String, GitError> {
        head_sha(worktree, &self.git)
    }
}

/// Commit message naming the run and milestone.
pub fn checkpoint_message(run_id: &RunId, milestone_index: usize, goal: &str) -> String {
    format!(
        "relay({run_id}): milestone {} {goal}\n\nRelay-Run: {run_id}\nRelay-Milestone: {milestone_index}\n",
        milestone_index + 1
    )
}
