use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use orch_core::types::RunId;
use serde::{Deserialize, Serialize};

use crate::command::GitCli;
use crate::error::GitError;
use crate::repo::RepoHandle;

pub const DEFAULT_WORKTREE_ROOT: &str = ".relay/worktrees";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorktreeInfo {
    pub run_id: RunId,
    pub branch: String,
    pub path: PathBuf,
    pub base_sha: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListedWorktree {
    pub path: PathBuf,
    pub branch: Option<String>,
    pub head: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeManager {
    git: GitCli,
    relative_root: PathBuf,
}

impl Default for WorktreeManager {
    fn default() -> Self {
        Self {
            git: GitCli::default(),
            relative_root: PathBuf::from(DEFAULT_WORKTREE_ROOT),
        }
    }
}

impl WorktreeManager {
    pub fn new(git: GitCli, relative_root: impl Into<PathBuf>) -> Self {
        Self {
            git,
            relative_root: relative_root.into(),
        }
    }

    pub fn run_worktree_path(&self, repo: &RepoHandle, run_id: &RunId) -> PathBuf {
        repo.root.join(&self.relative_root).join(&run_id.0)
    }

    /// Create `relay/<run_id>` at `base_sha` and check it out in the run's worktree.
    pub fn create_for_run(
        &self,
        repo: &RepoHandle,
        run_id: &RunId,
        base_sha: &str,
    ) -> Result<WorktreeInfo, GitError> {
        let root = repo.root.join(&self.relative_root);
        fs::create_dir_all(&root).map_err(|source| GitError::WorktreeDir {
            path: root.clone(),
            source,
        })?;

        let path = self.run_worktree_path(repo, run_id);
        let branch = run_id.branch_name();
        let args = vec![
            OsString::from("worktree"),
            OsString::from("add"),
            OsString::from("--quiet"),
            OsString::from("-b"),
            OsString::from(branch.as_str()),
            path.as_os_str().to_os_string(),
            OsString::from(base_sha),
        ];
        self.git.run(&repo.root, args)?;

        Ok(WorktreeInfo {
            run_id: run_id.clone(),
            branch,
            path,
            base_sha: base_sha.to_string(),
        })
    }

    /// Check out `rev` detached at `path`; used for throwaway integration checks.
    pub fn add_detached(&self, repo: &RepoHandle, path: &Path, rev: &str) -> Result<(), GitError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| GitError::WorktreeDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let args = vec![
            OsString::from("worktree"),
            OsString::from("add"),
            OsString::from("--quiet"),
            OsString::from("--detach"),
            path.as_os_str().to_os_string(),
            OsString::from(rev),
        ];
        self.git.run(&repo.root, args)?;
        Ok(())
    }

    pub fn remove(&self, repo: &RepoHandle, path: &Path, force: bool) -> Result<(), GitError> {
        let mut args = vec![OsString::from("worktree"), OsString::from("remove")];
        if force {
            args.push(OsString::from("--force"));
        }
        args.push(path.as_os_str().to_os_string());

        self.git.run(&repo.root, args)?;
        self.git.run(&repo.root, ["worktree", "prune"])?;
        Ok(())
    }

    pub fn list(&self, repo: &RepoHandle) -> Result<Vec<ListedWorktree>, GitError> {
        let output = self.git.run(&repo.root, ["worktree", "list", "--porcelain"])?;
        parse_worktree_list(&output.stdout)
    }
}

fn parse_worktree_list(raw: &str) -> Result<Vec<ListedWorktree>, GitError> {
    let mut listed = Vec::new();

    let mut current_path: Option<PathBuf> = None;
    let mut current_branch: Option<String> = None;
    let mut current_head: Option<String> = None;

    for line in raw.lines().chain(std::iter::once("")) {
        if line.trim().is_empty() {
            if let Some(path) = current_path.take() {
                listed.push(ListedWorktree {
                    path,
                    branch: current_branch.take(),
                    head: current_head.take(),
                });
            }
            continue;
        }

        if let Some(rest) = line.strip_prefix("worktree ") {
            current_path = Some(PathBuf::from(rest.trim()));
        } else if let Some(rest) = line.strip_prefix("branch ") {
            current_branch = Some(rest.trim().trim_start_matches("refs/heads/").to_string());
        } else if let Some(rest) = line.strip_prefix("HEAD ") {
            current_head = Some(rest.trim().to_string());
        }
    }

    if listed.is_empty() && !raw.trim().is_empty() {
        return Err(GitError::Parse {
            context: "unable to parse git worktree list output".to_string(),
        });
    }

    Ok(listed)
}
