use std::path::{Path, PathBuf};

use crate::command::GitCli;
use crate::error::GitError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoHandle {
    pub root: PathBuf,
    pub git_dir: PathBuf,
}

pub fn discover_repo(start_path: &Path, git: &GitCli) -> Result<RepoHandle, GitError> {
    let inside = match git.run(start_path, ["rev-parse", "--is-inside-work-tree"]) {
        Ok(output) => output.stdout.trim().eq("true"),
        Err(GitError::CommandFailed { .. }) => false,
        Err(err) => return Err(err),
    };

    if !inside {
        return Err(GitError::NotARepository {
            path: start_path.to_path_buf(),
        });
    }

    let root_raw = git.run(start_path, ["rev-parse", "--show-toplevel"])?;
    let root = PathBuf::from(root_raw.stdout.trim());

    let git_dir_raw = git.run(&root, ["rev-parse", "--git-common-dir"])?;
    let git_dir_rel = PathBuf::from(git_dir_raw.stdout.trim());
    let git_dir = if git_dir_rel.is_absolute() {
        git_dir_rel
    } else {
        root.join(git_dir_rel)
    };

    Ok(RepoHandle { root, git_dir })
}

/// Branch checked out in `cwd`, or `None` when HEAD is detached.
pub fn current_branch(cwd: &Path, git: &GitCli) -> Result<Option<String>, GitError> {
    let output = git.run_status(cwd, ["symbolic-ref", "--quiet", "--short", "HEAD"])?;
    if output.success() {
        return Ok(Some(output.stdout.trim().to_string()));
    }
    if output.status == Some(1) {
        return Ok(None);
    }
    Err(output.into_error())
}

pub fn head_sha(cwd: &Path, git: &GitCli) -> Result<String, GitError> {
    rev_parse(cwd, git, "HEAD")
}

pub fn rev_parse(cwd: &Path, git: &GitCli, rev: &str) -> Result<String, GitError> {
    let spec = format!("{rev}^{{commit}}");
    let output = git.run(cwd, ["rev-parse", "--verify", spec.as_str()])?;
    Ok(output.stdout.trim().to_string())
}

pub fn branch_exists(cwd: &Path, git: &GitCli, branch: &str) -> Result<bool, GitError> {
    let reference = format!("refs/heads/{branch}");
    let output = git.run_status(cwd, ["show-ref", "--verify", "--quiet", reference.as_str()])?;
    match output.status {
        Some(0) => Ok(true),
        Some(1) => Ok(false),
        _ => Err(output.into_error()),
    }
}

/// Check if the worktree has uncommitted changes (staged, unstaged or untracked).
pub fn has_uncommitted_changes(cwd: &Path, git: &GitCli) -> Result<bool, GitError> {
    let output = git.run(cwd, ["status", "--porcelain"])?;
    Ok(!output.stdout.trim().is_empty())
}

pub fn checkout(cwd: &Path, git: &GitCli, target: &str) -> Result<(), GitError> {
    git.run(cwd, ["checkout", "--quiet", target])?;
    Ok(())
}

/// Move the checked-out branch to `sha` and discard every local change.
pub fn reset_hard(cwd: &Path, git: &GitCli, sha: &str) -> Result<(), GitError> {
    git.run(cwd, ["reset", "--hard", "--quiet", sha])?;
    git.run(cwd, ["clean", "-fdq"])?;
    Ok(())
}

/// Like [`reset_hard`] but untracked files survive.
pub fn reset_tracked(cwd: &Path, git: &GitCli, sha: &str) -> Result<(), GitError> {
    git.run(cwd, ["reset", "--hard", "--quiet", sha])?;
    Ok(())
}

pub fn push(cwd: &Path, git: &GitCli, remote: &str, branch: &str) -> Result<(), GitError> {
    git.run(cwd, ["push", remote, branch])?;
    Ok(())
}
