use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::command::GitCli;
use crate::error::GitError;
use crate::repo::head_sha;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum CherryPickOutcome {
    /// Every commit applied; `head` is the new tip.
    Applied { head: String },
    /// Range was empty, nothing to apply.
    Empty,
    /// Stopped on a conflict. The cherry-pick is still in progress.
    Conflict { files: Vec<String> },
}

/// Stage everything except `exclude` globs and commit. Returns the new commit,
/// or `None` when nothing was staged.
pub fn commit_all(
    cwd: &Path,
    git: &GitCli,
    message: &str,
    exclude: &[String],
) -> Result<Option<String>, GitError> {
    let mut args = vec![
        "add".to_string(),
        "--all".to_string(),
        "--".to_string(),
        ".".to_string(),
    ];
    args.extend(
        exclude
            .iter()
            .map(|pattern| format!(":(exclude,glob){pattern}")),
    );
    git.run(cwd, &args)?;

    let staged = git.run_status(cwd, ["diff", "--cached", "--quiet"])?;
    match staged.status {
        Some(0) => return Ok(None),
        Some(1) => {}
        _ => return Err(staged.into_error()),
    }

    git.run(cwd, ["commit", "--quiet", "--no-verify", "-m", message])?;
    head_sha(cwd, git).map(Some)
}

/// Apply `base..tip` onto whatever is checked out in `cwd`.
pub fn cherry_pick_range(
    cwd: &Path,
    git: &GitCli,
    base: &str,
    tip: &str,
) -> Result<CherryPickOutcome, GitError> {
    let range = format!("{base}..{tip}");
    let pending = git.run(cwd, ["rev-list", "--count", range.as_str()])?;
    if pending.stdout.trim() == "0" {
        return Ok(CherryPickOutcome::Empty);
    }

    let output = git.run_status(
        cwd,
        ["cherry-pick", "--keep-redundant-commits", range.as_str()],
    )?;
    if output.success() {
        return Ok(CherryPickOutcome::Applied {
            head: head_sha(cwd, git)?,
        });
    }

    let files = unmerged_files(cwd, git)?;
    if files.is_empty() {
        return Err(output.into_error());
    }
    Ok(CherryPickOutcome::Conflict { files })
}

pub fn unmerged_files(cwd: &Path, git: &GitCli) -> Result<Vec<String>, GitError> {
    let output = git.run(cwd, ["diff", "--name-only", "--diff-filter=U", "-z"])?;
    let mut files: Vec<String> = output
        .stdout
        .split('\0')
        .filter(|path| !path.is_empty())
        .map(str::to_string)
        .collect();
    files.sort();
    files.dedup();
    Ok(files)
}

pub fn abort_cherry_pick(cwd: &Path, git: &GitCli) -> Result<(), GitError> {
    git.run(cwd, ["cherry-pick", "--abort"])?;
    Ok(())
}
