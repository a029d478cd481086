use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::command::GitCli;
use crate::error::GitError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    Added,
    Modified,
    Deleted,
    Renamed,
    Copied,
    Unmerged,
    Untracked,
    TypeChanged,
    Unknown,
}

/// One changed path. Renames and copies carry their source in `previous_path`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedFile {
    pub path: String,
    #[serde(default)]
    pub previous_path: Option<String>,
    pub state: FileState,
}

impl ChangedFile {
    /// Every path the change touches; both sides of a rename.
    pub fn touched_paths(&self) -> Vec<&str> {
        let mut paths = vec![self.path.as_str()];
        if let Some(previous) = &self.previous_path {
            paths.push(previous.as_str());
        }
        paths
    }
}

/// Files changed in `cwd` relative to `base`: committed, staged, unstaged
/// and untracked, with rename detection.
pub fn changed_files_since(
    cwd: &Path,
    git: &GitCli,
    base: &str,
) -> Result<Vec<ChangedFile>, GitError> {
    let tracked = git.run(cwd, ["diff", "--name-status", "-M", "-z", base])?;
    let mut files = parse_name_status_z(&tracked.stdout)?;

    let untracked = git.run(cwd, ["ls-files", "--others", "--exclude-standard", "-z"])?;
    files.extend(
        untracked
            .stdout
            .split('\0')
            .filter(|path| !path.is_empty())
            .map(|path| ChangedFile {
                path: path.to_string(),
                previous_path: None,
                state: FileState::Untracked,
            }),
    );
    Ok(files)
}

/// Parsed `git status --porcelain=v1 -z`.
pub fn status_porcelain(cwd: &Path, git: &GitCli) -> Result<Vec<ChangedFile>, GitError> {
    let output = git.run(cwd, ["status", "--porcelain=v1", "-z"])?;
    parse_porcelain_status_z(&output.stdout)
}

/// Unified diff of tracked changes against `base`.
pub fn diff_patch(cwd: &Path, git: &GitCli, base: &str) -> Result<String, GitError> {
    Ok(git.run(cwd, ["diff", "-M", base])?.stdout)
}

pub fn diffstat(cwd: &Path, git: &GitCli, base: &str) -> Result<String, GitError> {
    Ok(git.run(cwd, ["diff", "--stat", "-M", base])?.stdout)
}

fn parse_name_status_z(raw: &str) -> Result<Vec<ChangedFile>, GitError> {
    let mut files = Vec::new();
    let mut fields = raw.split('\0').filter(|field| !field.is_empty());

    while let Some(code) = fields.next() {
        let state = file_state_from_code(code);
        let first = fields.next().ok_or_else(|| GitError::Parse {
            context: format!("missing path after status '{code}'"),
        })?;
        if matches!(state, FileState::Renamed | FileState::Copied) {
            let second = fields.next().ok_or_else(|| GitError::Parse {
                context: format!("missing destination path for '{code} {first}'"),
            })?;
            files.push(ChangedFile {
                path: second.to_string(),
                previous_path: Some(first.to_string()),
                state,
            });
        } else {
            files.push(ChangedFile {
                path: first.to_string(),
                previous_path: None,
                state,
            });
        }
    }

    Ok(files)
}

fn parse_porcelain_status_z(raw: &str) -> Result<Vec<ChangedFile>, GitError> {
    let mut files = Vec::new();
    let mut entries = raw.split('\0').filter(|entry| !entry.is_empty());

    while let Some(entry) = entries.next() {
        if entry.len() < 4 {
            return Err(GitError::Parse {
                context: format!("invalid porcelain status entry: {entry}"),
            });
        }
        let code = &entry[0..2];
        let path = entry[3..].to_string();
        let state = if code == "??" {
            FileState::Untracked
        } else {
            file_state_from_code(code.trim())
        };
        let previous_path = if matches!(state, FileState::Renamed | FileState::Copied) {
            entries.next().map(str::to_string)
        } else {
            None
        };
        files.push(ChangedFile {
            path,
            previous_path,
            state,
        });
    }

    Ok(files)
}

fn file_state_from_code(code: &str) -> FileState {
    if code.contains('U') || code == "AA" || code == "DD" {
        return FileState::Unmerged;
    }
    match code.chars().next() {
        Some('A') => FileState::Added,
        Some('M') => FileState::Modified,
        Some('D') => FileState::Deleted,
        Some('R') => FileState::Renamed,
        Some('C') => FileState::Copied,
        Some('T') => FileState::TypeChanged,
        _ => FileState::Unknown,
    }
}
