//! On-disk layout under `<repo>/.relay/`.

use std::fs;
use std::path::{Path, PathBuf};

use orch_core::state::VerifyTier;
use orch_core::types::{OrchestratorId, RunId};

pub const RELAY_DIR: &str = ".relay";

#[derive(Debug, thiserror::Error)]
pub enum LayoutError {
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Paths shared by every run and orchestration in one repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayPaths {
    pub repo_root: PathBuf,
    pub relay_dir: PathBuf,
}

impl RelayPaths {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        let repo_root = repo_root.into();
        let relay_dir = repo_root.join(RELAY_DIR);
        Self {
            repo_root,
            relay_dir,
        }
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.relay_dir.join("runs")
    }

    pub fn run_dir(&self, run_id: &RunId) -> PathBuf {
        self.runs_dir().join(&run_id.0)
    }

    pub fn orchestration_dir(&self, id: &OrchestratorId) -> PathBuf {
        self.relay_dir.join("orchestrations").join(&id.0)
    }

    pub fn index_path(&self) -> PathBuf {
        self.relay_dir.join("index.sqlite")
    }

    pub fn submit_lock_path(&self) -> PathBuf {
        self.relay_dir.join("submit.lock")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.relay_dir.join("tmp")
    }

    /// Create `.relay/` and keep it out of `git status`.
    pub fn ensure_layout(&self) -> Result<(), LayoutError> {
        create_dir(&self.relay_dir)?;
        create_dir(&self.runs_dir())?;
        let ignore = self.relay_dir.join(".gitignore");
        if !ignore.exists() {
            fs::write(&ignore, "*\n").map_err(|source| LayoutError::Write {
                path: ignore.clone(),
                source,
            })?;
        }
        Ok(())
    }

    pub fn run_context(&self, run_id: RunId) -> RunContext {
        RunContext {
            run_dir: self.run_dir(&run_id),
            paths: self.clone(),
            run_id,
        }
    }
}

/// Everything a supervisor needs to locate one run's files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    pub paths: RelayPaths,
    pub run_id: RunId,
    pub run_dir: PathBuf,
}

impl RunContext {
    pub fn repo_root(&self) -> &Path {
        &self.paths.repo_root
    }

    pub fn state_path(&self) -> PathBuf {
        self.run_dir.join("state.json")
    }

    pub fn events_path(&self) -> PathBuf {
        self.run_dir.join("events.jsonl")
    }

    pub fn verify_log_path(&self, attempt: u32, tier: VerifyTier) -> PathBuf {
        self.run_dir
            .join("verify")
            .join(format!("{attempt}-{}.log", tier.as_str()))
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.run_dir.join("artifacts")
    }

    pub fn diagnostics_path(&self) -> PathBuf {
        self.artifacts_dir().join("stop_diagnostics.json")
    }

    pub fn ensure_layout(&self) -> Result<(), LayoutError> {
        self.paths.ensure_layout()?;
        create_dir(&self.run_dir)?;
        create_dir(&self.artifacts_dir())
    }
}

fn create_dir(path: &Path) -> Result<(), LayoutError> {
    fs::create_dir_all(path).map_err(|source| LayoutError::CreateDir {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_paths_follow_relay_layout() {
        let paths = RelayPaths::new("/repo");
        let ctx = paths.run_context(RunId::new("r1"));
        assert_eq!(ctx.state_path(), PathBuf::from("/repo/.relay/runs/r1/state.json"));
        assert_eq!(
            ctx.events_path(),
            PathBuf::from("/repo/.relay/runs/r1/events.jsonl")
        );
        assert_eq!(
            ctx.verify_log_path(3, VerifyTier::Tier1),
            PathBuf::from("/repo/.relay/runs/r1/verify/3-tier1.log")
        );
        assert_eq!(
            ctx.diagnostics_path(),
            PathBuf::from("/repo/.relay/runs/r1/artifacts/stop_diagnostics.json")
        );
        assert_eq!(
            paths.orchestration_dir(&OrchestratorId("o1".to_string())),
            PathBuf::from("/repo/.relay/orchestrations/o1")
        );
        assert_eq!(paths.index_path(), PathBuf::from("/repo/.relay/index.sqlite"));
    }

    #[test]
    fn ensure_layout_ignores_relay_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = RelayPaths::new(dir.path());
        let ctx = paths.run_context(RunId::new("r1"));
        ctx.ensure_layout().expect("layout");
        ctx.ensure_layout().expect("layout is idempotent");

        let ignore = fs::read_to_string(dir.path().join(".relay/.gitignore")).expect("read");
        assert_eq!(ignore, "*\n");
        assert!(ctx.artifacts_dir().is_dir());
    }
}
