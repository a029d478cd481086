//! `relay.toml` and `tracks.toml` configuration.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::state::VerifyTier;
use crate::types::{CollisionPolicy, ScopeLock, Track, TrackId, TrackStep};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to serialize config at {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: toml::ser::Error,
    },
    #[error("failed to create config parent directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write config file at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub const DEFAULT_ENV_ALLOWLIST: &[&str] = &[
    "target/**",
    "node_modules/**",
    "dist/**",
    "__pycache__/**",
    "**/*.pyc",
    ".DS_Store",
    ".relay/**",
];

/// Allowlist patterns for a named scope preset.
pub fn preset_patterns(name: &str) -> Option<&'static [&'static str]> {
    match name.trim().to_ascii_lowercase().as_str() {
        "rust" => Some(&[
            "src/**",
            "tests/**",
            "benches/**",
            "crates/**",
            "build.rs",
            "Cargo.toml",
            "Cargo.lock",
        ]),
        "typescript" => Some(&[
            "src/**",
            "test/**",
            "tests/**",
            "package.json",
            "package-lock.json",
            "tsconfig.json",
        ]),
        "python" => Some(&[
            "src/**",
            "tests/**",
            "pyproject.toml",
            "setup.py",
            "requirements*.txt",
        ]),
        "docs" => Some(&["docs/**", "*.md"]),
        _ => None,
    }
}

/// Full run configuration (`relay.toml`). Every section is optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RunConfig {
    pub scope: ScopeConfig,
    pub verify: VerifySettings,
    pub resilience: ResilienceConfig,
    pub worker: WorkerConfig,
    pub checkpoint: CheckpointConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeConfig {
    pub allowlist: Vec<String>,
    pub denylist: Vec<String>,
    /// Generated files ignored by the guard and never checkpointed.
    pub env_allowlist: Vec<String>,
    pub presets: Vec<String>,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            allowlist: Vec::new(),
            denylist: Vec::new(),
            env_allowlist: DEFAULT_ENV_ALLOWLIST
                .iter()
                .map(|pattern| pattern.to_string())
                .collect(),
            presets: Vec::new(),
        }
    }
}

impl ScopeConfig {
    /// Allowlist with presets expanded, duplicates removed. Unknown presets are skipped.
    pub fn scope_lock(&self) -> ScopeLock {
        let mut allowlist: Vec<String> = Vec::new();
        let expanded = self
            .presets
            .iter()
            .filter_map(|name| preset_patterns(name))
            .flat_map(|patterns| patterns.iter().map(|pattern| pattern.to_string()));
        for pattern in self.allowlist.iter().cloned().chain(expanded) {
            if !allowlist.contains(&pattern) {
                allowlist.push(pattern);
            }
        }
        ScopeLock {
            allowlist,
            denylist: self.denylist.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskTrigger {
    pub name: String,
    pub patterns: Vec<String>,
    pub tier: VerifyTier,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifySettings {
    pub tier0: Vec<String>,
    pub tier1: Vec<String>,
    pub tier2: Vec<String>,
    /// Budget for one verification pass; each tier and command gets what remains.
    pub timeout_secs: u64,
    pub max_output_bytes: usize,
    pub risk_triggers: Vec<RiskTrigger>,
}

impl Default for VerifySettings {
    fn default() -> Self {
        Self {
            tier0: Vec::new(),
            tier1: Vec::new(),
            tier2: Vec::new(),
            timeout_secs: 600,
            max_output_bytes: 64 * 1024,
            risk_triggers: Vec::new(),
        }
    }
}

impl VerifySettings {
    pub fn commands_for(&self, tier: VerifyTier) -> &[String] {
        match tier {
            VerifyTier::Tier0 => &self.tier0,
            VerifyTier::Tier1 => &self.tier1,
            VerifyTier::Tier2 => &self.tier2,
        }
    }

    pub fn all_commands(&self) -> impl Iterator<Item = &String> {
        self.tier0.iter().chain(&self.tier1).chain(&self.tier2)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub auto_resume: bool,
    pub max_auto_resumes: u32,
    pub auto_resume_delays_ms: Vec<u64>,
    pub max_worker_call_minutes: u64,
    pub max_review_rounds: u32,
    pub max_milestone_retries: u32,
    pub stall_timeout_minutes: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            auto_resume: true,
            max_auto_resumes: 2,
            auto_resume_delays_ms: vec![1_000, 5_000],
            max_worker_call_minutes: 30,
            max_review_rounds: 2,
            max_milestone_retries: 2,
            stall_timeout_minutes: 15,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    #[default]
    Claude,
    Codex,
    /// Arbitrary command speaking the JSON line protocol.
    Command,
}

impl WorkerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerKind::Claude => "claude",
            WorkerKind::Codex => "codex",
            WorkerKind::Command => "command",
        }
    }
}

impl std::str::FromStr for WorkerKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "claude" => Ok(WorkerKind::Claude),
            "codex" => Ok(WorkerKind::Codex),
            "command" => Ok(WorkerKind::Command),
            other => Err(format!(
                "invalid worker kind '{other}'. valid values: claude, codex, command"
            )),
        }
    }
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WorkerConfig {
    pub kind: WorkerKind,
    /// Reviewer worker; falls back to `kind` when unset.
    pub reviewer: Option<WorkerKind>,
    /// Argv for `kind = "command"`; the prompt is written to stdin.
    pub command: Vec<String>,
}

impl WorkerConfig {
    pub fn reviewer_kind(&self) -> WorkerKind {
        self.reviewer.unwrap_or(self.kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub author_name: String,
    pub author_email: String,
    pub remote: String,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            author_name: "relay".to_string(),
            author_email: "relay@localhost".to_string(),
            remote: "origin".to_string(),
        }
    }
}

/// `tracks.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestrationConfig {
    #[serde(default)]
    pub orchestrator_id: Option<String>,
    #[serde(default)]
    pub collision_policy: CollisionPolicy,
    #[serde(default = "default_time_budget_minutes")]
    pub time_budget_minutes: u64,
    #[serde(default = "default_max_ticks")]
    pub max_ticks: u64,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default)]
    pub tracks: Vec<TrackConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackConfig {
    pub name: String,
    #[serde(default)]
    pub steps: Vec<StepConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepConfig {
    pub task: PathBuf,
    #[serde(default)]
    pub owns: Vec<String>,
}

fn default_time_budget_minutes() -> u64 {
    120
}

fn default_max_ticks() -> u64 {
    10_000
}

fn default_tick_interval_ms() -> u64 {
    1_000
}

impl OrchestrationConfig {
    /// Tracks with task paths resolved against `base_dir`.
    pub fn build_tracks(&self, base_dir: &Path) -> Vec<Track> {
        self.tracks
            .iter()
            .map(|track| Track {
                id: TrackId::new(track.name.clone()),
                name: track.name.clone(),
                steps: track
                    .steps
                    .iter()
                    .map(|step| {
                        let task = if step.task.is_absolute() {
                            step.task.clone()
                        } else {
                            base_dir.join(&step.task)
                        };
                        TrackStep::new(task, step.owns.clone())
                    })
                    .collect(),
            })
            .collect()
    }
}

pub fn parse_run_config(contents: &str) -> Result<RunConfig, toml::de::Error> {
    toml::from_str(contents)
}

pub fn parse_orchestration_config(contents: &str) -> Result<OrchestrationConfig, toml::de::Error> {
    toml::from_str(contents)
}

fn read_config(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })
}

pub fn load_run_config(path: impl AsRef<Path>) -> Result<RunConfig, ConfigError> {
    let path_ref = path.as_ref();
    let body = read_config(path_ref)?;
    parse_run_config(&body).map_err(|source| ConfigError::Parse {
        path: path_ref.to_path_buf(),
        source,
    })
}

/// Like [`load_run_config`] but a missing file yields the defaults.
pub fn load_run_config_or_default(path: impl AsRef<Path>) -> Result<RunConfig, ConfigError> {
    let path_ref = path.as_ref();
    if !path_ref.exists() {
        return Ok(RunConfig::default());
    }
    load_run_config(path_ref)
}

pub fn load_orchestration_config(
    path: impl AsRef<Path>,
) -> Result<OrchestrationConfig, ConfigError> {
    let path_ref = path.as_ref();
    let body = read_config(path_ref)?;
    parse_orchestration_config(&body).map_err(|source| ConfigError::Parse {
        path: path_ref.to_path_buf(),
        source,
    })
}

pub fn save_run_config(path: impl AsRef<Path>, config: &RunConfig) -> Result<(), ConfigError> {
    let path_ref = path.as_ref();
    if let Some(parent_dir) = path_ref.parent().map(Path::to_path_buf) {
        fs::create_dir_all(&parent_dir).map_err(|source| ConfigError::CreateDir {
            path: parent_dir,
            source,
        })?;
    }

    let body = toml::to_string_pretty(config).map_err(|source| ConfigError::Serialize {
        path: path_ref.to_path_buf(),
        source,
    })?;
    fs::write(path_ref, body).map_err(|source| ConfigError::Write {
        path: path_ref.to_path_buf(),
        source,
    })?;
    Ok(())
}
