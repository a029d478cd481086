//! Markdown task files with an optional `---` front matter block.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::types::{Milestone, RiskLevel, ScopeLock};

#[derive(Debug, thiserror::Error)]
pub enum TaskFileError {
    #[error("failed to read task file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid front matter in {path}: {message}")]
    FrontMatter { path: PathBuf, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFile {
    pub title: String,
    #[serde(default)]
    pub owns: Vec<String>,
    #[serde(default)]
    pub allowlist: Vec<String>,
    #[serde(default)]
    pub denylist: Vec<String>,
    /// Pre-planned milestone goals; empty means the worker plans.
    #[serde(default)]
    pub milestones: Vec<String>,
    #[serde(default)]
    pub risk: Option<RiskLevel>,
    /// Markdown after the front matter.
    pub body: String,
}

impl TaskFile {
    /// Milestones from front matter, each carrying the task's risk level.
    pub fn planned_milestones(&self) -> Vec<Milestone> {
        let risk = self.risk.unwrap_or_default();
        self.milestones
            .iter()
            .map(|goal| Milestone::new(goal.clone()).with_risk(risk))
            .collect()
    }

    /// Task scope merged over the configured one. Task entries come first.
    pub fn merged_scope(&self, configured: &ScopeLock) -> ScopeLock {
        let mut allowlist = self.allowlist.clone();
        for pattern in &configured.allowlist {
            if !allowlist.contains(pattern) {
                allowlist.push(pattern.clone());
            }
        }
        let mut denylist = self.denylist.clone();
        for pattern in &configured.denylist {
            if !denylist.contains(pattern) {
                denylist.push(pattern.clone());
            }
        }
        ScopeLock {
            allowlist,
            denylist,
        }
    }
}

fn parse_scalar(value: &str) -> String {
    let trimmed = value.trim();
    let bytes = trimmed.as_bytes();
    if bytes.len() >= 2
        && ((bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[bytes.len() - 1] == b'\''))
    {
        trimmed[1..trimmed.len() - 1].to_string()
    } else {
        trimmed.to_string()
    }
}

/// Inline `[a, b]` list or a single scalar.
fn parse_inline_list(value: &str) -> Vec<String> {
    let trimmed = value.trim();
    match trimmed
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
    {
        Some(inner) => inner
            .split(',')
            .map(parse_scalar)
            .filter(|item| !item.is_empty())
            .collect(),
        None => vec![parse_scalar(trimmed)],
    }
}

fn split_front_matter(content: &str) -> (Option<&str>, &str) {
    let Some(rest) = content
        .strip_prefix("---\n")
        .or_else(|| content.strip_prefix("---\r\n"))
    else {
        return (None, content);
    };
    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == "---" {
            let front = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return (Some(front), body);
        }
        offset += line.len();
    }
    (None, content)
}

fn fallback_title(body: &str) -> Option<String> {
    body.lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("# "))
        .map(|title| title.trim().to_string())
        .filter(|title| !title.is_empty())
}

/// Parse a task file. `default_title` is used when neither front matter nor
/// a `# ` heading names the task.
pub fn parse_task_file(content: &str, default_title: &str) -> Result<TaskFile, String> {
    let (front, body) = split_front_matter(content);

    let mut title: Option<String> = None;
    let mut owns = Vec::new();
    let mut allowlist = Vec::new();
    let mut denylist = Vec::new();
    let mut milestones = Vec::new();
    let mut risk: Option<RiskLevel> = None;
    let mut current_list_key: Option<&str> = None;

    for (idx, raw_line) in front.unwrap_or_default().lines().enumerate() {
        let line_no = idx + 2;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(value) = line.strip_prefix("- ") {
            let key = current_list_key
                .ok_or_else(|| format!("line {line_no}: list item found without list key"))?;
            let value = parse_scalar(value);
            if value.is_empty() {
                return Err(format!("line {line_no}: list item cannot be empty"));
            }
            match key {
                "owns" => owns.push(value),
                "allowlist" => allowlist.push(value),
                "denylist" => denylist.push(value),
                "milestones" => milestones.push(value),
                _ => return Err(format!("line {line_no}: unsupported list key '{key}'")),
            }
            continue;
        }

        let Some((raw_key, raw_value)) = line.split_once(':') else {
            return Err(format!("line {line_no}: expected 'key: value'"));
        };
        let key = raw_key.trim();
        let value = raw_value.trim();
        current_list_key = None;

        match key {
            "title" => {
                if title.is_some() {
                    return Err(format!("line {line_no}: duplicate key 'title'"));
                }
                let parsed = parse_scalar(value);
                if parsed.is_empty() {
                    return Err(format!("line {line_no}: title cannot be empty"));
                }
                title = Some(parsed);
            }
            "risk" => {
                let parsed = parse_scalar(value)
                    .parse::<RiskLevel>()
                    .map_err(|err| format!("line {line_no}: {err}"))?;
                risk = Some(parsed);
            }
            "owns" | "allowlist" | "denylist" | "milestones" => {
                let target = match key {
                    "owns" => &mut owns,
                    "allowlist" => &mut allowlist,
                    "denylist" => &mut denylist,
                    _ => &mut milestones,
                };
                if !target.is_empty() {
                    return Err(format!("line {line_no}: duplicate key '{key}'"));
                }
                if value.is_empty() {
                    current_list_key = Some(match key {
                        "owns" => "owns",
                        "allowlist" => "allowlist",
                        "denylist" => "denylist",
                        _ => "milestones",
                    });
                } else {
                    target.extend(parse_inline_list(value));
                }
            }
            other => return Err(format!("line {line_no}: unknown key '{other}'")),
        }
    }

    let title = title
        .or_else(|| fallback_title(body))
        .unwrap_or_else(|| default_title.to_string());

    Ok(TaskFile {
        title,
        owns,
        allowlist,
        denylist,
        milestones,
        risk,
        body: body.trim().to_string(),
    })
}

pub fn load_task_file(path: impl AsRef<Path>) -> Result<TaskFile, TaskFileError> {
    let path_ref = path.as_ref();
    let content = fs::read_to_string(path_ref).map_err(|source| TaskFileError::Read {
        path: path_ref.to_path_buf(),
        source,
    })?;
    let default_title = path_ref
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("task");
    parse_task_file(&content, default_title).map_err(|message| TaskFileError::FrontMatter {
        path: path_ref.to_path_buf(),
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_front_matter_lists_and_scalars() {
        let content = r#"---
title: "Add rate limiting"
risk: high
owns:
  - src/api/**
  - tests/api/**
denylist: [Cargo.lock, "secrets/**"]
milestones:
  - add limiter type
  - wire limiter into handlers
---
# Ignored heading

Limit each client to 10 requests per second.
"#;
        let task = parse_task_file(content, "fallback").expect("parse task");
        assert_eq!(task.title, "Add rate limiting");
        assert_eq!(task.risk, Some(RiskLevel::High));
        assert_eq!(task.owns, vec!["src/api/**", "tests/api/**"]);
        assert_eq!(task.denylist, vec!["Cargo.lock", "secrets/**"]);
        assert_eq!(task.milestones.len(), 2);
        assert!(task.body.starts_with("# Ignored heading"));

        let planned = task.planned_milestones();
        assert_eq!(planned[1].goal, "wire limiter into handlers");
        assert_eq!(planned[1].risk_level, RiskLevel::High);
    }

    #[test]
    fn title_falls_back_to_heading_then_default() {
        let task = parse_task_file("# Fix login\n\nbody", "file-stem").expect("parse");
        assert_eq!(task.title, "Fix login");
        assert!(task.owns.is_empty());

        let task = parse_task_file("just text", "file-stem").expect("parse");
        assert_eq!(task.title, "file-stem");
    }

    #[test]
    fn rejects_unknown_keys_and_bad_risk() {
        let err = parse_task_file("---\nowner: me\n---\n", "t").expect_err("unknown key");
        assert!(err.contains("unknown key 'owner'"));

        let err = parse_task_file("---\nrisk: extreme\n---\n", "t").expect_err("bad risk");
        assert!(err.contains("invalid risk level"));

        let err = parse_task_file("---\n- orphan\n---\n", "t").expect_err("orphan item");
        assert!(err.contains("without list key"));
    }

    #[test]
    fn merged_scope_puts_task_patterns_first() {
        let task = parse_task_file("---\nallowlist: [src/**]\n---\n", "t").expect("parse");
        let merged = task.merged_scope(&ScopeLock {
            allowlist: vec!["src/**".to_string(), "docs/**".to_string()],
            denylist: vec!["vendor/**".to_string()],
        });
        assert_eq!(merged.allowlist, vec!["src/**", "docs/**"]);
        assert_eq!(merged.denylist, vec!["vendor/**"]);
    }

    #[test]
    fn load_task_file_uses_file_stem_and_classifies_errors() {
        let dir = std::env::temp_dir().join(format!(
            "relay-task-file-{}",
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        fs::create_dir_all(&dir).expect("create dir");
        let path = dir.join("cleanup-logs.md");
        fs::write(&path, "no heading here").expect("write task");
        let task = load_task_file(&path).expect("load task");
        assert_eq!(task.title, "cleanup-logs");

        let missing = dir.join("missing.md");
        let err = load_task_file(&missing).expect_err("missing task");
        assert!(matches!(err, TaskFileError::Read { .. }));

        let bad = dir.join("bad.md");
        fs::write(&bad, "---\nnope\n---\n").expect("write bad task");
        let err = load_task_file(&bad).expect_err("bad front matter");
        assert!(matches!(err, TaskFileError::FrontMatter { .. }));

        let _ = fs::remove_dir_all(dir);
    }
}
