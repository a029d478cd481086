//! Classifies a run's changed files against its scope lock and ownership.
//!
//! Pure functions: callers collect the changes and act on the verdict.

use orch_core::pattern::{
    has_glob_chars, normalize_path, normalize_pattern, patterns_overlap, PatternSet,
};
use orch_core::state::StopReason;
use orch_core::types::{Milestone, ScopeLock};
use orch_git::ChangedFile;
use serde::{Deserialize, Serialize};

/// Result of checking touched paths against owned patterns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipCheck {
    pub ok: bool,
    /// Owned patterns after normalization.
    pub owned_paths: Vec<String>,
    /// Touched paths left after removing env-allowlisted ones.
    pub semantic_changed: Vec<String>,
    pub violating_files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardResult {
    pub ok: bool,
    pub semantic_changed: Vec<String>,
    pub violating_files: Vec<String>,
    pub reason: Option<StopReason>,
}

/// Every touched path, both sides of renames, normalized and deduplicated.
pub fn touched_paths(changed: &[ChangedFile]) -> Vec<String> {
    let mut paths: Vec<String> = Vec::new();
    for file in changed {
        for path in file.touched_paths() {
            let path = normalize_path(path);
            if !path.is_empty() && !paths.contains(&path) {
                paths.push(path);
            }
        }
    }
    paths
}

/// Touched paths minus generated files matched by `env_allowlist`.
pub fn semantic_changes<S: AsRef<str>>(changed: &[ChangedFile], env_allowlist: &[S]) -> Vec<String> {
    let env = PatternSet::new(env_allowlist);
    touched_paths(changed)
        .into_iter()
        .filter(|path| !env.matches(path))
        .collect()
}

/// Every semantic change must match an owned pattern. No ownership means no
/// restriction.
pub fn check_ownership<S: AsRef<str>, E: AsRef<str>>(
    changed: &[ChangedFile],
    owned: &[S],
    env_allowlist: &[E],
) -> OwnershipCheck {
    let owned_set = PatternSet::new(owned);
    let semantic_changed = semantic_changes(changed, env_allowlist);
    let violating_files = if owned_set.is_empty() {
        Vec::new()
    } else {
        semantic_changed
            .iter()
            .filter(|path| !owned_set.matches(path))
            .cloned()
            .collect()
    };
    OwnershipCheck {
        ok: violating_files.is_empty(),
        owned_paths: owned_set.patterns().to_vec(),
        semantic_changed,
        violating_files,
    }
}

/// Full verdict for VERIFY: denylist first, then ownership when declared,
/// otherwise the scope allowlist.
pub fn check_changes<S: AsRef<str>, E: AsRef<str>>(
    changed: &[ChangedFile],
    scope: &ScopeLock,
    owns: &[S],
    env_allowlist: &[E],
) -> GuardResult {
    let semantic_changed = semantic_changes(changed, env_allowlist);
    let deny = PatternSet::new(&scope.denylist);
    let denied: Vec<String> = semantic_changed
        .iter()
        .filter(|path| deny.matches(path))
        .cloned()
        .collect();
    if !denied.is_empty() {
        return GuardResult {
            ok: false,
            semantic_changed,
            violating_files: denied,
            reason: Some(StopReason::ScopeViolation),
        };
    }

    if !owns.is_empty() {
        let ownership = check_ownership(changed, owns, env_allowlist);
        return GuardResult {
            ok: ownership.ok,
            semantic_changed,
            reason: (!ownership.ok).then_some(StopReason::OwnershipViolation),
            violating_files: ownership.violating_files,
        };
    }

    let allow = PatternSet::new(&scope.allowlist);
    let outside: Vec<String> = if allow.is_empty() {
        Vec::new()
    } else {
        semantic_changed
            .iter()
            .filter(|path| !allow.matches(path))
            .cloned()
            .collect()
    };
    GuardResult {
        ok: outside.is_empty(),
        semantic_changed,
        reason: (!outside.is_empty()).then_some(StopReason::ScopeViolation),
        violating_files: outside,
    }
}

/// `files_expected` entries across a plan that fall outside the scope.
///
/// Literal entries must be allowed like a changed path. Glob entries must
/// overlap some allowed pattern and may not sit inside a denied one.
pub fn plan_violations<S: AsRef<str>>(
    milestones: &[Milestone],
    scope: &ScopeLock,
    owns: &[S],
) -> Vec<String> {
    let allowed: Vec<String> = if owns.is_empty() {
        scope.allowlist.clone()
    } else {
        owns.iter().map(|p| p.as_ref().to_string()).collect()
    };
    let allow = PatternSet::new(&allowed);
    let deny = PatternSet::new(&scope.denylist);

    let mut violations = Vec::new();
    for expected in milestones.iter().flat_map(|m| m.files_expected.iter()) {
        let entry = normalize_pattern(expected);
        if entry.is_empty() || violations.contains(&entry) {
            continue;
        }
        let ok = if has_glob_chars(&entry) {
            let within_allow =
                allow.is_empty() || allowed.iter().any(|pattern| patterns_overlap(pattern, &entry));
            within_allow && !deny.matches(&entry)
        } else {
            (allow.is_empty() || allow.matches(&entry)) && !deny.matches(&entry)
        };
        if !ok {
            violations.push(entry);
        }
    }
    violations
}
