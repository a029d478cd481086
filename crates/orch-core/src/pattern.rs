//! Path pattern normalization, matching and overlap.
//!
//! Patterns are `glob` patterns over repository-relative, `/`-separated
//! paths. `*` never crosses a `/`; `**` as a whole component crosses any
//! number of them.

use glob::{MatchOptions, Pattern};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

const GLOB_CHARS: &[char] = &['*', '?', '[', ']', '{', '}'];

/// Normalize a repository path: `\` becomes `/`, leading `./` and `/` are stripped.
pub fn normalize_path(path: &str) -> String {
    let mut value = path.trim().replace('\\', "/");
    loop {
        if let Some(rest) = value.strip_prefix("./") {
            value = rest.to_string();
        } else if let Some(rest) = value.strip_prefix('/') {
            value = rest.to_string();
        } else {
            break;
        }
    }
    value
}

/// Normalize a pattern like a path; a trailing `/` becomes `/**`.
pub fn normalize_pattern(pattern: &str) -> String {
    // Checked before normalize_path, which strips a bare `/` to nothing.
    let directory = pattern.trim().replace('\\', "/").ends_with('/');
    let value = normalize_path(pattern);
    if directory {
        let trimmed = value.trim_end_matches('/');
        if trimmed.is_empty() {
            return "**".to_string();
        }
        return format!("{trimmed}/**");
    }
    value
}

pub fn has_glob_chars(pattern: &str) -> bool {
    pattern.contains(GLOB_CHARS)
}

/// Literal text before the first glob character.
fn literal_prefix(pattern: &str) -> &str {
    match pattern.find(GLOB_CHARS) {
        Some(index) => &pattern[..index],
        None => pattern,
    }
}

#[derive(Debug, Clone)]
enum Matcher {
    Glob(Pattern),
    Literal(String),
}

/// A normalized, compiled set of patterns.
///
/// Patterns that fail to compile are matched literally; [`invalid_patterns`]
/// reports them for validation.
#[derive(Debug, Clone, Default)]
pub struct PatternSet {
    normalized: Vec<String>,
    matchers: Vec<Matcher>,
}

impl PatternSet {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        let mut normalized = Vec::new();
        let mut matchers = Vec::new();
        for raw in patterns {
            let pattern = normalize_pattern(raw.as_ref());
            if pattern.is_empty() || normalized.contains(&pattern) {
                continue;
            }
            let matcher = if has_glob_chars(&pattern) {
                match Pattern::new(&pattern) {
                    Ok(glob) => Matcher::Glob(glob),
                    Err(_) => Matcher::Literal(pattern.clone()),
                }
            } else {
                Matcher::Literal(pattern.clone())
            };
            normalized.push(pattern);
            matchers.push(matcher);
        }
        Self {
            normalized,
            matchers,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty()
    }

    pub fn patterns(&self) -> &[String] {
        &self.normalized
    }

    pub fn matches(&self, path: &str) -> bool {
        let path = normalize_path(path);
        self.matchers.iter().any(|matcher| match matcher {
            Matcher::Glob(glob) => glob.matches_with(&path, MATCH_OPTIONS),
            Matcher::Literal(literal) => *literal == path,
        })
    }
}

/// Patterns from `patterns` that are not valid globs.
pub fn invalid_patterns<S: AsRef<str>>(patterns: &[S]) -> Vec<String> {
    patterns
        .iter()
        .map(|raw| normalize_pattern(raw.as_ref()))
        .filter(|pattern| has_glob_chars(pattern) && Pattern::new(pattern).is_err())
        .collect()
}

/// Whether some concrete path could match both patterns.
///
/// Exact for literal patterns. For two globs this compares literal prefixes
/// and may report overlap where none exists, never the reverse.
pub fn patterns_overlap(left: &str, right: &str) -> bool {
    let left = normalize_pattern(left);
    let right = normalize_pattern(right);
    match (has_glob_chars(&left), has_glob_chars(&right)) {
        (false, false) => left == right,
        (true, false) => PatternSet::new(&[left.as_str()]).matches(&right),
        (false, true) => PatternSet::new(&[right.as_str()]).matches(&left),
        (true, true) => {
            let a = literal_prefix(&left);
            let b = literal_prefix(&right);
            a.starts_with(b) || b.starts_with(a)
        }
    }
}

/// Whether two declared scopes could touch the same path. An empty scope is
/// undeclared and overlaps everything.
pub fn scopes_overlap<A: AsRef<str>, B: AsRef<str>>(left: &[A], right: &[B]) -> bool {
    if left.is_empty() || right.is_empty() {
        return true;
    }
    left.iter().any(|a| {
        right
            .iter()
            .any(|b| patterns_overlap(a.as_ref(), b.as_ref()))
    })
}
