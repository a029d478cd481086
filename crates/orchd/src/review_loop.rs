//! Turns free-text reviewer feedback into structured requests and detects
//! reviewers repeating themselves.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewFeedback {
    pub is_approved: bool,
    pub requests: Vec<String>,
    /// Verification commands that would show the requests are satisfied.
    pub commands_to_satisfy: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestCategory {
    TypeCheck,
    Tests,
    Lint,
    Build,
    Coverage,
}

impl RequestCategory {
    const ALL: [RequestCategory; 5] = [
        RequestCategory::TypeCheck,
        RequestCategory::Tests,
        RequestCategory::Lint,
        RequestCategory::Build,
        RequestCategory::Coverage,
    ];

    fn phrases(self) -> &'static [&'static str] {
        match self {
            RequestCategory::TypeCheck => &[
                "type error",
                "typecheck",
                "type check",
                "type-check",
                "typing",
                "mypy",
                "tsc",
            ],
            RequestCategory::Tests => &["test"],
            RequestCategory::Lint => &["lint", "clippy", "eslint", "ruff", "warning"],
            RequestCategory::Build => &["build", "compile"],
            RequestCategory::Coverage => &["coverage"],
        }
    }

    fn command_keywords(self) -> &'static [&'static str] {
        match self {
            RequestCategory::TypeCheck => {
                &["typecheck", "type-check", "tsc", "mypy", "cargo check"]
            }
            RequestCategory::Tests => &["test", "pytest"],
            RequestCategory::Lint => &["lint", "clippy", "eslint", "ruff"],
            RequestCategory::Build => &["build", "compile"],
            RequestCategory::Coverage => &["coverage", "cov", "tarpaulin"],
        }
    }

    fn matches(self, lower: &str) -> bool {
        if self == RequestCategory::Coverage
            && mentions_percentage(lower)
            && lower.contains("cover")
        {
            return true;
        }
        self.phrases().iter().any(|phrase| lower.contains(phrase))
    }
}

const IMPERATIVE_MARKERS: &[&str] = &[
    "please ",
    "need to ",
    "needs to ",
    "must ",
    "should ",
    "fix ",
    "add ",
    "remove ",
    "rename ",
    "handle ",
];

const APPROVAL_MARKERS: &[&str] = &[
    "approve",
    "lgtm",
    "looks good",
    "ship it",
    "no further changes",
    "no changes needed",
    "no issues found",
];

const REJECTION_MARKERS: &[&str] = &[
    "not approve",
    "cannot approve",
    "can't approve",
    "don't approve",
    "not yet approve",
    "request changes",
    "requesting changes",
    "changes requested",
];

/// Parse reviewer output. `candidate_commands` are tried in order when
/// mapping requests to commands, so configured commands should come first.
pub fn parse_review<S: AsRef<str>>(text: &str, candidate_commands: &[S]) -> ReviewFeedback {
    let mut requests: Vec<String> = Vec::new();
    let mut approval = false;
    let mut rejection = false;

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('{') || line.starts_with('#') {
            continue;
        }
        let lower = line.to_ascii_lowercase();
        let imperative = is_imperative(&lower);
        if REJECTION_MARKERS.iter().any(|marker| lower.contains(marker)) {
            rejection = true;
        } else if APPROVAL_MARKERS.iter().any(|marker| lower.contains(marker)) && !imperative {
            approval = true;
            continue;
        }

        let candidate = match list_item(line) {
            Some(item) => Some(item),
            None if imperative => Some(line),
            None => None,
        };
        if let Some(item) = candidate {
            let item = item.trim().to_string();
            if !item.is_empty() && !requests.contains(&item) {
                requests.push(item);
            }
        }
    }

    let commands_to_satisfy = map_commands(&requests, candidate_commands);
    ReviewFeedback {
        is_approved: approval && !rejection && requests.is_empty(),
        requests,
        commands_to_satisfy,
    }
}

/// Lowercase, punctuation-free, single-spaced form used for signatures.
pub fn normalize_request(request: &str) -> String {
    let cleaned: String = request
        .to_ascii_lowercase()
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '%' { ch } else { ' ' })
        .collect();
    let words: Vec<&str> = cleaned.split_whitespace().collect();
    let words = match words.first() {
        Some(&"please") => &words[1..],
        _ => &words[..],
    };
    words.join(" ")
}

/// Order-insensitive fingerprint of a round's requests.
pub fn request_signature<S: AsRef<str>>(requests: &[S]) -> String {
    let mut normalized: Vec<String> = requests
        .iter()
        .map(|request| normalize_request(request.as_ref()))
        .filter(|request| !request.is_empty())
        .collect();
    normalized.sort();
    normalized.dedup();
    normalized.join(" | ")
}

/// A loop is a repeated signature once the round budget is spent.
pub fn is_review_loop(
    review_rounds: u32,
    max_review_rounds: u32,
    signature: &str,
    previous_signature: Option<&str>,
) -> bool {
    review_rounds > max_review_rounds && previous_signature == Some(signature)
}

fn is_imperative(lower: &str) -> bool {
    IMPERATIVE_MARKERS
        .iter()
        .any(|marker| lower.starts_with(marker) || lower.contains(&format!(" {marker}")))
}

fn list_item(line: &str) -> Option<&str> {
    for bullet in ["- ", "* ", "+ ", "• "] {
        if let Some(rest) = line.strip_prefix(bullet) {
            return Some(rest);
        }
    }
    let digits = line.chars().take_while(|ch| ch.is_ascii_digit()).count();
    if digits == 0 {
        return None;
    }
    let rest = &line[digits..];
    rest.strip_prefix(". ")
        .or_else(|| rest.strip_prefix(") "))
        .or_else(|| rest.strip_prefix(": "))
}

fn mentions_percentage(lower: &str) -> bool {
    let bytes = lower.as_bytes();
    bytes
        .iter()
        .enumerate()
        .any(|(idx, byte)| *byte == b'%' && idx > 0 && bytes[idx - 1].is_ascii_digit())
}

fn map_commands<R: AsRef<str>, S: AsRef<str>>(requests: &[R], candidates: &[S]) -> Vec<String> {
    let mut commands: Vec<String> = Vec::new();
    for request in requests {
        let lower = request.as_ref().to_ascii_lowercase();
        for category in RequestCategory::ALL {
            if !category.matches(&lower) {
                continue;
            }
            let hit = candidates.iter().map(AsRef::as_ref).find(|command| {
                let command = command.to_ascii_lowercase();
                category
                    .command_keywords()
                    .iter()
                    .any(|keyword| command.contains(keyword))
            });
            if let Some(command) = hit {
                if !commands.iter().any(|existing| existing == command) {
                    commands.push(command.to_string());
                }
            }
        }
    }
    commands
}
