use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentSignalKind {
    NeedsHuman,
    PatchReady,
}

/// Plain-text markers workers print when they cannot emit a JSON result.
pub fn detect_common_signal(line: &str) -> Option<AgentSignalKind> {
    let lower = line.to_ascii_lowercase();
    if lower.contains("[needs_human]") || lower.contains("[need_human]") {
        Some(AgentSignalKind::NeedsHuman)
    } else if lower.contains("[patch_ready]") {
        Some(AgentSignalKind::PatchReady)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_bracketed_markers_case_insensitively() {
        assert_eq!(
            detect_common_signal("status: [NEEDS_HUMAN] which db?"),
            Some(AgentSignalKind::NeedsHuman)
        );
        assert_eq!(
            detect_common_signal("[patch_ready]"),
            Some(AgentSignalKind::PatchReady)
        );
        assert_eq!(detect_common_signal("patch ready soon"), None);
    }
}
