use orch_core::state::VerifyTier;
use std::path::Path;

/// Conventional commands for a tier, inferred from repository markers.
pub fn discover_verify_commands(repo_path: &Path, tier: VerifyTier) -> Vec<String> {
    let has_justfile = file_exists(repo_path, "Justfile") || file_exists(repo_path, "justfile");
    let has_cargo = file_exists(repo_path, "Cargo.toml");
    let has_node = file_exists(repo_path, "package.json");
    let has_python = file_exists(repo_path, "pyproject.toml")
        || file_exists(repo_path, "requirements.txt")
        || file_exists(repo_path, "requirements-dev.txt");

    let commands: &[&str] = if has_justfile {
        just_commands(tier)
    } else if has_cargo {
        rust_commands(tier)
    } else if has_node {
        node_commands(tier)
    } else if has_python {
        python_commands(tier)
    } else {
        &[]
    };
    commands.iter().map(|command| command.to_string()).collect()
}

pub fn resolve_verify_commands(
    repo_path: &Path,
    tier: VerifyTier,
    configured: &[String],
) -> Vec<String> {
    if !configured.is_empty() {
        return configured.to_vec();
    }
    discover_verify_commands(repo_path, tier)
}

fn just_commands(tier: VerifyTier) -> &'static [&'static str] {
    match tier {
        VerifyTier::Tier0 => &["just fmt", "just lint"],
        VerifyTier::Tier1 => &["just build"],
        VerifyTier::Tier2 => &["just test"],
    }
}

fn rust_commands(tier: VerifyTier) -> &'static [&'static str] {
    match tier {
        VerifyTier::Tier0 => &["cargo fmt --all -- --check"],
        VerifyTier::Tier1 => &["cargo clippy --workspace --all-targets -- -D warnings"],
        VerifyTier::Tier2 => &["cargo test --workspace"],
    }
}

fn node_commands(tier: VerifyTier) -> &'static [&'static str] {
    match tier {
        VerifyTier::Tier0 => &[
            "npm run format:check --if-present",
            "npm run lint --if-present",
        ],
        VerifyTier::Tier1 => &["npm run build --if-present"],
        VerifyTier::Tier2 => &["npm run test --if-present"],
    }
}

fn python_commands(tier: VerifyTier) -> &'static [&'static str] {
    match tier {
        VerifyTier::Tier0 => &["python -m ruff check ."],
        VerifyTier::Tier1 => &["python -m compileall -q ."],
        VerifyTier::Tier2 => &["python -m pytest -q"],
    }
}

fn file_exists(repo_path: &Path, name: &str) -> bool {
    repo_path.join(name).exists()
}

#[cfg(test)]
mod tests {
    use super::{discover_verify_commands, resolve_verify_commands};
    use orch_core::state::VerifyTier;
    use std::fs;
    use std::path::PathBuf;

    fn tmp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "relay-verify-discover-{}-{}",
            name,
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    #[test]
    fn prefers_justfile_when_present() {
        let dir = tmp_dir("just");
        fs::write(dir.join("Justfile"), "fmt:\n\t@echo fmt\n").expect("write justfile");
        fs::write(dir.join("Cargo.toml"), "[package]\nname='x'\n").expect("write cargo");

        assert_eq!(
            discover_verify_commands(&dir, VerifyTier::Tier0),
            vec!["just fmt".to_string(), "just lint".to_string()]
        );
        assert_eq!(
            discover_verify_commands(&dir, VerifyTier::Tier2),
            vec!["just test".to_string()]
        );
    }

    #[test]
    fn each_tier_of_a_cargo_repo_gets_its_own_commands() {
        let dir = tmp_dir("rust");
        fs::write(dir.join("Cargo.toml"), "[package]\nname='x'\n").expect("write cargo");

        let tier0 = discover_verify_commands(&dir, VerifyTier::Tier0);
        let tier1 = discover_verify_commands(&dir, VerifyTier::Tier1);
        let tier2 = discover_verify_commands(&dir, VerifyTier::Tier2);
        assert!(tier0[0].contains("cargo fmt"));
        assert!(tier1[0].contains("cargo clippy"));
        assert_eq!(tier2, vec!["cargo test --workspace".to_string()]);
    }

    #[test]
    fn unknown_repositories_have_no_commands() {
        let dir = tmp_dir("empty");
        assert!(discover_verify_commands(&dir, VerifyTier::Tier1).is_empty());
    }

    #[test]
    fn configured_commands_override_discovery() {
        let dir = tmp_dir("override");
        fs::write(dir.join("package.json"), "{}").expect("write package");

        let configured = vec!["make check".to_string()];
        let resolved = resolve_verify_commands(&dir, VerifyTier::Tier0, &configured);
        assert_eq!(resolved, configured);
    }
}
