//! Choosing how deep verification goes for a milestone.

use orch_core::config::RiskTrigger;
use orch_core::pattern::PatternSet;
use orch_core::state::VerifyTier;
use orch_core::types::RiskLevel;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierSelection {
    /// Highest tier to run; every lower tier runs first.
    pub tier: VerifyTier,
    pub reasons: Vec<String>,
}

impl TierSelection {
    pub fn tiers(&self) -> Vec<VerifyTier> {
        self.tier.up_to()
    }
}

/// Tier0 always; high risk lifts to tier1; a changed file matching a risk
/// trigger lifts to that trigger's tier.
pub fn select_tier<S: AsRef<str>>(
    risk: RiskLevel,
    changed_files: &[S],
    triggers: &[RiskTrigger],
) -> TierSelection {
    let mut tier = VerifyTier::Tier0;
    let mut reasons = vec!["baseline".to_string()];

    if risk == RiskLevel::High {
        tier = VerifyTier::Tier1;
        reasons.push("risk_level=high".to_string());
    }

    for trigger in triggers {
        let patterns = PatternSet::new(&trigger.patterns);
        let hit = changed_files
            .iter()
            .map(AsRef::as_ref)
            .find(|path| patterns.matches(path));
        if let Some(path) = hit {
            reasons.push(format!(
                "trigger {} ({}) matched {path}",
                trigger.name, trigger.tier
            ));
            tier = tier.max(trigger.tier);
        }
    }

    TierSelection { tier, reasons }
}
