//! Stage-name to execution-tier resolution.
//!
//! Maps each stage of the workflow to a coarse execution-cost tier
//! (light/standard/advanced), which the executor profile turns into a
//! model argument. Resolution is a longest-prefix-first scan over a
//! static table, with an optional complexity hint (S/M/L) that overrides
//! the stage default in either direction. Unknown names fall back to the
//! most capable tier rather than the cheapest.

use serde::{Deserialize, Serialize};

/// Execution-cost tier, ordered cheapest to most capable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Light,
    Standard,
    Advanced,
}

/// Unknown stages get the most capable tier. Failing toward quality costs
/// money; failing toward the cheap tier costs a broken stage.
pub const FALLBACK_TIER: Tier = Tier::Advanced;

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Light => write!(f, "light"),
            Tier::Standard => write!(f, "standard"),
            Tier::Advanced => write!(f, "advanced"),
        }
    }
}

impl std::str::FromStr for Tier {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "light" => Ok(Tier::Light),
            "standard" => Ok(Tier::Standard),
            "advanced" => Ok(Tier::Advanced),
            _ => anyhow::bail!("Invalid tier '{}'. Valid values: light, standard, advanced", s),
        }
    }
}

/// Stage-prefix defaults. Declaration order is not load-bearing; the
/// resolver re-sorts longest-first so `spec-review` always wins over
/// `review` for names like `spec-review-iter-1`.
const STAGE_TIERS: &[(&str, Tier)] = &[
    ("setup", Tier::Light),
    ("research", Tier::Standard),
    ("evaluate", Tier::Advanced),
    ("plan", Tier::Advanced),
    ("implement", Tier::Standard),
    ("review", Tier::Standard),
    ("spec-review", Tier::Advanced),
    ("pr-review", Tier::Advanced),
    ("test", Tier::Standard),
    ("test-fix", Tier::Standard),
    ("fix", Tier::Standard),
    ("docs", Tier::Light),
    ("publish", Tier::Light),
];

/// Longest-prefix-first resolver from stage name (plus optional hint)
/// to execution tier.
#[derive(Debug, Clone)]
pub struct TierResolver {
    /// (prefix, tier), sorted by descending prefix length.
    table: Vec<(&'static str, Tier)>,
}

impl Default for TierResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl TierResolver {
    pub fn new() -> Self {
        let mut table: Vec<(&'static str, Tier)> = STAGE_TIERS.to_vec();
        table.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Self { table }
    }

    /// Resolve a stage name and optional complexity hint to a tier.
    ///
    /// A recognized hint (`S`/`M`/`L`, exact case) overrides the stage
    /// default, upgrading or downgrading alike. Unrecognized hints are
    /// silently ignored so callers can pass whatever the planner emitted
    /// without guarding it. No prefix match and no hint yields
    /// [`FALLBACK_TIER`].
    pub fn resolve(&self, stage_name: &str, complexity_hint: &str) -> Tier {
        if let Some(tier) = hint_tier(complexity_hint) {
            return tier;
        }
        self.lookup(stage_name)
            .map(|(_, tier)| tier)
            .unwrap_or(FALLBACK_TIER)
    }

    /// Find the longest table prefix matching `stage_name`. A prefix
    /// matches only when the name equals it or continues with `-` right
    /// after it; `impl` matches nothing, `review-2` matches `review`.
    pub fn lookup(&self, stage_name: &str) -> Option<(&'static str, Tier)> {
        self.table
            .iter()
            .find(|(prefix, _)| prefix_matches(stage_name, prefix))
            .copied()
    }
}

fn prefix_matches(stage_name: &str, prefix: &str) -> bool {
    match stage_name.strip_prefix(prefix) {
        Some("") => true,
        Some(rest) => rest.starts_with('-'),
        None => false,
    }
}

/// Map a complexity hint to its tier. The set is closed and exact-case;
/// anything else (lowercase, numbers, empty) is not a hint.
fn hint_tier(hint: &str) -> Option<Tier> {
    match hint {
        "S" => Some(Tier::Light),
        "M" => Some(Tier::Standard),
        "L" => Some(Tier::Advanced),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_longest_prefix_wins() {
        let resolver = TierResolver::new();
        // spec-review, not the shorter review, must claim this name
        let (prefix, tier) = resolver.lookup("spec-review-iter-1").unwrap();
        assert_eq!(prefix, "spec-review");
        assert_eq!(tier, Tier::Advanced);
        assert_eq!(resolver.resolve("spec-review-iter-1", ""), Tier::Advanced);
    }

    #[test]
    fn test_exact_name_matches() {
        let resolver = TierResolver::new();
        assert_eq!(resolver.resolve("implement", ""), Tier::Standard);
        assert_eq!(resolver.resolve("docs", ""), Tier::Light);
        assert_eq!(resolver.resolve("evaluate", ""), Tier::Advanced);
    }

    #[test]
    fn test_prefix_requires_dash_boundary() {
        let resolver = TierResolver::new();
        // review-2 continues with '-', so it matches review
        assert_eq!(resolver.lookup("review-2").unwrap().0, "review");
        // testing shares letters with test but has no boundary
        assert!(resolver.lookup("testing").is_none());
        assert_eq!(resolver.resolve("testing", ""), Tier::Advanced);
    }

    #[test]
    fn test_no_partial_substring_matching() {
        let resolver = TierResolver::new();
        // impl is a prefix of implement, not the other way round
        assert!(resolver.lookup("impl").is_none());
        assert_eq!(resolver.resolve("impl", ""), FALLBACK_TIER);
    }

    #[test]
    fn test_hint_overrides_stage_default_both_directions() {
        let resolver = TierResolver::new();
        // downgrade: implement defaults to Standard
        assert_eq!(resolver.resolve("implement", "S"), Tier::Light);
        // upgrade: docs defaults to Light
        assert_eq!(resolver.resolve("docs", "L"), Tier::Advanced);
        assert_eq!(resolver.resolve("plan", "M"), Tier::Standard);
    }

    #[test]
    fn test_hint_applies_even_without_prefix_match() {
        let resolver = TierResolver::new();
        assert_eq!(resolver.resolve("mystery-stage", "M"), Tier::Standard);
    }

    #[test]
    fn test_unrecognized_hints_are_ignored() {
        let resolver = TierResolver::new();
        assert_eq!(resolver.resolve("implement", "s"), Tier::Standard);
        assert_eq!(resolver.resolve("implement", "XL"), Tier::Standard);
        assert_eq!(resolver.resolve("implement", "2"), Tier::Standard);
        assert_eq!(resolver.resolve("implement", ""), Tier::Standard);
    }

    #[test]
    fn test_test_fix_wins_over_test() {
        let resolver = TierResolver::new();
        assert_eq!(resolver.lookup("test-fix-round-3").unwrap().0, "test-fix");
        assert_eq!(resolver.lookup("test-suite").unwrap().0, "test");
    }

    #[test]
    fn test_tier_ordering() {
        assert!(Tier::Light < Tier::Standard);
        assert!(Tier::Standard < Tier::Advanced);
    }

    #[test]
    fn test_tier_from_str() {
        assert_eq!("light".parse::<Tier>().unwrap(), Tier::Light);
        assert_eq!("ADVANCED".parse::<Tier>().unwrap(), Tier::Advanced);
        assert!("opus".parse::<Tier>().is_err());
    }
}
