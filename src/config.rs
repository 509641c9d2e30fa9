use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::error::Result;

/// The `system:` block of a scenario. Everything the resolver dispatches on
/// lives here; the engine itself has no opinion about which clocks exist or
/// what an action costs.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SystemConfig {
    #[serde(default)]
    pub clock_rules: Vec<ClockRule>,
    #[serde(default)]
    pub resolution_rules: ResolutionRules,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClockRule {
    pub name: String,
    pub segments: i64,
    #[serde(default)]
    pub start: i64,
    /// Threshold value -> narrative consequence key.
    #[serde(default)]
    pub triggers: BTreeMap<i64, String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Bidirectional clocks (reputation) may tick down past earlier
    /// thresholds; strict-count clocks only ever move one way.
    #[serde(default)]
    pub bidirectional: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResolutionRules {
    #[serde(default)]
    pub resolution: ResolutionSpec,
    #[serde(default)]
    pub stat_schema: StatSchema,
    /// Action verb -> (attribute, ability) used to size a dice pool.
    /// `_default` is the fallback row.
    #[serde(default)]
    pub action_stat_map: HashMap<String, ActionStat>,
    /// Action category -> clock cost vector. Missing category means zero
    /// cost; physical-local categories should be listed with an empty map.
    #[serde(default)]
    pub action_costs: HashMap<String, CostVector>,
    /// Action category -> context danger, `_default` fallback.
    #[serde(default)]
    pub danger: HashMap<String, DangerLevel>,
    /// Closed list of consequence types the resolver may emit.
    #[serde(default)]
    pub consequences: Vec<String>,
    #[serde(default = "default_streak_threshold")]
    pub failure_streak_threshold: u32,
}

fn default_streak_threshold() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionSpec {
    pub method: ResolutionMethod,
    #[serde(default = "default_die")]
    pub die: u8,
    #[serde(default = "default_difficulty")]
    pub difficulty: u8,
    #[serde(default)]
    pub ones_cancel_successes: bool,
    #[serde(default)]
    pub thresholds: PoolThresholds,
}

fn default_die() -> u8 {
    10
}

fn default_difficulty() -> u8 {
    6
}

impl Default for ResolutionSpec {
    fn default() -> Self {
        ResolutionSpec {
            method: ResolutionMethod::TwoD6Bands,
            die: default_die(),
            difficulty: default_difficulty(),
            ones_cancel_successes: false,
            thresholds: PoolThresholds::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionMethod {
    #[serde(rename = "2d6_bands")]
    TwoD6Bands,
    #[serde(rename = "dice_pool")]
    DicePool,
}

/// Net-success cutoffs for the dice-pool method. Below `mixed` is a plain
/// failure; `critical` and above is a critical.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PoolThresholds {
    pub mixed: u32,
    pub success: u32,
    pub critical: u32,
}

impl Default for PoolThresholds {
    fn default() -> Self {
        PoolThresholds {
            mixed: 1,
            success: 2,
            critical: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StatSchema {
    #[serde(default)]
    pub attributes: Vec<String>,
    #[serde(default)]
    pub abilities: Vec<String>,
    #[serde(default)]
    pub special: Vec<SpecialTrait>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecialTrait {
    pub name: String,
    pub min: i64,
    pub max: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionStat {
    pub attribute: String,
    pub ability: String,
}

/// Clock name -> signed delta, applied on attempt rather than on success.
pub type CostVector = BTreeMap<String, i64>;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DangerLevel {
    Safe,
    Risky,
    Dangerous,
}

impl Default for DangerLevel {
    fn default() -> Self {
        DangerLevel::Safe
    }
}

impl ResolutionRules {
    pub fn stat_for_action(&self, verb: &str) -> Option<&ActionStat> {
        self.action_stat_map
            .get(verb)
            .or_else(|| self.action_stat_map.get("_default"))
    }

    pub fn cost_for_category(&self, category: &str) -> CostVector {
        self.action_costs.get(category).cloned().unwrap_or_default()
    }

    pub fn danger_for_category(&self, category: &str) -> DangerLevel {
        self.danger
            .get(category)
            .or_else(|| self.danger.get("_default"))
            .copied()
            .unwrap_or_default()
    }
}

/// Scenario calibration knobs, echoed verbatim into every context packet.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Calibration {
    #[serde(default)]
    pub tone: String,
    #[serde(default)]
    pub themes: Vec<String>,
    #[serde(default)]
    pub risk: String,
}

/// Ambient engine settings with workable defaults. These are process
/// configuration, not campaign state; a `fateloom.yaml` next to the campaign
/// database overrides them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_context_budget")]
    pub context_token_budget: usize,
    #[serde(default = "default_lore_budget")]
    pub lore_token_budget: usize,
    #[serde(default = "default_recent_events")]
    pub recent_events: usize,
    #[serde(default = "default_gateway_attempts")]
    pub gateway_attempts: u32,
    #[serde(default = "default_gateway_timeout")]
    pub gateway_timeout_secs: u64,
    /// Build the sqlite-vec store at pack install and rank by similarity at
    /// query time. FTS-only retrieval when false.
    #[serde(default)]
    pub embeddings: bool,
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_context_budget() -> usize {
    8000
}

fn default_lore_budget() -> usize {
    3000
}

fn default_recent_events() -> usize {
    5
}

fn default_gateway_attempts() -> u32 {
    3
}

fn default_gateway_timeout() -> u64 {
    120
}

impl Default for EngineSettings {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty settings always deserialize")
    }
}

impl EngineSettings {
    /// Load overrides from `fateloom.yaml` when present, otherwise defaults.
    pub fn load_from_dir(dir: &std::path::Path) -> Result<Self> {
        let path = dir.join("fateloom.yaml");
        if path.exists() {
            let data = std::fs::read_to_string(&path)?;
            Ok(serde_yaml::from_str(&data)?)
        } else {
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_defaults_to_2d6_bands() {
        let rules: ResolutionRules = serde_yaml::from_str("{}").unwrap();
        assert_eq!(rules.resolution.method, ResolutionMethod::TwoD6Bands);
        assert_eq!(rules.failure_streak_threshold, 3);
    }

    #[test]
    fn action_stat_map_falls_back_to_default_row() {
        let yaml = r#"
action_stat_map:
  _default: { attribute: wits, ability: streetwise }
  fight: { attribute: body, ability: brawl }
"#;
        let rules: ResolutionRules = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(rules.stat_for_action("fight").unwrap().ability, "brawl");
        assert_eq!(
            rules.stat_for_action("sneak").unwrap().ability,
            "streetwise"
        );
    }

    #[test]
    fn danger_map_defaults_to_safe() {
        let yaml = r#"
danger:
  infiltrate: risky
  assault: dangerous
"#;
        let rules: ResolutionRules = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(rules.danger_for_category("assault"), DangerLevel::Dangerous);
        assert_eq!(rules.danger_for_category("chat"), DangerLevel::Safe);
    }
}
