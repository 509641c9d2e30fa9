use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::Id;
use crate::state::model::{Clock, Entity, Fact, Scene, Thread, ThreadStatus, Visibility};

/// Declarative mutation bundle. The store applies a diff transactionally
/// together with its event record: everything commits or nothing does.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StateDiff {
    /// Clock name -> signed delta.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub clock_deltas: BTreeMap<String, i64>,
    /// New clocks, created whole. Scenario seeding only; play turns never
    /// mint clocks.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clocks_to_add: Vec<Clock>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities_to_add: Vec<Entity>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub facts_to_add: Vec<Fact>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fact_updates: Vec<FactUpdate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inventory_deltas: Vec<InventoryDelta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scene_replacement: Option<Scene>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub threads_to_add: Vec<Thread>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub thread_updates: Vec<ThreadUpdate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relationship_updates: Vec<RelationshipUpdate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub streak_updates: Vec<StreakUpdate>,
}

impl StateDiff {
    pub fn is_empty(&self) -> bool {
        self.clock_deltas.is_empty()
            && self.clocks_to_add.is_empty()
            && self.entities_to_add.is_empty()
            && self.facts_to_add.is_empty()
            && self.fact_updates.is_empty()
            && self.inventory_deltas.is_empty()
            && self.scene_replacement.is_none()
            && self.threads_to_add.is_empty()
            && self.thread_updates.is_empty()
            && self.relationship_updates.is_empty()
            && self.streak_updates.is_empty()
    }

    /// Fold another diff into this one. Later scene replacements win; clock
    /// deltas accumulate.
    pub fn merge(&mut self, other: StateDiff) {
        for (clock, delta) in other.clock_deltas {
            *self.clock_deltas.entry(clock).or_insert(0) += delta;
        }
        self.clocks_to_add.extend(other.clocks_to_add);
        self.entities_to_add.extend(other.entities_to_add);
        self.facts_to_add.extend(other.facts_to_add);
        self.fact_updates.extend(other.fact_updates);
        self.inventory_deltas.extend(other.inventory_deltas);
        if other.scene_replacement.is_some() {
            self.scene_replacement = other.scene_replacement;
        }
        self.threads_to_add.extend(other.threads_to_add);
        self.thread_updates.extend(other.thread_updates);
        self.relationship_updates.extend(other.relationship_updates);
        self.streak_updates.extend(other.streak_updates);
    }
}

/// Partial update against an existing fact; `None` fields are untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactUpdate {
    pub id: Id,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<Visibility>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovered_turn: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovery_method: Option<String>,
    /// Remove the fact outright (a cleared situation fact).
    #[serde(default)]
    pub retract: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryDelta {
    pub owner: Id,
    pub item: Id,
    pub delta: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub add_flags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove_flags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadUpdate {
    pub id: Id,
    pub status: ThreadStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipUpdate {
    pub from: Id,
    pub to: Id,
    pub rel_type: String,
    pub intensity_delta: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreakUpdate {
    pub subject: Id,
    pub category: String,
    pub op: StreakOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreakOp {
    Increment,
    Reset,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_accumulates_clock_deltas() {
        let mut a = StateDiff::default();
        a.clock_deltas.insert("heat".into(), 1);
        let mut b = StateDiff::default();
        b.clock_deltas.insert("heat".into(), 2);
        b.clock_deltas.insert("time".into(), 1);
        a.merge(b);
        assert_eq!(a.clock_deltas["heat"], 3);
        assert_eq!(a.clock_deltas["time"], 1);
    }

    #[test]
    fn empty_diff_reports_empty() {
        assert!(StateDiff::default().is_empty());
    }
}
