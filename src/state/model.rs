use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum_macros::{Display, EnumString};

use crate::ids::{Id, Origin};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, Hash,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EntityType {
    Pc,
    Npc,
    Location,
    Item,
    Faction,
    ThreadRef,
}

/// A named thing in the world: common header plus a type-specific attribute
/// bag. Entities are never destroyed, only removed from the scene.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: Id,
    pub entity_type: EntityType,
    pub name: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub origin: Origin,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pack_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pack_entity_id: Option<Id>,
}

impl Entity {
    fn bag_strings(&self, key: &str) -> Vec<String> {
        self.attributes
            .get(key)
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// What an NPC can do. Empty means the definition is silent, which the
    /// resolver treats as "nothing beyond baseline".
    pub fn capabilities(&self) -> Vec<String> {
        self.bag_strings("capabilities")
    }

    /// What an NPC explicitly cannot do (e.g. `no_netrunning`).
    pub fn limitations(&self) -> Vec<String> {
        self.bag_strings("limitations")
    }

    pub fn equipment(&self) -> Vec<String> {
        self.bag_strings("equipment")
    }

    pub fn threat_level(&self) -> Option<String> {
        self.attributes
            .get("threat_level")
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// Soft -> hard -> lethal escalation cutoffs, if the NPC declares them.
    pub fn escalation_profile(&self) -> Option<Value> {
        self.attributes.get("escalation_profile").cloned()
    }

    /// Item policy flag: fixed items are never implicitly picked up on a
    /// successful search. Missing flag means portable.
    pub fn portable(&self) -> bool {
        self.attributes
            .get("portable")
            .and_then(Value::as_bool)
            .unwrap_or(true)
    }

    pub fn agenda(&self) -> Option<String> {
        self.attributes
            .get("agenda")
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, Hash,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Visibility {
    /// GM-only truth. Never surfaced to any LLM stage.
    World,
    Rumored,
    Known,
    Witnessed,
}

/// Subject-predicate-object triple about the world.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    pub id: Id,
    pub subject: Id,
    pub predicate: String,
    #[serde(default)]
    pub object: Value,
    pub visibility: Visibility,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovered_turn: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovery_method: Option<String>,
    pub origin: Origin,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pack_id: Option<String>,
}

fn default_confidence() -> f64 {
    1.0
}

/// A bounded tension/resource meter with threshold triggers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Clock {
    pub id: Id,
    pub name: String,
    pub value: i64,
    pub max: i64,
    #[serde(default)]
    pub triggers: BTreeMap<i64, String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub bidirectional: bool,
}

impl Clock {
    pub fn from_rule(rule: &crate::config::ClockRule) -> Self {
        Clock {
            id: Id::new(Origin::Campaign, &rule.name),
            name: rule.name.clone(),
            value: rule.start,
            max: rule.segments,
            triggers: rule.triggers.clone(),
            tags: rule.tags.clone(),
            bidirectional: rule.bidirectional,
        }
    }

    /// Trigger keys whose threshold sits strictly between the old and new
    /// value (inclusive of the new value), in crossing order.
    pub fn crossed_triggers(&self, old: i64, new: i64) -> Vec<(i64, String)> {
        let mut crossed: Vec<(i64, String)> = self
            .triggers
            .iter()
            .filter(|(threshold, _)| {
                let t = **threshold;
                if new >= old {
                    t > old && t <= new
                } else {
                    self.bidirectional && t < old && t >= new
                }
            })
            .map(|(t, key)| (*t, key.clone()))
            .collect();
        crossed.sort_by_key(|(t, _)| if new >= old { *t } else { -*t });
        crossed
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SceneVisibility {
    #[default]
    Normal,
    Dim,
    Dark,
}

/// The current setting. Exactly one per campaign; replaced atomically by a
/// scene-transition diff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scene {
    pub location: Id,
    /// Ordered: the narrator addresses entities in presentation order.
    #[serde(default)]
    pub present: Vec<Id>,
    #[serde(default)]
    pub time: Map<String, Value>,
    #[serde(default)]
    pub constraints: Map<String, Value>,
    #[serde(default)]
    pub visibility: SceneVisibility,
    #[serde(default)]
    pub noise: String,
    #[serde(default)]
    pub obscured: Vec<Id>,
}

impl Scene {
    /// Adjacent locations the scene constraints declare reachable without a
    /// transition.
    pub fn adjacent_locations(&self) -> Vec<Id> {
        self.constraints
            .get("adjacent")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .map(Id::from)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, Hash,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ThreadStatus {
    Open,
    Advancing,
    Resolved,
    Failed,
}

/// A tracked plot line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: Id,
    pub title: String,
    pub status: ThreadStatus,
    #[serde(default)]
    pub stakes: Map<String, Value>,
    #[serde(default)]
    pub related: Vec<Id>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub origin: Origin,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pack_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryEntry {
    pub owner: Id,
    pub item: Id,
    pub quantity: i64,
    #[serde(default)]
    pub flags: Vec<String>,
}

impl InventoryEntry {
    pub fn usable(&self) -> bool {
        !self
            .flags
            .iter()
            .any(|f| f == "broken" || f == "consumed")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub from: Id,
    pub to: Id,
    pub rel_type: String,
    pub intensity: i64,
    #[serde(default)]
    pub notes: String,
}

/// Per-(subject, action-category) consecutive failure counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureStreak {
    pub subject: Id,
    pub category: String,
    pub count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub scope: String,
    pub scope_id: String,
    pub turn_start: u64,
    pub turn_end: u64,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<String>,
    pub turn_start: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_end: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recap: Option<String>,
}

/// Typed record emitted by the resolver. Forcing input to the narrator: the
/// prose must reflect every one of these.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    ActionSucceeded {
        action: String,
        subject: Id,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<Id>,
        outcome: String,
    },
    ActionFailed {
        action: String,
        subject: Id,
        /// What didn't work, for the narrator to render in-fiction.
        failure_state: String,
    },
    ActionBotched {
        action: String,
        subject: Id,
        failure_state: String,
    },
    CostApplied {
        clock: String,
        delta: i64,
    },
    ClockTriggered {
        clock: String,
        threshold: i64,
        trigger: String,
        terminal: bool,
    },
    SituationFactWritten {
        subject: Id,
        predicate: String,
    },
    NpcAction {
        npc: Id,
        kind: NpcActionKind,
        description: String,
    },
    ThreatResolved {
        subject: Id,
        situation: String,
        resolution: String,
    },
    ItemDiscovered {
        item: Id,
        source: Id,
        picked_up: bool,
    },
    RelationshipDelta {
        from: Id,
        to: Id,
        rel_type: String,
        delta: i64,
    },
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum NpcActionKind {
    Reactive,
    Ongoing,
}

/// One append-only record per accepted turn. Self-sufficient for replay:
/// every pass output and the applied diff are stored verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub turn: u64,
    pub player_input: String,
    pub context_packet: Value,
    pub interpreter: Value,
    pub validator: Value,
    pub planner: Value,
    pub resolver: Value,
    pub narrator: Value,
    pub engine_events: Vec<EngineEvent>,
    pub diff: crate::state::diff::StateDiff,
    pub final_text: String,
    pub prompt_versions: BTreeMap<String, String>,
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock_with_trigger() -> Clock {
        Clock {
            id: Id::from("campaign:time"),
            name: "time".into(),
            value: 11,
            max: 12,
            triggers: BTreeMap::from([(12, "deadline_passed".to_string())]),
            tags: vec![],
            bidirectional: false,
        }
    }

    #[test]
    fn crossing_a_threshold_upward_reports_the_trigger() {
        let clock = clock_with_trigger();
        let crossed = clock.crossed_triggers(11, 12);
        assert_eq!(crossed, vec![(12, "deadline_passed".to_string())]);
    }

    #[test]
    fn one_way_clocks_do_not_retrigger_downward() {
        let clock = clock_with_trigger();
        assert!(clock.crossed_triggers(12, 10).is_empty());
    }

    #[test]
    fn bidirectional_clocks_trigger_in_both_directions() {
        let mut clock = clock_with_trigger();
        clock.bidirectional = true;
        clock.triggers.insert(3, "reputation_low".to_string());
        let crossed = clock.crossed_triggers(4, 2);
        assert_eq!(crossed, vec![(3, "reputation_low".to_string())]);
    }

    #[test]
    fn fixed_items_are_not_portable() {
        let mut entity = Entity {
            id: Id::from("pack:vault_door"),
            entity_type: EntityType::Item,
            name: "Vault door".into(),
            attributes: Map::new(),
            tags: vec![],
            origin: Origin::Pack,
            pack_id: Some("core".into()),
            pack_entity_id: None,
        };
        assert!(entity.portable());
        entity
            .attributes
            .insert("portable".into(), Value::Bool(false));
        assert!(!entity.portable());
    }
}
