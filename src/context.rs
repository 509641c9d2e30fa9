use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{Calibration, EngineSettings};
use crate::error::Result;
use crate::ids::Id;
use crate::lore::estimate_tokens;
use crate::lore::scene_cache::SceneLore;
use crate::state::model::{Clock, Entity, EntityType, Fact, Scene, ThreadStatus, Visibility};
use crate::state::Store;

/// Tag the resolver puts on every situation fact it writes.
pub const SITUATION_TAG: &str = "situation";
/// Tag marking a fact as an active threat against its object.
pub const THREAT_TAG: &str = "threat";
/// Predicate the resolver writes after a successful search.
pub const INVESTIGATED_PREDICATE: &str = "investigated_by_player";

/// Everything an LLM stage is allowed to see for one turn. Assembled
/// deterministically: same projections, same lore bundle, same packet.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContextPacket {
    pub player_character: Option<EntityView>,
    pub scene: Option<SceneView>,
    pub present_entities: Vec<EntityView>,
    pub known_facts: Vec<FactView>,
    pub threads: Vec<ThreadView>,
    pub main_thread_goal: Option<String>,
    pub clocks: Vec<ClockView>,
    pub inventory: Vec<InventoryView>,
    pub relationships: Vec<String>,
    pub summary: Option<String>,
    pub recent_events: Vec<RecentEvent>,
    pub npc_agendas: BTreeMap<String, String>,
    pub npc_capabilities: BTreeMap<String, CapabilityView>,
    pub investigated: Vec<String>,
    pub pending_threats: Vec<String>,
    pub active_situations: Vec<FactView>,
    pub failure_streaks: Vec<StreakView>,
    pub calibration: Calibration,
    pub lore: LoreView,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityView {
    pub id: Id,
    pub entity_type: EntityType,
    pub name: String,
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threat_level: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneView {
    pub location: Id,
    pub location_name: String,
    pub time: serde_json::Map<String, Value>,
    pub constraints: serde_json::Map<String, Value>,
    pub visibility: String,
    pub noise: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactView {
    pub id: Id,
    pub subject: Id,
    pub predicate: String,
    pub object: Value,
    pub visibility: Visibility,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadView {
    pub id: Id,
    pub title: String,
    pub status: ThreadStatus,
    pub stakes: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClockView {
    pub name: String,
    pub value: i64,
    pub max: i64,
    /// True when the clock sits at or past any trigger threshold.
    pub triggered: bool,
    pub active_triggers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryView {
    pub item: Id,
    pub name: String,
    pub quantity: i64,
    pub flags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityView {
    pub capabilities: Vec<String>,
    pub limitations: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreakView {
    pub subject: Id,
    pub category: String,
    pub count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentEvent {
    pub turn: u64,
    pub player_input: String,
    pub final_text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoreView {
    pub atmosphere: Vec<String>,
    pub npc_briefings: BTreeMap<String, crate::lore::scene_cache::NpcBriefing>,
    pub thread_connections: BTreeMap<String, String>,
}

impl ContextPacket {
    pub fn token_estimate(&self) -> usize {
        estimate_tokens(&serde_json::to_string(self).unwrap_or_default())
    }

    pub fn entity_present(&self, id: &Id) -> bool {
        self.present_entities.iter().any(|e| &e.id == id)
    }

    pub fn knows_entity(&self, id: &Id) -> bool {
        self.entity_present(id)
            || self
                .player_character
                .as_ref()
                .map(|pc| &pc.id == id)
                .unwrap_or(false)
            || self.known_facts.iter().any(|f| &f.subject == id)
            || self.inventory.iter().any(|i| &i.item == id)
    }
}

/// Build the packet for the coming turn. The perception filter runs at
/// section build time: `world` facts, obscured entities and facts about
/// obscured subjects never enter any section.
pub fn build_context(
    store: &Store,
    lore: &SceneLore,
    calibration: &Calibration,
    settings: &EngineSettings,
) -> Result<ContextPacket> {
    let entities = store.entities()?;
    let facts = store.facts()?;
    let threads = store.threads()?;
    let clocks = store.clocks()?;
    let scene = store.scene()?;
    let streaks = store.failure_streaks()?;

    let obscured: Vec<Id> = scene
        .as_ref()
        .map(|s| s.obscured.clone())
        .unwrap_or_default();
    let perceivable_fact = |fact: &Fact| {
        fact.visibility != Visibility::World && !obscured.contains(&fact.subject)
    };

    let pc = entities.iter().find(|e| e.entity_type == EntityType::Pc);
    let pc_id = pc.map(|e| e.id.clone());

    let mut packet = ContextPacket {
        calibration: calibration.clone(),
        ..Default::default()
    };

    packet.player_character = pc.map(entity_view);

    if let Some(scene) = &scene {
        packet.scene = Some(scene_view(scene, &entities));
        packet.present_entities = scene
            .present
            .iter()
            .filter(|id| !obscured.contains(id))
            .filter_map(|id| entities.iter().find(|e| &e.id == id))
            .map(entity_view)
            .collect();
    }

    packet.known_facts = facts
        .iter()
        .filter(|f| perceivable_fact(f))
        .filter(|f| !f.tags.iter().any(|t| t == SITUATION_TAG))
        .map(fact_view)
        .collect();

    packet.threads = threads
        .iter()
        .filter(|t| matches!(t.status, ThreadStatus::Open | ThreadStatus::Advancing))
        .map(|t| ThreadView {
            id: t.id.clone(),
            title: t.title.clone(),
            status: t.status,
            stakes: t.stakes.clone(),
        })
        .collect();
    packet.main_thread_goal = threads
        .iter()
        .find(|t| matches!(t.status, ThreadStatus::Open | ThreadStatus::Advancing))
        .map(|t| t.title.clone());

    packet.clocks = clocks.iter().map(clock_view).collect();

    if let Some(pc_id) = &pc_id {
        packet.inventory = store
            .inventory_for(pc_id)?
            .into_iter()
            .map(|entry| {
                let name = entities
                    .iter()
                    .find(|e| e.id == entry.item)
                    .map(|e| e.name.clone())
                    .unwrap_or_else(|| entry.item.local().to_string());
                InventoryView {
                    item: entry.item,
                    name,
                    quantity: entry.quantity,
                    flags: entry.flags,
                }
            })
            .collect();
    }

    packet.relationships = store
        .relationships()?
        .into_iter()
        .filter(|r| !obscured.contains(&r.from) && !obscured.contains(&r.to))
        .map(|r| format!("{} -[{} {}]-> {}", r.from, r.rel_type, r.intensity, r.to))
        .collect();

    if let Some(scene) = &scene {
        packet.summary = store
            .summary("scene", scene.location.as_str())?
            .map(|s| s.text);
    }

    let last_turn = store.last_turn()?;
    let window = settings.recent_events as u64;
    let first = last_turn.saturating_sub(window.saturating_sub(1)).max(1);
    if last_turn > 0 {
        packet.recent_events = store
            .events_in_range(first, last_turn)?
            .into_iter()
            .map(|record| RecentEvent {
                turn: record.turn,
                player_input: record.player_input,
                final_text: record.final_text,
            })
            .collect();
    }

    for entity in entities
        .iter()
        .filter(|e| e.entity_type == EntityType::Npc)
        .filter(|e| {
            scene
                .as_ref()
                .map(|s| s.present.contains(&e.id) && !obscured.contains(&e.id))
                .unwrap_or(false)
        })
    {
        if let Some(agenda) = entity.agenda() {
            packet
                .npc_agendas
                .insert(entity.id.as_str().to_string(), agenda);
        }
        packet.npc_capabilities.insert(
            entity.id.as_str().to_string(),
            CapabilityView {
                capabilities: entity.capabilities(),
                limitations: entity.limitations(),
            },
        );
    }

    packet.investigated = facts
        .iter()
        .filter(|f| f.predicate == INVESTIGATED_PREDICATE)
        .map(|f| f.subject.as_str().to_string())
        .collect();

    packet.pending_threats = facts
        .iter()
        .filter(|f| perceivable_fact(f))
        .filter(|f| f.tags.iter().any(|t| t == THREAT_TAG))
        .map(|f| format!("{} {}", f.subject, f.predicate))
        .collect();

    packet.active_situations = facts
        .iter()
        .filter(|f| f.tags.iter().any(|t| t == SITUATION_TAG))
        .filter(|f| perceivable_fact(f))
        .map(fact_view)
        .collect();

    packet.failure_streaks = streaks
        .into_iter()
        .map(|s| StreakView {
            subject: s.subject,
            category: s.category,
            count: s.count,
        })
        .collect();

    packet.lore = LoreView {
        atmosphere: lore.atmosphere.clone(),
        npc_briefings: lore
            .npc_briefings
            .iter()
            .filter(|(id, _)| !obscured.iter().any(|o| o.as_str() == id.as_str()))
            .map(|(id, b)| (id.clone(), b.clone()))
            .collect(),
        thread_connections: lore.thread_connections.clone(),
    };

    truncate_to_budget(&mut packet, settings.context_token_budget);
    Ok(packet)
}

/// Background sections go first, important sections shrink next; the
/// essential tier (PC identity, main-thread goal, active situations,
/// triggered clocks, calibration) is never touched.
fn truncate_to_budget(packet: &mut ContextPacket, budget: usize) {
    if packet.token_estimate() <= budget {
        return;
    }
    packet.summary = None;

    if packet.token_estimate() > budget {
        // Distant threads: keep only threads tied to the current scene's
        // main goal.
        packet.threads.truncate(3);
    }
    if packet.token_estimate() > budget {
        packet.lore.atmosphere.truncate(1);
    }
    if packet.token_estimate() > budget {
        for briefing in packet.lore.npc_briefings.values_mut() {
            briefing.knows.truncate(3);
            briefing.withholds.truncate(2);
        }
    }
    while packet.token_estimate() > budget && packet.recent_events.len() > 1 {
        packet.recent_events.remove(0);
    }
    if packet.token_estimate() > budget {
        // Keep only facts about whoever is in the scene.
        let present: Vec<Id> = packet.present_entities.iter().map(|e| e.id.clone()).collect();
        packet
            .known_facts
            .retain(|f| present.contains(&f.subject));
    }
    while packet.token_estimate() > budget && !packet.known_facts.is_empty() {
        packet.known_facts.pop();
    }
    while packet.token_estimate() > budget && !packet.lore.atmosphere.is_empty() {
        packet.lore.atmosphere.pop();
    }
}

fn entity_view(entity: &Entity) -> EntityView {
    EntityView {
        id: entity.id.clone(),
        entity_type: entity.entity_type,
        name: entity.name.clone(),
        tags: entity.tags.clone(),
        threat_level: entity.threat_level(),
    }
}

fn fact_view(fact: &Fact) -> FactView {
    FactView {
        id: fact.id.clone(),
        subject: fact.subject.clone(),
        predicate: fact.predicate.clone(),
        object: fact.object.clone(),
        visibility: fact.visibility,
    }
}

fn scene_view(scene: &Scene, entities: &[Entity]) -> SceneView {
    SceneView {
        location: scene.location.clone(),
        location_name: entities
            .iter()
            .find(|e| e.id == scene.location)
            .map(|e| e.name.clone())
            .unwrap_or_else(|| scene.location.local().to_string()),
        time: scene.time.clone(),
        constraints: scene.constraints.clone(),
        visibility: scene.visibility.to_string(),
        noise: scene.noise.clone(),
    }
}

fn clock_view(clock: &Clock) -> ClockView {
    let active: Vec<String> = clock
        .triggers
        .iter()
        .filter(|(threshold, _)| **threshold <= clock.value)
        .map(|(_, key)| key.clone())
        .collect();
    ClockView {
        name: clock.name.clone(),
        value: clock.value,
        max: clock.max,
        triggered: !active.is_empty(),
        active_triggers: active,
    }
}
