use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::{Calibration, SystemConfig};
use crate::error::{Result, ScenarioError};
use crate::ids::{Id, Origin};
use crate::lore::index::LoreIndex;
use crate::state::diff::{InventoryDelta, StateDiff};
use crate::state::model::{
    Clock, Entity, EntityType, EventRecord, Fact, Scene, SceneVisibility, Thread, ThreadStatus,
    Visibility,
};
use crate::state::{CampaignRow, Store};

/// A scenario definition file. Pack-namespaced ids are copied into campaign
/// state with `origin: pack` and a `pack_entity_id` back-reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub packs: Vec<String>,
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub calibration: Calibration,
    /// Named calibration overrides selectable with `--preset`.
    #[serde(default)]
    pub presets: BTreeMap<String, Calibration>,
    #[serde(default)]
    pub entities: Vec<ScenarioEntity>,
    #[serde(default)]
    pub facts: Vec<ScenarioFact>,
    #[serde(default)]
    pub threads: Vec<ScenarioThread>,
    pub scene: ScenarioScene,
    #[serde(default)]
    pub inventory: Vec<ScenarioInventory>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioEntity {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: EntityType,
    pub name: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioFact {
    pub subject: String,
    pub predicate: String,
    #[serde(default)]
    pub object: Value,
    pub visibility: Visibility,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioThread {
    pub id: String,
    pub title: String,
    #[serde(default = "default_thread_status")]
    pub status: ThreadStatus,
    #[serde(default)]
    pub stakes: Map<String, Value>,
    #[serde(default)]
    pub related: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_thread_status() -> ThreadStatus {
    ThreadStatus::Open
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioScene {
    pub location: String,
    #[serde(default)]
    pub present: Vec<String>,
    #[serde(default)]
    pub time: Map<String, Value>,
    #[serde(default)]
    pub constraints: Map<String, Value>,
    #[serde(default)]
    pub visibility: SceneVisibility,
    #[serde(default)]
    pub noise: String,
    #[serde(default)]
    pub obscured: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioInventory {
    pub owner: String,
    pub item: String,
    #[serde(default = "default_quantity")]
    pub quantity: i64,
    #[serde(default)]
    pub flags: Vec<String>,
}

fn default_quantity() -> i64 {
    1
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let scenario: Scenario = serde_yaml::from_str(&raw)?;
        if scenario.entities.iter().all(|e| e.kind != EntityType::Pc) {
            return Err(ScenarioError::Invalid("no player character entity".into()).into());
        }
        Ok(scenario)
    }

    fn entity_id(&self, raw: &str) -> Id {
        Id::namespaced(raw, Origin::Campaign)
    }
}

/// Seed a fresh campaign from a scenario: campaign header, entities, facts,
/// threads, clocks, scene and starting inventory, then the entity-lore
/// manifest for stage-1 retrieval.
pub fn seed_campaign(
    store: &mut Store,
    index: &mut LoreIndex,
    scenario: &Scenario,
    preset: Option<&str>,
) -> Result<()> {
    for pack in &scenario.packs {
        if !index.is_installed(pack)? {
            return Err(ScenarioError::PackNotInstalled(pack.clone()).into());
        }
    }

    // Pack-namespaced entity references must resolve to something an
    // installed pack actually defines, before anything is written.
    for entity in &scenario.entities {
        let id = scenario.entity_id(&entity.id);
        if id.origin() == Some(Origin::Pack) && !index.has_entity(id.as_str())? {
            return Err(ScenarioError::UnknownPackEntity(id.as_str().to_string()).into());
        }
    }

    let calibration = match preset {
        Some(name) => scenario
            .presets
            .get(name)
            .cloned()
            .ok_or_else(|| ScenarioError::Invalid(format!("unknown preset `{name}`")))?,
        None => scenario.calibration.clone(),
    };

    store.create_campaign(&CampaignRow {
        id: store.campaign_id().to_string(),
        name: scenario.name.clone(),
        scenario_id: scenario.id.clone(),
        system: scenario.system.clone(),
        calibration,
        prompt_versions: crate::prompts::default_pins(),
    })?;

    let mut diff = StateDiff::default();

    for entity in &scenario.entities {
        let id = scenario.entity_id(&entity.id);
        let from_pack = id.origin() == Some(Origin::Pack);
        diff.entities_to_add.push(Entity {
            id: id.clone(),
            entity_type: entity.kind,
            name: entity.name.clone(),
            attributes: entity.attributes.clone(),
            tags: entity.tags.clone(),
            origin: if from_pack { Origin::Pack } else { Origin::Campaign },
            pack_id: from_pack
                .then(|| scenario.packs.first().cloned())
                .flatten(),
            pack_entity_id: from_pack.then(|| id.clone()),
        });
    }

    for (index_no, fact) in scenario.facts.iter().enumerate() {
        diff.facts_to_add.push(Fact {
            id: Id::new(Origin::Campaign, &format!("seed_fact_{index_no}")),
            subject: scenario.entity_id(&fact.subject),
            predicate: fact.predicate.clone(),
            object: fact.object.clone(),
            visibility: fact.visibility,
            confidence: 1.0,
            tags: fact.tags.clone(),
            discovered_turn: None,
            discovery_method: None,
            origin: Origin::Campaign,
            pack_id: None,
        });
    }

    for thread in &scenario.threads {
        diff.threads_to_add.push(Thread {
            id: scenario.entity_id(&thread.id),
            title: thread.title.clone(),
            status: thread.status,
            stakes: thread.stakes.clone(),
            related: thread.related.iter().map(|r| scenario.entity_id(r)).collect(),
            tags: thread.tags.clone(),
            origin: Origin::Campaign,
            pack_id: None,
        });
    }

    diff.scene_replacement = Some(Scene {
        location: scenario.entity_id(&scenario.scene.location),
        present: scenario
            .scene
            .present
            .iter()
            .map(|p| scenario.entity_id(p))
            .collect(),
        time: scenario.scene.time.clone(),
        constraints: scenario.scene.constraints.clone(),
        visibility: scenario.scene.visibility,
        noise: scenario.scene.noise.clone(),
        obscured: scenario
            .scene
            .obscured
            .iter()
            .map(|o| scenario.entity_id(o))
            .collect(),
    });

    for entry in &scenario.inventory {
        diff.inventory_deltas.push(InventoryDelta {
            owner: scenario.entity_id(&entry.owner),
            item: scenario.entity_id(&entry.item),
            delta: entry.quantity,
            add_flags: entry.flags.clone(),
            remove_flags: vec![],
        });
    }

    for rule in &scenario.system.clock_rules {
        diff.clocks_to_add.push(Clock::from_rule(rule));
    }

    // The seed is a genesis event at turn zero: replay reconstructs every
    // projection, the starting state included, from the log alone.
    let record = EventRecord {
        turn: 0,
        player_input: String::new(),
        context_packet: Value::Null,
        interpreter: Value::Null,
        validator: Value::Null,
        planner: Value::Null,
        resolver: Value::Null,
        narrator: Value::Null,
        engine_events: vec![],
        diff,
        final_text: format!("Campaign seeded from scenario `{}`.", scenario.id),
        prompt_versions: crate::prompts::default_pins(),
        created_at: chrono::Utc::now().to_rfc3339(),
    };
    store.commit_turn(&record)?;

    let entity_ids: Vec<String> = scenario
        .entities
        .iter()
        .map(|e| scenario.entity_id(&e.id).as_str().to_string())
        .collect();
    index.build_entity_manifest(store.campaign_id(), &entity_ids)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO: &str = r#"
id: dockside_debt
name: Dockside Debt
system:
  clock_rules:
    - name: heat
      segments: 6
      triggers: { 6: "crackdown" }
  resolution_rules:
    consequences: [exposed, detected]
calibration:
  tone: noir
  risk: high
presets:
  gentle:
    tone: cozy
    risk: low
entities:
  - id: pc
    type: pc
    name: Riley
  - id: alley
    type: location
    name: Service Alley
scene:
  location: alley
  present: [pc]
"#;

    #[test]
    fn scenario_parses_and_seeds() {
        let scenario: Scenario = serde_yaml::from_str(SCENARIO).unwrap();
        let mut store = Store::open_in_memory("campaign:test").unwrap();
        let mut index = LoreIndex::open_in_memory().unwrap();
        seed_campaign(&mut store, &mut index, &scenario, None).unwrap();

        let row = store.load_campaign().unwrap();
        assert_eq!(row.scenario_id, "dockside_debt");
        assert_eq!(row.calibration.tone, "noir");
        assert_eq!(store.entities().unwrap().len(), 2);
        assert_eq!(store.clock_by_name("heat").unwrap().unwrap().max, 6);
        assert!(store.scene().unwrap().is_some());
    }

    #[test]
    fn preset_overrides_calibration() {
        let scenario: Scenario = serde_yaml::from_str(SCENARIO).unwrap();
        let mut store = Store::open_in_memory("campaign:test").unwrap();
        let mut index = LoreIndex::open_in_memory().unwrap();
        seed_campaign(&mut store, &mut index, &scenario, Some("gentle")).unwrap();
        assert_eq!(store.load_campaign().unwrap().calibration.tone, "cozy");
    }

    #[test]
    fn scenario_without_pc_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scenario.yaml");
        std::fs::write(&path, SCENARIO.replace("type: pc", "type: npc")).unwrap();
        assert!(Scenario::load(&path).is_err());
    }

    #[test]
    fn pack_entity_references_must_exist_in_an_installed_pack() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("locations")).unwrap();
        std::fs::write(
            dir.path().join("pack.yaml"),
            "id: core\nname: Core Setting\nversion: \"1.0\"\nlayer: 1\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("locations/anchor.md"),
            "---\ntitle: The Rusted Anchor\ntype: location\n\
             entity_id: pack:rusted_anchor\n---\n# The Rusted Anchor\n\nA dockside bar.\n",
        )
        .unwrap();
        let mut index = LoreIndex::open_in_memory().unwrap();
        index.install_pack(dir.path()).unwrap();

        let yaml = r#"
id: ghost_town
name: Ghost Town
packs: [core]
entities:
  - { id: pc, type: pc, name: Riley }
  - { id: "pack:ghost", type: location, name: Nowhere }
scene:
  location: "pack:ghost"
  present: [pc]
"#;
        let scenario: Scenario = serde_yaml::from_str(yaml).unwrap();
        let mut store = Store::open_in_memory("campaign:test").unwrap();
        assert!(matches!(
            seed_campaign(&mut store, &mut index, &scenario, None),
            Err(crate::error::Error::Scenario(
                ScenarioError::UnknownPackEntity(_)
            ))
        ));

        // The same scenario seeds cleanly once it names an entity the
        // installed pack actually defines.
        let yaml = yaml.replace("pack:ghost", "pack:rusted_anchor");
        let scenario: Scenario = serde_yaml::from_str(&yaml).unwrap();
        let mut store = Store::open_in_memory("campaign:test").unwrap();
        seed_campaign(&mut store, &mut index, &scenario, None).unwrap();
    }

    #[test]
    fn unknown_preset_is_rejected() {
        let scenario: Scenario = serde_yaml::from_str(SCENARIO).unwrap();
        let mut store = Store::open_in_memory("campaign:test").unwrap();
        let mut index = LoreIndex::open_in_memory().unwrap();
        assert!(seed_campaign(&mut store, &mut index, &scenario, Some("brutal")).is_err());
    }
}
