use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::EngineSettings;
use crate::error::Result;
use crate::ids::Id;
use crate::lore::index::{CorpusFilter, LoreIndex, LoreQuery};
use crate::lore::vectors::VectorLore;
use crate::state::model::{EntityType, ThreadStatus, Visibility};
use crate::state::Store;

/// The materialized bundle turn-level stages read instead of the index.
/// Rebuilt on scene transition, appended to on NPC introduction.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SceneLore {
    pub location: Option<Id>,
    /// Sensory description chunks for the location.
    pub atmosphere: Vec<String>,
    /// Per present-NPC briefing, keyed by entity id.
    pub npc_briefings: BTreeMap<String, NpcBriefing>,
    /// Hooks the resolver may surface on investigation.
    pub discoverable: Vec<DiscoverableHook>,
    /// Why this location matters to each active thread, keyed by thread id.
    pub thread_connections: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NpcBriefing {
    pub disposition: String,
    pub knows: Vec<String>,
    pub withholds: Vec<String>,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverableHook {
    pub source: Id,
    pub trigger: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<Id>,
}

impl SceneLore {
    pub fn briefing_for(&self, npc: &Id) -> Option<&NpcBriefing> {
        self.npc_briefings.get(npc.as_str())
    }

    pub fn hooks_for(&self, source: &Id) -> Vec<&DiscoverableHook> {
        self.discoverable
            .iter()
            .filter(|h| &h.source == source)
            .collect()
    }
}

/// Build the bundle for the current scene from the lore index and the
/// projections. This is the only place during a campaign that queries the
/// index; per-turn stages read the stored bundle.
pub async fn build_scene_lore(
    index: &LoreIndex,
    store: &Store,
    vectors: Option<&VectorLore>,
    settings: &EngineSettings,
) -> Result<SceneLore> {
    let Some(scene) = store.scene()? else {
        return Ok(SceneLore::default());
    };
    let entities = store.entities()?;
    let facts = store.facts()?;
    let threads = store.threads()?;

    let location_name = entities
        .iter()
        .find(|e| e.id == scene.location)
        .map(|e| e.name.clone())
        .unwrap_or_else(|| scene.location.local().to_string());

    let present_npcs: Vec<_> = entities
        .iter()
        .filter(|e| e.entity_type == EntityType::Npc && scene.present.contains(&e.id))
        .collect();

    let query_text = format!(
        "{location_name} {} {}",
        present_npcs
            .iter()
            .map(|n| n.name.as_str())
            .collect::<Vec<_>>()
            .join(" "),
        threads
            .iter()
            .filter(|t| matches!(t.status, ThreadStatus::Open | ThreadStatus::Advancing))
            .map(|t| t.title.as_str())
            .collect::<Vec<_>>()
            .join(" "),
    );
    let vector_hits = match vectors {
        Some(store) => Some(store.top_ids(&query_text, 32).await?),
        None => None,
    };

    let atmosphere_query = LoreQuery {
        campaign: store.campaign_id().to_string(),
        location: Some(scene.location.as_str().to_string()),
        entities: vec![],
        factions: vec![],
        threads: vec![],
        tags: vec![],
        text: query_text.clone(),
        budget_tokens: settings.lore_token_budget / 2,
        corpus: CorpusFilter::Authored,
        vector_hits: vector_hits.clone(),
    };
    let atmosphere = index
        .query(&atmosphere_query)?
        .into_iter()
        .map(|r| r.chunk.body)
        .collect();

    let mut lore = SceneLore {
        location: Some(scene.location.clone()),
        atmosphere,
        npc_briefings: BTreeMap::new(),
        discoverable: Vec::new(),
        thread_connections: BTreeMap::new(),
    };

    let briefing_budget = settings.lore_token_budget / 4;
    for npc in &present_npcs {
        let briefing = build_npc_briefing(
            index,
            store.campaign_id(),
            npc,
            &facts,
            briefing_budget,
            vector_hits.as_deref(),
        )?;
        lore.npc_briefings.insert(npc.id.as_str().to_string(), briefing);
    }

    // Discoverable hooks come from entity attribute bags of everything in
    // the scene, the location included.
    for entity in entities
        .iter()
        .filter(|e| e.id == scene.location || scene.present.contains(&e.id))
    {
        lore.discoverable.extend(hooks_from_bag(entity));
    }

    for thread in threads
        .iter()
        .filter(|t| matches!(t.status, ThreadStatus::Open | ThreadStatus::Advancing))
    {
        let tied_here = thread.related.contains(&scene.location)
            || thread.related.iter().any(|r| scene.present.contains(r));
        if tied_here {
            lore.thread_connections.insert(
                thread.id.as_str().to_string(),
                format!("{} runs through {}", thread.title, location_name),
            );
        }
    }

    Ok(lore)
}

/// Incremental append for a narrator-introduced NPC; the rest of the
/// bundle stays as materialized.
pub fn append_npc_briefing(
    lore: &mut SceneLore,
    index: &LoreIndex,
    store: &Store,
    npc_id: &Id,
    budget: usize,
) -> Result<()> {
    let Some(npc) = store.entity(npc_id)? else {
        return Ok(());
    };
    let facts = store.facts()?;
    let briefing = build_npc_briefing(index, store.campaign_id(), &npc, &facts, budget, None)?;
    lore.npc_briefings.insert(npc_id.as_str().to_string(), briefing);
    lore.discoverable.extend(hooks_from_bag(&npc));
    Ok(())
}

fn build_npc_briefing(
    index: &LoreIndex,
    campaign: &str,
    npc: &crate::state::model::Entity,
    facts: &[crate::state::model::Fact],
    budget: usize,
    vector_hits: Option<&[(String, f64)]>,
) -> Result<NpcBriefing> {
    let disposition = npc
        .attributes
        .get("disposition")
        .and_then(Value::as_str)
        .unwrap_or("neutral")
        .to_string();

    // Known/witnessed facts about the NPC are fair game for the narrator;
    // rumored facts are what the NPC holds back until pressed.
    let mut knows: Vec<String> = facts
        .iter()
        .filter(|f| f.subject == npc.id)
        .filter(|f| matches!(f.visibility, Visibility::Known | Visibility::Witnessed))
        .map(render_fact)
        .collect();
    let withholds: Vec<String> = facts
        .iter()
        .filter(|f| f.subject == npc.id)
        .filter(|f| f.visibility == Visibility::Rumored)
        .map(render_fact)
        .collect();

    let query = LoreQuery {
        campaign: campaign.to_string(),
        location: None,
        entities: vec![npc.id.as_str().to_string()],
        factions: vec![],
        threads: vec![],
        tags: vec![],
        text: npc.name.clone(),
        budget_tokens: budget,
        corpus: CorpusFilter::Authored,
        vector_hits: vector_hits.map(|h| h.to_vec()),
    };
    for retrieved in index.query(&query)? {
        knows.push(retrieved.chunk.body);
    }

    Ok(NpcBriefing {
        disposition,
        knows,
        withholds,
        capabilities: npc.capabilities(),
    })
}

fn render_fact(fact: &crate::state::model::Fact) -> String {
    match &fact.object {
        Value::Null => fact.predicate.clone(),
        Value::String(s) => format!("{}: {s}", fact.predicate),
        other => format!("{}: {other}", fact.predicate),
    }
}

fn hooks_from_bag(entity: &crate::state::model::Entity) -> Vec<DiscoverableHook> {
    entity
        .attributes
        .get("discoverable")
        .and_then(Value::as_array)
        .map(|hooks| {
            hooks
                .iter()
                .filter_map(|hook| {
                    Some(DiscoverableHook {
                        source: entity.id.clone(),
                        trigger: hook.get("trigger")?.as_str()?.to_string(),
                        content: hook.get("content")?.as_str()?.to_string(),
                        item_id: hook
                            .get("item_id")
                            .and_then(Value::as_str)
                            .map(Id::from),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}
