use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::EngineSettings;
use crate::context::{ContextPacket, build_context};
use crate::error::{EngineError, Result};
use crate::gateway::Gateway;
use crate::ids::{Id, Origin};
use crate::lore::index::LoreIndex;
use crate::lore::scene_cache::{SceneLore, append_npc_briefing, build_scene_lore};
use crate::lore::vectors::VectorLore;
use crate::prompts::PromptRegistry;
use crate::resolver::{ResolverContext, ResolverOutput, resolve};
use crate::stages::interpreter::run_interpreter;
use crate::stages::narrator::{NarratorOutput, run_narrator};
use crate::stages::planner::run_planner;
use crate::state::diff::{StateDiff, ThreadUpdate};
use crate::state::model::{
    Entity, EntityType, EventRecord, Fact, Scene, Summary, Visibility,
};
use crate::state::{CampaignRow, Store};
use crate::validator::validate;

/// What one call to `run_turn` produced. Aborted turns leave the store
/// untouched and do not advance the turn number.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TurnOutcome {
    Committed {
        turn: u64,
        final_text: String,
        next_prompt: String,
        suggested_actions: Vec<String>,
    },
    Clarification {
        turn: u64,
        question: String,
    },
    Aborted {
        error: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplayTurn {
    pub turn: u64,
    pub original_final_text: String,
    pub replayed_final_text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplayReport {
    pub sandbox_campaign: String,
    pub turns: Vec<ReplayTurn>,
}

/// Drives the per-turn pipeline for one campaign. Holds the exclusive
/// store handle for the campaign; everything it borrows is read-only.
pub struct Orchestrator {
    store: Store,
    db_path: PathBuf,
    lore_index: LoreIndex,
    vectors: Option<VectorLore>,
    gateway: Gateway,
    registry: PromptRegistry,
    settings: EngineSettings,
    campaign: CampaignRow,
    scene_lore: SceneLore,
}

impl Orchestrator {
    pub async fn new(
        db_path: PathBuf,
        campaign_id: &str,
        gateway: Gateway,
        registry: PromptRegistry,
        settings: EngineSettings,
        vectors: Option<VectorLore>,
    ) -> Result<Self> {
        // Opening a connection would create an empty database; a missing
        // file means `init`/`new-game` never ran.
        if !db_path.exists() {
            return Err(EngineError::NoCampaign(db_path.display().to_string()).into());
        }
        let store = Store::open(&db_path, campaign_id)?;
        let lore_index = LoreIndex::open(&db_path)?;
        let campaign = store.load_campaign()?;
        let scene_lore = match store.load_scene_lore()? {
            Some(raw) => serde_json::from_value(raw)?,
            None => {
                let lore =
                    build_scene_lore(&lore_index, &store, vectors.as_ref(), &settings).await?;
                store.save_scene_lore(&serde_json::to_value(&lore)?)?;
                lore
            }
        };
        Ok(Orchestrator {
            store,
            db_path,
            lore_index,
            vectors,
            gateway,
            registry,
            settings,
            campaign,
            scene_lore,
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn campaign(&self) -> &CampaignRow {
        &self.campaign
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    /// Run one turn. Stage errors abort the turn atomically: the error is
    /// folded into `TurnOutcome::Aborted` and nothing is written.
    pub async fn run_turn(&mut self, player_input: &str) -> TurnOutcome {
        self.run_turn_with_pins(player_input, None).await
    }

    pub async fn run_turn_with_pins(
        &mut self,
        player_input: &str,
        pin_overrides: Option<&BTreeMap<String, String>>,
    ) -> TurnOutcome {
        let mut pins = self.campaign.prompt_versions.clone();
        if let Some(overrides) = pin_overrides {
            for (id, version) in overrides {
                pins.insert(id.clone(), version.clone());
            }
        }
        match execute_turn(
            &self.gateway,
            &self.registry,
            &mut self.lore_index,
            self.vectors.as_ref(),
            &self.settings,
            &mut self.store,
            &mut self.scene_lore,
            &self.campaign,
            &pins,
            player_input,
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(error) => {
                log::error!("turn aborted: {error}");
                TurnOutcome::Aborted {
                    error: error.to_string(),
                }
            }
        }
    }

    /// Replay a recorded turn range into an isolated sandbox campaign with
    /// optionally overridden prompt versions. The live campaign is never
    /// written; the sandbox id is returned for diffing.
    pub async fn replay(
        &mut self,
        start: u64,
        end: u64,
        pin_overrides: Option<&BTreeMap<String, String>>,
    ) -> Result<ReplayReport> {
        let last = self.store.last_turn()?;
        if start == 0 || end < start || end > last {
            return Err(EngineError::ReplayOutOfRange { start, end }.into());
        }

        let sandbox_id = format!("{}_replay_{start}_{end}", self.campaign.id);
        let mut sandbox = Store::open(&self.db_path, &sandbox_id)?;
        sandbox.reset_projections()?;
        sandbox.clear_events()?;
        self.store.clone_campaign_row(&sandbox_id)?;

        // Roll the sandbox forward to the eve of the range by committing
        // the recorded prefix verbatim, genesis record included; no LLM
        // involved, and the sandbox log stays turn-aligned with the
        // original.
        for record in self.store.events_in_range(0, start - 1)? {
            sandbox.commit_turn(&record)?;
        }

        let mut pins = self.campaign.prompt_versions.clone();
        if let Some(overrides) = pin_overrides {
            for (id, version) in overrides {
                pins.insert(id.clone(), version.clone());
            }
        }
        sandbox.set_prompt_versions(&pins)?;

        let mut sandbox_lore =
            build_scene_lore(&self.lore_index, &sandbox, self.vectors.as_ref(), &self.settings)
                .await?;
        let sandbox_campaign = sandbox.load_campaign()?;

        let mut turns = Vec::new();
        for record in self.store.events_in_range(start, end)? {
            let outcome = execute_turn(
                &self.gateway,
                &self.registry,
                &mut self.lore_index,
                self.vectors.as_ref(),
                &self.settings,
                &mut sandbox,
                &mut sandbox_lore,
                &sandbox_campaign,
                &pins,
                &record.player_input,
            )
            .await?;
            let replayed_text = match outcome {
                TurnOutcome::Committed { final_text, .. } => final_text,
                TurnOutcome::Clarification { question, .. } => question,
                TurnOutcome::Aborted { error } => return Err(crate::error::Error::StringError(error)),
            };
            turns.push(ReplayTurn {
                turn: record.turn,
                original_final_text: record.final_text,
                replayed_final_text: replayed_text,
            });
        }

        Ok(ReplayReport {
            sandbox_campaign: sandbox_id,
            turns,
        })
    }
}

/// The pipeline proper, shared by live play and replay. Strictly
/// sequential; the only awaits are the three gateway calls.
#[allow(clippy::too_many_arguments)]
async fn execute_turn(
    gateway: &Gateway,
    registry: &PromptRegistry,
    lore_index: &mut LoreIndex,
    vectors: Option<&VectorLore>,
    settings: &EngineSettings,
    store: &mut Store,
    scene_lore: &mut SceneLore,
    campaign: &CampaignRow,
    pins: &BTreeMap<String, String>,
    player_input: &str,
) -> Result<TurnOutcome> {
    // Exactly one scene is current per campaign; a turn with none means
    // the campaign was never seeded.
    if store.scene()?.is_none() {
        return Err(EngineError::NoCurrentScene.into());
    }

    let turn = store.last_turn()? + 1;
    let packet = build_context(store, scene_lore, &campaign.calibration, settings)?;

    let interpreter =
        run_interpreter(gateway, registry, pins, &packet, player_input).await?;
    let validator = validate(
        &interpreter,
        store,
        &packet,
        &campaign.system.resolution_rules,
    )?;

    // Clarification short-circuit: the one permitted question goes out as
    // the narrator text and the turn commits with an empty diff.
    if validator.clarification_needed {
        let question = validator
            .clarification_question
            .clone()
            .unwrap_or_else(|| "What are you actually trying to do?".to_string());
        let narrator = NarratorOutput::clarification(&question);
        let record = EventRecord {
            turn,
            player_input: player_input.to_string(),
            context_packet: serde_json::to_value(&packet)?,
            interpreter: serde_json::to_value(&interpreter)?,
            validator: serde_json::to_value(&validator)?,
            planner: Value::Null,
            resolver: Value::Null,
            narrator: serde_json::to_value(&narrator)?,
            engine_events: vec![],
            diff: StateDiff::default(),
            final_text: question.clone(),
            prompt_versions: pins.clone(),
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        store.commit_turn(&record)?;
        return Ok(TurnOutcome::Clarification { turn, question });
    }

    let planner = run_planner(gateway, registry, pins, &packet, &validator).await?;

    // The seed is the turn number: recorded implicitly in the event log,
    // so replay rerolls identically.
    let resolver_ctx = ResolverContext {
        store,
        system: &campaign.system,
        lore: scene_lore,
        turn,
        seed: turn,
    };
    let resolved = resolve(&resolver_ctx, &validator, &planner, &interpreter.risk_flags)?;

    let narrator = run_narrator(
        gateway,
        registry,
        pins,
        &packet,
        &resolved.events,
        &planner,
        &validator.blocked_actions,
        None,
    )
    .await?;

    let mut diff = resolved.diff.clone();
    let introduced_npcs = merge_narrator_contributions(store, &packet, &narrator, turn, &mut diff)?;

    let record = EventRecord {
        turn,
        player_input: player_input.to_string(),
        context_packet: serde_json::to_value(&packet)?,
        interpreter: serde_json::to_value(&interpreter)?,
        validator: serde_json::to_value(&validator)?,
        planner: serde_json::to_value(&planner)?,
        resolver: serde_json::to_value(&resolved)?,
        narrator: serde_json::to_value(&narrator)?,
        engine_events: resolved.events.clone(),
        diff: diff.clone(),
        final_text: narrator.final_text.clone(),
        prompt_versions: pins.clone(),
        created_at: chrono::Utc::now().to_rfc3339(),
    };
    store.commit_turn(&record)?;

    // Post-commit bookkeeping: summaries and the scene-lore cache.
    for update in &narrator.thread_updates {
        let thread_id = Id::namespaced(&update.thread, Origin::Campaign);
        store.upsert_summary(&Summary {
            scope: "thread".to_string(),
            scope_id: thread_id.as_str().to_string(),
            turn_start: turn,
            turn_end: turn,
            text: format!("now {}", update.status),
        })?;
    }

    if narrator.scene_transition.is_some() {
        // The summary and history chunk belong to the scene just closed,
        // which the committed diff has already replaced.
        if let Some(prior) = packet.scene.as_ref().map(|s| s.location.clone()) {
            refresh_scene_summary(store, lore_index, turn, &prior)?;
        }
        store.clear_scene_lore()?;
        *scene_lore = build_scene_lore(lore_index, store, vectors, settings).await?;
        store.save_scene_lore(&serde_json::to_value(&*scene_lore)?)?;
    } else if !introduced_npcs.is_empty() {
        for npc in &introduced_npcs {
            append_npc_briefing(
                scene_lore,
                lore_index,
                store,
                npc,
                settings.lore_token_budget / 4,
            )?;
        }
        store.save_scene_lore(&serde_json::to_value(&*scene_lore)?)?;
    }

    Ok(TurnOutcome::Committed {
        turn,
        final_text: narrator.final_text,
        next_prompt: narrator.next_prompt,
        suggested_actions: narrator.suggested_actions,
    })
}

/// Fold the narrator's contributions into the resolver diff, re-validated:
/// facts contradicting a known fact are dropped, introduced things get
/// namespaced campaign ids, unknown references are discarded with a log
/// line rather than poisoning the commit.
fn merge_narrator_contributions(
    store: &Store,
    packet: &ContextPacket,
    narrator: &NarratorOutput,
    turn: u64,
    diff: &mut StateDiff,
) -> Result<Vec<Id>> {
    let entities = store.entities()?;
    let facts = store.facts()?;
    let threads = store.threads()?;
    let scene = store.scene()?;

    let mut known_ids: Vec<Id> = entities.iter().map(|e| e.id.clone()).collect();

    for (list, entity_type) in [
        (&narrator.introduced_items, EntityType::Item),
        (&narrator.introduced_npcs, EntityType::Npc),
    ] {
        for introduced in list {
            let id = Id::namespaced(&introduced.local_id, Origin::Campaign);
            if known_ids.contains(&id) {
                continue;
            }
            let mut attributes = Map::new();
            if !introduced.description.is_empty() {
                attributes.insert(
                    "description".to_string(),
                    Value::String(introduced.description.clone()),
                );
            }
            diff.entities_to_add.push(Entity {
                id: id.clone(),
                entity_type,
                name: introduced.name.clone(),
                attributes,
                tags: vec![],
                origin: Origin::Campaign,
                pack_id: None,
                pack_entity_id: None,
            });
            known_ids.push(id);
        }
    }

    let introduced_npc_ids: Vec<Id> = narrator
        .introduced_npcs
        .iter()
        .map(|n| Id::namespaced(&n.local_id, Origin::Campaign))
        .collect();

    for established in &narrator.established_facts {
        let subject = Id::namespaced(&established.subject, Origin::Campaign);
        if !known_ids.contains(&subject) {
            log::info!("dropping established fact about unknown subject {subject}");
            continue;
        }
        let contradicts = facts.iter().any(|f| {
            f.subject == subject
                && f.predicate == established.predicate
                && matches!(f.visibility, Visibility::Known | Visibility::Witnessed)
                && f.object != Value::String(established.detail.clone())
        });
        if contradicts {
            log::info!(
                "dropping narrator fact `{} {}`: contradicts known state",
                subject,
                established.predicate
            );
            continue;
        }
        let duplicate = facts
            .iter()
            .any(|f| f.subject == subject && f.predicate == established.predicate);
        if duplicate {
            continue;
        }
        diff.facts_to_add.push(Fact {
            id: Id::new(
                Origin::Campaign,
                &format!("narrated_{}_{}_t{turn}", subject.local(), established.predicate),
            ),
            subject,
            predicate: established.predicate.clone(),
            object: Value::String(established.detail.clone()),
            visibility: Visibility::Known,
            confidence: 0.9,
            tags: vec![],
            discovered_turn: Some(turn),
            discovery_method: Some("narration".to_string()),
            origin: Origin::Campaign,
            pack_id: None,
        });
    }

    if let Some(transition) = &narrator.scene_transition {
        let location = Id::namespaced(&transition.location, Origin::Campaign);
        if known_ids.contains(&location) {
            let pc = packet.player_character.as_ref().map(|pc| pc.id.clone());
            let mut present: Vec<Id> = pc.into_iter().collect();
            for raw in &transition.present {
                let id = Id::namespaced(raw, Origin::Campaign);
                if known_ids.contains(&id) && !present.contains(&id) {
                    present.push(id);
                }
            }
            diff.scene_replacement = Some(Scene {
                location,
                present,
                time: scene.as_ref().map(|s| s.time.clone()).unwrap_or_default(),
                constraints: Map::new(),
                visibility: Default::default(),
                noise: String::new(),
                obscured: vec![],
            });
        } else {
            log::info!("dropping scene transition to unknown location {location}");
        }
    }

    for update in &narrator.thread_updates {
        let id = Id::namespaced(&update.thread, Origin::Campaign);
        if threads.iter().any(|t| t.id == id) {
            diff.thread_updates.push(ThreadUpdate {
                id,
                status: update.status,
            });
        } else {
            log::info!("dropping update to unknown thread {}", update.thread);
        }
    }

    Ok(introduced_npc_ids
        .into_iter()
        .filter(|id| known_ids.contains(id))
        .collect())
}

/// Scene summary: the tail of the narrative for the scene just closed,
/// plus a history chunk so later retrieval can find it.
fn refresh_scene_summary(
    store: &Store,
    index: &mut LoreIndex,
    turn: u64,
    location: &Id,
) -> Result<()> {
    let first = turn.saturating_sub(5).max(1);
    let recent = store.events_in_range(first, turn)?;
    let mut text = recent
        .iter()
        .map(|r| r.final_text.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    text.truncate(1200);
    store.upsert_summary(&Summary {
        scope: "scene".to_string(),
        scope_id: location.as_str().to_string(),
        turn_start: first,
        turn_end: turn,
        text: text.clone(),
    })?;
    index.add_history_chunk(
        store.campaign_id(),
        location.as_str(),
        first,
        turn,
        &text,
        &["history".to_string()],
    )?;
    Ok(())
}
