pub mod dice;

use std::collections::BTreeMap;

use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{DangerLevel, SystemConfig};
use crate::context::{INVESTIGATED_PREDICATE, SITUATION_TAG, THREAT_TAG};
use crate::error::Result;
use crate::ids::{Id, Origin};
use crate::lore::scene_cache::SceneLore;
use crate::resolver::dice::{Outcome, RollResult, roll};
use crate::stages::interpreter::RiskFlag;
use crate::stages::planner::PlannerOutput;
use crate::state::diff::{FactUpdate, InventoryDelta, RelationshipUpdate, StateDiff, StreakOp, StreakUpdate};
use crate::state::model::{
    EngineEvent, Entity, EntityType, Fact, NpcActionKind, Visibility,
};
use crate::state::Store;
use crate::validator::ValidatorOutput;

/// Verbs treated as investigation for search dedup.
const SEARCH_VERBS: &[&str] = &["search", "examine", "investigate", "loot", "check"];

/// Verbs whose success clears active situation facts on the subject.
const CLEARING_VERBS: &[&str] = &["hide", "evade", "escape", "lay_low", "slip_away", "shake_tail"];

/// Generic capability classes inferred from planner beats, matched against
/// NPC `capabilities` / `no_*` limitations before any npc_action is
/// authorized.
const CAPABILITY_KEYWORDS: &[(&str, &[&str])] = &[
    ("netrunning", &["hack", "netrun", "remote", "implant", "ice", "jack in"]),
    ("combat", &["shoot", "fire", "stab", "strike", "attack", "gun"]),
    ("pursuit", &["chase", "pursue", "run down", "corner"]),
    ("surveillance", &["track", "monitor", "tail", "camera", "watch"]),
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollRecord {
    pub verb: String,
    pub roll: RollResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverOutput {
    pub events: Vec<EngineEvent>,
    pub diff: StateDiff,
    pub rolls: Vec<RollRecord>,
}

pub struct ResolverContext<'a> {
    pub store: &'a Store,
    pub system: &'a SystemConfig,
    pub lore: &'a SceneLore,
    pub turn: u64,
    pub seed: u64,
}

/// Deterministic and seedable: the same state, validator output, planner
/// output and seed produce identical events and diff. Required for replay.
pub fn resolve(
    ctx: &ResolverContext<'_>,
    validator: &ValidatorOutput,
    planner: &PlannerOutput,
    risk_flags: &[RiskFlag],
) -> Result<ResolverOutput> {
    let mut rng = StdRng::seed_from_u64(ctx.seed);
    let mut out = ResolverOutput {
        events: Vec::new(),
        diff: StateDiff::default(),
        rolls: Vec::new(),
    };

    let entities = ctx.store.entities()?;
    let facts = ctx.store.facts()?;
    let scene = ctx.store.scene()?;
    let Some(pc) = entities.iter().find(|e| e.entity_type == EntityType::Pc) else {
        return Ok(out);
    };
    let subject = pc.id.clone();

    // Working clock values so successive actions in one turn see each
    // other's deltas.
    let mut clocks: BTreeMap<String, crate::state::model::Clock> = ctx
        .store
        .clocks()?
        .into_iter()
        .map(|c| (c.name.clone(), c))
        .collect();

    let active_situations: Vec<&Fact> = facts
        .iter()
        .filter(|f| f.subject == subject && f.tags.iter().any(|t| t == SITUATION_TAG))
        .collect();
    let threat_active = !active_situations.is_empty()
        || facts.iter().any(|f| f.tags.iter().any(|t| t == THREAT_TAG));

    let rules = &ctx.system.resolution_rules;
    let roll_override = risk_flags.iter().any(|f| f.forces_roll());

    for allowed in &validator.allowed_actions {
        let verb = allowed.action.verb.as_str();
        let target = allowed
            .action
            .target
            .as_deref()
            .map(|raw| resolve_target(raw, &entities));
        let streak = ctx.store.streak(&subject, verb)?;

        // Failure-streak forcing: a hunted character cannot loop in
        // "nearly caught" forever. At threshold, the threat resolves
        // against them regardless of the dice.
        if threat_active && streak >= rules.failure_streak_threshold {
            let situation = active_situations
                .first()
                .map(|f| f.predicate.clone())
                .unwrap_or_else(|| "threat".to_string());
            out.events.push(EngineEvent::ThreatResolved {
                subject: subject.clone(),
                situation: situation.clone(),
                resolution: "the pursuit closes and the subject is taken".to_string(),
            });
            tick_tagged_clock(&mut clocks, &mut out, "harm");
            for fact in &active_situations {
                out.diff.fact_updates.push(FactUpdate {
                    id: fact.id.clone(),
                    object: None,
                    visibility: None,
                    confidence: None,
                    discovered_turn: None,
                    discovery_method: None,
                    retract: true,
                });
            }
            out.diff.streak_updates.push(StreakUpdate {
                subject: subject.clone(),
                category: verb.to_string(),
                op: StreakOp::Reset,
            });
            continue;
        }

        // Search dedup: a target already picked clean yields nothing new,
        // and no dice are spent on it.
        if SEARCH_VERBS.contains(&verb) {
            if let Some(Some(target)) = &target {
                let already = facts.iter().any(|f| {
                    f.subject == target.id && f.predicate == INVESTIGATED_PREDICATE
                });
                if already {
                    out.events.push(EngineEvent::ActionSucceeded {
                        action: verb.to_string(),
                        subject: subject.clone(),
                        target: Some(target.id.clone()),
                        outcome: "nothing_new".to_string(),
                    });
                    continue;
                }
            }
        }

        // Context danger: the configured category danger, raised to risky
        // when the turn's risk flags force a roll. Moving is safe; moving
        // while pursued is not.
        let effective_danger = if roll_override && allowed.danger == DangerLevel::Safe {
            DangerLevel::Risky
        } else {
            allowed.danger
        };
        let needs_roll = effective_danger != DangerLevel::Safe;
        let outcome = if needs_roll {
            let pool = dice_pool_for(pc, rules.stat_for_action(verb));
            let result = roll(&rules.resolution, pool, &mut rng);
            let outcome = result.outcome;
            out.rolls.push(RollRecord {
                verb: verb.to_string(),
                roll: result,
            });
            outcome
        } else {
            Outcome::Success
        };

        // Costs are provisional: they land on the attempt.
        apply_costs(&allowed.cost, &mut clocks, &mut out);

        if outcome.is_success() {
            out.events.push(EngineEvent::ActionSucceeded {
                action: verb.to_string(),
                subject: subject.clone(),
                target: target.as_ref().and_then(|t| t.as_ref().map(|e| e.id.clone())),
                outcome: outcome.to_string(),
            });

            if SEARCH_VERBS.contains(&verb) {
                if let Some(Some(target)) = &target {
                    resolve_search(ctx, pc, target, &entities, &mut out);
                }
            }

            if CLEARING_VERBS.contains(&verb) {
                for fact in &active_situations {
                    out.diff.fact_updates.push(FactUpdate {
                        id: fact.id.clone(),
                        object: None,
                        visibility: None,
                        confidence: None,
                        discovered_turn: None,
                        discovery_method: None,
                        retract: true,
                    });
                }
            }

            if streak > 0 {
                out.diff.streak_updates.push(StreakUpdate {
                    subject: subject.clone(),
                    category: verb.to_string(),
                    op: StreakOp::Reset,
                });
            }

            if outcome == Outcome::Critical {
                if let Some(Some(target)) = &target {
                    if target.entity_type == EntityType::Npc {
                        push_relationship(&mut out, &subject, &target.id, 1);
                    }
                }
            }
        } else {
            let failure_state = format!("the attempt to {} does not come off", verb.replace('_', " "));
            if outcome == Outcome::Botch {
                out.events.push(EngineEvent::ActionBotched {
                    action: verb.to_string(),
                    subject: subject.clone(),
                    failure_state: failure_state.clone(),
                });
                if let Some(Some(target)) = &target {
                    if target.entity_type == EntityType::Npc {
                        push_relationship(&mut out, &subject, &target.id, -1);
                    }
                }
            } else {
                out.events.push(EngineEvent::ActionFailed {
                    action: verb.to_string(),
                    subject: subject.clone(),
                    failure_state: failure_state.clone(),
                });
            }

            // A botch escalates a safe context to risky consequences.
            let tier = match (effective_danger, outcome) {
                (DangerLevel::Safe, Outcome::Botch) => DangerLevel::Risky,
                (danger, _) => danger,
            };

            match tier {
                DangerLevel::Safe => {}
                DangerLevel::Risky => {
                    write_situation_fact(ctx, &subject, &active_situations, &facts, &mut out);
                    // Costs double on a risky-tier failure, and the
                    // pressure meter (if the system has one) ticks.
                    apply_costs(&allowed.cost, &mut clocks, &mut out);
                    tick_tagged_clock(&mut clocks, &mut out, "pressure");
                }
                DangerLevel::Dangerous => {
                    write_situation_fact(ctx, &subject, &active_situations, &facts, &mut out);
                    apply_costs(&allowed.cost, &mut clocks, &mut out);
                    tick_tagged_clock(&mut clocks, &mut out, "pressure");
                    tick_tagged_clock(&mut clocks, &mut out, "harm");
                }
            }

            out.diff.streak_updates.push(StreakUpdate {
                subject: subject.clone(),
                category: verb.to_string(),
                op: StreakOp::Increment,
            });
        }
    }

    authorize_npc_actions(planner, &entities, scene.as_ref(), &mut out);

    Ok(out)
}

fn resolve_target<'a>(raw: &str, entities: &'a [Entity]) -> Option<&'a Entity> {
    entities
        .iter()
        .find(|e| e.id.as_str() == raw)
        .or_else(|| entities.iter().find(|e| e.id.local() == raw))
}

/// Pool = attribute + ability from the action-stat map, read out of the
/// PC's attribute bag. Missing stats default to one die each.
fn dice_pool_for(pc: &Entity, stat: Option<&crate::config::ActionStat>) -> u32 {
    let Some(stat) = stat else {
        return 2;
    };
    let read = |bag: &str, key: &str| {
        pc.attributes
            .get(bag)
            .and_then(Value::as_object)
            .and_then(|m| m.get(key))
            .and_then(Value::as_u64)
            .unwrap_or(1) as u32
    };
    read("stats", &stat.attribute) + read("abilities", &stat.ability)
}

fn apply_costs(
    cost: &crate::config::CostVector,
    clocks: &mut BTreeMap<String, crate::state::model::Clock>,
    out: &mut ResolverOutput,
) {
    for (name, delta) in cost {
        let Some(clock) = clocks.get_mut(name) else {
            log::warn!("cost names unknown clock {name}; skipped");
            continue;
        };
        let old = clock.value;
        let new = (old + delta).clamp(0, clock.max);
        let applied = new - old;
        if applied == 0 {
            continue;
        }
        clock.value = new;
        *out.diff.clock_deltas.entry(name.clone()).or_insert(0) += applied;
        out.events.push(EngineEvent::CostApplied {
            clock: name.clone(),
            delta: applied,
        });
        for (threshold, trigger) in clock.crossed_triggers(old, new) {
            out.events.push(EngineEvent::ClockTriggered {
                clock: name.clone(),
                threshold,
                trigger,
                terminal: new == clock.max,
            });
        }
    }
}

/// Tick the first clock carrying the given tag by one, if the system
/// defines one. Which clocks play these roles is scenario configuration.
fn tick_tagged_clock(
    clocks: &mut BTreeMap<String, crate::state::model::Clock>,
    out: &mut ResolverOutput,
    tag: &str,
) {
    let Some(name) = clocks
        .values()
        .find(|c| c.tags.iter().any(|t| t == tag))
        .map(|c| c.name.clone())
    else {
        return;
    };
    let cost = BTreeMap::from([(name, 1i64)]);
    apply_costs(&cost, clocks, out);
}

/// Tier-1 consequence: a persistent situation fact. The predicate comes
/// from the configured consequence list; the first one not already active
/// on the subject wins, which keeps repeated failures escalating instead
/// of stacking duplicates.
fn write_situation_fact(
    ctx: &ResolverContext<'_>,
    subject: &Id,
    active: &[&Fact],
    facts: &[Fact],
    out: &mut ResolverOutput,
) {
    let consequences = &ctx.system.resolution_rules.consequences;
    let fallback = "exposed".to_string();
    let predicate = consequences
        .iter()
        .find(|c| !active.iter().any(|f| &&f.predicate == c))
        .cloned()
        .unwrap_or_else(|| consequences.first().cloned().unwrap_or(fallback));

    let already_written = facts
        .iter()
        .any(|f| f.subject == *subject && f.predicate == predicate)
        || out
            .diff
            .facts_to_add
            .iter()
            .any(|f| &f.subject == subject && f.predicate == predicate);
    if already_written {
        return;
    }

    out.diff.facts_to_add.push(Fact {
        id: Id::new(Origin::Campaign, &format!("situation_{predicate}_t{}", ctx.turn)),
        subject: subject.clone(),
        predicate: predicate.clone(),
        object: Value::Null,
        visibility: Visibility::Witnessed,
        confidence: 1.0,
        tags: vec![SITUATION_TAG.to_string(), THREAT_TAG.to_string()],
        discovered_turn: Some(ctx.turn),
        discovery_method: Some("consequence".to_string()),
        origin: Origin::Campaign,
        pack_id: None,
    });
    out.events.push(EngineEvent::SituationFactWritten {
        subject: subject.clone(),
        predicate,
    });
}

/// A successful first search surfaces the target's discoverable hooks from
/// the scene-lore bundle: portable finds go straight into the PC's pockets,
/// fixed ones become discovery facts.
fn resolve_search(
    ctx: &ResolverContext<'_>,
    pc: &Entity,
    target: &Entity,
    entities: &[Entity],
    out: &mut ResolverOutput,
) {
    for hook in ctx.lore.hooks_for(&target.id) {
        let Some(item_id) = &hook.item_id else {
            continue;
        };
        let portable = entities
            .iter()
            .find(|e| &e.id == item_id)
            .map(Entity::portable)
            .unwrap_or(true);
        out.events.push(EngineEvent::ItemDiscovered {
            item: item_id.clone(),
            source: target.id.clone(),
            picked_up: portable,
        });
        if portable {
            out.diff.inventory_deltas.push(InventoryDelta {
                owner: pc.id.clone(),
                item: item_id.clone(),
                delta: 1,
                add_flags: vec![],
                remove_flags: vec![],
            });
        } else {
            out.diff.facts_to_add.push(Fact {
                id: Id::new(
                    Origin::Campaign,
                    &format!("found_{}_t{}", item_id.local(), ctx.turn),
                ),
                subject: item_id.clone(),
                predicate: "located_at".to_string(),
                object: Value::String(target.id.as_str().to_string()),
                visibility: Visibility::Witnessed,
                confidence: 1.0,
                tags: vec![],
                discovered_turn: Some(ctx.turn),
                discovery_method: Some("search".to_string()),
                origin: Origin::Campaign,
                pack_id: None,
            });
        }
    }

    out.diff.facts_to_add.push(Fact {
        id: Id::new(
            Origin::Campaign,
            &format!("investigated_{}_t{}", target.id.local(), ctx.turn),
        ),
        subject: target.id.clone(),
        predicate: INVESTIGATED_PREDICATE.to_string(),
        object: Value::Null,
        visibility: Visibility::Known,
        confidence: 1.0,
        tags: vec![],
        discovered_turn: Some(ctx.turn),
        discovery_method: Some("search".to_string()),
        origin: Origin::Campaign,
        pack_id: None,
    });
}

fn push_relationship(out: &mut ResolverOutput, from: &Id, to: &Id, delta: i64) {
    out.events.push(EngineEvent::RelationshipDelta {
        from: from.clone(),
        to: to.clone(),
        rel_type: "rapport".to_string(),
        delta,
    });
    out.diff.relationship_updates.push(RelationshipUpdate {
        from: from.clone(),
        to: to.clone(),
        rel_type: "rapport".to_string(),
        intensity_delta: delta,
        notes: None,
    });
}

/// Gate planner beats that imply NPC responses through each NPC's declared
/// capabilities and limitations, and cap authorized actions at one reactive
/// plus one ongoing per NPC. The narrator only ever sees what survives.
fn authorize_npc_actions(
    planner: &PlannerOutput,
    entities: &[Entity],
    scene: Option<&crate::state::model::Scene>,
    out: &mut ResolverOutput,
) {
    let Some(scene) = scene else {
        return;
    };
    let present_npcs: Vec<&Entity> = entities
        .iter()
        .filter(|e| e.entity_type == EntityType::Npc && scene.present.contains(&e.id))
        .collect();

    let mut used: BTreeMap<&str, (bool, bool)> = BTreeMap::new();
    for beat in &planner.beats {
        let lowered = beat.to_lowercase();
        for npc in &present_npcs {
            let mentioned = lowered.contains(&npc.name.to_lowercase())
                || lowered.contains(npc.id.local());
            if !mentioned {
                continue;
            }
            if let Some(capability) = capability_required(&lowered) {
                if !npc_can(npc, capability) {
                    log::info!(
                        "dropping beat for {}: requires {capability} outside its definition",
                        npc.id
                    );
                    continue;
                }
            }
            let slots = used.entry(npc.id.as_str()).or_insert((false, false));
            let kind = if !slots.0 {
                slots.0 = true;
                NpcActionKind::Reactive
            } else if !slots.1 {
                slots.1 = true;
                NpcActionKind::Ongoing
            } else {
                continue;
            };
            out.events.push(EngineEvent::NpcAction {
                npc: npc.id.clone(),
                kind,
                description: beat.clone(),
            });
        }
    }
}

fn capability_required(beat: &str) -> Option<&'static str> {
    CAPABILITY_KEYWORDS
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| beat.contains(k)))
        .map(|(capability, _)| *capability)
}

fn npc_can(npc: &Entity, capability: &str) -> bool {
    let forbidden = format!("no_{capability}");
    if npc.limitations().iter().any(|l| l == &forbidden) {
        return false;
    }
    let declared = npc.capabilities();
    declared.is_empty() || declared.iter().any(|c| c == capability)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::planner::TensionMove;
    use serde_json::Map;

    fn entity(id: &str, ty: EntityType, name: &str) -> Entity {
        Entity {
            id: Id::from(id),
            entity_type: ty,
            name: name.into(),
            attributes: Map::new(),
            tags: vec![],
            origin: Origin::Campaign,
            pack_id: None,
            pack_entity_id: None,
        }
    }

    fn planner_with_beats(beats: Vec<&str>) -> PlannerOutput {
        PlannerOutput {
            beats: beats.into_iter().map(str::to_string).collect(),
            tension_move: "pressure".into(),
            tension_move_type: TensionMove::ShowApproachingThreat,
            clarification_question: None,
            next_suggestions: vec![],
        }
    }

    #[test]
    fn limited_npc_gets_no_forbidden_action() {
        let mut chen = entity("campaign:agent_chen", EntityType::Npc, "Agent Chen");
        chen.attributes.insert(
            "limitations".into(),
            serde_json::json!(["no_netrunning"]),
        );
        let scene = crate::state::model::Scene {
            location: Id::from("campaign:alley"),
            present: vec![Id::from("campaign:agent_chen")],
            time: Map::new(),
            constraints: Map::new(),
            visibility: Default::default(),
            noise: String::new(),
            obscured: vec![],
        };
        let planner =
            planner_with_beats(vec!["Agent Chen remotely disables the implant with a hack"]);
        let mut out = ResolverOutput {
            events: vec![],
            diff: StateDiff::default(),
            rolls: vec![],
        };
        authorize_npc_actions(&planner, &[chen], Some(&scene), &mut out);
        assert!(out.events.is_empty());
    }

    #[test]
    fn npc_actions_cap_at_one_reactive_one_ongoing() {
        let chen = entity("campaign:agent_chen", EntityType::Npc, "Agent Chen");
        let scene = crate::state::model::Scene {
            location: Id::from("campaign:alley"),
            present: vec![Id::from("campaign:agent_chen")],
            time: Map::new(),
            constraints: Map::new(),
            visibility: Default::default(),
            noise: String::new(),
            obscured: vec![],
        };
        let planner = planner_with_beats(vec![
            "Agent Chen steps out of the shadows",
            "Agent Chen keeps pace along the rooftops",
            "Agent Chen also whistles for backup",
        ]);
        let mut out = ResolverOutput {
            events: vec![],
            diff: StateDiff::default(),
            rolls: vec![],
        };
        authorize_npc_actions(&planner, &[chen], Some(&scene), &mut out);
        assert_eq!(out.events.len(), 2);
        assert!(matches!(
            out.events[0],
            EngineEvent::NpcAction { kind: NpcActionKind::Reactive, .. }
        ));
        assert!(matches!(
            out.events[1],
            EngineEvent::NpcAction { kind: NpcActionKind::Ongoing, .. }
        ));
    }

    #[test]
    fn situation_predicate_comes_from_config_and_escalates() {
        let mut system = SystemConfig::default();
        system.resolution_rules.consequences =
            vec!["exposed".into(), "detected".into(), "cornered".into()];
        let store = Store::open_in_memory("campaign:test").unwrap();
        let lore = SceneLore::default();
        let ctx = ResolverContext {
            store: &store,
            system: &system,
            lore: &lore,
            turn: 3,
            seed: 0,
        };
        let subject = Id::from("campaign:pc");
        let active_fact = Fact {
            id: Id::from("campaign:situation_exposed_t1"),
            subject: subject.clone(),
            predicate: "exposed".into(),
            object: Value::Null,
            visibility: Visibility::Witnessed,
            confidence: 1.0,
            tags: vec![SITUATION_TAG.into()],
            discovered_turn: Some(1),
            discovery_method: None,
            origin: Origin::Campaign,
            pack_id: None,
        };
        let mut out = ResolverOutput {
            events: vec![],
            diff: StateDiff::default(),
            rolls: vec![],
        };
        write_situation_fact(&ctx, &subject, &[&active_fact], &[active_fact.clone()], &mut out);
        // "exposed" is already active, so the next consequence lands.
        assert_eq!(out.diff.facts_to_add[0].predicate, "detected");
    }
}
