use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::config::{CostVector, DangerLevel, ResolutionRules};
use crate::context::ContextPacket;
use crate::error::Result;
use crate::ids::Id;
use crate::stages::interpreter::{InterpreterOutput, ProposedAction};
use crate::state::model::{Entity, EntityType, Fact, InventoryEntry, Scene, Visibility};
use crate::state::Store;

/// Verbs a character can take on instinct without perceiving the cause.
/// "Duck into cover" works without naming the sniper; naming the sniper
/// does not.
const INSTINCTIVE_VERBS: &[&str] = &["duck", "dodge", "hide", "take_cover", "freeze", "drop", "run"];

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BlockReason {
    UnknownEntity,
    EntityNotInScene,
    MissingItem,
    ContradictsFact,
    PerceptionBlocked,
    CapabilityExceeded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowedAction {
    pub action: ProposedAction,
    /// Provisional: applied on attempt, not only on success.
    pub cost: CostVector,
    pub danger: DangerLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockedAction {
    pub action: ProposedAction,
    pub reason: BlockReason,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorOutput {
    pub allowed_actions: Vec<AllowedAction>,
    pub blocked_actions: Vec<BlockedAction>,
    pub clarification_needed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clarification_question: Option<String>,
}

struct ValidationState {
    entities: Vec<Entity>,
    facts: Vec<Fact>,
    inventory: Vec<InventoryEntry>,
    scene: Option<Scene>,
    pc: Option<Entity>,
}

/// Deterministic rule engine over the interpreter's proposal. Rules run in
/// a fixed order; the first violation blocks the action with its reason.
/// Blocked actions are normal output, not errors.
pub fn validate(
    interpreter: &InterpreterOutput,
    store: &Store,
    packet: &ContextPacket,
    rules: &ResolutionRules,
) -> Result<ValidatorOutput> {
    let entities = store.entities()?;
    let pc = entities
        .iter()
        .find(|e| e.entity_type == EntityType::Pc)
        .cloned();
    let state = ValidationState {
        facts: store.facts()?,
        inventory: pc
            .as_ref()
            .map(|pc| store.inventory_for(&pc.id))
            .transpose()?
            .unwrap_or_default(),
        scene: store.scene()?,
        entities,
        pc,
    };

    let mut output = ValidatorOutput {
        allowed_actions: Vec::new(),
        blocked_actions: Vec::new(),
        clarification_needed: false,
        clarification_question: None,
    };

    for action in &interpreter.proposed_actions {
        match check_action(action, interpreter, &state, packet) {
            Ok(()) => output.allowed_actions.push(AllowedAction {
                action: action.clone(),
                cost: rules.cost_for_category(&action.verb),
                danger: rules.danger_for_category(&action.verb),
            }),
            Err((reason, detail)) => output.blocked_actions.push(BlockedAction {
                action: action.clone(),
                reason,
                detail,
            }),
        }
    }

    // At most one question per turn, and only when it would change the
    // resolution: if anything went through, resolve that instead of asking.
    if output.allowed_actions.is_empty() {
        if let Some(blocked) = output.blocked_actions.iter().find(|b| {
            matches!(
                b.reason,
                BlockReason::PerceptionBlocked | BlockReason::UnknownEntity
            )
        }) {
            output.clarification_needed = true;
            output.clarification_question = Some(format!(
                "What makes you think you need to {}?",
                blocked.action.verb.replace('_', " ")
            ));
        }
    }

    Ok(output)
}

fn check_action(
    action: &ProposedAction,
    interpreter: &InterpreterOutput,
    state: &ValidationState,
    packet: &ContextPacket,
) -> std::result::Result<(), (BlockReason, String)> {
    let perception_flagged = |raw: &str| {
        interpreter
            .perception_flags
            .iter()
            .any(|flag| flag == raw || Id::from(flag.as_str()).local() == Id::from(raw).local())
    };

    let target = action.target.as_deref();

    // 1. Presence: every referenced entity must exist.
    let target_entity = match target {
        Some(raw) => {
            let id = resolve_id(raw, &state.entities);
            match id.and_then(|id| state.entities.iter().find(|e| e.id == id)) {
                Some(entity) => Some(entity),
                None if perception_flagged(raw) => {
                    return Err((
                        BlockReason::PerceptionBlocked,
                        format!("nothing perceived matches `{raw}`"),
                    ));
                }
                None => {
                    return Err((
                        BlockReason::UnknownEntity,
                        format!("`{raw}` does not exist"),
                    ));
                }
            }
        }
        None => None,
    };

    // 2. Location: the action must be feasible from here. An absent target
    // the player has no discovered facts about also fails rule 4 here:
    // naming it asserts knowledge the character does not have.
    if let Some(entity) = target_entity {
        let in_scene = state
            .scene
            .as_ref()
            .map(|s| {
                s.present.contains(&entity.id)
                    || s.location == entity.id
                    || s.adjacent_locations().contains(&entity.id)
            })
            .unwrap_or(false);
        let carried = state.inventory.iter().any(|i| i.item == entity.id);
        if !in_scene && !carried {
            if perception_flagged(entity.id.as_str()) || perception_flagged(entity.id.local()) {
                return Err((
                    BlockReason::PerceptionBlocked,
                    format!("{} is not perceivable from here", entity.name),
                ));
            }
            // An entity the player has no discovered facts about is not
            // merely elsewhere, it was never introduced at all.
            if !introduced(entity, state) {
                return Err((
                    BlockReason::ContradictsFact,
                    format!("{} has never come up in play", entity.name),
                ));
            }
            return Err((
                BlockReason::EntityNotInScene,
                format!("{} is not in the current scene", entity.name),
            ));
        }
    }

    // 3. Inventory: required items must be owned and unflagged.
    if let Some(required) = &action.requires_item {
        let id = resolve_id(required, &state.entities);
        let entry = id.and_then(|id| state.inventory.iter().find(|i| i.item == id));
        match entry {
            Some(entry) if entry.quantity > 0 && entry.usable() => {}
            Some(_) => {
                return Err((
                    BlockReason::MissingItem,
                    format!("`{required}` is not usable"),
                ));
            }
            None => {
                return Err((
                    BlockReason::MissingItem,
                    format!("`{required}` is not carried"),
                ));
            }
        }
    }

    // 5. Perception: an entity standing in the scene but absent from the
    // packet is obscured; naming it relies on information the character
    // does not have. Instinctive reactions that name nothing ("duck into
    // cover") never reach this rule.
    if let Some(entity) = target_entity {
        let in_scene = state
            .scene
            .as_ref()
            .map(|s| s.present.contains(&entity.id))
            .unwrap_or(false);
        if in_scene
            && !packet.entity_present(&entity.id)
            && !INSTINCTIVE_VERBS.contains(&action.verb.as_str())
        {
            return Err((
                BlockReason::PerceptionBlocked,
                format!("{} cannot be perceived right now", entity.name),
            ));
        }
    }

    // 6. Capability: the character's own declared limitations bind too.
    if let Some(pc) = &state.pc {
        let blocked_verb = format!("no_{}", action.verb);
        if pc.limitations().iter().any(|l| l == &blocked_verb) {
            return Err((
                BlockReason::CapabilityExceeded,
                format!("{} cannot {}", pc.name, action.verb),
            ));
        }
    }

    Ok(())
}

/// Accept either a fully namespaced id or a bare local id that matches
/// exactly one known entity.
fn resolve_id(raw: &str, entities: &[Entity]) -> Option<Id> {
    let direct = Id::from(raw);
    if entities.iter().any(|e| e.id == direct) {
        return Some(direct);
    }
    let mut matches = entities.iter().filter(|e| e.id.local() == raw);
    match (matches.next(), matches.next()) {
        (Some(entity), None) => Some(entity.id.clone()),
        _ => None,
    }
}

/// An entity is introduced once any fact about it is player-visible, it
/// stands in the scene, or it sits in someone's inventory.
fn introduced(entity: &Entity, state: &ValidationState) -> bool {
    if entity.entity_type == EntityType::Pc {
        return true;
    }
    if state
        .scene
        .as_ref()
        .map(|s| s.present.contains(&entity.id) || s.location == entity.id)
        .unwrap_or(false)
    {
        return true;
    }
    if state.inventory.iter().any(|i| i.item == entity.id) {
        return true;
    }
    state
        .facts
        .iter()
        .any(|f| f.subject == entity.id && f.visibility != Visibility::World)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Calibration;
    use crate::config::EngineSettings;
    use crate::ids::Origin;
    use crate::lore::scene_cache::SceneLore;
    use crate::state::diff::StateDiff;
    use crate::state::model::SceneVisibility;
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

    fn seeded_store() -> Store {
        let mut store = Store::open_in_memory("campaign:test").unwrap();
        let mut diff = StateDiff::default();
        diff.entities_to_add = vec![
            entity("campaign:pc", EntityType::Pc, "Riley"),
            entity("campaign:alley", EntityType::Location, "Service Alley"),
            entity("campaign:sniper_01", EntityType::Npc, "Sniper"),
            entity("campaign:agent_chen", EntityType::Npc, "Agent Chen"),
        ];
        diff.scene_replacement = Some(Scene {
            location: Id::from("campaign:alley"),
            present: vec![Id::from("campaign:pc"), Id::from("campaign:agent_chen")],
            time: Map::new(),
            constraints: Map::new(),
            visibility: SceneVisibility::Normal,
            noise: "quiet".into(),
            obscured: vec![],
        });
        store.apply_state_diff(&diff).unwrap();
        store
    }

    fn packet_for(store: &Store) -> ContextPacket {
        crate::context::build_context(
            store,
            &SceneLore::default(),
            &Calibration::default(),
            &EngineSettings::default(),
        )
        .unwrap()
    }

    fn interpreter_with(actions: Vec<ProposedAction>, flags: Vec<String>) -> InterpreterOutput {
        InterpreterOutput {
            intent: "test".into(),
            referenced_entities: vec![],
            proposed_actions: actions,
            assumptions: vec![],
            risk_flags: vec![],
            perception_flags: flags,
        }
    }

    fn action(verb: &str, target: Option<&str>) -> ProposedAction {
        ProposedAction {
            verb: verb.into(),
            target: target.map(str::to_string),
            details: String::new(),
            estimated_minutes: 1,
            requires_item: None,
        }
    }

    #[test]
    fn unknown_target_blocks_with_unknown_entity() {
        let store = seeded_store();
        let packet = packet_for(&store);
        let interp = interpreter_with(vec![action("ask", Some("campaign:viktor"))], vec![]);
        let out = validate(&interp, &store, &packet, &ResolutionRules::default()).unwrap();
        assert_eq!(out.blocked_actions[0].reason, BlockReason::UnknownEntity);
    }

    #[test]
    fn unperceived_existing_entity_blocks_with_perception() {
        let store = seeded_store();
        let packet = packet_for(&store);
        // sniper_01 exists but is not in the scene and the interpreter
        // flagged it as unperceived.
        let interp = interpreter_with(
            vec![action("duck", Some("campaign:sniper_01"))],
            vec!["campaign:sniper_01".into()],
        );
        let out = validate(&interp, &store, &packet, &ResolutionRules::default()).unwrap();
        assert_eq!(out.blocked_actions[0].reason, BlockReason::PerceptionBlocked);
        assert!(out.clarification_needed);
        assert_eq!(
            out.clarification_question.as_deref(),
            Some("What makes you think you need to duck?")
        );
    }

    #[test]
    fn missing_item_blocks() {
        let store = seeded_store();
        let packet = packet_for(&store);
        let mut act = action("unlock", Some("campaign:agent_chen"));
        act.requires_item = Some("campaign:keycard".into());
        let interp = interpreter_with(vec![act], vec![]);
        let out = validate(&interp, &store, &packet, &ResolutionRules::default()).unwrap();
        assert_eq!(out.blocked_actions[0].reason, BlockReason::MissingItem);
    }

    #[test]
    fn present_npc_can_be_engaged_and_gets_a_cost() {
        let store = seeded_store();
        let packet = packet_for(&store);
        let yaml = r#"
action_costs:
  talk: { time: 1 }
"#;
        let rules: ResolutionRules = serde_yaml::from_str(yaml).unwrap();
        let interp = interpreter_with(vec![action("talk", Some("campaign:agent_chen"))], vec![]);
        let out = validate(&interp, &store, &packet, &rules).unwrap();
        assert_eq!(out.allowed_actions.len(), 1);
        assert_eq!(out.allowed_actions[0].cost.get("time"), Some(&1));
        assert!(!out.clarification_needed);
    }

    #[test]
    fn no_question_when_an_action_survives() {
        let store = seeded_store();
        let packet = packet_for(&store);
        let interp = interpreter_with(
            vec![
                action("talk", Some("campaign:agent_chen")),
                action("ask", Some("campaign:viktor")),
            ],
            vec![],
        );
        let out = validate(&interp, &store, &packet, &ResolutionRules::default()).unwrap();
        assert_eq!(out.allowed_actions.len(), 1);
        assert_eq!(out.blocked_actions.len(), 1);
        assert!(!out.clarification_needed);
    }
}
