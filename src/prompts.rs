use std::collections::{BTreeMap, HashMap};

use serde_json::{Value, json};

use crate::error::{EngineError, Result};

/// A versioned prompt: template text with `{{named_slots}}`, plus the JSON
/// schema its output must conform to. Campaigns pin one version per id.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    pub id: String,
    pub version: String,
    pub text: String,
    pub schema_name: String,
    pub schema: Value,
}

impl PromptTemplate {
    /// Substitute `{{slot}}` markers from the top level of the input bag.
    /// String values substitute verbatim, everything else as JSON.
    pub fn render(&self, bag: &Value) -> String {
        let mut out = self.text.clone();
        if let Some(map) = bag.as_object() {
            for (key, value) in map {
                let marker = format!("{{{{{key}}}}}");
                if !out.contains(&marker) {
                    continue;
                }
                let replacement = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                out = out.replace(&marker, &replacement);
            }
        }
        out
    }
}

/// Read-only at play time. New versions are added here out of band;
/// campaigns choose which version of each id they run.
pub struct PromptRegistry {
    prompts: HashMap<(String, String), PromptTemplate>,
}

impl PromptRegistry {
    pub fn builtin() -> Self {
        let mut registry = PromptRegistry {
            prompts: HashMap::new(),
        };
        registry.register("interpreter", "v1", INTERPRETER_PREAMBLE, "interpreter_output", interpreter_schema());
        registry.register("planner", "v1", PLANNER_PREAMBLE, "planner_output", planner_schema());
        registry.register("narrator", "v1", NARRATOR_PREAMBLE, "narrator_output", narrator_schema());
        registry.register("narrator", "v2", NARRATOR_PREAMBLE_V2, "narrator_output", narrator_schema());
        registry.register("recap", "v1", RECAP_PREAMBLE, "recap_output", recap_schema());
        registry
    }

    fn register(&mut self, id: &str, version: &str, text: &str, schema_name: &str, schema: Value) {
        self.prompts.insert(
            (id.to_string(), version.to_string()),
            PromptTemplate {
                id: id.to_string(),
                version: version.to_string(),
                text: text.to_string(),
                schema_name: schema_name.to_string(),
                schema,
            },
        );
    }

    pub fn get(&self, id: &str, version: &str) -> Result<&PromptTemplate> {
        self.prompts
            .get(&(id.to_string(), version.to_string()))
            .ok_or_else(|| {
                if self.prompts.keys().any(|(known, _)| known == id) {
                    EngineError::UnknownPromptVersion {
                        id: id.to_string(),
                        version: version.to_string(),
                    }
                    .into()
                } else {
                    EngineError::UnknownPrompt(id.to_string()).into()
                }
            })
    }

    /// Resolve a pinned version for the id, falling back to the default pin.
    pub fn pinned<'a>(
        &'a self,
        id: &str,
        pins: &BTreeMap<String, String>,
    ) -> Result<&'a PromptTemplate> {
        let version = pins
            .get(id)
            .cloned()
            .unwrap_or_else(|| default_version(id));
        self.get(id, &version)
    }
}

fn default_version(_id: &str) -> String {
    "v1".to_string()
}

pub fn default_pins() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("interpreter".to_string(), "v1".to_string()),
        ("planner".to_string(), "v1".to_string()),
        ("narrator".to_string(), "v1".to_string()),
        ("recap".to_string(), "v1".to_string()),
    ])
}

const INTERPRETER_PREAMBLE: &str = r#"
# System Prompt — Interpreter

You read one raw player input against the current context packet and emit a
conservative, structured interpretation. You never decide outcomes and you
never invent facts.

## Rules

1. Interpret conservatively: only reference entities that appear in the
   context packet, or flag them in `perception_flags` if the player names
   something the character has no way of perceiving.
2. Propose one to three concrete actions (verb, target id, details,
   estimated minutes). Use the smallest set that covers the input.
3. Do not repeat a search of anything listed under `investigated`.
4. Set `risk_flags` only from the closed vocabulary: violence, sensitive,
   contested, dangerous, pursuit, hostile_present. Set `pursuit` or
   `hostile_present` whenever `pending_threats` or hostile present entities
   indicate so, even if the player's wording is casual.
5. Flag metagame references (rules talk, out-of-fiction requests) in
   `assumptions` rather than inventing in-fiction readings.

Campaign tone: {{tone}}.

Reply with a single JSON object conforming to the `interpreter_output`
schema. No prose outside JSON.
"#;

const PLANNER_PREAMBLE: &str = r#"
# System Prompt — Planner

You turn the validator's verdict into dramatic direction for the narrator.
You never decide mechanical outcomes; the resolver has already rolled by
the time your beats are used.

## Rules

1. Produce one to three ordered beats. Each beat is one concrete dramatic
   development grounded in the context packet.
2. Pick exactly one tension move from the closed palette:
   reveal_unwelcome_truth, show_approaching_threat, put_in_a_spot,
   offer_opportunity_with_cost, use_up_resource, turn_move_back,
   separate, foreshadow_consequence, escalate, introduce_npc_agenda.
3. If the validator already asked a clarification question, leave
   `clarification_question` empty. Never ask a second question.
4. Suggest two or three short next actions the player might take.
5. Honor `active_situations` and blocked actions: beats must not undo or
   contradict them.

Campaign tone: {{tone}}.

Reply with a single JSON object conforming to the `planner_output` schema.
"#;

const NARRATOR_PREAMBLE: &str = r#"
# System Prompt — Narrator

You are the only voice the player hears. You narrate exactly what the
engine resolved, in second person, present tense.

## Hard rules

1. Honor every engine event verbatim in meaning: a reported failure stays
   a failure, a reported success stays a success. Never soften or invert
   an outcome state.
2. Describe only what the player character can perceive. Entities absent
   from the packet do not exist for you.
3. Active situations (exposed, detected, cornered and kin) are real and
   present; your prose must reflect them this turn.
4. NPCs act strictly within the authorized actions you are given: at most
   one reactive and one ongoing action each, nothing outside their
   capability notes.
5. Items found by a successful search are picked up without ceremony
   unless the engine says otherwise.
6. New facts you establish go into `established_facts`; new people and
   objects into `introduced_npcs` / `introduced_items` with short local
   ids. If the scene moves, fill `scene_transition`.
7. End with `next_prompt`: one open question handing control back.

Campaign tone: {{tone}}. Risk level: {{risk}}.

Reply with a single JSON object conforming to the `narrator_output` schema.
"#;

const NARRATOR_PREAMBLE_V2: &str = r#"
# System Prompt — Narrator (v2)

You are the only voice the player hears. Narrate what the engine resolved
in second person, present tense, in tight sensory prose: two short
paragraphs at most, concrete nouns, no summary sentences.

## Hard rules

1. Honor every engine event in meaning: failures stay failures, successes
   stay successes. Never soften or invert an outcome state.
2. Describe only what the player character can perceive.
3. Active situations are in force; surface them this turn.
4. NPCs act only within the authorized actions provided, at most one
   reactive and one ongoing action each.
5. Search finds are picked up implicitly unless the engine says otherwise.
6. Record new facts in `established_facts`, new people and objects in
   `introduced_npcs` / `introduced_items`, moves in `scene_transition`.
7. Close with `next_prompt`: one open question, player in control.

Campaign tone: {{tone}}. Risk level: {{risk}}.

Reply with a single JSON object conforming to the `narrator_output` schema.
"#;

const RECAP_PREAMBLE: &str = r#"
# System Prompt — Recap

Write a "previously on" recap from the prior session's summaries: three or
four sentences, past tense, ending on the open question the table left
hanging. Mention only events present in the summaries.

Reply with a single JSON object conforming to the `recap_output` schema.
"#;

fn interpreter_schema() -> Value {
    json!({
        "type": "object",
        "required": ["intent", "referenced_entities", "proposed_actions", "assumptions",
                     "risk_flags", "perception_flags"],
        "properties": {
            "intent": { "type": "string" },
            "referenced_entities": { "type": "array", "items": { "type": "string" } },
            "proposed_actions": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["verb", "details", "estimated_minutes"],
                    "properties": {
                        "verb": { "type": "string" },
                        "target": { "type": "string" },
                        "details": { "type": "string" },
                        "estimated_minutes": { "type": "integer" },
                        "requires_item": { "type": "string" }
                    }
                }
            },
            "assumptions": { "type": "array", "items": { "type": "string" } },
            "risk_flags": {
                "type": "array",
                "items": { "enum": ["violence", "sensitive", "contested", "dangerous",
                                     "pursuit", "hostile_present"] }
            },
            "perception_flags": { "type": "array", "items": { "type": "string" } }
        }
    })
}

fn planner_schema() -> Value {
    json!({
        "type": "object",
        "required": ["beats", "tension_move", "tension_move_type", "next_suggestions"],
        "properties": {
            "beats": { "type": "array", "items": { "type": "string" } },
            "tension_move": { "type": "string" },
            "tension_move_type": {
                "enum": ["reveal_unwelcome_truth", "show_approaching_threat", "put_in_a_spot",
                         "offer_opportunity_with_cost", "use_up_resource", "turn_move_back",
                         "separate", "foreshadow_consequence", "escalate",
                         "introduce_npc_agenda"]
            },
            "clarification_question": { "type": "string" },
            "next_suggestions": { "type": "array", "items": { "type": "string" } }
        }
    })
}

fn narrator_schema() -> Value {
    json!({
        "type": "object",
        "required": ["final_text", "next_prompt", "suggested_actions", "established_facts",
                     "introduced_items", "introduced_npcs", "thread_updates"],
        "properties": {
            "final_text": { "type": "string" },
            "next_prompt": { "type": "string" },
            "suggested_actions": { "type": "array", "items": { "type": "string" } },
            "established_facts": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["subject", "predicate", "detail"],
                    "properties": {
                        "subject": { "type": "string" },
                        "predicate": { "type": "string" },
                        "detail": { "type": "string" }
                    }
                }
            },
            "introduced_items": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["local_id", "name"],
                    "properties": {
                        "local_id": { "type": "string" },
                        "name": { "type": "string" },
                        "description": { "type": "string" }
                    }
                }
            },
            "introduced_npcs": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["local_id", "name"],
                    "properties": {
                        "local_id": { "type": "string" },
                        "name": { "type": "string" },
                        "description": { "type": "string" }
                    }
                }
            },
            "scene_transition": {
                "type": "object",
                "required": ["location"],
                "properties": {
                    "location": { "type": "string" },
                    "description": { "type": "string" },
                    "present": { "type": "array", "items": { "type": "string" } }
                }
            },
            "thread_updates": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["thread", "status"],
                    "properties": {
                        "thread": { "type": "string" },
                        "status": { "enum": ["open", "advancing", "resolved", "failed"] }
                    }
                }
            }
        }
    })
}

fn recap_schema() -> Value {
    json!({
        "type": "object",
        "required": ["recap"],
        "properties": { "recap": { "type": "string" } }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_substitute_from_the_bag() {
        let registry = PromptRegistry::builtin();
        let template = registry.get("narrator", "v1").unwrap();
        let rendered = template.render(&json!({ "tone": "noir", "risk": "high" }));
        assert!(rendered.contains("Campaign tone: noir. Risk level: high."));
        assert!(!rendered.contains("{{tone}}"));
    }

    #[test]
    fn unknown_version_is_distinguished_from_unknown_id() {
        let registry = PromptRegistry::builtin();
        assert!(matches!(
            registry.get("narrator", "v9"),
            Err(crate::error::Error::Engine(
                EngineError::UnknownPromptVersion { .. }
            ))
        ));
        assert!(matches!(
            registry.get("bard", "v1"),
            Err(crate::error::Error::Engine(EngineError::UnknownPrompt(_)))
        ));
    }

    #[test]
    fn pins_override_the_default_version() {
        let registry = PromptRegistry::builtin();
        let mut pins = default_pins();
        pins.insert("narrator".to_string(), "v2".to_string());
        let template = registry.pinned("narrator", &pins).unwrap();
        assert_eq!(template.version, "v2");
    }
}
