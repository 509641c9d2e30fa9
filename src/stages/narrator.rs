use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::context::ContextPacket;
use crate::error::Result;
use crate::gateway::Gateway;
use crate::prompts::PromptRegistry;
use crate::stages::planner::PlannerOutput;
use crate::state::model::{EngineEvent, ThreadStatus};
use crate::validator::BlockedAction;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstablishedFact {
    pub subject: String,
    pub predicate: String,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntroducedEntity {
    /// Bare local id; the commit step namespaces it under `campaign:`.
    pub local_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneTransition {
    pub location: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub present: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NarratorThreadUpdate {
    pub thread: String,
    pub status: ThreadStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NarratorOutput {
    pub final_text: String,
    pub next_prompt: String,
    pub suggested_actions: Vec<String>,
    /// Persisted post-commit, after re-validation against known facts.
    pub established_facts: Vec<EstablishedFact>,
    pub introduced_items: Vec<IntroducedEntity>,
    pub introduced_npcs: Vec<IntroducedEntity>,
    #[serde(default)]
    pub scene_transition: Option<SceneTransition>,
    pub thread_updates: Vec<NarratorThreadUpdate>,
}

impl NarratorOutput {
    /// A bare question turn: used when the validator short-circuits the
    /// pipeline with its one clarification.
    pub fn clarification(question: &str) -> Self {
        NarratorOutput {
            final_text: question.to_string(),
            next_prompt: question.to_string(),
            suggested_actions: vec![],
            established_facts: vec![],
            introduced_items: vec![],
            introduced_npcs: vec![],
            scene_transition: None,
            thread_updates: vec![],
        }
    }
}

pub async fn run_narrator(
    gateway: &Gateway,
    registry: &PromptRegistry,
    pins: &BTreeMap<String, String>,
    packet: &ContextPacket,
    engine_events: &[EngineEvent],
    planner: &PlannerOutput,
    blocked: &[BlockedAction],
    clarification: Option<&str>,
) -> Result<NarratorOutput> {
    let template = registry.pinned("narrator", pins)?;
    let bag = json!({
        "tone": packet.calibration.tone,
        "risk": packet.calibration.risk,
        "context": packet,
        "engine_events": engine_events,
        "planner": planner,
        "blocked_actions": blocked,
        "clarification_question": clarification,
    });
    let value = gateway.run_structured(template, &bag).await?;
    Ok(serde_json::from_value(value)?)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecapOutput {
    pub recap: String,
}

/// Session-start "previously on", fed by the prior session's summaries.
pub async fn run_recap(
    gateway: &Gateway,
    registry: &PromptRegistry,
    pins: &BTreeMap<String, String>,
    summaries: &[String],
) -> Result<String> {
    let template = registry.pinned("recap", pins)?;
    let bag = json!({ "summaries": summaries });
    let value = gateway.run_structured(template, &bag).await?;
    let output: RecapOutput = serde_json::from_value(value)?;
    Ok(output.recap)
}
