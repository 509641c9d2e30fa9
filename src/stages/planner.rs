use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::json;
use strum_macros::{Display, EnumString};

use crate::context::ContextPacket;
use crate::error::Result;
use crate::gateway::Gateway;
use crate::prompts::PromptRegistry;
use crate::validator::ValidatorOutput;

/// The closed tension-move palette.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TensionMove {
    RevealUnwelcomeTruth,
    ShowApproachingThreat,
    PutInASpot,
    OfferOpportunityWithCost,
    UseUpResource,
    TurnMoveBack,
    Separate,
    ForeshadowConsequence,
    Escalate,
    IntroduceNpcAgenda,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerOutput {
    /// One to three ordered beats.
    pub beats: Vec<String>,
    pub tension_move: String,
    pub tension_move_type: TensionMove,
    /// Empty when the validator already set one; the planner defers.
    #[serde(default)]
    pub clarification_question: Option<String>,
    pub next_suggestions: Vec<String>,
}

pub async fn run_planner(
    gateway: &Gateway,
    registry: &PromptRegistry,
    pins: &BTreeMap<String, String>,
    packet: &ContextPacket,
    validator: &ValidatorOutput,
) -> Result<PlannerOutput> {
    let template = registry.pinned("planner", pins)?;
    let bag = json!({
        "tone": packet.calibration.tone,
        "context": packet,
        "validator": validator,
    });
    let value = gateway.run_structured(template, &bag).await?;
    let mut output: PlannerOutput = serde_json::from_value(value)?;
    output.beats.truncate(3);
    // The validator owns the one question per turn.
    if validator.clarification_needed {
        output.clarification_question = None;
    }
    Ok(output)
}
