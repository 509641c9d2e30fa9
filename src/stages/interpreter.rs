use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::json;
use strum_macros::{Display, EnumString};

use crate::context::ContextPacket;
use crate::error::Result;
use crate::gateway::Gateway;
use crate::prompts::PromptRegistry;

/// Closed risk vocabulary. Anything else a model invents fails schema
/// validation at the gateway.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RiskFlag {
    Violence,
    Sensitive,
    Contested,
    Dangerous,
    Pursuit,
    HostilePresent,
}

impl RiskFlag {
    /// Flags that force a roll even for a safe-by-default action category.
    /// A plain `move` under pursuit still gets dice.
    pub fn forces_roll(self) -> bool {
        matches!(
            self,
            RiskFlag::Violence
                | RiskFlag::Contested
                | RiskFlag::Dangerous
                | RiskFlag::Pursuit
                | RiskFlag::HostilePresent
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedAction {
    pub verb: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub details: String,
    pub estimated_minutes: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_item: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterpreterOutput {
    pub intent: String,
    pub referenced_entities: Vec<String>,
    pub proposed_actions: Vec<ProposedAction>,
    pub assumptions: Vec<String>,
    pub risk_flags: Vec<RiskFlag>,
    /// Referenced entities that are not present in the packet; the
    /// validator turns these into perception blocks.
    pub perception_flags: Vec<String>,
}

pub async fn run_interpreter(
    gateway: &Gateway,
    registry: &PromptRegistry,
    pins: &BTreeMap<String, String>,
    packet: &ContextPacket,
    player_input: &str,
) -> Result<InterpreterOutput> {
    let template = registry.pinned("interpreter", pins)?;
    let bag = json!({
        "tone": packet.calibration.tone,
        "player_input": player_input,
        "context": packet,
    });
    let value = gateway.run_structured(template, &bag).await?;
    Ok(serde_json::from_value(value)?)
}
