pub mod mock;
pub mod openai;

use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::{Duration, Instant, timeout};

use crate::config::EngineSettings;
use crate::error::{GatewayError, Result};
use crate::prompts::PromptTemplate;

pub use mock::MockProvider;
pub use openai::OpenAiProvider;

/// What a provider returns for one structured call.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub content: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Pluggable structured-output backend. One real provider and one mock is
/// the floor; anything that can emit schema-conforming JSON fits here.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn run_structured(
        &self,
        prompt_id: &str,
        system: &str,
        user: &str,
        schema_name: &str,
        schema: &Value,
        model: &str,
    ) -> Result<ProviderResponse>;
}

/// Per-call accounting, recorded for every gateway dispatch.
#[derive(Debug, Clone)]
pub struct CallStat {
    pub prompt_id: String,
    pub prompt_version: String,
    pub attempts: u32,
    pub latency_ms: u128,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

pub struct Gateway {
    provider: Box<dyn ProviderAdapter>,
    settings: EngineSettings,
    stats: Mutex<Vec<CallStat>>,
}

impl Gateway {
    pub fn new(provider: Box<dyn ProviderAdapter>, settings: EngineSettings) -> Self {
        Gateway {
            provider,
            settings,
            stats: Mutex::new(Vec::new()),
        }
    }

    pub fn call_stats(&self) -> Vec<CallStat> {
        self.stats.lock().expect("stats lock poisoned").clone()
    }

    /// Render-dispatch-validate with bounded retries. Each retry appends a
    /// tightened reminder naming what failed; the N-th failure raises a
    /// structured error and the turn aborts.
    pub async fn run_structured(
        &self,
        template: &PromptTemplate,
        input_bag: &Value,
    ) -> Result<Value> {
        let system = template.render(input_bag);
        let base_user = serde_json::to_string_pretty(input_bag)?;
        let deadline = Duration::from_secs(self.settings.gateway_timeout_secs);
        let started = Instant::now();

        let mut last_detail = String::new();
        for attempt in 1..=self.settings.gateway_attempts {
            let user = if attempt == 1 {
                base_user.clone()
            } else {
                format!(
                    "{base_user}\n\nREMINDER: your previous reply was rejected ({last_detail}). \
                     Reply with a single JSON object conforming exactly to the `{}` schema. \
                     No prose, no markdown fences.",
                    template.schema_name
                )
            };

            let response = match timeout(
                deadline,
                self.provider.run_structured(
                    &template.id,
                    &system,
                    &user,
                    &template.schema_name,
                    &template.schema,
                    &self.settings.model,
                ),
            )
            .await
            {
                Ok(result) => result?,
                Err(_) => return Err(GatewayError::Timeout.into()),
            };

            match parse_and_validate(&response.content, &template.schema) {
                Ok(value) => {
                    self.stats.lock().expect("stats lock poisoned").push(CallStat {
                        prompt_id: template.id.clone(),
                        prompt_version: template.version.clone(),
                        attempts: attempt,
                        latency_ms: started.elapsed().as_millis(),
                        prompt_tokens: response.prompt_tokens,
                        completion_tokens: response.completion_tokens,
                    });
                    return Ok(value);
                }
                Err(detail) => {
                    log::warn!(
                        "prompt {} v{} attempt {attempt} rejected: {detail}",
                        template.id,
                        template.version
                    );
                    last_detail = detail;
                }
            }
        }

        Err(GatewayError::SchemaValidation {
            attempts: self.settings.gateway_attempts,
            detail: last_detail,
        }
        .into())
    }
}

fn parse_and_validate(content: &str, schema: &Value) -> std::result::Result<Value, String> {
    // Some models wrap JSON in a fence even in structured mode; strip it
    // before parsing.
    let trimmed = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    let value: Value =
        serde_json::from_str(trimmed).map_err(|e| format!("not valid JSON: {e}"))?;
    validate_schema(schema, &value, "$")?;
    Ok(value)
}

/// Structural validation against the subset of JSON Schema our prompt
/// schemas use: object/array/string/integer/number/boolean types, required
/// properties, enum membership, nested properties and array items.
fn validate_schema(
    schema: &Value,
    value: &Value,
    path: &str,
) -> std::result::Result<(), String> {
    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            return Err(format!("{path}: {value} not in enum"));
        }
        return Ok(());
    }

    let Some(kind) = schema.get("type").and_then(Value::as_str) else {
        return Ok(());
    };
    match kind {
        "object" => {
            let Some(map) = value.as_object() else {
                return Err(format!("{path}: expected object"));
            };
            if let Some(required) = schema.get("required").and_then(Value::as_array) {
                for key in required.iter().filter_map(Value::as_str) {
                    if !map.contains_key(key) {
                        return Err(format!("{path}: missing required property `{key}`"));
                    }
                }
            }
            if let Some(props) = schema.get("properties").and_then(Value::as_object) {
                for (key, prop_schema) in props {
                    if let Some(prop_value) = map.get(key) {
                        if prop_value.is_null() {
                            continue;
                        }
                        validate_schema(prop_schema, prop_value, &format!("{path}.{key}"))?;
                    }
                }
            }
            Ok(())
        }
        "array" => {
            let Some(items) = value.as_array() else {
                return Err(format!("{path}: expected array"));
            };
            if let Some(item_schema) = schema.get("items") {
                for (i, item) in items.iter().enumerate() {
                    validate_schema(item_schema, item, &format!("{path}[{i}]"))?;
                }
            }
            Ok(())
        }
        "string" => value
            .as_str()
            .map(|_| ())
            .ok_or_else(|| format!("{path}: expected string")),
        "integer" => value
            .as_i64()
            .map(|_| ())
            .ok_or_else(|| format!("{path}: expected integer")),
        "number" => value
            .as_f64()
            .map(|_| ())
            .ok_or_else(|| format!("{path}: expected number")),
        "boolean" => value
            .as_bool()
            .map(|_| ())
            .ok_or_else(|| format!("{path}: expected boolean")),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_required_property_is_rejected() {
        let schema = json!({
            "type": "object",
            "required": ["intent"],
            "properties": { "intent": { "type": "string" } }
        });
        assert!(validate_schema(&schema, &json!({}), "$").is_err());
        assert!(validate_schema(&schema, &json!({"intent": "look"}), "$").is_ok());
    }

    #[test]
    fn enum_membership_is_enforced() {
        let schema = json!({ "enum": ["pursuit", "violence"] });
        assert!(validate_schema(&schema, &json!("pursuit"), "$").is_ok());
        assert!(validate_schema(&schema, &json!("stealth"), "$").is_err());
    }

    #[test]
    fn fenced_json_is_stripped() {
        let schema = json!({ "type": "object" });
        let value = parse_and_validate("```json\n{\"a\": 1}\n```", &schema).unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn array_items_are_checked() {
        let schema = json!({
            "type": "array",
            "items": { "type": "string" }
        });
        assert!(validate_schema(&schema, &json!(["a", "b"]), "$").is_ok());
        assert!(validate_schema(&schema, &json!(["a", 3]), "$").is_err());
    }
}
