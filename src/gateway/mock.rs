use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{GatewayError, Result};
use crate::gateway::{ProviderAdapter, ProviderResponse};

/// Test double: canned JSON per prompt id. Queued responses drain in order;
/// when the queue for a prompt id is empty the sticky default (if any) is
/// returned forever. Replay uses this to feed recorded outputs back through
/// the pipeline.
#[derive(Default)]
pub struct MockProvider {
    queues: Mutex<HashMap<String, VecDeque<Value>>>,
    defaults: Mutex<HashMap<String, Value>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one response for a prompt id; consumed in FIFO order.
    pub fn push(&self, prompt_id: &str, response: Value) {
        self.queues
            .lock()
            .expect("mock queues lock poisoned")
            .entry(prompt_id.to_string())
            .or_default()
            .push_back(response);
    }

    /// Sticky fallback returned whenever the queue for the id runs dry.
    pub fn set_default(&self, prompt_id: &str, response: Value) {
        self.defaults
            .lock()
            .expect("mock defaults lock poisoned")
            .insert(prompt_id.to_string(), response);
    }
}

/// Tests hold an `Arc<MockProvider>` so they can keep queueing responses
/// after the gateway has taken ownership of its copy.
#[async_trait]
impl ProviderAdapter for std::sync::Arc<MockProvider> {
    async fn run_structured(
        &self,
        prompt_id: &str,
        system: &str,
        user: &str,
        schema_name: &str,
        schema: &Value,
        model: &str,
    ) -> Result<ProviderResponse> {
        self.as_ref()
            .run_structured(prompt_id, system, user, schema_name, schema, model)
            .await
    }
}

#[async_trait]
impl ProviderAdapter for MockProvider {
    async fn run_structured(
        &self,
        prompt_id: &str,
        _system: &str,
        _user: &str,
        _schema_name: &str,
        _schema: &Value,
        _model: &str,
    ) -> Result<ProviderResponse> {
        let queued = self
            .queues
            .lock()
            .expect("mock queues lock poisoned")
            .get_mut(prompt_id)
            .and_then(VecDeque::pop_front);
        let response = match queued {
            Some(value) => value,
            None => self
                .defaults
                .lock()
                .expect("mock defaults lock poisoned")
                .get(prompt_id)
                .cloned()
                .ok_or(GatewayError::NoMessageFound)?,
        };
        Ok(ProviderResponse {
            content: response.to_string(),
            prompt_tokens: 0,
            completion_tokens: 0,
        })
    }
}
