use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs, ResponseFormat, ResponseFormatJsonSchema,
    },
};
use async_trait::async_trait;
use serde_json::Value;

use crate::error::{GatewayError, Result};
use crate::gateway::{ProviderAdapter, ProviderResponse};

/// The real provider: OpenAI chat completions in structured-output mode.
pub struct OpenAiProvider {
    client: Client<OpenAIConfig>,
}

impl OpenAiProvider {
    pub fn new(api_key: String) -> Self {
        let config = OpenAIConfig::new().with_api_key(api_key);
        OpenAiProvider {
            client: Client::with_config(config),
        }
    }

    /// Reads `OPENAI_API_KEY` from the environment.
    pub fn from_env() -> Self {
        OpenAiProvider {
            client: Client::new(),
        }
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiProvider {
    async fn run_structured(
        &self,
        _prompt_id: &str,
        system: &str,
        user: &str,
        schema_name: &str,
        schema: &Value,
        model: &str,
    ) -> Result<ProviderResponse> {
        let response_format = ResponseFormat::JsonSchema {
            json_schema: ResponseFormatJsonSchema {
                description: None,
                name: schema_name.to_string(),
                schema: Some(schema.clone()),
                strict: Some(true),
            },
        };

        let request = CreateChatCompletionRequestArgs::default()
            .model(model)
            .messages([
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(system)
                    .build()?
                    .into(),
                ChatCompletionRequestUserMessageArgs::default()
                    .content(user)
                    .build()?
                    .into(),
            ])
            .response_format(response_format)
            .build()?;

        let response = self.client.chat().create(request).await?;
        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or(GatewayError::NoMessageFound)?;
        let (prompt_tokens, completion_tokens) = response
            .usage
            .map(|u| (u.prompt_tokens, u.completion_tokens))
            .unwrap_or((0, 0));

        Ok(ProviderResponse {
            content,
            prompt_tokens,
            completion_tokens,
        })
    }
}
