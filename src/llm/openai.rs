use crate::llm::{
    provider_error_message, Completion, CompletionBackend, GatewayError,
    TokenUsage,
};
use crate::models::Provider;
use async_openai::types::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequest,
    CreateChatCompletionRequestArgs, CreateChatCompletionResponse,
    ResponseFormat,
};
use async_trait::async_trait;
use tracing::{debug, instrument};

const TEMPERATURE: f32 = 0.3;

/// OpenAI chat-completions backend.
///
/// Requests and responses use the `async-openai` wire types, but are sent
/// through a plain `reqwest` client so the HTTP status is visible for
/// retry classification and no retry happens behind the caller's back.
pub struct OpenAIBackend {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
}

impl OpenAIBackend {
    pub fn new(http: reqwest::Client, api_base: String, api_key: String) -> Self {
        Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn build_request(
        model: &str,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<CreateChatCompletionRequest, GatewayError> {
        let invalid = |e: async_openai::error::OpenAIError| {
            GatewayError::MalformedResponse {
                provider: Provider::OpenAI,
                message: format!("Failed to build request: {}", e),
            }
        };

        let system_message = ChatCompletionRequestMessage::System(
            ChatCompletionRequestSystemMessageArgs::default()
                .content(system_prompt)
                .build()
                .map_err(invalid)?,
        );
        let user_message = ChatCompletionRequestMessage::User(
            ChatCompletionRequestUserMessageArgs::default()
                .content(user_prompt)
                .build()
                .map_err(invalid)?,
        );

        CreateChatCompletionRequestArgs::default()
            .model(model)
            .messages([system_message, user_message])
            .temperature(TEMPERATURE)
            .response_format(ResponseFormat::JsonObject)
            .build()
            .map_err(invalid)
    }
}

#[async_trait]
impl CompletionBackend for OpenAIBackend {
    #[instrument(skip(self, system_prompt, user_prompt), err)]
    async fn complete(
        &self,
        model: &str,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<Completion, GatewayError> {
        let request = Self::build_request(model, system_prompt, user_prompt)?;
        let url = format!("{}/chat/completions", self.api_base);
        debug!("Sending chat completion request to {}", url);

        let transport = |e: reqwest::Error| GatewayError::Transport {
            provider: Provider::OpenAI,
            message: e.to_string(),
        };

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        let body = response.text().await.map_err(transport)?;
        if !status.is_success() {
            return Err(GatewayError::Http {
                provider: Provider::OpenAI,
                status: status.as_u16(),
                message: provider_error_message(
                    Provider::OpenAI,
                    status.as_u16(),
                    &body,
                ),
            });
        }

        let parsed: CreateChatCompletionResponse = serde_json::from_str(&body)
            .map_err(|e| GatewayError::MalformedResponse {
                provider: Provider::OpenAI,
                message: e.to_string(),
            })?;

        let content = parsed
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .filter(|content| !content.trim().is_empty())
            .ok_or(GatewayError::EmptyResponse(Provider::OpenAI))?;

        let usage = parsed.usage.map(|usage| TokenUsage {
            prompt_tokens: i64::from(usage.prompt_tokens),
            completion_tokens: i64::from(usage.completion_tokens),
        });

        Ok(Completion { content, usage })
    }
}
