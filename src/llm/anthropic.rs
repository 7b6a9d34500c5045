use crate::llm::{
    provider_error_message, Completion, CompletionBackend, GatewayError,
    TokenUsage,
};
use crate::models::Provider;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, instrument};

pub const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: i64 = 1024;
const TEMPERATURE: f64 = 0.3;

/// Anthropic messages backend.
pub struct AnthropicBackend {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
}

impl AnthropicBackend {
    pub fn new(http: reqwest::Client, api_base: String, api_key: String) -> Self {
        Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn request_body(model: &str, system_prompt: &str, user_prompt: &str) -> Value {
        serde_json::json!({
            "model": model,
            "max_tokens": MAX_TOKENS,
            "temperature": TEMPERATURE,
            "system": system_prompt,
            "messages": [{
                "role": "user",
                "content": user_prompt
            }]
        })
    }
}

/// Concatenates the text blocks of a messages response.
fn response_text(payload: &Value) -> Option<String> {
    let blocks = payload.get("content").and_then(Value::as_array)?;
    let mut text = String::new();
    for block in blocks {
        if block.get("type").and_then(Value::as_str) == Some("text") {
            if let Some(chunk) = block.get("text").and_then(Value::as_str) {
                text.push_str(chunk);
            }
        }
    }
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

fn response_usage(payload: &Value) -> Option<TokenUsage> {
    let usage = payload.get("usage")?;
    Some(TokenUsage {
        prompt_tokens: usage
            .get("input_tokens")
            .and_then(Value::as_i64)
            .unwrap_or(0),
        completion_tokens: usage
            .get("output_tokens")
            .and_then(Value::as_i64)
            .unwrap_or(0),
    })
}

#[async_trait]
impl CompletionBackend for AnthropicBackend {
    #[instrument(skip(self, system_prompt, user_prompt), err)]
    async fn complete(
        &self,
        model: &str,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<Completion, GatewayError> {
        let url = format!("{}/messages", self.api_base);
        debug!("Sending messages request to {}", url);

        let transport = |e: reqwest::Error| GatewayError::Transport {
            provider: Provider::Anthropic,
            message: e.to_string(),
        };

        let response = self
            .http
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&Self::request_body(model, system_prompt, user_prompt))
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        let body = response.text().await.map_err(transport)?;
        if !status.is_success() {
            return Err(GatewayError::Http {
                provider: Provider::Anthropic,
                status: status.as_u16(),
                message: provider_error_message(
                    Provider::Anthropic,
                    status.as_u16(),
                    &body,
                ),
            });
        }

        let payload: Value = serde_json::from_str(&body).map_err(|e| {
            GatewayError::MalformedResponse {
                provider: Provider::Anthropic,
                message: e.to_string(),
            }
        })?;

        let content = response_text(&payload)
            .ok_or(GatewayError::EmptyResponse(Provider::Anthropic))?;

        Ok(Completion {
            content,
            usage: response_usage(&payload),
        })
    }
}
