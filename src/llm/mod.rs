pub mod anthropic;
pub mod fake;
pub mod openai;

use crate::models::{Provider, Verdict};
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Rough upper bound on prompt size accepted before any request is made.
pub const MAX_INPUT_TOKENS: usize = 100_000;

/// Template values shipped in example `.env` files. A key equal to one of
/// these is treated as missing.
const PLACEHOLDER_API_KEYS: [&str; 2] =
    ["your_openai_api_key_here", "your_anthropic_api_key_here"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
}

/// Raw text returned by a provider backend, before verdict parsing.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub content: String,
    pub usage: Option<TokenUsage>,
}

/// A judge's structured answer.
#[derive(Debug, Clone, PartialEq)]
pub struct JudgeReply {
    pub verdict: Verdict,
    pub reasoning: String,
    pub usage: Option<TokenUsage>,
}

/// Failure of a single gateway call. Only rate limiting and server-side
/// faults are worth retrying; everything else is terminal for the unit.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    #[error("{provider} API error ({status}): {message}")]
    Http {
        provider: Provider,
        status: u16,
        message: String,
    },
    #[error("{provider} request failed: {message}")]
    Transport { provider: Provider, message: String },
    #[error("No response from {0}")]
    EmptyResponse(Provider),
    #[error("Failed to parse {provider} response as JSON: {message}")]
    MalformedResponse { provider: Provider, message: String },
    #[error("Invalid response format: missing {0}")]
    MissingField(&'static str),
    #[error("Invalid verdict: {0}")]
    InvalidVerdict(String),
    #[error("{0} API key not configured")]
    NotConfigured(Provider),
    #[error("Input too large: {tokens} tokens (max: {max})")]
    InputTooLarge { tokens: usize, max: usize },
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Http { status, .. } => {
                *status == 429 || *status >= 500
            }
            _ => false,
        }
    }
}

/// One provider's chat endpoint: sends a system + user prompt pair and
/// returns the reply text.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(
        &self,
        model: &str,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<Completion, GatewayError>;
}

/// Sends one judge request and returns its verdict.
///
/// Implementations make at most one remote call per invocation: retries
/// belong to [`crate::retry`], persistence to the caller.
#[async_trait]
pub trait LlmGateway: Send + Sync {
    async fn send(
        &self,
        provider: Provider,
        model: &str,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<JudgeReply, GatewayError>;
}

/// Gateway that dispatches on [`Provider`] to the configured backends.
pub struct ProviderGateway {
    openai: Option<Arc<dyn CompletionBackend>>,
    anthropic: Option<Arc<dyn CompletionBackend>>,
}

impl ProviderGateway {
    pub fn new(
        openai: Option<Arc<dyn CompletionBackend>>,
        anthropic: Option<Arc<dyn CompletionBackend>>,
    ) -> Self {
        Self { openai, anthropic }
    }

    fn backend(
        &self,
        provider: Provider,
    ) -> Result<&Arc<dyn CompletionBackend>, GatewayError> {
        let backend = match provider {
            Provider::OpenAI => self.openai.as_ref(),
            Provider::Anthropic => self.anthropic.as_ref(),
        };
        backend.ok_or(GatewayError::NotConfigured(provider))
    }
}

#[async_trait]
impl LlmGateway for ProviderGateway {
    #[instrument(skip(self, system_prompt, user_prompt), err)]
    async fn send(
        &self,
        provider: Provider,
        model: &str,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<JudgeReply, GatewayError> {
        let tokens = estimate_tokens(system_prompt) + estimate_tokens(user_prompt);
        if tokens > MAX_INPUT_TOKENS {
            return Err(GatewayError::InputTooLarge {
                tokens,
                max: MAX_INPUT_TOKENS,
            });
        }

        let backend = self.backend(provider)?;
        let completion =
            backend.complete(model, system_prompt, user_prompt).await?;
        debug!(
            "Received {} characters from {}",
            completion.content.len(),
            provider
        );

        let mut reply = parse_judge_reply(provider, &completion.content)?;
        reply.usage = completion.usage;
        Ok(reply)
    }
}

/// Roughly four characters per token.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

fn fenced_json_regex() -> &'static Regex {
    static FENCED_JSON: OnceLock<Regex> = OnceLock::new();
    FENCED_JSON.get_or_init(|| {
        Regex::new(r"(?s)```json[ \t]*\r?\n(.*?)\r?\n?```")
            .expect("fenced json pattern is valid")
    })
}

/// Returns the body of the first fenced ```json block, or the whole text
/// when there is none.
pub fn extract_json_payload(text: &str) -> &str {
    fenced_json_regex()
        .captures(text)
        .and_then(|captures| captures.get(1))
        .map(|body| body.as_str())
        .unwrap_or(text)
        .trim()
}

/// Parses a model reply into a verdict and its reasoning.
pub fn parse_judge_reply(
    provider: Provider,
    content: &str,
) -> Result<JudgeReply, GatewayError> {
    if content.trim().is_empty() {
        return Err(GatewayError::EmptyResponse(provider));
    }

    let payload: Value = serde_json::from_str(extract_json_payload(content))
        .map_err(|e| GatewayError::MalformedResponse {
            provider,
            message: e.to_string(),
        })?;

    let verdict = payload
        .get("verdict")
        .and_then(Value::as_str)
        .filter(|v| !v.trim().is_empty())
        .ok_or(GatewayError::MissingField("verdict"))?;
    let verdict = verdict
        .parse::<Verdict>()
        .map_err(|_| GatewayError::InvalidVerdict(verdict.to_string()))?;

    let reasoning = payload
        .get("reasoning")
        .and_then(Value::as_str)
        .filter(|r| !r.trim().is_empty())
        .ok_or(GatewayError::MissingField("reasoning"))?;

    Ok(JudgeReply {
        verdict,
        reasoning: reasoning.to_string(),
        usage: None,
    })
}

/// Connection settings for the real provider backends.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub openai_api_key: Option<String>,
    pub openai_api_base: String,
    pub anthropic_api_key: Option<String>,
    pub anthropic_api_base: String,
    pub request_timeout: Duration,
}

fn usable_api_key(key: Option<String>) -> Option<String> {
    key.map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty() && !PLACEHOLDER_API_KEYS.contains(&k.as_str()))
}

/// Builds a [`ProviderGateway`] with a backend for every provider that has
/// a usable API key.
pub fn create_gateway(
    config: GatewayConfig,
) -> anyhow::Result<Arc<dyn LlmGateway>> {
    let http = reqwest::Client::builder()
        .timeout(config.request_timeout)
        .build()?;

    let openai = usable_api_key(config.openai_api_key).map(|key| {
        info!("OpenAI backend enabled at {}", config.openai_api_base);
        Arc::new(openai::OpenAIBackend::new(
            http.clone(),
            config.openai_api_base.clone(),
            key,
        )) as Arc<dyn CompletionBackend>
    });
    if openai.is_none() {
        warn!("OpenAI API key not configured; OpenAI judges will fail");
    }

    let anthropic = usable_api_key(config.anthropic_api_key).map(|key| {
        info!("Anthropic backend enabled at {}", config.anthropic_api_base);
        Arc::new(anthropic::AnthropicBackend::new(
            http.clone(),
            config.anthropic_api_base.clone(),
            key,
        )) as Arc<dyn CompletionBackend>
    });
    if anthropic.is_none() {
        warn!("Anthropic API key not configured; Anthropic judges will fail");
    }

    Ok(Arc::new(ProviderGateway::new(openai, anthropic)))
}

/// Pulls `error.message` out of a provider error body, falling back to a
/// generic status message.
pub(crate) fn provider_error_message(
    provider: Provider,
    status: u16,
    body: &str,
) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| format!("{} API error: {}", provider, status))
}
