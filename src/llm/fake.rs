use async_trait::async_trait;
use std::sync::Mutex;

use crate::llm::{GatewayError, JudgeReply, LlmGateway};
use crate::models::{Provider, Verdict};

/// A request as seen by [`FakeGateway`].
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayRequest {
    pub provider: Provider,
    pub model: String,
    pub system_prompt: String,
    pub user_prompt: String,
}

/// A fake gateway for testing
///
/// Scripted outcomes are handed out in order, one per call; once the
/// script runs out every call succeeds with a `pass` verdict. Every
/// request is recorded for verification.
///
/// # Example
///
/// ```
/// use judgeflow::llm::fake::FakeGateway;
/// use judgeflow::llm::LlmGateway;
/// use judgeflow::models::{Provider, Verdict};
///
/// #[tokio::main]
/// async fn main() {
///     let gateway = FakeGateway::new()
///         .with_http_error(429)
///         .with_reply(Verdict::Fail, "Off topic");
///
///     let first = gateway
///         .send(Provider::OpenAI, "gpt-4", "rubric", "prompt")
///         .await;
///     assert!(first.unwrap_err().is_retryable());
///
///     let second = gateway
///         .send(Provider::OpenAI, "gpt-4", "rubric", "prompt")
///         .await
///         .unwrap();
///     assert_eq!(second.verdict, Verdict::Fail);
///     assert_eq!(gateway.request_count(), 2);
/// }
/// ```
pub struct FakeGateway {
    responses: Mutex<Vec<Result<JudgeReply, GatewayError>>>,
    // Track requests for verification in tests
    pub requests: Mutex<Vec<GatewayRequest>>,
}

impl Default for FakeGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeGateway {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(vec![]),
            requests: Mutex::new(vec![]),
        }
    }

    /// Queue a successful reply
    pub fn with_reply(self, verdict: Verdict, reasoning: &str) -> Self {
        self.responses.lock().unwrap().push(Ok(JudgeReply {
            verdict,
            reasoning: reasoning.to_string(),
            usage: None,
        }));
        self
    }

    /// Queue an arbitrary failure
    pub fn with_error(self, error: GatewayError) -> Self {
        self.responses.lock().unwrap().push(Err(error));
        self
    }

    /// Queue a provider HTTP failure with the given status
    pub fn with_http_error(self, status: u16) -> Self {
        self.with_error(GatewayError::Http {
            provider: Provider::OpenAI,
            status,
            message: format!("fake status {}", status),
        })
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Models requested so far, in call order.
    pub fn requested_models(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.model.clone())
            .collect()
    }
}

#[async_trait]
impl LlmGateway for FakeGateway {
    async fn send(
        &self,
        provider: Provider,
        model: &str,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<JudgeReply, GatewayError> {
        self.requests.lock().unwrap().push(GatewayRequest {
            provider,
            model: model.to_string(),
            system_prompt: system_prompt.to_string(),
            user_prompt: user_prompt.to_string(),
        });

        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Ok(JudgeReply {
                verdict: Verdict::Pass,
                reasoning: "Fake default reasoning".to_string(),
                usage: None,
            })
        } else {
            responses.remove(0)
        }
    }
}
