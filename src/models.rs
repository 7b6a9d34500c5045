use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Milliseconds since the Unix epoch, the timestamp unit used for every
/// record in the store.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// LLM backend a judge is served by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAI,
    Anthropic,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAI => "openai",
            Provider::Anthropic => "anthropic",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Provider::OpenAI),
            "anthropic" => Ok(Provider::Anthropic),
            other => Err(anyhow::anyhow!("Unknown provider: {}", other)),
        }
    }
}

/// Three-valued outcome of a single evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Pass,
    Fail,
    Inconclusive,
}

impl Verdict {
    pub const ALL: [Verdict; 3] =
        [Verdict::Pass, Verdict::Fail, Verdict::Inconclusive];

    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Pass => "pass",
            Verdict::Fail => "fail",
            Verdict::Inconclusive => "inconclusive",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verdict {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pass" => Ok(Verdict::Pass),
            "fail" => Ok(Verdict::Fail),
            "inconclusive" => Ok(Verdict::Inconclusive),
            other => Err(anyhow::anyhow!("Unknown verdict: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Judge {
    pub id: String,
    pub name: String,
    pub system_prompt: String,
    pub model_name: String,
    pub provider: Provider,
    pub active: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Fields supplied by the user when creating a judge. New judges start
/// active.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewJudge {
    pub name: String,
    pub system_prompt: String,
    pub model_name: String,
    pub provider: Provider,
}

fn require_text(field: &str, value: &str) -> anyhow::Result<()> {
    if value.trim().is_empty() {
        return Err(anyhow::anyhow!("Judge {} must not be empty", field));
    }
    Ok(())
}

impl NewJudge {
    pub fn validate(&self) -> anyhow::Result<()> {
        require_text("name", &self.name)?;
        require_text("system prompt", &self.system_prompt)?;
        require_text("model name", &self.model_name)
    }
}

/// Partial update of a judge's mutable fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JudgeUpdate {
    pub name: Option<String>,
    pub system_prompt: Option<String>,
    pub model_name: Option<String>,
    pub provider: Option<Provider>,
}

impl JudgeUpdate {
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(name) = &self.name {
            require_text("name", name)?;
        }
        if let Some(system_prompt) = &self.system_prompt {
            require_text("system prompt", system_prompt)?;
        }
        if let Some(model_name) = &self.model_name {
            require_text("model name", model_name)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    pub id: String,
    pub question_type: String,
    pub question_text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Answer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choice: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freeform_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_options: Option<Vec<String>>,
}

/// A submission as it arrives in an upload, before the store assigns it
/// an id of its own.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSubmission {
    pub source_id: String,
    pub queue_id: String,
    pub labeling_task_id: String,
    pub created_at: i64,
    pub questions: Vec<Question>,
    pub answers: HashMap<String, Answer>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub id: String,
    pub source_id: String,
    pub queue_id: String,
    pub labeling_task_id: String,
    pub created_at: i64,
    pub uploaded_at: i64,
    pub questions: Vec<Question>,
    pub answers: HashMap<String, Answer>,
}

impl Submission {
    /// The answer recorded for a question, if any.
    pub fn answer_for(&self, question_id: &str) -> Option<&Answer> {
        self.answers.get(question_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JudgeAssignment {
    pub id: String,
    pub queue_id: String,
    pub question_id: String,
    pub judge_ids: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationMetadata {
    pub model_used: String,
    pub provider: String,
    /// Duration of the final gateway attempt, in milliseconds.
    pub latency: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<i64>,
}

/// An evaluation about to be written. Evaluations are append-only, so
/// there is no update counterpart.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvaluation {
    pub submission_id: String,
    pub queue_id: String,
    pub question_id: String,
    pub judge_id: String,
    pub judge_name: String,
    pub verdict: Verdict,
    pub reasoning: String,
    pub created_at: i64,
    pub metadata: EvaluationMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    pub id: String,
    pub submission_id: String,
    pub queue_id: String,
    pub question_id: String,
    pub judge_id: String,
    pub judge_name: String,
    pub verdict: Verdict,
    pub reasoning: String,
    pub created_at: i64,
    pub metadata: EvaluationMetadata,
}

/// Narrows an evaluation listing. Empty lists mean "no constraint".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationFilter {
    pub queue_id: Option<String>,
    #[serde(default)]
    pub judge_ids: Vec<String>,
    #[serde(default)]
    pub question_ids: Vec<String>,
    #[serde(default)]
    pub verdicts: Vec<Verdict>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(anyhow::anyhow!("Unknown run status: {}", other)),
        }
    }
}

/// History record of one orchestrator run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationRun {
    pub id: String,
    pub queue_id: String,
    pub status: RunStatus,
    pub total_evaluations: i64,
    pub completed_evaluations: i64,
    pub failed_evaluations: i64,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub error: Option<String>,
}
