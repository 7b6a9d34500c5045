use crate::models::{Answer, Question};

/// Rendered in place of an answer field the submitter left empty.
pub const MISSING_FIELD_PLACEHOLDER: &str = "N/A";

/// Closing instruction block of every judge prompt. Reply parsing in the
/// gateway relies on the model answering with exactly this JSON shape.
pub const JUDGE_RESPONSE_INSTRUCTIONS: &str = r####"Evaluate this answer according to the rubric provided in the system prompt.

Respond in JSON format:
{
  "verdict": "pass" | "fail" | "inconclusive",
  "reasoning": "Brief explanation of your verdict"
}"####;

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

/// Renders the user prompt sent to a judge for one question/answer pair.
///
/// The choice falls back to a placeholder, and the reasoning falls back
/// to the free-text answer and then to a placeholder.
pub fn build_user_prompt(question: &Question, answer: &Answer) -> String {
    let choice =
        non_empty(&answer.choice).unwrap_or(MISSING_FIELD_PLACEHOLDER);
    let reasoning = non_empty(&answer.reasoning)
        .or_else(|| non_empty(&answer.freeform_text))
        .unwrap_or(MISSING_FIELD_PLACEHOLDER);

    format!(
        "QUESTION:\n{}\n\nUSER'S ANSWER:\nChoice: {}\nReasoning: {}\n\n{}",
        question.question_text, choice, reasoning, JUDGE_RESPONSE_INSTRUCTIONS
    )
    .trim()
    .to_string()
}
