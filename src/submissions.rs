use crate::models::{Answer, NewSubmission, Question, Submission};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum UploadError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),
    #[error("Invalid JSON format. Expected an array of submissions.")]
    NotAnArray,
    #[error("Submission {index}: field `{field}` {problem}")]
    InvalidField {
        index: usize,
        field: &'static str,
        problem: &'static str,
    },
    #[error("Submission {index}: question {question}: {message}")]
    InvalidQuestion {
        index: usize,
        question: usize,
        message: String,
    },
    #[error("Submission {index}: answer for `{question_id}`: {message}")]
    InvalidAnswer {
        index: usize,
        question_id: String,
        message: String,
    },
}

/// Questions arrive either flat or wrapped in a revision envelope.
#[derive(Deserialize)]
#[serde(untagged)]
enum QuestionWire {
    Versioned {
        #[allow(dead_code)]
        rev: Option<i64>,
        data: Question,
    },
    Flat(Question),
}

impl From<QuestionWire> for Question {
    fn from(wire: QuestionWire) -> Self {
        match wire {
            QuestionWire::Versioned { data, .. } => data,
            QuestionWire::Flat(question) => question,
        }
    }
}

fn required_string(
    item: &Map<String, Value>,
    index: usize,
    field: &'static str,
) -> Result<String, UploadError> {
    match item.get(field) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::String(_)) => Err(UploadError::InvalidField {
            index,
            field,
            problem: "must not be empty",
        }),
        Some(_) => Err(UploadError::InvalidField {
            index,
            field,
            problem: "must be a string",
        }),
        None => Err(UploadError::InvalidField {
            index,
            field,
            problem: "is missing",
        }),
    }
}

fn required_timestamp(
    item: &Map<String, Value>,
    index: usize,
) -> Result<i64, UploadError> {
    const FIELD: &str = "createdAt";
    let value = item.get(FIELD).ok_or(UploadError::InvalidField {
        index,
        field: FIELD,
        problem: "is missing",
    })?;
    let millis = value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f as i64))
        .ok_or(UploadError::InvalidField {
            index,
            field: FIELD,
            problem: "must be a number",
        })?;
    if millis == 0 {
        return Err(UploadError::InvalidField {
            index,
            field: FIELD,
            problem: "must not be zero",
        });
    }
    Ok(millis)
}

fn parse_questions(
    item: &Map<String, Value>,
    index: usize,
) -> Result<Vec<Question>, UploadError> {
    let raw = match item.get("questions") {
        Some(Value::Array(raw)) => raw,
        Some(_) => {
            return Err(UploadError::InvalidField {
                index,
                field: "questions",
                problem: "must be an array",
            })
        }
        None => {
            return Err(UploadError::InvalidField {
                index,
                field: "questions",
                problem: "is missing",
            })
        }
    };

    raw.iter()
        .enumerate()
        .map(|(question, value)| {
            QuestionWire::deserialize(value)
                .map(Question::from)
                .map_err(|_| UploadError::InvalidQuestion {
                    index,
                    question,
                    message: "expected {id, questionType, questionText}"
                        .to_string(),
                })
        })
        .collect()
}

fn parse_answers(
    item: &Map<String, Value>,
    index: usize,
) -> Result<HashMap<String, Answer>, UploadError> {
    let raw = match item.get("answers") {
        Some(Value::Object(raw)) => raw,
        Some(_) => {
            return Err(UploadError::InvalidField {
                index,
                field: "answers",
                problem: "must be an object",
            })
        }
        None => {
            return Err(UploadError::InvalidField {
                index,
                field: "answers",
                problem: "is missing",
            })
        }
    };

    // A null answer is the same as no answer.
    raw.iter()
        .filter(|(_, value)| !value.is_null())
        .map(|(question_id, value)| {
            Answer::deserialize(value)
                .map(|answer| (question_id.clone(), answer))
                .map_err(|e| UploadError::InvalidAnswer {
                    index,
                    question_id: question_id.clone(),
                    message: e.to_string(),
                })
        })
        .collect()
}

/// Validates an uploaded JSON document and converts it into submissions
/// ready to store.
///
/// The first structural problem found is reported with the index of the
/// offending element, so nothing is stored from a partially valid upload.
pub fn parse_submission_upload(
    text: &str,
) -> Result<Vec<NewSubmission>, UploadError> {
    let document: Value = serde_json::from_str(text)
        .map_err(|e| UploadError::InvalidJson(e.to_string()))?;
    let items = document.as_array().ok_or(UploadError::NotAnArray)?;

    items
        .iter()
        .enumerate()
        .map(|(index, value)| {
            let item = value.as_object().ok_or(UploadError::InvalidField {
                index,
                field: "submission",
                problem: "must be an object",
            })?;
            Ok(NewSubmission {
                source_id: required_string(item, index, "id")?,
                queue_id: required_string(item, index, "queueId")?,
                labeling_task_id: required_string(
                    item,
                    index,
                    "labelingTaskId",
                )?,
                created_at: required_timestamp(item, index)?,
                questions: parse_questions(item, index)?,
                answers: parse_answers(item, index)?,
            })
        })
        .collect()
}

/// Distinct queue ids, sorted.
pub fn unique_queue_ids(submissions: &[Submission]) -> Vec<String> {
    submissions
        .iter()
        .map(|s| s.queue_id.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Distinct questions asked in a queue. The first definition of a
/// question id wins.
pub fn questions_for_queue(
    submissions: &[Submission],
    queue_id: &str,
) -> Vec<Question> {
    let mut seen = HashSet::new();
    submissions
        .iter()
        .filter(|s| s.queue_id == queue_id)
        .flat_map(|s| s.questions.iter())
        .filter(|q| seen.insert(q.id.clone()))
        .cloned()
        .collect()
}
