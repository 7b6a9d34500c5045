use crate::models::{Evaluation, Verdict};
use anyhow::{anyhow, Context, Result};
use chrono::{SecondsFormat, TimeZone, Utc};
use serde::Serialize;
use tracing::instrument;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationStats {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub inconclusive: usize,
    /// Whole-number percentage of evaluations that passed.
    pub pass_rate: u32,
}

impl EvaluationStats {
    pub fn from_evaluations(evaluations: &[Evaluation]) -> Self {
        let mut stats = EvaluationStats {
            total: evaluations.len(),
            ..Default::default()
        };
        for evaluation in evaluations {
            match evaluation.verdict {
                Verdict::Pass => stats.passed += 1,
                Verdict::Fail => stats.failed += 1,
                Verdict::Inconclusive => stats.inconclusive += 1,
            }
        }
        if stats.total > 0 {
            stats.pass_rate =
                (stats.passed as f64 / stats.total as f64 * 100.0).round() as u32;
        }
        stats
    }
}

pub const CSV_HEADERS: [&str; 13] = [
    "Submission ID",
    "Queue ID",
    "Question ID",
    "Judge Name",
    "Judge ID",
    "Provider",
    "Model",
    "Verdict",
    "Reasoning",
    "Created At",
    "Latency (ms)",
    "Prompt Tokens",
    "Completion Tokens",
];

fn format_timestamp(millis: i64) -> String {
    Utc.timestamp_millis_opt(millis)
        .single()
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(|| millis.to_string())
}

fn optional_number(value: Option<i64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Renders evaluations as CSV, one row per evaluation in the order given.
#[instrument(skip(evaluations), fields(count = evaluations.len()), err)]
pub fn export_evaluations_csv(evaluations: &[Evaluation]) -> Result<String> {
    if evaluations.is_empty() {
        return Err(anyhow!("No evaluations to export"));
    }

    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(CSV_HEADERS)?;

    for evaluation in evaluations {
        let created_at = format_timestamp(evaluation.created_at);
        let latency = evaluation.metadata.latency.to_string();
        let prompt_tokens = optional_number(evaluation.metadata.prompt_tokens);
        let completion_tokens =
            optional_number(evaluation.metadata.completion_tokens);
        writer.write_record([
            evaluation.submission_id.as_str(),
            evaluation.queue_id.as_str(),
            evaluation.question_id.as_str(),
            evaluation.judge_name.as_str(),
            evaluation.judge_id.as_str(),
            evaluation.metadata.provider.as_str(),
            evaluation.metadata.model_used.as_str(),
            evaluation.verdict.as_str(),
            evaluation.reasoning.as_str(),
            created_at.as_str(),
            latency.as_str(),
            prompt_tokens.as_str(),
            completion_tokens.as_str(),
        ])?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| anyhow!("Failed to flush CSV: {}", e))?;
    String::from_utf8(bytes).context("CSV output was not valid UTF-8")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EvaluationMetadata;
    use pretty_assertions::assert_eq;

    fn evaluation(verdict: Verdict, reasoning: &str) -> Evaluation {
        Evaluation {
            id: "eval-1".to_string(),
            submission_id: "sub-1".to_string(),
            queue_id: "queue-1".to_string(),
            question_id: "q1".to_string(),
            judge_id: "judge-1".to_string(),
            judge_name: "Strict, but fair".to_string(),
            verdict,
            reasoning: reasoning.to_string(),
            created_at: 1_700_000_000_000,
            metadata: EvaluationMetadata {
                model_used: "gpt-4".to_string(),
                provider: "openai".to_string(),
                latency: 812,
                error: None,
                prompt_tokens: Some(150),
                completion_tokens: None,
            },
        }
    }

    #[test]
    fn stats_round_pass_rate() {
        let evaluations = vec![
            evaluation(Verdict::Pass, "a"),
            evaluation(Verdict::Pass, "b"),
            evaluation(Verdict::Fail, "c"),
        ];
        assert_eq!(
            EvaluationStats::from_evaluations(&evaluations),
            EvaluationStats {
                total: 3,
                passed: 2,
                failed: 1,
                inconclusive: 0,
                pass_rate: 67,
            }
        );
    }

    #[test]
    fn stats_of_nothing_are_zero() {
        assert_eq!(
            EvaluationStats::from_evaluations(&[]),
            EvaluationStats::default()
        );
    }

    #[test]
    fn csv_escapes_and_formats_fields() {
        let csv = export_evaluations_csv(&[evaluation(
            Verdict::Fail,
            "Said \"maybe\"\nthen left",
        )])
        .unwrap();

        let mut reader = csv::Reader::from_reader(csv.as_bytes());
        let headers: Vec<String> =
            reader.headers().unwrap().iter().map(String::from).collect();
        assert_eq!(headers, CSV_HEADERS);

        let rows: Vec<csv::StringRecord> =
            reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(&row[3], "Strict, but fair");
        assert_eq!(&row[7], "fail");
        assert_eq!(&row[8], "Said \"maybe\"\nthen left");
        assert_eq!(&row[9], "2023-11-14T22:13:20.000Z");
        assert_eq!(&row[10], "812");
        assert_eq!(&row[11], "150");
        assert_eq!(&row[12], "");
    }

    #[test]
    fn refuses_to_export_nothing() {
        let err = export_evaluations_csv(&[]).unwrap_err();
        assert_eq!(err.to_string(), "No evaluations to export");
    }
}
