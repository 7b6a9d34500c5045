use crate::models::{
    now_millis, Evaluation, EvaluationFilter, EvaluationMetadata,
    EvaluationRun, Judge, JudgeAssignment, JudgeUpdate, NewEvaluation,
    NewJudge, NewSubmission, RunStatus, Submission,
};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::str::FromStr;
use tracing::{info, instrument};

/// Final counters written back to a run record.
#[derive(Debug, Clone, PartialEq)]
pub struct RunCompletion {
    pub status: RunStatus,
    pub completed: usize,
    pub failed: usize,
    pub error: Option<String>,
}

/// Persistence used by the evaluation workflow.
///
/// Every call is treated as a remote operation that may fail; callers do
/// not retry them.
#[async_trait]
pub trait Store: Send + Sync {
    async fn upload_submissions(
        &self,
        submissions: Vec<NewSubmission>,
    ) -> Result<Vec<Submission>>;
    async fn get_submissions(
        &self,
        queue_id: Option<&str>,
    ) -> Result<Vec<Submission>>;
    async fn get_submission(&self, id: &str) -> Result<Option<Submission>>;

    async fn create_judge(&self, judge: NewJudge) -> Result<Judge>;
    async fn get_judges(&self) -> Result<Vec<Judge>>;
    async fn get_judge(&self, id: &str) -> Result<Option<Judge>>;
    async fn update_judge(&self, id: &str, update: JudgeUpdate) -> Result<Judge>;
    async fn set_judge_active(&self, id: &str, active: bool) -> Result<Judge>;

    /// Creates or replaces the judge list for `(queue_id, question_id)`.
    async fn save_assignment(
        &self,
        queue_id: &str,
        question_id: &str,
        judge_ids: Vec<String>,
    ) -> Result<JudgeAssignment>;
    async fn get_assignments(&self, queue_id: &str)
        -> Result<Vec<JudgeAssignment>>;

    /// Appends an evaluation. Never overwrites an earlier one.
    async fn save_evaluation(&self, evaluation: NewEvaluation)
        -> Result<Evaluation>;
    async fn get_evaluations(
        &self,
        filter: &EvaluationFilter,
    ) -> Result<Vec<Evaluation>>;

    async fn create_run(&self, queue_id: &str, total: usize)
        -> Result<EvaluationRun>;
    async fn finish_run(&self, run_id: &str, completion: RunCompletion)
        -> Result<()>;
    async fn get_runs(&self, queue_id: &str) -> Result<Vec<EvaluationRun>>;
}

/// Removes repeated judge ids, keeping the first occurrence of each.
pub fn dedupe_judge_ids<I>(judge_ids: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut seen = HashSet::new();
    judge_ids
        .into_iter()
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = anyhow::Error>,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())
    })
}

fn json_column<T: DeserializeOwned>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
    })
}

const JUDGE_COLUMNS: &str = "id, name, system_prompt, model_name, provider, active, created_at, updated_at";

fn judge_from_row(row: &Row<'_>) -> rusqlite::Result<Judge> {
    Ok(Judge {
        id: row.get(0)?,
        name: row.get(1)?,
        system_prompt: row.get(2)?,
        model_name: row.get(3)?,
        provider: parse_column(row, 4)?,
        active: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

const SUBMISSION_COLUMNS: &str = "id, source_id, queue_id, labeling_task_id, created_at, uploaded_at, questions, answers";

fn submission_from_row(row: &Row<'_>) -> rusqlite::Result<Submission> {
    Ok(Submission {
        id: row.get(0)?,
        source_id: row.get(1)?,
        queue_id: row.get(2)?,
        labeling_task_id: row.get(3)?,
        created_at: row.get(4)?,
        uploaded_at: row.get(5)?,
        questions: json_column(row, 6)?,
        answers: json_column(row, 7)?,
    })
}

const ASSIGNMENT_COLUMNS: &str =
    "id, queue_id, question_id, judge_ids, created_at, updated_at";

fn assignment_from_row(row: &Row<'_>) -> rusqlite::Result<JudgeAssignment> {
    Ok(JudgeAssignment {
        id: row.get(0)?,
        queue_id: row.get(1)?,
        question_id: row.get(2)?,
        judge_ids: json_column(row, 3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

const EVALUATION_COLUMNS: &str = "id, submission_id, queue_id, question_id, judge_id, judge_name, verdict, reasoning, created_at, model_used, provider, latency_ms, error, prompt_tokens, completion_tokens";

fn evaluation_from_row(row: &Row<'_>) -> rusqlite::Result<Evaluation> {
    Ok(Evaluation {
        id: row.get(0)?,
        submission_id: row.get(1)?,
        queue_id: row.get(2)?,
        question_id: row.get(3)?,
        judge_id: row.get(4)?,
        judge_name: row.get(5)?,
        verdict: parse_column(row, 6)?,
        reasoning: row.get(7)?,
        created_at: row.get(8)?,
        metadata: EvaluationMetadata {
            model_used: row.get(9)?,
            provider: row.get(10)?,
            latency: row.get(11)?,
            error: row.get(12)?,
            prompt_tokens: row.get(13)?,
            completion_tokens: row.get(14)?,
        },
    })
}

const RUN_COLUMNS: &str = "id, queue_id, status, total_evaluations, completed_evaluations, failed_evaluations, started_at, completed_at, error";

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<EvaluationRun> {
    Ok(EvaluationRun {
        id: row.get(0)?,
        queue_id: row.get(1)?,
        status: parse_column(row, 2)?,
        total_evaluations: row.get(3)?,
        completed_evaluations: row.get(4)?,
        failed_evaluations: row.get(5)?,
        started_at: row.get(6)?,
        completed_at: row.get(7)?,
        error: row.get(8)?,
    })
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

/// [`Store`] backed by the SQLite database in [`crate::AppState`].
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteStore {
    pub fn new(pool: Pool<SqliteConnectionManager>) -> Self {
        Self { pool }
    }

    fn fetch_judge(&self, id: &str) -> Result<Option<Judge>> {
        let conn = self.pool.get()?;
        let judge = conn
            .query_row(
                &format!("SELECT {} FROM judges WHERE id = ?", JUDGE_COLUMNS),
                params![id],
                judge_from_row,
            )
            .optional()?;
        Ok(judge)
    }
}

#[async_trait]
impl Store for SqliteStore {
    #[instrument(skip(self, submissions), fields(count = submissions.len()), err)]
    async fn upload_submissions(
        &self,
        submissions: Vec<NewSubmission>,
    ) -> Result<Vec<Submission>> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let uploaded_at = now_millis();
        let mut stored = Vec::with_capacity(submissions.len());

        for submission in submissions {
            let stored_submission = Submission {
                id: new_id(),
                source_id: submission.source_id,
                queue_id: submission.queue_id,
                labeling_task_id: submission.labeling_task_id,
                created_at: submission.created_at,
                uploaded_at,
                questions: submission.questions,
                answers: submission.answers,
            };
            tx.execute(
                &format!(
                    "INSERT INTO submissions ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                    SUBMISSION_COLUMNS
                ),
                params![
                    stored_submission.id,
                    stored_submission.source_id,
                    stored_submission.queue_id,
                    stored_submission.labeling_task_id,
                    stored_submission.created_at,
                    stored_submission.uploaded_at,
                    serde_json::to_string(&stored_submission.questions)?,
                    serde_json::to_string(&stored_submission.answers)?,
                ],
            )?;
            stored.push(stored_submission);
        }

        tx.commit()?;
        info!("Uploaded {} submission(s)", stored.len());
        Ok(stored)
    }

    #[instrument(skip(self), err)]
    async fn get_submissions(
        &self,
        queue_id: Option<&str>,
    ) -> Result<Vec<Submission>> {
        let conn = self.pool.get()?;
        let submissions = match queue_id {
            Some(queue_id) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM submissions WHERE queue_id = ? ORDER BY rowid",
                    SUBMISSION_COLUMNS
                ))?;
                let rows = stmt.query_map(params![queue_id], submission_from_row)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM submissions ORDER BY rowid",
                    SUBMISSION_COLUMNS
                ))?;
                let rows = stmt.query_map([], submission_from_row)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(submissions)
    }

    async fn get_submission(&self, id: &str) -> Result<Option<Submission>> {
        let conn = self.pool.get()?;
        let submission = conn
            .query_row(
                &format!(
                    "SELECT {} FROM submissions WHERE id = ?",
                    SUBMISSION_COLUMNS
                ),
                params![id],
                submission_from_row,
            )
            .optional()?;
        Ok(submission)
    }

    #[instrument(skip(self, judge), fields(name = %judge.name), err)]
    async fn create_judge(&self, judge: NewJudge) -> Result<Judge> {
        judge.validate()?;

        let now = now_millis();
        let created = Judge {
            id: new_id(),
            name: judge.name.trim().to_string(),
            system_prompt: judge.system_prompt,
            model_name: judge.model_name.trim().to_string(),
            provider: judge.provider,
            active: true,
            created_at: now,
            updated_at: now,
        };

        let conn = self.pool.get()?;
        conn.execute(
            &format!(
                "INSERT INTO judges ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                JUDGE_COLUMNS
            ),
            params![
                created.id,
                created.name,
                created.system_prompt,
                created.model_name,
                created.provider.as_str(),
                created.active,
                created.created_at,
                created.updated_at,
            ],
        )?;

        info!("Created judge {} ({})", created.name, created.id);
        Ok(created)
    }

    async fn get_judges(&self) -> Result<Vec<Judge>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM judges ORDER BY created_at, rowid",
            JUDGE_COLUMNS
        ))?;
        let judges = stmt.query_map([], judge_from_row)?;
        Ok(judges.collect::<Result<Vec<_>, _>>()?)
    }

    async fn get_judge(&self, id: &str) -> Result<Option<Judge>> {
        self.fetch_judge(id)
    }

    #[instrument(skip(self, update), err)]
    async fn update_judge(&self, id: &str, update: JudgeUpdate) -> Result<Judge> {
        update.validate()?;
        let mut judge = self
            .fetch_judge(id)?
            .ok_or_else(|| anyhow!("Judge not found: {}", id))?;

        if let Some(name) = update.name {
            judge.name = name.trim().to_string();
        }
        if let Some(system_prompt) = update.system_prompt {
            judge.system_prompt = system_prompt;
        }
        if let Some(model_name) = update.model_name {
            judge.model_name = model_name.trim().to_string();
        }
        if let Some(provider) = update.provider {
            judge.provider = provider;
        }
        judge.updated_at = now_millis();

        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE judges
             SET name = ?, system_prompt = ?, model_name = ?, provider = ?, updated_at = ?
             WHERE id = ?",
            params![
                judge.name,
                judge.system_prompt,
                judge.model_name,
                judge.provider.as_str(),
                judge.updated_at,
                judge.id,
            ],
        )?;
        Ok(judge)
    }

    #[instrument(skip(self), err)]
    async fn set_judge_active(&self, id: &str, active: bool) -> Result<Judge> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE judges SET active = ?, updated_at = ? WHERE id = ?",
            params![active, now_millis(), id],
        )?;
        if changed == 0 {
            return Err(anyhow!("Judge not found: {}", id));
        }
        drop(conn);

        self.fetch_judge(id)?
            .ok_or_else(|| anyhow!("Judge not found: {}", id))
    }

    #[instrument(skip(self, judge_ids), fields(judges = judge_ids.len()), err)]
    async fn save_assignment(
        &self,
        queue_id: &str,
        question_id: &str,
        judge_ids: Vec<String>,
    ) -> Result<JudgeAssignment> {
        let judge_ids = dedupe_judge_ids(judge_ids);
        let now = now_millis();

        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO judge_assignments
                (id, queue_id, question_id, judge_ids, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(queue_id, question_id) DO UPDATE SET
                judge_ids = excluded.judge_ids,
                updated_at = excluded.updated_at",
            params![
                new_id(),
                queue_id,
                question_id,
                serde_json::to_string(&judge_ids)?,
                now,
                now,
            ],
        )?;

        let assignment = conn.query_row(
            &format!(
                "SELECT {} FROM judge_assignments WHERE queue_id = ? AND question_id = ?",
                ASSIGNMENT_COLUMNS
            ),
            params![queue_id, question_id],
            assignment_from_row,
        )?;
        Ok(assignment)
    }

    async fn get_assignments(
        &self,
        queue_id: &str,
    ) -> Result<Vec<JudgeAssignment>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM judge_assignments WHERE queue_id = ? ORDER BY rowid",
            ASSIGNMENT_COLUMNS
        ))?;
        let assignments = stmt.query_map(params![queue_id], assignment_from_row)?;
        Ok(assignments.collect::<Result<Vec<_>, _>>()?)
    }

    async fn save_evaluation(
        &self,
        evaluation: NewEvaluation,
    ) -> Result<Evaluation> {
        let stored = Evaluation {
            id: new_id(),
            submission_id: evaluation.submission_id,
            queue_id: evaluation.queue_id,
            question_id: evaluation.question_id,
            judge_id: evaluation.judge_id,
            judge_name: evaluation.judge_name,
            verdict: evaluation.verdict,
            reasoning: evaluation.reasoning,
            created_at: evaluation.created_at,
            metadata: evaluation.metadata,
        };

        let conn = self.pool.get()?;
        conn.execute(
            &format!(
                "INSERT INTO evaluations ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                EVALUATION_COLUMNS
            ),
            params![
                stored.id,
                stored.submission_id,
                stored.queue_id,
                stored.question_id,
                stored.judge_id,
                stored.judge_name,
                stored.verdict.as_str(),
                stored.reasoning,
                stored.created_at,
                stored.metadata.model_used,
                stored.metadata.provider,
                stored.metadata.latency,
                stored.metadata.error,
                stored.metadata.prompt_tokens,
                stored.metadata.completion_tokens,
            ],
        )
        .with_context(|| {
            format!("Failed to save evaluation for submission {}", stored.submission_id)
        })?;
        Ok(stored)
    }

    #[instrument(skip(self), err)]
    async fn get_evaluations(
        &self,
        filter: &EvaluationFilter,
    ) -> Result<Vec<Evaluation>> {
        let mut query = format!("SELECT {} FROM evaluations WHERE 1 = 1", EVALUATION_COLUMNS);
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(queue_id) = &filter.queue_id {
            query.push_str(" AND queue_id = ?");
            params.push(Box::new(queue_id.clone()));
        }
        if !filter.judge_ids.is_empty() {
            query.push_str(&format!(
                " AND judge_id IN ({})",
                placeholders(filter.judge_ids.len())
            ));
            for id in &filter.judge_ids {
                params.push(Box::new(id.clone()));
            }
        }
        if !filter.question_ids.is_empty() {
            query.push_str(&format!(
                " AND question_id IN ({})",
                placeholders(filter.question_ids.len())
            ));
            for id in &filter.question_ids {
                params.push(Box::new(id.clone()));
            }
        }
        if !filter.verdicts.is_empty() {
            query.push_str(&format!(
                " AND verdict IN ({})",
                placeholders(filter.verdicts.len())
            ));
            for verdict in &filter.verdicts {
                params.push(Box::new(verdict.as_str()));
            }
        }
        query.push_str(" ORDER BY created_at DESC, rowid DESC");

        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&query)?;
        let param_refs: Vec<&dyn rusqlite::ToSql> =
            params.iter().map(|p| p.as_ref()).collect();
        let evaluations =
            stmt.query_map(param_refs.as_slice(), evaluation_from_row)?;
        Ok(evaluations.collect::<Result<Vec<_>, _>>()?)
    }

    #[instrument(skip(self), err)]
    async fn create_run(
        &self,
        queue_id: &str,
        total: usize,
    ) -> Result<EvaluationRun> {
        let run = EvaluationRun {
            id: new_id(),
            queue_id: queue_id.to_string(),
            status: RunStatus::Running,
            total_evaluations: total as i64,
            completed_evaluations: 0,
            failed_evaluations: 0,
            started_at: now_millis(),
            completed_at: None,
            error: None,
        };

        let conn = self.pool.get()?;
        conn.execute(
            &format!(
                "INSERT INTO evaluation_runs ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                RUN_COLUMNS
            ),
            params![
                run.id,
                run.queue_id,
                run.status.as_str(),
                run.total_evaluations,
                run.completed_evaluations,
                run.failed_evaluations,
                run.started_at,
                run.completed_at,
                run.error,
            ],
        )?;
        Ok(run)
    }

    #[instrument(skip(self), err)]
    async fn finish_run(
        &self,
        run_id: &str,
        completion: RunCompletion,
    ) -> Result<()> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE evaluation_runs
             SET status = ?, completed_evaluations = ?, failed_evaluations = ?,
                 completed_at = ?, error = ?
             WHERE id = ?",
            params![
                completion.status.as_str(),
                completion.completed as i64,
                completion.failed as i64,
                now_millis(),
                completion.error,
                run_id,
            ],
        )?;
        if changed == 0 {
            return Err(anyhow!("Evaluation run not found: {}", run_id));
        }
        Ok(())
    }

    async fn get_runs(&self, queue_id: &str) -> Result<Vec<EvaluationRun>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM evaluation_runs WHERE queue_id = ? ORDER BY started_at DESC, rowid DESC",
            RUN_COLUMNS
        ))?;
        let runs = stmt.query_map(params![queue_id], run_from_row)?;
        Ok(runs.collect::<Result<Vec<_>, _>>()?)
    }
}
