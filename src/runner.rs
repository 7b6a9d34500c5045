use crate::llm::{GatewayError, LlmGateway};
use crate::models::{
    now_millis, Answer, EvaluationMetadata, Judge, NewEvaluation, Question,
    RunStatus, Submission,
};
use crate::progress::{Progress, ProgressReporter, RunSnapshot};
use crate::prompts::build_user_prompt;
use crate::retry::{run_with_retry, RetryPolicy};
use crate::store::{dedupe_judge_ids, RunCompletion, Store};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("No submissions found in this queue")]
    NoSubmissions,
    #[error("No judge assignments found for this queue")]
    NoAssignments,
    #[error("Evaluation run cancelled")]
    Cancelled,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Outcome of a run that reached the `Completed` state.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub run_id: String,
    pub progress: Progress,
    pub summary: String,
}

pub fn summarize(progress: &Progress) -> String {
    format!(
        "Evaluation complete: {} completed, {} failed out of {} total.",
        progress.completed, progress.failed, progress.total
    )
}

/// One (submission, answered question, assigned judge) triple.
struct WorkUnit<'a> {
    submission: &'a Submission,
    question: &'a Question,
    answer: &'a Answer,
    judge_id: &'a str,
}

/// Resolves the full work list up front so the total is known before the
/// first gateway call. Unanswered questions are skipped.
fn resolve_work<'a>(
    submissions: &'a [Submission],
    assignment_map: &'a HashMap<String, Vec<String>>,
) -> Vec<WorkUnit<'a>> {
    let mut units = Vec::new();
    for submission in submissions {
        for question in &submission.questions {
            let Some(answer) = submission.answer_for(&question.id) else {
                continue;
            };
            let Some(judge_ids) = assignment_map.get(&question.id) else {
                continue;
            };
            for judge_id in judge_ids {
                units.push(WorkUnit {
                    submission,
                    question,
                    answer,
                    judge_id,
                });
            }
        }
    }
    units
}

enum UnitOutcome {
    Completed,
    Failed,
}

/// Drives a batch of judge evaluations over one queue.
///
/// Units run strictly one at a time. A unit that fails (inactive or
/// unknown judge, gateway error after retries) is counted and the run
/// moves on; only a storage failure or cancellation ends the run early.
#[derive(Clone)]
pub struct EvaluationRunner {
    store: Arc<dyn Store>,
    gateway: Arc<dyn LlmGateway>,
    retry: RetryPolicy,
}

impl EvaluationRunner {
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Arc<dyn LlmGateway>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            gateway,
            retry,
        }
    }

    #[instrument(skip(self, reporter, cancel))]
    pub async fn run_evaluations(
        &self,
        queue_id: &str,
        reporter: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<RunReport, RunError> {
        reporter.start();
        match self.execute(queue_id, reporter, cancel).await {
            Ok(report) => {
                info!("{}", report.summary);
                reporter.complete(report.progress, report.summary.clone());
                Ok(report)
            }
            Err(e) => {
                error!("Evaluation run for queue {} failed: {:#}", queue_id, e);
                reporter.fail(e.to_string());
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        queue_id: &str,
        reporter: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<RunReport, RunError> {
        let submissions = self.store.get_submissions(Some(queue_id)).await?;
        if submissions.is_empty() {
            return Err(RunError::NoSubmissions);
        }

        let assignments = self.store.get_assignments(queue_id).await?;
        if assignments.is_empty() {
            return Err(RunError::NoAssignments);
        }

        let assignment_map: HashMap<String, Vec<String>> = assignments
            .into_iter()
            .map(|a| (a.question_id, dedupe_judge_ids(a.judge_ids)))
            .collect();

        // All judges, active or not; activity is checked per unit.
        let judge_map: HashMap<String, Judge> = self
            .store
            .get_judges()
            .await?
            .into_iter()
            .map(|j| (j.id.clone(), j))
            .collect();

        let units = resolve_work(&submissions, &assignment_map);
        let mut progress = Progress::new(units.len());
        reporter.update(progress);
        info!(
            "Starting evaluation of queue {}: {} submission(s), {} unit(s)",
            queue_id,
            submissions.len(),
            progress.total
        );

        let run = self.store.create_run(queue_id, progress.total).await?;

        match self
            .process_units(&units, &judge_map, &mut progress, reporter, cancel)
            .await
        {
            Ok(()) => {
                self.store
                    .finish_run(
                        &run.id,
                        RunCompletion {
                            status: RunStatus::Completed,
                            completed: progress.completed,
                            failed: progress.failed,
                            error: None,
                        },
                    )
                    .await?;
                Ok(RunReport {
                    run_id: run.id,
                    progress,
                    summary: summarize(&progress),
                })
            }
            Err(e) => {
                let completion = RunCompletion {
                    status: RunStatus::Failed,
                    completed: progress.completed,
                    failed: progress.failed,
                    error: Some(e.to_string()),
                };
                if let Err(record_err) =
                    self.store.finish_run(&run.id, completion).await
                {
                    warn!(
                        "Could not record failure of run {}: {:#}",
                        run.id, record_err
                    );
                }
                Err(e)
            }
        }
    }

    async fn process_units(
        &self,
        units: &[WorkUnit<'_>],
        judge_map: &HashMap<String, Judge>,
        progress: &mut Progress,
        reporter: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<(), RunError> {
        for unit in units {
            if cancel.is_cancelled() {
                return Err(RunError::Cancelled);
            }

            match self.evaluate_unit(unit, judge_map).await? {
                UnitOutcome::Completed => progress.completed += 1,
                UnitOutcome::Failed => progress.failed += 1,
            }
            reporter.update(*progress);
        }
        Ok(())
    }

    async fn evaluate_unit(
        &self,
        unit: &WorkUnit<'_>,
        judge_map: &HashMap<String, Judge>,
    ) -> Result<UnitOutcome, RunError> {
        let judge = match judge_map.get(unit.judge_id) {
            Some(judge) if judge.active => judge,
            Some(judge) => {
                warn!("Judge {} is inactive, skipping", judge.name);
                return Ok(UnitOutcome::Failed);
            }
            None => {
                warn!("Judge {} not found, skipping", unit.judge_id);
                return Ok(UnitOutcome::Failed);
            }
        };

        let prompt = build_user_prompt(unit.question, unit.answer);
        let outcome = run_with_retry(&self.retry, |_| {
            self.gateway.send(
                judge.provider,
                &judge.model_name,
                &judge.system_prompt,
                &prompt,
            )
        })
        .await;
        let latency_ms = outcome.latency.as_millis() as i64;

        let reply = match outcome.result {
            Ok(reply) => reply,
            Err(e) => {
                log_unit_failure(unit, judge, &e, outcome.attempts);
                return Ok(UnitOutcome::Failed);
            }
        };

        self.store
            .save_evaluation(NewEvaluation {
                submission_id: unit.submission.id.clone(),
                queue_id: unit.submission.queue_id.clone(),
                question_id: unit.question.id.clone(),
                judge_id: judge.id.clone(),
                judge_name: judge.name.clone(),
                verdict: reply.verdict,
                reasoning: reply.reasoning,
                created_at: now_millis(),
                metadata: EvaluationMetadata {
                    model_used: judge.model_name.clone(),
                    provider: judge.provider.to_string(),
                    latency: latency_ms,
                    error: None,
                    prompt_tokens: reply.usage.map(|u| u.prompt_tokens),
                    completion_tokens: reply.usage.map(|u| u.completion_tokens),
                },
            })
            .await?;

        debug!(
            submission_id = %unit.submission.id,
            question_id = %unit.question.id,
            judge_id = %judge.id,
            latency_ms,
            "Evaluation saved"
        );
        Ok(UnitOutcome::Completed)
    }
}

fn log_unit_failure(
    unit: &WorkUnit<'_>,
    judge: &Judge,
    error: &GatewayError,
    attempts: u32,
) {
    warn!(
        submission_id = %unit.submission.id,
        question_id = %unit.question.id,
        judge_id = %judge.id,
        attempts,
        "Evaluation failed: {}",
        error
    );
}

struct TrackedRun {
    reporter: Arc<ProgressReporter>,
    cancel: CancellationToken,
}

/// Runs started in the background, at most one active per queue.
///
/// Finished runs stay registered so their final snapshot can still be
/// read until the next run for the same queue replaces them.
#[derive(Default)]
pub struct RunRegistry {
    runs: Mutex<HashMap<String, TrackedRun>>,
}

impl RunRegistry {
    /// Registers a new run for `queue_id`, with a cancellation token
    /// derived from `parent`. Returns `None` if a run is still going.
    pub async fn begin(
        &self,
        queue_id: &str,
        parent: &CancellationToken,
    ) -> Option<(Arc<ProgressReporter>, CancellationToken)> {
        let mut runs = self.runs.lock().await;
        if let Some(existing) = runs.get(queue_id) {
            if existing.reporter.snapshot().is_running {
                return None;
            }
        }

        let reporter = Arc::new(ProgressReporter::new());
        // Mark running before releasing the lock so a racing begin sees it.
        reporter.start();
        let cancel = parent.child_token();
        runs.insert(
            queue_id.to_string(),
            TrackedRun {
                reporter: reporter.clone(),
                cancel: cancel.clone(),
            },
        );
        Some((reporter, cancel))
    }

    pub async fn snapshot(&self, queue_id: &str) -> RunSnapshot {
        self.runs
            .lock()
            .await
            .get(queue_id)
            .map(|run| run.reporter.snapshot())
            .unwrap_or_default()
    }

    /// Requests cancellation of the active run. Returns false when no run
    /// is active for the queue.
    pub async fn cancel(&self, queue_id: &str) -> bool {
        match self.runs.lock().await.get(queue_id) {
            Some(run) if run.reporter.snapshot().is_running => {
                run.cancel.cancel();
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::fake::FakeGateway;
    use crate::llm::{JudgeReply, TokenUsage};
    use crate::models::{
        Evaluation, EvaluationFilter, EvaluationRun, JudgeAssignment,
        JudgeUpdate, NewJudge, NewSubmission, Provider, Verdict,
    };
    use crate::progress::RunPhase;
    use crate::test_utils::init_test_logging;
    use crate::AppState;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::watch;

    const QUEUE: &str = "queue-1";

    async fn add_judge(store: &dyn Store, name: &str, active: bool) -> Judge {
        let judge = store
            .create_judge(NewJudge {
                name: name.to_string(),
                system_prompt: format!("You are {}", name),
                model_name: format!("model-{}", name),
                provider: Provider::OpenAI,
            })
            .await
            .unwrap();
        if active {
            judge
        } else {
            store.set_judge_active(&judge.id, false).await.unwrap()
        }
    }

    fn question(id: &str) -> Question {
        Question {
            id: id.to_string(),
            question_type: "single_choice_with_reasoning".to_string(),
            question_text: format!("Question {}?", id),
        }
    }

    fn answer(choice: &str) -> Answer {
        Answer {
            choice: Some(choice.to_string()),
            reasoning: Some("Because".to_string()),
            ..Default::default()
        }
    }

    /// Uploads one submission to [`QUEUE`] asking `asked` and answering
    /// `answered`.
    async fn add_submission(store: &dyn Store, asked: &[&str], answered: &[&str]) {
        store
            .upload_submissions(vec![NewSubmission {
                source_id: "payload".to_string(),
                queue_id: QUEUE.to_string(),
                labeling_task_id: "task".to_string(),
                created_at: 1_690_000_000_000,
                questions: asked.iter().map(|id| question(id)).collect(),
                answers: answered
                    .iter()
                    .map(|id| (id.to_string(), answer("yes")))
                    .collect(),
            }])
            .await
            .unwrap();
    }

    async fn assign(store: &dyn Store, question_id: &str, judges: &[&Judge]) {
        store
            .save_assignment(
                QUEUE,
                question_id,
                judges.iter().map(|j| j.id.clone()).collect(),
            )
            .await
            .unwrap();
    }

    fn runner(store: Arc<dyn Store>, gateway: Arc<FakeGateway>) -> EvaluationRunner {
        EvaluationRunner::new(
            store,
            gateway,
            RetryPolicy::new(3, Duration::from_millis(1000)),
        )
    }

    async fn all_evaluations(store: &dyn Store) -> Vec<Evaluation> {
        store
            .get_evaluations(&EvaluationFilter::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn inactive_judge_fails_without_gateway_call() {
        init_test_logging();
        let state = AppState::new_for_testing();
        let store = state.store.clone();
        let j1 = add_judge(store.as_ref(), "J1", true).await;
        let j2 = add_judge(store.as_ref(), "J2", false).await;
        add_submission(store.as_ref(), &["qa", "qb"], &["qa", "qb"]).await;
        assign(store.as_ref(), "qa", &[&j1]).await;
        assign(store.as_ref(), "qb", &[&j1, &j2]).await;

        let gateway = Arc::new(FakeGateway::new());
        let reporter = ProgressReporter::new();
        let report = runner(store.clone(), gateway.clone())
            .run_evaluations(QUEUE, &reporter, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            report.progress,
            Progress {
                total: 3,
                completed: 2,
                failed: 1
            }
        );
        assert_eq!(
            report.summary,
            "Evaluation complete: 2 completed, 1 failed out of 3 total."
        );
        assert_eq!(gateway.request_count(), 2);
        assert_eq!(gateway.requested_models(), vec!["model-J1", "model-J1"]);

        let evaluations = all_evaluations(store.as_ref()).await;
        assert_eq!(evaluations.len(), 2);
        assert!(evaluations.iter().all(|e| e.judge_id == j1.id));

        let snapshot = reporter.snapshot();
        assert_eq!(snapshot.phase, RunPhase::Completed);
        assert!(!snapshot.is_running);
        assert_eq!(snapshot.summary, Some(report.summary));
    }

    #[tokio::test]
    async fn missing_assignments_fail_before_any_call() {
        let state = AppState::new_for_testing();
        let store = state.store.clone();
        add_judge(store.as_ref(), "J1", true).await;
        add_submission(store.as_ref(), &["qa"], &["qa"]).await;

        let gateway = Arc::new(FakeGateway::new());
        let reporter = ProgressReporter::new();
        let result = runner(store.clone(), gateway.clone())
            .run_evaluations(QUEUE, &reporter, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(RunError::NoAssignments)));
        assert_eq!(gateway.request_count(), 0);
        assert!(store.get_runs(QUEUE).await.unwrap().is_empty());

        let snapshot = reporter.snapshot();
        assert_eq!(snapshot.phase, RunPhase::Failed);
        assert_eq!(
            snapshot.error.as_deref(),
            Some("No judge assignments found for this queue")
        );
    }

    #[tokio::test]
    async fn empty_queue_fails_before_any_call() {
        let state = AppState::new_for_testing();
        let gateway = Arc::new(FakeGateway::new());
        let result = runner(state.store.clone(), gateway.clone())
            .run_evaluations(
                "empty",
                &ProgressReporter::new(),
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(result, Err(RunError::NoSubmissions)));
        assert_eq!(gateway.request_count(), 0);
    }

    #[tokio::test]
    async fn rerunning_a_queue_duplicates_evaluations() {
        let state = AppState::new_for_testing();
        let store = state.store.clone();
        let j1 = add_judge(store.as_ref(), "J1", true).await;
        add_submission(store.as_ref(), &["qa"], &["qa"]).await;
        assign(store.as_ref(), "qa", &[&j1]).await;

        let runner = runner(store.clone(), Arc::new(FakeGateway::new()));
        for _ in 0..2 {
            runner
                .run_evaluations(
                    QUEUE,
                    &ProgressReporter::new(),
                    &CancellationToken::new(),
                )
                .await
                .unwrap();
        }

        let evaluations = all_evaluations(store.as_ref()).await;
        assert_eq!(evaluations.len(), 2);
        assert_eq!(evaluations[0].submission_id, evaluations[1].submission_id);
        assert_eq!(evaluations[0].judge_id, evaluations[1].judge_id);
        assert_ne!(evaluations[0].id, evaluations[1].id);
        assert_eq!(store.get_runs(QUEUE).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unanswered_questions_are_not_counted() {
        let state = AppState::new_for_testing();
        let store = state.store.clone();
        let j1 = add_judge(store.as_ref(), "J1", true).await;
        add_submission(store.as_ref(), &["qa", "qb"], &["qa"]).await;
        assign(store.as_ref(), "qa", &[&j1]).await;
        assign(store.as_ref(), "qb", &[&j1]).await;

        let gateway = Arc::new(FakeGateway::new());
        let report = runner(store.clone(), gateway.clone())
            .run_evaluations(
                QUEUE,
                &ProgressReporter::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.progress.total, 1);
        assert_eq!(report.progress.completed, 1);
        let evaluations = all_evaluations(store.as_ref()).await;
        assert_eq!(evaluations.len(), 1);
        assert_eq!(evaluations[0].question_id, "qa");
    }

    #[tokio::test]
    async fn unknown_and_duplicated_judge_ids() {
        let state = AppState::new_for_testing();
        let store = state.store.clone();
        let j1 = add_judge(store.as_ref(), "J1", true).await;
        add_submission(store.as_ref(), &["qa"], &["qa"]).await;
        store
            .save_assignment(
                QUEUE,
                "qa",
                vec![j1.id.clone(), "ghost".to_string(), j1.id.clone()],
            )
            .await
            .unwrap();

        let gateway = Arc::new(FakeGateway::new());
        let report = runner(store.clone(), gateway.clone())
            .run_evaluations(
                QUEUE,
                &ProgressReporter::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(
            report.progress,
            Progress {
                total: 2,
                completed: 1,
                failed: 1
            }
        );
        assert_eq!(gateway.request_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_failures_are_absorbed() {
        let state = AppState::new_for_testing();
        let store = state.store.clone();
        let j1 = add_judge(store.as_ref(), "J1", true).await;
        add_submission(store.as_ref(), &["qa"], &["qa"]).await;
        assign(store.as_ref(), "qa", &[&j1]).await;

        let gateway = Arc::new(
            FakeGateway::new()
                .with_http_error(429)
                .with_http_error(429)
                .with_reply(Verdict::Fail, "Wrong answer"),
        );
        let report = runner(store.clone(), gateway.clone())
            .run_evaluations(
                QUEUE,
                &ProgressReporter::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(gateway.request_count(), 3);
        assert_eq!(report.progress.completed, 1);
        let evaluations = all_evaluations(store.as_ref()).await;
        assert_eq!(evaluations[0].verdict, Verdict::Fail);
        assert_eq!(evaluations[0].reasoning, "Wrong answer");
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_and_terminal_failures_do_not_abort_the_run() {
        let state = AppState::new_for_testing();
        let store = state.store.clone();
        let j1 = add_judge(store.as_ref(), "J1", true).await;
        let j2 = add_judge(store.as_ref(), "J2", true).await;
        add_submission(store.as_ref(), &["qa", "qb"], &["qa", "qb"]).await;
        assign(store.as_ref(), "qa", &[&j1]).await;
        assign(store.as_ref(), "qb", &[&j1, &j2]).await;

        // qa/J1 exhausts four 503s, qb/J1 hits a terminal error, qb/J2
        // falls through to the default pass.
        let gateway = Arc::new(
            FakeGateway::new()
                .with_http_error(503)
                .with_http_error(503)
                .with_http_error(503)
                .with_http_error(503)
                .with_error(GatewayError::InvalidVerdict("maybe".to_string())),
        );
        let report = runner(store.clone(), gateway.clone())
            .run_evaluations(
                QUEUE,
                &ProgressReporter::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(gateway.request_count(), 6);
        assert_eq!(
            report.progress,
            Progress {
                total: 3,
                completed: 1,
                failed: 2
            }
        );
        let runs = store.get_runs(QUEUE).await.unwrap();
        assert_eq!(runs[0].status, RunStatus::Completed);
        assert_eq!(runs[0].failed_evaluations, 2);
    }

    struct UsageGateway;

    #[async_trait]
    impl LlmGateway for UsageGateway {
        async fn send(
            &self,
            _provider: Provider,
            _model: &str,
            _system_prompt: &str,
            _user_prompt: &str,
        ) -> Result<JudgeReply, GatewayError> {
            tokio::time::sleep(Duration::from_millis(40)).await;
            Ok(JudgeReply {
                verdict: Verdict::Inconclusive,
                reasoning: "Not enough detail".to_string(),
                usage: Some(TokenUsage {
                    prompt_tokens: 120,
                    completion_tokens: 18,
                }),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn evaluation_metadata_records_model_latency_and_usage() {
        let state = AppState::new_for_testing();
        let store = state.store.clone();
        let j1 = add_judge(store.as_ref(), "J1", true).await;
        let j1 = store
            .update_judge(
                &j1.id,
                JudgeUpdate {
                    provider: Some(Provider::Anthropic),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        add_submission(store.as_ref(), &["qa"], &["qa"]).await;
        assign(store.as_ref(), "qa", &[&j1]).await;

        EvaluationRunner::new(store.clone(), Arc::new(UsageGateway), RetryPolicy::default())
            .run_evaluations(
                QUEUE,
                &ProgressReporter::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let evaluation = all_evaluations(store.as_ref()).await.remove(0);
        assert_eq!(evaluation.judge_name, "J1");
        assert_eq!(evaluation.queue_id, QUEUE);
        assert_eq!(evaluation.metadata.model_used, "model-J1");
        assert_eq!(evaluation.metadata.provider, "anthropic");
        assert_eq!(evaluation.metadata.latency, 40);
        assert_eq!(evaluation.metadata.prompt_tokens, Some(120));
        assert_eq!(evaluation.metadata.completion_tokens, Some(18));
    }

    /// Records how many units had been processed each time it is called.
    struct ObservingGateway {
        progress: watch::Receiver<crate::progress::RunSnapshot>,
        seen: Mutex<Vec<(usize, usize)>>,
    }

    #[async_trait]
    impl LlmGateway for ObservingGateway {
        async fn send(
            &self,
            _provider: Provider,
            _model: &str,
            _system_prompt: &str,
            _user_prompt: &str,
        ) -> Result<JudgeReply, GatewayError> {
            let progress = self.progress.borrow().progress.unwrap_or_default();
            self.seen
                .lock()
                .unwrap()
                .push((progress.processed(), progress.total));
            Ok(JudgeReply {
                verdict: Verdict::Pass,
                reasoning: "ok".to_string(),
                usage: None,
            })
        }
    }

    #[tokio::test]
    async fn progress_is_published_after_every_unit() {
        let state = AppState::new_for_testing();
        let store = state.store.clone();
        let j1 = add_judge(store.as_ref(), "J1", true).await;
        let j2 = add_judge(store.as_ref(), "J2", true).await;
        add_submission(store.as_ref(), &["qa", "qb"], &["qa", "qb"]).await;
        assign(store.as_ref(), "qa", &[&j1, &j2]).await;
        assign(store.as_ref(), "qb", &[&j1]).await;

        let reporter = ProgressReporter::new();
        let gateway = Arc::new(ObservingGateway {
            progress: reporter.subscribe(),
            seen: Mutex::new(vec![]),
        });
        EvaluationRunner::new(store.clone(), gateway.clone(), RetryPolicy::default())
            .run_evaluations(QUEUE, &reporter, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            *gateway.seen.lock().unwrap(),
            vec![(0, 3), (1, 3), (2, 3)]
        );
    }

    #[tokio::test]
    async fn cancelled_run_is_recorded_as_failed() {
        let state = AppState::new_for_testing();
        let store = state.store.clone();
        let j1 = add_judge(store.as_ref(), "J1", true).await;
        add_submission(store.as_ref(), &["qa"], &["qa"]).await;
        assign(store.as_ref(), "qa", &[&j1]).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let gateway = Arc::new(FakeGateway::new());
        let reporter = ProgressReporter::new();
        let result = runner(store.clone(), gateway.clone())
            .run_evaluations(QUEUE, &reporter, &cancel)
            .await;

        assert!(matches!(result, Err(RunError::Cancelled)));
        assert_eq!(gateway.request_count(), 0);
        assert_eq!(
            reporter.snapshot().error.as_deref(),
            Some("Evaluation run cancelled")
        );

        let runs = store.get_runs(QUEUE).await.unwrap();
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert_eq!(runs[0].error.as_deref(), Some("Evaluation run cancelled"));
    }

    /// Delegates to a real store but refuses to save evaluations.
    struct BrokenEvaluationStore {
        inner: Arc<dyn Store>,
    }

    #[async_trait]
    impl Store for BrokenEvaluationStore {
        async fn upload_submissions(
            &self,
            submissions: Vec<NewSubmission>,
        ) -> anyhow::Result<Vec<Submission>> {
            self.inner.upload_submissions(submissions).await
        }
        async fn get_submissions(
            &self,
            queue_id: Option<&str>,
        ) -> anyhow::Result<Vec<Submission>> {
            self.inner.get_submissions(queue_id).await
        }
        async fn get_submission(
            &self,
            id: &str,
        ) -> anyhow::Result<Option<Submission>> {
            self.inner.get_submission(id).await
        }
        async fn create_judge(&self, judge: NewJudge) -> anyhow::Result<Judge> {
            self.inner.create_judge(judge).await
        }
        async fn get_judges(&self) -> anyhow::Result<Vec<Judge>> {
            self.inner.get_judges().await
        }
        async fn get_judge(&self, id: &str) -> anyhow::Result<Option<Judge>> {
            self.inner.get_judge(id).await
        }
        async fn update_judge(
            &self,
            id: &str,
            update: JudgeUpdate,
        ) -> anyhow::Result<Judge> {
            self.inner.update_judge(id, update).await
        }
        async fn set_judge_active(
            &self,
            id: &str,
            active: bool,
        ) -> anyhow::Result<Judge> {
            self.inner.set_judge_active(id, active).await
        }
        async fn save_assignment(
            &self,
            queue_id: &str,
            question_id: &str,
            judge_ids: Vec<String>,
        ) -> anyhow::Result<JudgeAssignment> {
            self.inner
                .save_assignment(queue_id, question_id, judge_ids)
                .await
        }
        async fn get_assignments(
            &self,
            queue_id: &str,
        ) -> anyhow::Result<Vec<JudgeAssignment>> {
            self.inner.get_assignments(queue_id).await
        }
        async fn save_evaluation(
            &self,
            _evaluation: NewEvaluation,
        ) -> anyhow::Result<Evaluation> {
            Err(anyhow!("database is locked"))
        }
        async fn get_evaluations(
            &self,
            filter: &EvaluationFilter,
        ) -> anyhow::Result<Vec<Evaluation>> {
            self.inner.get_evaluations(filter).await
        }
        async fn create_run(
            &self,
            queue_id: &str,
            total: usize,
        ) -> anyhow::Result<EvaluationRun> {
            self.inner.create_run(queue_id, total).await
        }
        async fn finish_run(
            &self,
            run_id: &str,
            completion: RunCompletion,
        ) -> anyhow::Result<()> {
            self.inner.finish_run(run_id, completion).await
        }
        async fn get_runs(
            &self,
            queue_id: &str,
        ) -> anyhow::Result<Vec<EvaluationRun>> {
            self.inner.get_runs(queue_id).await
        }
    }

    #[tokio::test]
    async fn storage_failure_aborts_the_run() {
        let state = AppState::new_for_testing();
        let j1 = add_judge(state.store.as_ref(), "J1", true).await;
        add_submission(state.store.as_ref(), &["qa", "qb"], &["qa", "qb"])
            .await;
        assign(state.store.as_ref(), "qa", &[&j1]).await;
        assign(state.store.as_ref(), "qb", &[&j1]).await;

        let store: Arc<dyn Store> = Arc::new(BrokenEvaluationStore {
            inner: state.store.clone(),
        });
        let gateway = Arc::new(FakeGateway::new());
        let reporter = ProgressReporter::new();
        let result = runner(store.clone(), gateway.clone())
            .run_evaluations(QUEUE, &reporter, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(RunError::Storage(_))));
        // The first unit's save fails, so the second is never attempted.
        assert_eq!(gateway.request_count(), 1);

        let snapshot = reporter.snapshot();
        assert_eq!(snapshot.phase, RunPhase::Failed);
        assert_eq!(snapshot.error.as_deref(), Some("database is locked"));
        assert_eq!(snapshot.progress.map(|p| p.total), Some(2));

        let runs = state.store.get_runs(QUEUE).await.unwrap();
        assert_eq!(runs[0].status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn registry_allows_one_active_run_per_queue() {
        let registry = RunRegistry::default();
        let parent = CancellationToken::new();

        let (reporter, cancel) = registry.begin(QUEUE, &parent).await.unwrap();
        assert!(registry.snapshot(QUEUE).await.is_running);
        assert!(registry.begin(QUEUE, &parent).await.is_none());
        assert!(registry.begin("other", &parent).await.is_some());

        assert!(registry.cancel(QUEUE).await);
        assert!(cancel.is_cancelled());

        reporter.fail("Evaluation run cancelled".to_string());
        assert!(!registry.cancel(QUEUE).await);
        assert_eq!(
            registry.snapshot(QUEUE).await.error.as_deref(),
            Some("Evaluation run cancelled")
        );
        assert!(registry.begin(QUEUE, &parent).await.is_some());
        assert_eq!(registry.snapshot("unknown").await, RunSnapshot::idle());
    }

    #[tokio::test]
    async fn shutdown_cancels_registered_runs() {
        let registry = RunRegistry::default();
        let shutdown = CancellationToken::new();
        let (_reporter, cancel) = registry.begin(QUEUE, &shutdown).await.unwrap();

        shutdown.cancel();
        assert!(cancel.is_cancelled());
    }
}
