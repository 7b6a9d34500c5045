use crate::cli::CommonArgs;
use crate::models::{EvaluationFilter, JudgeUpdate, NewJudge, Verdict};
use crate::results::{export_evaluations_csv, EvaluationStats};
use crate::submissions::{
    parse_submission_upload, questions_for_queue, unique_queue_ids,
};
use crate::AppState;
use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use clap::Parser;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, instrument};
use tracing_subscriber::{prelude::*, Registry};
use tracing_tree::HierarchicalLayer;

type ApiError = (StatusCode, String);

fn internal_error(e: impl std::fmt::Display) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

fn bad_request(e: impl std::fmt::Display) -> ApiError {
    (StatusCode::BAD_REQUEST, e.to_string())
}

// Health check endpoint
#[instrument]
pub async fn health_check() -> &'static str {
    debug!("Health check requested");
    "OK"
}

#[instrument(level = "debug")]
fn check_db_location(path: &std::path::Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            return Err(anyhow::anyhow!(
                "Directory for judgeflow database at '{}' does not exist. Please create it manually.",
                parent.display()
            ));
        }
    }
    if path.exists() {
        std::fs::OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| {
                anyhow::anyhow!(
                    "Cannot write to judgeflow database at '{}': {}. Please check file permissions.",
                    path.display(),
                    e
                )
            })?;
    }
    Ok(())
}

async fn list_judges(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let judges = state.store.get_judges().await.map_err(internal_error)?;
    Ok(Json(judges))
}

async fn create_judge(
    State(state): State<Arc<AppState>>,
    Json(judge): Json<NewJudge>,
) -> Result<impl IntoResponse, ApiError> {
    judge.validate().map_err(bad_request)?;
    let created = state
        .store
        .create_judge(judge)
        .await
        .map_err(internal_error)?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_judge(
    State(state): State<Arc<AppState>>,
    Path(judge_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let judge = state
        .store
        .get_judge(&judge_id)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| {
            (StatusCode::NOT_FOUND, format!("Judge not found: {}", judge_id))
        })?;
    Ok(Json(judge))
}

async fn ensure_judge_exists(
    state: &AppState,
    judge_id: &str,
) -> Result<(), ApiError> {
    match state.store.get_judge(judge_id).await {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err((
            StatusCode::NOT_FOUND,
            format!("Judge not found: {}", judge_id),
        )),
        Err(e) => Err(internal_error(e)),
    }
}

async fn update_judge(
    State(state): State<Arc<AppState>>,
    Path(judge_id): Path<String>,
    Json(update): Json<JudgeUpdate>,
) -> Result<impl IntoResponse, ApiError> {
    update.validate().map_err(bad_request)?;
    ensure_judge_exists(&state, &judge_id).await?;
    let judge = state
        .store
        .update_judge(&judge_id, update)
        .await
        .map_err(internal_error)?;
    Ok(Json(judge))
}

#[derive(Debug, Deserialize)]
struct ActiveRequest {
    active: bool,
}

async fn set_judge_active(
    State(state): State<Arc<AppState>>,
    Path(judge_id): Path<String>,
    Json(request): Json<ActiveRequest>,
) -> Result<impl IntoResponse, ApiError> {
    ensure_judge_exists(&state, &judge_id).await?;
    let judge = state
        .store
        .set_judge_active(&judge_id, request.active)
        .await
        .map_err(internal_error)?;
    info!(
        "Judge {} is now {}",
        judge.name,
        if judge.active { "active" } else { "inactive" }
    );
    Ok(Json(judge))
}

#[derive(Debug, Deserialize)]
struct SubmissionQuery {
    queue_id: Option<String>,
}

async fn list_submissions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SubmissionQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let submissions = state
        .store
        .get_submissions(query.queue_id.as_deref())
        .await
        .map_err(internal_error)?;
    Ok(Json(submissions))
}

// Body is the raw upload document; validation errors name the bad element.
async fn upload_submissions(
    State(state): State<Arc<AppState>>,
    body: String,
) -> Result<impl IntoResponse, ApiError> {
    let submissions = parse_submission_upload(&body).map_err(bad_request)?;
    let stored = state
        .store
        .upload_submissions(submissions)
        .await
        .map_err(internal_error)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": format!("Successfully uploaded {} submission(s)", stored.len()),
            "submissions": stored,
        })),
    ))
}

async fn list_queues(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let submissions =
        state.store.get_submissions(None).await.map_err(internal_error)?;
    Ok(Json(unique_queue_ids(&submissions)))
}

async fn list_queue_questions(
    State(state): State<Arc<AppState>>,
    Path(queue_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let submissions = state
        .store
        .get_submissions(Some(&queue_id))
        .await
        .map_err(internal_error)?;
    Ok(Json(questions_for_queue(&submissions, &queue_id)))
}

async fn list_assignments(
    State(state): State<Arc<AppState>>,
    Path(queue_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let assignments = state
        .store
        .get_assignments(&queue_id)
        .await
        .map_err(internal_error)?;
    Ok(Json(assignments))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssignmentRequest {
    judge_ids: Vec<String>,
}

async fn save_assignment(
    State(state): State<Arc<AppState>>,
    Path((queue_id, question_id)): Path<(String, String)>,
    Json(request): Json<AssignmentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let assignment = state
        .store
        .save_assignment(&queue_id, &question_id, request.judge_ids)
        .await
        .map_err(internal_error)?;
    Ok(Json(assignment))
}

// Starts a run in the background; progress is polled from /runs/current.
#[instrument(skip(state))]
async fn start_run(
    State(state): State<Arc<AppState>>,
    Path(queue_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let (reporter, cancel) = state
        .runs
        .begin(&queue_id, &state.shutdown_token)
        .await
        .ok_or_else(|| {
            (
                StatusCode::CONFLICT,
                format!(
                    "An evaluation run is already in progress for queue {}",
                    queue_id
                ),
            )
        })?;

    let snapshot = reporter.snapshot();
    let runner = state.runner();
    tokio::spawn(async move {
        // The outcome is published through the reporter.
        if let Err(e) = runner.run_evaluations(&queue_id, &reporter, &cancel).await
        {
            debug!("Background run for queue {} ended: {}", queue_id, e);
        }
    });

    Ok((StatusCode::ACCEPTED, Json(snapshot)))
}

async fn current_run(
    State(state): State<Arc<AppState>>,
    Path(queue_id): Path<String>,
) -> impl IntoResponse {
    Json(state.runs.snapshot(&queue_id).await)
}

async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Path(queue_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if state.runs.cancel(&queue_id).await {
        info!("Cancellation requested for queue {}", queue_id);
        Ok(StatusCode::ACCEPTED)
    } else {
        Err((
            StatusCode::CONFLICT,
            format!("No evaluation run in progress for queue {}", queue_id),
        ))
    }
}

async fn list_runs(
    State(state): State<Arc<AppState>>,
    Path(queue_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let runs = state
        .store
        .get_runs(&queue_id)
        .await
        .map_err(internal_error)?;
    Ok(Json(runs))
}

/// Evaluation filters as query parameters. List values are comma separated.
#[derive(Debug, Default, Deserialize)]
struct EvaluationQuery {
    queue_id: Option<String>,
    judge_ids: Option<String>,
    question_ids: Option<String>,
    verdicts: Option<String>,
}

fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

impl EvaluationQuery {
    fn into_filter(self) -> Result<EvaluationFilter, ApiError> {
        let verdicts = split_list(self.verdicts.as_deref())
            .iter()
            .map(|v| v.parse::<Verdict>())
            .collect::<Result<Vec<_>>>()
            .map_err(bad_request)?;
        Ok(EvaluationFilter {
            queue_id: self.queue_id.filter(|q| !q.is_empty()),
            judge_ids: split_list(self.judge_ids.as_deref()),
            question_ids: split_list(self.question_ids.as_deref()),
            verdicts,
        })
    }
}

async fn list_evaluations(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EvaluationQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let filter = query.into_filter()?;
    let evaluations = state
        .store
        .get_evaluations(&filter)
        .await
        .map_err(internal_error)?;
    Ok(Json(evaluations))
}

async fn evaluation_stats(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EvaluationQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let filter = query.into_filter()?;
    let evaluations = state
        .store
        .get_evaluations(&filter)
        .await
        .map_err(internal_error)?;
    Ok(Json(EvaluationStats::from_evaluations(&evaluations)))
}

#[axum::debug_handler]
async fn evaluations_csv(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EvaluationQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let filter = query.into_filter()?;
    let evaluations = state
        .store
        .get_evaluations(&filter)
        .await
        .map_err(internal_error)?;
    if evaluations.is_empty() {
        return Err((
            StatusCode::NOT_FOUND,
            "No evaluations to export".to_string(),
        ));
    }
    let csv_content =
        export_evaluations_csv(&evaluations).map_err(internal_error)?;

    let headers = [
        (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
        (
            header::CONTENT_DISPOSITION,
            "attachment; filename=\"evaluations.csv\"",
        ),
    ];

    Ok((headers, csv_content))
}

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/judges", get(list_judges).post(create_judge))
        .route("/api/judges/{judge_id}", get(get_judge).put(update_judge))
        .route("/api/judges/{judge_id}/active", put(set_judge_active))
        .route(
            "/api/submissions",
            get(list_submissions).post(upload_submissions),
        )
        .route("/api/queues", get(list_queues))
        .route("/api/queues/{queue_id}/questions", get(list_queue_questions))
        .route("/api/queues/{queue_id}/assignments", get(list_assignments))
        .route(
            "/api/queues/{queue_id}/assignments/{question_id}",
            put(save_assignment),
        )
        .route("/api/queues/{queue_id}/runs", get(list_runs).post(start_run))
        .route("/api/queues/{queue_id}/runs/current", get(current_run))
        .route("/api/queues/{queue_id}/runs/cancel", post(cancel_run))
        .route("/api/evaluations", get(list_evaluations))
        .route("/api/evaluations/stats", get(evaluation_stats))
        .route("/api/evaluations/csv", get(evaluations_csv))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    /// Port to listen on
    #[arg(long, default_value_t = 3010)]
    port: u16,

    /// Host address to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
}

pub async fn serve() -> Result<()> {
    // Initialize logging with tracing
    let subscriber = Registry::default()
        .with(
            HierarchicalLayer::new(2)
                .with_targets(true)
                .with_bracketed_fields(true),
        )
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        );

    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();

    info!("Starting judgeflow server");
    check_db_location(&args.common.db)?;
    let pool = crate::open_judgeflow_pool(&args.common.db)?;
    let state = crate::create_app_state(args.common.app_config(pool))?;

    // Ctrl-C stops the server and cancels any background runs
    let shutdown_token = state.shutdown_token.clone();
    tokio::spawn(async move {
        if let Ok(()) = tokio::signal::ctrl_c().await {
            info!("Received CTRL-C, initiating shutdown");
            shutdown_token.cancel();
        }
    });

    let app = routes(state.clone());
    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server running on http://{}", addr);

    let shutdown_token = state.shutdown_token.clone();
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown_token.cancelled().await })
        .await
    {
        error!("Server error: {}", e);
    }

    info!("Server shutdown complete");
    Ok(())
}
