use crate::llm::fake::FakeGateway;
use crate::llm::{create_gateway, GatewayConfig, LlmGateway};
use crate::retry::RetryPolicy;
use crate::runner::{EvaluationRunner, RunRegistry};
use crate::store::{SqliteStore, Store};
use anyhow::Result;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use rusqlite_migration::{Migrations, M};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::instrument;

pub mod app;
pub mod cli;
pub mod eval;
pub mod llm;
pub mod models;
pub mod progress;
pub mod prompts;
pub mod results;
pub mod retry;
pub mod runner;
pub mod store;
pub mod submissions;

pub mod test_utils;

// Shared by the HTTP server, the batch CLI and tests
pub struct AppState {
    pub judgeflow_db: Pool<SqliteConnectionManager>,
    pub store: Arc<dyn Store>,
    pub gateway: Arc<dyn LlmGateway>,
    pub retry_policy: RetryPolicy,
    // Background runs started over HTTP, keyed by queue id
    pub runs: RunRegistry,
    pub shutdown_token: CancellationToken,
    #[allow(dead_code)]
    temp_db_path: Option<tempfile::NamedTempFile>,
}

impl AppState {
    pub fn new_for_testing() -> Self {
        Self::new_for_testing_with_gateway(Arc::new(FakeGateway::new()))
    }

    // Temp-file database, no backoff delay between retries
    pub fn new_for_testing_with_gateway(gateway: Arc<dyn LlmGateway>) -> Self {
        let temp_db_file = tempfile::NamedTempFile::new()
            .expect("Failed to create temporary judgeflow database file");
        let db_path = temp_db_file
            .path()
            .to_str()
            .expect("Failed to get judgeflow temp file path")
            .to_string();

        let manager = SqliteConnectionManager::file(&db_path);
        let pool = Pool::new(manager).expect("Failed to create judgeflow pool");

        let mut conn = pool.get().expect("Failed to get connection");
        init_judgeflow_db(&mut conn)
            .expect("Failed to initialize judgeflow db");
        drop(conn);

        Self {
            store: Arc::new(SqliteStore::new(pool.clone())),
            judgeflow_db: pool,
            gateway,
            retry_policy: RetryPolicy::new(
                retry::DEFAULT_MAX_RETRIES,
                std::time::Duration::ZERO,
            ),
            runs: RunRegistry::default(),
            shutdown_token: CancellationToken::new(),
            // Kept so the file is removed when AppState is dropped
            temp_db_path: Some(temp_db_file),
        }
    }

    pub fn runner(&self) -> EvaluationRunner {
        EvaluationRunner::new(
            self.store.clone(),
            self.gateway.clone(),
            self.retry_policy,
        )
    }
}

pub struct AppConfig {
    pub judgeflow_pool: Pool<SqliteConnectionManager>,
    pub gateway: GatewayConfig,
    pub retry_policy: RetryPolicy,
}

pub fn create_app_state(config: AppConfig) -> Result<Arc<AppState>> {
    let gateway = create_gateway(config.gateway)?;

    Ok(Arc::new(AppState {
        store: Arc::new(SqliteStore::new(config.judgeflow_pool.clone())),
        judgeflow_db: config.judgeflow_pool,
        gateway,
        retry_policy: config.retry_policy,
        runs: RunRegistry::default(),
        shutdown_token: CancellationToken::new(),
        temp_db_path: None,
    }))
}

/// Opens (creating if needed) the database at `path` and brings its schema
/// up to date.
pub fn open_judgeflow_pool(
    path: &std::path::Path,
) -> Result<Pool<SqliteConnectionManager>> {
    let manager = SqliteConnectionManager::file(path);
    let pool = Pool::new(manager)?;
    {
        let mut conn = pool.get()?;
        init_judgeflow_db(&mut conn)?;
    }
    Ok(pool)
}

fn judgeflow_migration_steps() -> Vec<M<'static>> {
    vec![
        M::up(
            r#"
            CREATE TABLE IF NOT EXISTS judges (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                system_prompt TEXT NOT NULL,
                model_name TEXT NOT NULL,
                provider TEXT NOT NULL,               -- 'openai' or 'anthropic'
                active INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,          -- Unix millis
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS submissions (
                id TEXT PRIMARY KEY,                  -- Generated on upload
                source_id TEXT NOT NULL,              -- Id carried in the uploaded payload
                queue_id TEXT NOT NULL,
                labeling_task_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                uploaded_at INTEGER NOT NULL,
                questions TEXT NOT NULL,              -- JSON array
                answers TEXT NOT NULL                 -- JSON object keyed by question id
            );

            CREATE TABLE IF NOT EXISTS judge_assignments (
                id TEXT PRIMARY KEY,
                queue_id TEXT NOT NULL,
                question_id TEXT NOT NULL,
                judge_ids TEXT NOT NULL,              -- JSON array, ordered
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE(queue_id, question_id)
            );

            CREATE TABLE IF NOT EXISTS evaluations (
                id TEXT PRIMARY KEY,
                submission_id TEXT NOT NULL,
                queue_id TEXT NOT NULL,
                question_id TEXT NOT NULL,
                judge_id TEXT NOT NULL,
                judge_name TEXT NOT NULL,
                verdict TEXT NOT NULL,
                reasoning TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                model_used TEXT NOT NULL,
                provider TEXT NOT NULL,
                latency_ms INTEGER NOT NULL,
                error TEXT
            );
            "#,
        ),
        M::up(
            r#"
            CREATE INDEX IF NOT EXISTS idx_submissions_queue
                ON submissions(queue_id);

            CREATE INDEX IF NOT EXISTS idx_evaluations_queue_created
                ON evaluations(queue_id, created_at DESC);
            "#,
        ),
        M::up(
            r#"
            ALTER TABLE evaluations ADD COLUMN prompt_tokens INTEGER;
            ALTER TABLE evaluations ADD COLUMN completion_tokens INTEGER;
            "#,
        ),
        M::up(
            r#"
            CREATE TABLE IF NOT EXISTS evaluation_runs (
                id TEXT PRIMARY KEY,
                queue_id TEXT NOT NULL,
                status TEXT NOT NULL,                 -- running, completed, failed
                total_evaluations INTEGER NOT NULL,
                completed_evaluations INTEGER NOT NULL DEFAULT 0,
                failed_evaluations INTEGER NOT NULL DEFAULT 0,
                started_at INTEGER NOT NULL,
                completed_at INTEGER,
                error TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_evaluation_runs_queue
                ON evaluation_runs(queue_id, started_at DESC);
            "#,
        ),
    ]
}

// Database initialization
#[instrument(skip(conn))]
pub fn init_judgeflow_db(conn: &mut Connection) -> Result<()> {
    info!("Initializing judgeflow database");
    conn.pragma_update(None, "journal_mode", "WAL")?;

    let migrations = Migrations::new(judgeflow_migration_steps());
    migrations.to_latest(conn)?;

    Ok(())
}

#[cfg(test)]
mod migration_tests {
    use super::{init_judgeflow_db, judgeflow_migration_steps};
    use anyhow::Result;
    use rusqlite::{Connection, OptionalExtension};
    use rusqlite_migration::Migrations;

    fn has_table(conn: &Connection, name: &str) -> Result<bool> {
        Ok(conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [name],
                |_| Ok(()),
            )
            .optional()?
            .is_some())
    }

    fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names.iter().any(|n| n == column))
    }

    #[test]
    fn migrations_are_valid() {
        assert!(Migrations::new(judgeflow_migration_steps()).validate().is_ok());
    }

    #[test]
    fn migrations_apply_on_fresh_database() -> Result<()> {
        let mut conn = Connection::open_in_memory()?;

        init_judgeflow_db(&mut conn)?;

        for table in [
            "judges",
            "submissions",
            "judge_assignments",
            "evaluations",
            "evaluation_runs",
        ] {
            assert!(has_table(&conn, table)?, "missing table {}", table);
        }
        assert!(has_column(&conn, "evaluations", "prompt_tokens")?);

        Ok(())
    }

    #[test]
    fn migrations_upgrade_existing_schema() -> Result<()> {
        let mut conn = Connection::open_in_memory()?;

        // Apply only the first migration to simulate an older database.
        let mut partial_steps = judgeflow_migration_steps();
        let first_step = vec![partial_steps.remove(0)];
        Migrations::new(first_step).to_latest(&mut conn)?;

        assert!(!has_column(&conn, "evaluations", "completion_tokens")?);
        assert!(!has_table(&conn, "evaluation_runs")?);

        init_judgeflow_db(&mut conn)?;

        assert!(has_column(&conn, "evaluations", "completion_tokens")?);
        assert!(has_table(&conn, "evaluation_runs")?);

        Ok(())
    }

    #[test]
    fn assignments_are_unique_per_question() -> Result<()> {
        let mut conn = Connection::open_in_memory()?;
        init_judgeflow_db(&mut conn)?;

        let insert = "INSERT INTO judge_assignments
            (id, queue_id, question_id, judge_ids, created_at, updated_at)
            VALUES (?1, 'queue', 'q1', '[]', 0, 0)";
        conn.execute(insert, ["a"])?;
        assert!(conn.execute(insert, ["b"]).is_err());

        Ok(())
    }
}
