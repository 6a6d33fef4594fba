// src/store/mod.rs
//! SQLite persistence: pool construction and schema bootstrap.
//! Run `init_schema` at startup to guarantee schema compatibility.

pub mod session;

use std::str::FromStr;

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Executor;
use tracing::debug;

const CREATE_PIPELINES: &str = r#"
CREATE TABLE IF NOT EXISTS pipelines (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id TEXT NOT NULL,
    external_id INTEGER NOT NULL,
    path TEXT NOT NULL,
    name TEXT NOT NULL,
    project_name TEXT NOT NULL
);
"#;

const CREATE_PIPELINES_KEY: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS ux_pipelines_project_external
    ON pipelines (project_id, external_id);
"#;

const CREATE_BUILDS: &str = r#"
CREATE TABLE IF NOT EXISTS builds (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id TEXT NOT NULL,
    external_id INTEGER NOT NULL,
    pipeline_id INTEGER NOT NULL REFERENCES pipelines(id),
    build_number TEXT NOT NULL,
    finished_at DATETIME,
    sync_started_at DATETIME,
    sync_ended_at DATETIME,
    model_version INTEGER
);
"#;

const CREATE_BUILDS_KEY: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS ux_builds_project_external
    ON builds (project_id, external_id);
"#;

const CREATE_TEST_RUNS: &str = r#"
CREATE TABLE IF NOT EXISTS test_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id TEXT NOT NULL,
    external_id INTEGER NOT NULL,
    build_id INTEGER NOT NULL REFERENCES builds(id),
    name TEXT NOT NULL,
    run_type TEXT
);
"#;

const CREATE_TEST_RUNS_KEY: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS ux_test_runs_project_external
    ON test_runs (project_id, external_id);
"#;

const CREATE_TEST_CASES: &str = r#"
CREATE TABLE IF NOT EXISTS test_cases (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project TEXT NOT NULL,
    type_name TEXT NOT NULL,
    method TEXT NOT NULL,
    arguments TEXT,
    argument_hash TEXT,
    kind TEXT
);
"#;

const CREATE_TEST_CASES_IDENTITY: &str = r#"
CREATE INDEX IF NOT EXISTS idx_test_cases_identity
    ON test_cases (project, type_name, method, argument_hash, kind);
"#;

const CREATE_TEST_RESULTS: &str = r#"
CREATE TABLE IF NOT EXISTS test_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id INTEGER NOT NULL REFERENCES test_runs(id),
    case_id INTEGER NOT NULL REFERENCES test_cases(id),
    outcome TEXT NOT NULL
);
"#;

const CREATE_TEST_RESULTS_RUN: &str = r#"
CREATE INDEX IF NOT EXISTS idx_test_results_run ON test_results (run_id);
"#;

const CREATE_TEST_RESULT_DETAILS: &str = r#"
CREATE TABLE IF NOT EXISTS test_result_details (
    result_id INTEGER PRIMARY KEY REFERENCES test_results(id),
    web_url TEXT,
    skip_reason TEXT,
    message TEXT,
    stack_trace TEXT
);
"#;

pub async fn open_pool(database_url: &str, max_connections: u32) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;
    Ok(pool)
}

pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    for statement in [
        CREATE_PIPELINES,
        CREATE_PIPELINES_KEY,
        CREATE_BUILDS,
        CREATE_BUILDS_KEY,
        CREATE_TEST_RUNS,
        CREATE_TEST_RUNS_KEY,
        CREATE_TEST_CASES,
        CREATE_TEST_CASES_IDENTITY,
        CREATE_TEST_RESULTS,
        CREATE_TEST_RESULTS_RUN,
        CREATE_TEST_RESULT_DETAILS,
    ] {
        pool.execute(statement).await?;
    }
    debug!("database schema ready");
    Ok(())
}
