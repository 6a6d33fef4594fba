// tests/sync_cycle.rs
// End-to-end sync cycles against a canned CI source and a real SQLite pool.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use flaketrack::azdo::{
    CiBuild, CiConnector, CiSource, CiSubResult, CiTestResult, CiTestRun, DefinitionRef,
    ProjectRef,
};
use flaketrack::config::{PipelineSpec, UnsupportedResultMode};
use flaketrack::store::{init_schema, open_pool};
use flaketrack::sync::{SyncOptions, SyncOrchestrator};

const PROJECT_ID: &str = "11111111-2222-3333-4444-555555555555";

struct MockCi {
    include_unsupported: bool,
}

fn project() -> ProjectRef {
    ProjectRef {
        id: PROJECT_ID.to_string(),
        name: "example".to_string(),
    }
}

fn definition(id: i64, path: &str, name: &str) -> DefinitionRef {
    DefinitionRef {
        id,
        name: name.to_string(),
        path: path.to_string(),
        project: project(),
        revision: Some(3),
    }
}

fn plain_result(name: &str, outcome: &str) -> CiTestResult {
    CiTestResult {
        automated_test_name: Some(name.to_string()),
        automated_test_storage: Some("Foo.Tests.dll".to_string()),
        automated_test_type: Some("xunit".to_string()),
        outcome: Some(outcome.to_string()),
        result_group_type: Some("none".to_string()),
        ..CiTestResult::default()
    }
}

#[async_trait]
impl CiSource for MockCi {
    async fn list_definitions(&self, _project: &str) -> Result<Vec<DefinitionRef>> {
        Ok(vec![
            definition(17, r"\Folder", "CI"),
            definition(18, r"\Folder", "Other"),
        ])
    }

    async fn get_definition(&self, _project: &str, definition_id: i64) -> Result<DefinitionRef> {
        Ok(definition(definition_id, r"\Folder", "CI"))
    }

    async fn list_builds(
        &self,
        _project: &str,
        _definition_id: i64,
        _min_finish_time: Option<DateTime<Utc>>,
        _top: u32,
    ) -> Result<Vec<CiBuild>> {
        Ok(vec![CiBuild {
            id: 42,
            build_number: "20260808.1".to_string(),
            finish_time: Some(Utc::now()),
            project: project(),
        }])
    }

    async fn list_runs(&self, _project: &str, _build_id: i64) -> Result<Vec<CiTestRun>> {
        Ok(vec![CiTestRun {
            id: 7,
            name: "Unit Tests".to_string(),
        }])
    }

    async fn list_results(&self, _project: &str, _run_id: i64) -> Result<Vec<CiTestResult>> {
        let mut results = vec![
            plain_result("Foo.Tests.UnitTests.TestA", "Passed"),
            CiTestResult {
                url: Some("https://ci.example.com/results/2".to_string()),
                error_message: Some("expected 1 but got 2".to_string()),
                stack_trace: Some("at Foo.Tests.UnitTests.TestB()".to_string()),
                ..plain_result("Foo.Tests.UnitTests.TestB", "Failed")
            },
            // Data-driven result: outcomes live in the sub-results.
            CiTestResult {
                automated_test_name: Some("Foo.Tests.UnitTests.TestC".to_string()),
                automated_test_storage: Some("Foo.Tests.dll".to_string()),
                automated_test_type: Some("xunit".to_string()),
                result_group_type: Some("dataDriven".to_string()),
                sub_results: Some(vec![
                    CiSubResult {
                        display_name: Some("Foo.Tests.UnitTests.TestC(1)".to_string()),
                        outcome: Some("Passed".to_string()),
                        ..CiSubResult::default()
                    },
                    CiSubResult {
                        display_name: Some("Foo.Tests.UnitTests.TestC(2)".to_string()),
                        outcome: Some("Failed".to_string()),
                        error_message: Some("boom".to_string()),
                        ..CiSubResult::default()
                    },
                ]),
                ..CiTestResult::default()
            },
            // Kind on the skip list: never ingested.
            CiTestResult {
                automated_test_name: Some("com.example.JavaTest".to_string()),
                automated_test_storage: Some("java--tests".to_string()),
                automated_test_type: Some("JUnit".to_string()),
                outcome: Some("Passed".to_string()),
                ..CiTestResult::default()
            },
        ];
        if self.include_unsupported {
            results.push(CiTestResult {
                automated_test_name: Some("Foo.Tests.UnitTests.TestD".to_string()),
                automated_test_storage: Some("Foo.Tests.dll".to_string()),
                automated_test_type: Some("xunit".to_string()),
                result_group_type: Some("generic".to_string()),
                ..CiTestResult::default()
            });
        }
        Ok(results)
    }
}

struct MockConnector {
    ci: Arc<MockCi>,
}

#[async_trait]
impl CiConnector for MockConnector {
    async fn connect(&self) -> Result<Arc<dyn CiSource>> {
        Ok(self.ci.clone())
    }
}

fn options(mode: UnsupportedResultMode) -> SyncOptions {
    SyncOptions {
        pipelines: vec![
            PipelineSpec {
                project: "example".to_string(),
                pipeline: "/Folder/CI".to_string(),
                run_type: Some("public".to_string()),
            },
            // Unresolvable: logged and skipped, never fatal.
            PipelineSpec {
                project: "example".to_string(),
                pipeline: "/Nope/Missing".to_string(),
                run_type: None,
            },
        ],
        poll_interval: Duration::from_secs(600),
        lookback: chrono::Duration::days(7),
        build_limit: 10,
        skip_kinds: vec!["junit".to_string()],
        on_unsupported_results: mode,
    }
}

fn orchestrator(
    pool: &SqlitePool,
    include_unsupported: bool,
    mode: UnsupportedResultMode,
) -> SyncOrchestrator {
    let connector = Arc::new(MockConnector {
        ci: Arc::new(MockCi { include_unsupported }),
    });
    SyncOrchestrator::new(pool.clone(), connector, options(mode))
}

async fn memory_pool() -> SqlitePool {
    let pool = open_pool("sqlite::memory:", 1).await.expect("open pool");
    init_schema(&pool).await.expect("init schema");
    pool
}

async fn count(pool: &SqlitePool, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(pool)
        .await
        .expect("count")
}

async fn table_counts(pool: &SqlitePool) -> (i64, i64, i64, i64, i64, i64) {
    (
        count(pool, "pipelines").await,
        count(pool, "builds").await,
        count(pool, "test_runs").await,
        count(pool, "test_cases").await,
        count(pool, "test_results").await,
        count(pool, "test_result_details").await,
    )
}

#[tokio::test]
async fn full_cycle_ingests_the_expected_graph() {
    let pool = memory_pool().await;
    let sync = orchestrator(&pool, true, UnsupportedResultMode::Skip);

    sync.run_cycle().await.expect("first cycle");

    // TestA, TestB, TestC(1), TestC(2); junit and the unsupported shape
    // are skipped.
    assert_eq!(table_counts(&pool).await, (1, 1, 1, 4, 4, 2));

    let (run_type,): (Option<String>,) =
        sqlx::query_as("SELECT run_type FROM test_runs WHERE external_id = 7")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(run_type.as_deref(), Some("public"));

    let (ended, version): (Option<DateTime<Utc>>, Option<i64>) =
        sqlx::query_as("SELECT sync_ended_at, model_version FROM builds WHERE external_id = 42")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert!(ended.is_some(), "completion marker must be stamped");
    assert!(version.is_some());

    let failed: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM test_results WHERE outcome = 'failed'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(failed, 2);

    // The data-driven sub-cases share a method but differ by argument hash.
    let distinct_hashes: i64 = sqlx::query_scalar(
        "SELECT COUNT(DISTINCT argument_hash) FROM test_cases WHERE method = 'TestC'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(distinct_hashes, 2);
}

#[tokio::test]
async fn repeated_cycles_are_idempotent() {
    let pool = memory_pool().await;
    let sync = orchestrator(&pool, false, UnsupportedResultMode::Skip);

    sync.run_cycle().await.expect("first cycle");
    let before = table_counts(&pool).await;

    sync.run_cycle().await.expect("second cycle");
    sync.run_cycle().await.expect("third cycle");
    assert_eq!(table_counts(&pool).await, before);
}

#[tokio::test]
async fn partial_builds_are_rebuilt_not_duplicated() {
    let pool = memory_pool().await;
    let sync = orchestrator(&pool, false, UnsupportedResultMode::Skip);

    sync.run_cycle().await.expect("first cycle");
    let before = table_counts(&pool).await;

    // Strip the completion marker: the next cycle must delete and fully
    // rebuild this build rather than skip or patch it.
    sqlx::query("UPDATE builds SET sync_ended_at = NULL WHERE external_id = 42")
        .execute(&pool)
        .await
        .unwrap();

    sync.run_cycle().await.expect("retry cycle");
    assert_eq!(table_counts(&pool).await, before);

    let unmarked: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM builds WHERE sync_ended_at IS NULL")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(unmarked, 0);
}

#[tokio::test]
async fn fatal_mode_aborts_the_cycle_on_unsupported_shapes() {
    let pool = memory_pool().await;
    let sync = orchestrator(&pool, true, UnsupportedResultMode::Fatal);

    let err = sync.run_cycle().await.expect_err("cycle must abort");
    assert!(format!("{err:#}").contains("unsupported result shape"));

    // The aborted build keeps no completion marker, so the next (lenient)
    // configuration rebuilds it cleanly.
    let marked: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM builds WHERE sync_ended_at IS NOT NULL")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(marked, 0);

    let lenient = orchestrator(&pool, true, UnsupportedResultMode::Skip);
    lenient.run_cycle().await.expect("lenient cycle");
    assert_eq!(table_counts(&pool).await, (1, 1, 1, 4, 4, 2));
}

#[tokio::test]
async fn file_backed_database_survives_reopening() {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = format!("sqlite:{}/flaketrack.db", dir.path().display());

    {
        let pool = open_pool(&url, 1).await.expect("open pool");
        init_schema(&pool).await.expect("init schema");
        let sync = orchestrator(&pool, false, UnsupportedResultMode::Skip);
        sync.run_cycle().await.expect("cycle");
        pool.close().await;
    }

    let pool = open_pool(&url, 1).await.expect("reopen pool");
    init_schema(&pool).await.expect("schema is idempotent");
    assert_eq!(count(&pool, "builds").await, 1);

    // A fresh process over the same store still dedups identities.
    let sync = orchestrator(&pool, false, UnsupportedResultMode::Skip);
    sync.run_cycle().await.expect("cycle after reopen");
    assert_eq!(count(&pool, "test_cases").await, 4);
}
