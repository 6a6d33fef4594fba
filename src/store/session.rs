// src/store/session.rs
//! Per-cycle write session: identity cache, buffered mutations and a
//! dirty-flag flush.
//!
//! All writes run inside one lazily-begun transaction; `save_changes`
//! commits it when the session is dirty. Deleting a partially-synced build
//! and re-ingesting it therefore replaces the build's entire result
//! subtree atomically, without relying on cascading deletes.

use std::collections::HashMap;

use anyhow::Result;
use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::{debug, trace};

use crate::azdo::{CiBuild, CiTestRun, DefinitionRef};
use crate::model::{CaseKey, Outcome, ResultDetail, TestCase, MODEL_VERSION};

pub struct DbSession {
    pool: SqlitePool,
    tx: Option<Transaction<'static, Sqlite>>,
    dirty: bool,
    case_cache: HashMap<CaseKey, i64>,
}

impl DbSession {
    /// Open a session, pre-loading the identity cache from the store.
    pub async fn create(pool: &SqlitePool) -> Result<Self> {
        let rows = sqlx::query_as::<_, TestCase>(
            "SELECT id, project, type_name, method, arguments, argument_hash, kind \
             FROM test_cases",
        )
        .fetch_all(pool)
        .await?;

        let mut case_cache = HashMap::with_capacity(rows.len());
        for case in rows {
            let key = CaseKey::new(
                &case.project,
                &case.type_name,
                &case.method,
                case.argument_hash.clone(),
                case.kind.as_deref(),
            );
            case_cache.insert(key, case.id);
        }
        trace!("pre-loaded {} test case identities", case_cache.len());

        Ok(Self {
            pool: pool.clone(),
            tx: None,
            dirty: false,
            case_cache,
        })
    }

    async fn tx(&mut self) -> Result<&mut Transaction<'static, Sqlite>> {
        if self.tx.is_none() {
            self.tx = Some(self.pool.begin().await?);
        }
        Ok(self.tx.as_mut().expect("transaction just opened"))
    }

    /// Commit buffered mutations. A clean session releases its transaction
    /// without persisting anything.
    pub async fn save_changes(&mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            if self.dirty {
                tx.commit().await?;
                self.dirty = false;
            } else {
                tx.rollback().await?;
            }
        }
        Ok(())
    }

    pub async fn get_or_create_pipeline(&mut self, definition: &DefinitionRef) -> Result<i64> {
        let tx = self.tx().await?;
        let existing = sqlx::query_as::<_, (i64,)>(
            "SELECT id FROM pipelines WHERE project_id = ? AND external_id = ?",
        )
        .bind(&definition.project.id)
        .bind(definition.id)
        .fetch_optional(&mut **tx)
        .await?;

        if let Some((id,)) = existing {
            return Ok(id);
        }

        let result = sqlx::query(
            "INSERT INTO pipelines (project_id, external_id, path, name, project_name) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&definition.project.id)
        .bind(definition.id)
        .bind(&definition.path)
        .bind(&definition.name)
        .bind(&definition.project.name)
        .execute(&mut **tx)
        .await?;
        self.dirty = true;
        Ok(result.last_insert_rowid())
    }

    /// Start ingesting a build. Returns `None` when the build already
    /// carries a completion marker (fully synced, never reprocessed). An
    /// existing row without the marker is a previous partial sync: its whole
    /// result subtree is deleted and ingestion restarts from a clean slate.
    pub async fn try_create_build(&mut self, pipeline_id: i64, build: &CiBuild) -> Result<Option<i64>> {
        let tx = self.tx().await?;
        let existing = sqlx::query_as::<_, (i64, Option<chrono::DateTime<Utc>>)>(
            "SELECT id, sync_ended_at FROM builds WHERE project_id = ? AND external_id = ?",
        )
        .bind(&build.project.id)
        .bind(build.id)
        .fetch_optional(&mut **tx)
        .await?;

        if let Some((existing_id, sync_ended_at)) = existing {
            if sync_ended_at.is_some() {
                return Ok(None);
            }
            debug!("retrying partial sync of build {} (row {})", build.id, existing_id);
            self.delete_build_subtree(existing_id).await?;
        }

        let tx = self.tx().await?;
        let result = sqlx::query(
            "INSERT INTO builds \
             (project_id, external_id, pipeline_id, build_number, finished_at, sync_started_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&build.project.id)
        .bind(build.id)
        .bind(pipeline_id)
        .bind(&build.build_number)
        .bind(build.finish_time)
        .bind(Utc::now())
        .execute(&mut **tx)
        .await?;
        self.dirty = true;
        Ok(Some(result.last_insert_rowid()))
    }

    /// Stamp the completion marker. Only called after every result of the
    /// build has been buffered in this session.
    pub async fn mark_build_synced(&mut self, build_id: i64) -> Result<()> {
        let tx = self.tx().await?;
        sqlx::query("UPDATE builds SET sync_ended_at = ?, model_version = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(MODEL_VERSION)
            .bind(build_id)
            .execute(&mut **tx)
            .await?;
        self.dirty = true;
        Ok(())
    }

    async fn delete_build_subtree(&mut self, build_id: i64) -> Result<()> {
        let tx = self.tx().await?;
        sqlx::query(
            "DELETE FROM test_result_details WHERE result_id IN \
             (SELECT r.id FROM test_results r \
              JOIN test_runs tr ON r.run_id = tr.id WHERE tr.build_id = ?)",
        )
        .bind(build_id)
        .execute(&mut **tx)
        .await?;
        sqlx::query(
            "DELETE FROM test_results WHERE run_id IN \
             (SELECT id FROM test_runs WHERE build_id = ?)",
        )
        .bind(build_id)
        .execute(&mut **tx)
        .await?;
        sqlx::query("DELETE FROM test_runs WHERE build_id = ?")
            .bind(build_id)
            .execute(&mut **tx)
            .await?;
        sqlx::query("DELETE FROM builds WHERE id = ?")
            .bind(build_id)
            .execute(&mut **tx)
            .await?;
        self.dirty = true;
        Ok(())
    }

    pub async fn create_run(
        &mut self,
        build_id: i64,
        project_id: &str,
        run: &CiTestRun,
        run_type: Option<&str>,
    ) -> Result<i64> {
        let tx = self.tx().await?;
        let result = sqlx::query(
            "INSERT INTO test_runs (project_id, external_id, build_id, name, run_type) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(project_id)
        .bind(run.id)
        .bind(build_id)
        .bind(&run.name)
        .bind(run_type)
        .execute(&mut **tx)
        .await?;
        self.dirty = true;
        Ok(result.last_insert_rowid())
    }

    /// Find-or-create a test case identity.
    ///
    /// The in-memory cache short-circuits repeated lookups; on a miss the
    /// store is consulted by natural key before inserting, so a session that
    /// resumes mid-pipeline (or runs alongside another) never duplicates
    /// identity rows.
    pub async fn get_or_create_test_case(
        &mut self,
        project: &str,
        type_name: &str,
        method: &str,
        arguments: &str,
        kind: Option<&str>,
    ) -> Result<i64> {
        let argument_hash = hash_arguments(arguments);
        let key = CaseKey::new(project, type_name, method, argument_hash.clone(), kind);

        if let Some(id) = self.case_cache.get(&key) {
            return Ok(*id);
        }

        let kind = key.kind.clone();
        let tx = self.tx().await?;
        let existing = sqlx::query_as::<_, (i64,)>(
            "SELECT id FROM test_cases \
             WHERE project = ? AND type_name = ? AND method = ? \
               AND argument_hash IS ? AND kind IS ?",
        )
        .bind(project)
        .bind(type_name)
        .bind(method)
        .bind(&argument_hash)
        .bind(&kind)
        .fetch_optional(&mut **tx)
        .await?;

        let id = match existing {
            Some((id,)) => id,
            None => {
                let result = sqlx::query(
                    "INSERT INTO test_cases \
                     (project, type_name, method, arguments, argument_hash, kind) \
                     VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(project)
                .bind(type_name)
                .bind(method)
                .bind(if arguments.is_empty() { None } else { Some(arguments) })
                .bind(&argument_hash)
                .bind(&kind)
                .execute(&mut **tx)
                .await?;
                self.dirty = true;
                result.last_insert_rowid()
            }
        };

        self.case_cache.insert(key, id);
        Ok(id)
    }

    pub async fn create_result(
        &mut self,
        run_id: i64,
        case_id: i64,
        outcome: Outcome,
        detail: &ResultDetail,
    ) -> Result<i64> {
        let tx = self.tx().await?;
        let result = sqlx::query(
            "INSERT INTO test_results (run_id, case_id, outcome) VALUES (?, ?, ?)",
        )
        .bind(run_id)
        .bind(case_id)
        .bind(outcome.as_str())
        .execute(&mut **tx)
        .await?;
        let result_id = result.last_insert_rowid();

        if !detail.is_empty() {
            sqlx::query(
                "INSERT INTO test_result_details \
                 (result_id, web_url, skip_reason, message, stack_trace) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(result_id)
            .bind(&detail.web_url)
            .bind(&detail.skip_reason)
            .bind(&detail.message)
            .bind(&detail.stack_trace)
            .execute(&mut **tx)
            .await?;
        }

        self.dirty = true;
        Ok(result_id)
    }
}

/// Fixed-length digest of the raw argument string, used as the dedup key
/// component instead of the unbounded arguments themselves. Absent or empty
/// arguments map to no hash at all, which is distinct from the digest of
/// the empty string.
pub fn hash_arguments(arguments: &str) -> Option<String> {
    if arguments.is_empty() {
        return None;
    }
    let mut hasher = Sha256::new();
    hasher.update(arguments.as_bytes());
    Some(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::azdo::ProjectRef;
    use crate::store::{init_schema, open_pool};

    async fn test_pool() -> SqlitePool {
        let pool = open_pool("sqlite::memory:", 1).await.expect("open pool");
        init_schema(&pool).await.expect("init schema");
        pool
    }

    fn definition() -> DefinitionRef {
        DefinitionRef {
            id: 17,
            name: "ci".to_string(),
            path: r"\Folder".to_string(),
            project: ProjectRef {
                id: "11111111-2222-3333-4444-555555555555".to_string(),
                name: "example".to_string(),
            },
            revision: None,
        }
    }

    fn build(external_id: i64) -> CiBuild {
        CiBuild {
            id: external_id,
            build_number: format!("20260808.{external_id}"),
            finish_time: Some(Utc::now()),
            project: definition().project,
        }
    }

    #[test]
    fn empty_arguments_have_no_hash() {
        assert!(hash_arguments("").is_none());
        let hash = hash_arguments("1,2").expect("hash");
        assert_eq!(hash.len(), 64);
        assert_ne!(Some(hash), hash_arguments("1,3"));
    }

    #[tokio::test]
    async fn test_case_upserts_resolve_to_one_row() {
        let pool = test_pool().await;
        let mut session = DbSession::create(&pool).await.unwrap();

        let first = session
            .get_or_create_test_case("Foo.Tests", "Foo.Bar", "Baz", "1,2", Some("XUnit"))
            .await
            .unwrap();
        let second = session
            .get_or_create_test_case("Foo.Tests", "Foo.Bar", "Baz", "1,2", Some("xunit"))
            .await
            .unwrap();
        assert_eq!(first, second);
        session.save_changes().await.unwrap();

        // A fresh session (new cache) must still resolve to the same row.
        let mut resumed = DbSession::create(&pool).await.unwrap();
        let third = resumed
            .get_or_create_test_case("Foo.Tests", "Foo.Bar", "Baz", "1,2", Some("xunit"))
            .await
            .unwrap();
        assert_eq!(first, third);
        resumed.save_changes().await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM test_cases")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn distinct_arguments_are_distinct_cases() {
        let pool = test_pool().await;
        let mut session = DbSession::create(&pool).await.unwrap();

        let bare = session
            .get_or_create_test_case("Foo.Tests", "Foo.Bar", "Baz", "", None)
            .await
            .unwrap();
        let with_args = session
            .get_or_create_test_case("Foo.Tests", "Foo.Bar", "Baz", "1,2", None)
            .await
            .unwrap();
        assert_ne!(bare, with_args);
        session.save_changes().await.unwrap();

        let null_hashes: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM test_cases WHERE argument_hash IS NULL")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(null_hashes, 1);
    }

    #[tokio::test]
    async fn completed_builds_are_never_reprocessed() {
        let pool = test_pool().await;
        let mut session = DbSession::create(&pool).await.unwrap();

        let pipeline_id = session.get_or_create_pipeline(&definition()).await.unwrap();
        let build_id = session
            .try_create_build(pipeline_id, &build(42))
            .await
            .unwrap()
            .expect("new build row");
        session.mark_build_synced(build_id).await.unwrap();
        session.save_changes().await.unwrap();

        let again = session.try_create_build(pipeline_id, &build(42)).await.unwrap();
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn partial_builds_are_deleted_and_rebuilt() {
        let pool = test_pool().await;
        let mut session = DbSession::create(&pool).await.unwrap();

        let pipeline_id = session.get_or_create_pipeline(&definition()).await.unwrap();
        let build_id = session
            .try_create_build(pipeline_id, &build(42))
            .await
            .unwrap()
            .expect("new build row");
        let run = CiTestRun { id: 7, name: "run".to_string() };
        let run_id = session
            .create_run(build_id, &definition().project.id, &run, None)
            .await
            .unwrap();
        let case_id = session
            .get_or_create_test_case("Foo.Tests", "Foo.Bar", "Baz", "", None)
            .await
            .unwrap();
        session
            .create_result(run_id, case_id, Outcome::Failed, &ResultDetail::default())
            .await
            .unwrap();
        // No completion marker: this build is a partial sync.
        session.save_changes().await.unwrap();

        let retried = session
            .try_create_build(pipeline_id, &build(42))
            .await
            .unwrap()
            .expect("partial build restarts ingestion");
        assert_ne!(retried, build_id);
        session.save_changes().await.unwrap();

        let builds: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM builds")
            .fetch_one(&pool)
            .await
            .unwrap();
        let runs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM test_runs")
            .fetch_one(&pool)
            .await
            .unwrap();
        let results: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM test_results")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!((builds, runs, results), (1, 0, 0));
        // Identity rows survive the subtree replacement.
        let cases: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM test_cases")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(cases, 1);
    }

    #[tokio::test]
    async fn clean_sessions_do_not_flush() {
        let pool = test_pool().await;
        let mut session = DbSession::create(&pool).await.unwrap();
        // Only a read: the session stays clean and save_changes is a no-op.
        let missing = sqlx::query_as::<_, (i64,)>("SELECT id FROM pipelines WHERE id = 999")
            .fetch_optional(&pool)
            .await
            .unwrap();
        assert!(missing.is_none());
        session.save_changes().await.unwrap();
    }
}
