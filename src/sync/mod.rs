// src/sync/mod.rs
//! Polling orchestrator: resolve configured pipelines against the CI
//! source, ingest newly finished builds, sleep, repeat.
//!
//! Pipelines, builds, runs and results are processed sequentially to bound
//! load on the source API and keep the identity cache hot. Any
//! non-cancellation error escalates and terminates the orchestrator;
//! recovery is external process supervision. Cancellation is observed at
//! the loop top and around the sleep, never logged as an error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::azdo::{CiBuild, CiConnector, CiSource, CiTestResult, CiTestRun, DefinitionRef};
use crate::config::{Config, PipelineSpec, UnsupportedResultMode};
use crate::model::{Outcome, ResultDetail};
use crate::names;
use crate::store::session::DbSession;

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub pipelines: Vec<PipelineSpec>,
    pub poll_interval: Duration,
    pub lookback: chrono::Duration,
    pub build_limit: u32,
    pub skip_kinds: Vec<String>,
    pub on_unsupported_results: UnsupportedResultMode,
}

impl SyncOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            pipelines: config.pipelines.clone(),
            poll_interval: config.poll_interval,
            lookback: chrono::Duration::days(config.lookback_days),
            build_limit: config.build_limit,
            skip_kinds: config.skip_kinds.clone(),
            on_unsupported_results: config.on_unsupported_results,
        }
    }
}

pub struct SyncOrchestrator {
    pool: SqlitePool,
    connector: Arc<dyn CiConnector>,
    options: SyncOptions,
}

impl SyncOrchestrator {
    pub fn new(pool: SqlitePool, connector: Arc<dyn CiConnector>, options: SyncOptions) -> Self {
        Self {
            pool,
            connector,
            options,
        }
    }

    /// Drive sync cycles until cancelled. Errors propagate to the caller,
    /// which is expected to terminate the process.
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        loop {
            if token.is_cancelled() {
                break;
            }

            self.run_cycle().await?;

            info!("sleeping for {:?}", self.options.poll_interval);
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.options.poll_interval) => {}
            }
        }
        info!("sync orchestrator stopped");
        Ok(())
    }

    /// One full cycle: connect, resolve every configured pipeline, then
    /// sync each resolved pipeline in turn.
    pub async fn run_cycle(&self) -> Result<()> {
        let ci = self
            .connector
            .connect()
            .await
            .context("connecting to CI source")?;
        let mut db = DbSession::create(&self.pool).await?;

        let resolved = self.resolve_pipelines(ci.as_ref()).await?;
        for (definition, spec) in &resolved {
            self.sync_definition(&mut db, ci.as_ref(), definition, spec)
                .await
                .with_context(|| {
                    format!("syncing pipeline {}:{}", spec.project, spec.pipeline)
                })?;
        }
        Ok(())
    }

    /// Map configured specs to source definitions. Config accepts `/` as
    /// the path separator to avoid escaping; the source system uses `\`.
    /// An unresolved spec is logged and skipped, never fatal.
    async fn resolve_pipelines(
        &self,
        ci: &dyn CiSource,
    ) -> Result<Vec<(DefinitionRef, PipelineSpec)>> {
        let mut by_project: HashMap<&str, Vec<&PipelineSpec>> = HashMap::new();
        for spec in &self.options.pipelines {
            by_project.entry(spec.project.as_str()).or_default().push(spec);
        }

        let mut resolved = Vec::new();
        for (project, specs) in by_project {
            let definitions: HashMap<String, DefinitionRef> = ci
                .list_definitions(project)
                .await
                .with_context(|| format!("listing definitions for {project}"))?
                .into_iter()
                .map(|d| (d.qualified_name(), d))
                .collect();

            for spec in specs {
                let qualified = spec.pipeline.replace('/', "\\");
                match definitions.get(&qualified) {
                    Some(reference) => {
                        trace!(
                            "resolved {}:{} to {}:{}",
                            spec.project,
                            spec.pipeline,
                            reference.project.id,
                            reference.id
                        );
                        let definition = ci
                            .get_definition(&reference.project.id, reference.id)
                            .await?;
                        resolved.push((definition, spec.clone()));
                    }
                    None => {
                        warn!("unable to resolve pipeline: {}:{}", spec.project, spec.pipeline);
                    }
                }
            }
        }
        Ok(resolved)
    }

    async fn sync_definition(
        &self,
        db: &mut DbSession,
        ci: &dyn CiSource,
        definition: &DefinitionRef,
        spec: &PipelineSpec,
    ) -> Result<()> {
        let pipeline_id = db.get_or_create_pipeline(definition).await?;
        db.save_changes().await?;

        let min_finish_time = Utc::now() - self.options.lookback;
        let builds = ci
            .list_builds(
                &definition.project.id,
                definition.id,
                Some(min_finish_time),
                self.options.build_limit,
            )
            .await?;
        trace!(
            "fetched {} candidate builds for {}:{}",
            builds.len(),
            definition.project.id,
            definition.id
        );

        for build in &builds {
            debug!(
                "synchronizing build {}/{}#{}",
                definition.project.id, definition.name, build.build_number
            );
            self.sync_build(db, ci, pipeline_id, definition, spec, build)
                .await?;
        }
        Ok(())
    }

    async fn sync_build(
        &self,
        db: &mut DbSession,
        ci: &dyn CiSource,
        pipeline_id: i64,
        definition: &DefinitionRef,
        spec: &PipelineSpec,
        build: &CiBuild,
    ) -> Result<()> {
        let Some(build_id) = db.try_create_build(pipeline_id, build).await? else {
            trace!("build {} already synced", build.id);
            return Ok(());
        };

        let runs = ci.list_runs(&definition.project.id, build.id).await?;
        for run in &runs {
            debug!(
                "synchronizing test run {}/{}#{}/{}",
                definition.project.id, definition.name, build.build_number, run.name
            );
            self.sync_run(db, ci, &definition.project.id, build_id, run, spec)
                .await?;
        }

        // The completion marker goes in only after every result of the
        // build is buffered; the single commit below makes it durable
        // together with the data it vouches for.
        db.mark_build_synced(build_id).await?;
        db.save_changes().await?;
        Ok(())
    }

    async fn sync_run(
        &self,
        db: &mut DbSession,
        ci: &dyn CiSource,
        project_id: &str,
        build_id: i64,
        run: &CiTestRun,
        spec: &PipelineSpec,
    ) -> Result<()> {
        let run_id = db
            .create_run(build_id, project_id, run, spec.run_type.as_deref())
            .await?;

        let results = ci.list_results(project_id, run.id).await?;
        for result in &results {
            self.ingest_result(db, run_id, result).await?;
        }
        Ok(())
    }

    async fn ingest_result(
        &self,
        db: &mut DbSession,
        run_id: i64,
        result: &CiTestResult,
    ) -> Result<()> {
        let kind = result
            .automated_test_type
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty());

        if let Some(kind) = kind {
            if self.options.skip_kinds.iter().any(|s| s.eq_ignore_ascii_case(kind)) {
                trace!("skipping result of kind '{}'", kind);
                return Ok(());
            }
        }

        let storage = result.automated_test_storage.as_deref().unwrap_or_default();
        let project = names::parse_project(storage);

        match result.sub_results.as_deref() {
            // Grouped (rerun/data-driven) results: one row per sub-result.
            Some(sub_results) if !sub_results.is_empty() => {
                for sub in sub_results {
                    let parsed =
                        names::parse_test_name(sub.display_name.as_deref().unwrap_or_default());
                    let case_id = db
                        .get_or_create_test_case(
                            &project,
                            &parsed.type_name,
                            &parsed.method,
                            &parsed.arguments,
                            kind,
                        )
                        .await?;
                    let outcome = Outcome::from_source(sub.outcome.as_deref().unwrap_or_default());
                    let detail = ResultDetail {
                        web_url: sub.url.clone(),
                        skip_reason: None,
                        message: sub.error_message.clone(),
                        stack_trace: sub.stack_trace.clone(),
                    };
                    db.create_result(run_id, case_id, outcome, &detail).await?;
                }
            }
            _ => {
                if result.is_grouped() {
                    let group = result.result_group_type.as_deref().unwrap_or_default();
                    let name = result.automated_test_name.as_deref().unwrap_or_default();
                    match self.options.on_unsupported_results {
                        UnsupportedResultMode::Fatal => {
                            bail!(
                                "unsupported result shape: group type '{group}' with no \
                                 sub-results (test '{name}')"
                            );
                        }
                        UnsupportedResultMode::Skip => {
                            warn!(
                                "skipping unsupported result shape: group type '{}' with no \
                                 sub-results (test '{}')",
                                group, name
                            );
                            return Ok(());
                        }
                    }
                }

                let parsed = names::parse_test_name(
                    result.automated_test_name.as_deref().unwrap_or_default(),
                );
                let case_id = db
                    .get_or_create_test_case(
                        &project,
                        &parsed.type_name,
                        &parsed.method,
                        &parsed.arguments,
                        kind,
                    )
                    .await?;
                let outcome = Outcome::from_source(result.outcome.as_deref().unwrap_or_default());
                let detail = ResultDetail {
                    web_url: result.url.clone(),
                    skip_reason: result.comment.clone(),
                    message: result.error_message.clone(),
                    stack_trace: result.stack_trace.clone(),
                };
                db.create_result(run_id, case_id, outcome, &detail).await?;
            }
        }
        Ok(())
    }
}
