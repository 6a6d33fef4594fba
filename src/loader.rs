// src/loader.rs
//! Periodic analytical refresh: quarantine set + test index, published as
//! one snapshot per cycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::analytics::{queries, QueryContext, QueryValue};
use crate::collection::TestCollection;
use crate::config::Config;
use crate::model::TestCaseIdentity;
use crate::snapshot::{ReadinessGate, SnapshotStore};

/// How far back the identity list reaches. Tests not seen for this long
/// drop out of the published index on the next refresh.
const IDENTITY_WINDOW_DAYS: i64 = 90;

#[derive(Debug, Clone)]
pub struct LoaderOptions {
    pub reload_interval: Duration,
    pub skip_blocking_load: bool,
    pub projects: Vec<String>,
    pub branches: Vec<String>,
}

impl LoaderOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            reload_interval: config.reload_interval,
            skip_blocking_load: config.skip_blocking_load,
            projects: config.quarantine_projects.clone(),
            branches: config.quarantine_branches.clone(),
        }
    }
}

pub struct DataLoader {
    context: Arc<QueryContext>,
    snapshot: Arc<SnapshotStore>,
    readiness: ReadinessGate,
    options: LoaderOptions,
}

impl DataLoader {
    pub fn new(
        context: Arc<QueryContext>,
        snapshot: Arc<SnapshotStore>,
        readiness: ReadinessGate,
        options: LoaderOptions,
    ) -> Self {
        Self {
            context,
            snapshot,
            readiness,
            options,
        }
    }

    /// Perform the first load per the configured startup mode.
    ///
    /// Blocking mode refreshes before returning, so callers only proceed
    /// to serve once the first snapshot is out; its failure is a startup
    /// failure. Detached mode returns immediately and supervises the load
    /// on a task; a failure there surfaces through the readiness gate
    /// rather than being dropped.
    pub async fn initial_load(self: Arc<Self>, token: &CancellationToken) -> Result<()> {
        if !self.options.skip_blocking_load {
            debug!("doing initial data load before start-up continues");
            self.refresh(token).await?;
            self.readiness.set_ready();
        } else {
            debug!("doing initial data load in the background");
            let this = self.clone();
            let token = token.clone();
            tokio::spawn(async move {
                match this.refresh(&token).await {
                    Ok(()) => this.readiness.set_ready(),
                    Err(e) => {
                        if token.is_cancelled() {
                            return;
                        }
                        error!("initial data load failed: {:#}", e);
                        this.readiness.set_failed(format!("{e:#}"));
                    }
                }
            });
        }
        Ok(())
    }

    /// Reload on the configured interval until cancelled. Errors propagate;
    /// the caller decides how loudly to die.
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        loop {
            debug!("sleeping for {:?}", self.options.reload_interval);
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.options.reload_interval) => {}
            }

            match self.refresh(&token).await {
                Ok(()) => self.readiness.set_ready(),
                Err(e) if token.is_cancelled() => {
                    debug!("refresh abandoned during shutdown: {:#}", e);
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        info!("data loader stopped");
        Ok(())
    }

    /// One refresh cycle: both queries run concurrently, then quarantine
    /// set and tree go out as a single snapshot so readers never see views
    /// from different cycles.
    pub async fn refresh(&self, token: &CancellationToken) -> Result<()> {
        info!("reloading quarantined tests and test case lists");

        let project_list = QueryValue::Str(self.options.projects.join(","));
        let branch_list = QueryValue::Str(self.options.branches.join(","));
        let min_date =
            QueryValue::DateTime(Utc::now() - chrono::Duration::days(IDENTITY_WINDOW_DAYS));

        let quarantine_params = HashMap::from([
            ("ProjectList".to_string(), project_list.clone()),
            ("BranchList".to_string(), branch_list),
        ]);
        let identity_params = HashMap::from([
            ("ProjectList".to_string(), project_list),
            ("MinDate".to_string(), min_date),
        ]);

        let (quarantined, identities) = tokio::try_join!(
            async {
                self.context
                    .execute_named::<TestCaseIdentity>(
                        queries::QUARANTINED_TESTS,
                        quarantine_params,
                        token,
                    )
                    .await
                    .context("loading quarantined tests")
            },
            async {
                self.context
                    .execute_named::<TestCaseIdentity>(
                        queries::ALL_TEST_IDENTITIES,
                        identity_params,
                        token,
                    )
                    .await
                    .context("loading test identities")
            },
        )?;

        info!(
            "loaded {} quarantined tests and {} test identities",
            quarantined.len(),
            identities.len()
        );

        let tests = TestCollection::build(identities)
            .context("grouping test identities (backend returned unsorted rows?)")?;
        self.snapshot.publish(quarantined.into_iter().collect(), tests);
        Ok(())
    }
}
