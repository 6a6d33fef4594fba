// src/azdo/mod.rs
//! Azure DevOps collaborator: trait seams and wire types.
//!
//! The orchestrator only depends on the `CiConnector`/`CiSource` traits;
//! `client::AzDoClient` is the production REST implementation.

pub mod client;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRef {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefinitionRef {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub path: String,
    pub project: ProjectRef,
    #[serde(default)]
    pub revision: Option<i64>,
}

impl DefinitionRef {
    /// Source-system qualified name, used to resolve configured specs.
    pub fn qualified_name(&self) -> String {
        format!(r"{}\{}", self.path, self.name)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CiBuild {
    pub id: i64,
    pub build_number: String,
    #[serde(default)]
    pub finish_time: Option<DateTime<Utc>>,
    pub project: ProjectRef,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CiTestRun {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CiTestResult {
    #[serde(default)]
    pub automated_test_name: Option<String>,
    #[serde(default)]
    pub automated_test_storage: Option<String>,
    #[serde(default)]
    pub automated_test_type: Option<String>,
    #[serde(default)]
    pub outcome: Option<String>,
    /// "none" for plain results; anything else marks a grouped
    /// (rerun/data-driven) result whose sub-results carry the outcomes.
    #[serde(default)]
    pub result_group_type: Option<String>,
    #[serde(default)]
    pub sub_results: Option<Vec<CiSubResult>>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub stack_trace: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
}

impl CiTestResult {
    pub fn is_grouped(&self) -> bool {
        self.result_group_type
            .as_deref()
            .is_some_and(|g| !g.eq_ignore_ascii_case("none"))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CiSubResult {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub outcome: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub stack_trace: Option<String>,
}

/// A connected CI client, valid for one sync cycle.
#[async_trait]
pub trait CiSource: Send + Sync {
    /// All build definitions in a project (shallow references).
    async fn list_definitions(&self, project: &str) -> Result<Vec<DefinitionRef>>;

    /// Full definition by id.
    async fn get_definition(&self, project: &str, definition_id: i64) -> Result<DefinitionRef>;

    /// Completed builds of a definition in descending finish-time order,
    /// bounded by `top` and an optional minimum finish time.
    async fn list_builds(
        &self,
        project: &str,
        definition_id: i64,
        min_finish_time: Option<DateTime<Utc>>,
        top: u32,
    ) -> Result<Vec<CiBuild>>;

    async fn list_runs(&self, project: &str, build_id: i64) -> Result<Vec<CiTestRun>>;

    /// Results of a run with sub-results expanded.
    async fn list_results(&self, project: &str, run_id: i64) -> Result<Vec<CiTestResult>>;
}

/// Establishes the per-cycle connection/credential context.
#[async_trait]
pub trait CiConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn CiSource>>;
}
