// src/azdo/client.rs
// REST implementation of the CI source traits.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::trace;

use super::{CiBuild, CiConnector, CiSource, CiTestResult, CiTestRun, DefinitionRef};

const API_VERSION: &str = "7.1";

/// List responses arrive wrapped in a `{count, value}` envelope.
#[derive(Debug, Deserialize)]
struct ListEnvelope<T> {
    value: Vec<T>,
}

pub struct AzDoClient {
    http: Client,
    organization_url: String,
    access_token: String,
}

impl AzDoClient {
    fn new(organization_url: &str, access_token: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .context("building CI http client")?;
        Ok(Self {
            http,
            organization_url: organization_url.trim_end_matches('/').to_string(),
            access_token: access_token.to_string(),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let url = format!("{}/{}", self.organization_url, path.trim_start_matches('/'));
        trace!("GET {} {:?}", url, query);
        let response = self
            .http
            .get(&url)
            .basic_auth("", Some(&self.access_token))
            .query(&[("api-version", API_VERSION.to_string())])
            .query(query)
            .send()
            .await
            .with_context(|| format!("requesting {url}"))?
            .error_for_status()
            .with_context(|| format!("requesting {url}"))?;
        response
            .json()
            .await
            .with_context(|| format!("decoding response from {url}"))
    }
}

#[async_trait]
impl CiSource for AzDoClient {
    async fn list_definitions(&self, project: &str) -> Result<Vec<DefinitionRef>> {
        let envelope: ListEnvelope<DefinitionRef> = self
            .get_json(&format!("{project}/_apis/build/definitions"), &[])
            .await?;
        Ok(envelope.value)
    }

    async fn get_definition(&self, project: &str, definition_id: i64) -> Result<DefinitionRef> {
        self.get_json(&format!("{project}/_apis/build/definitions/{definition_id}"), &[])
            .await
    }

    async fn list_builds(
        &self,
        project: &str,
        definition_id: i64,
        min_finish_time: Option<DateTime<Utc>>,
        top: u32,
    ) -> Result<Vec<CiBuild>> {
        let mut query = vec![
            ("definitions", definition_id.to_string()),
            ("statusFilter", "completed".to_string()),
            ("queryOrder", "finishTimeDescending".to_string()),
            ("$top", top.to_string()),
        ];
        if let Some(min_time) = min_finish_time {
            query.push(("minTime", min_time.to_rfc3339_opts(SecondsFormat::Secs, true)));
        }
        let envelope: ListEnvelope<CiBuild> = self
            .get_json(&format!("{project}/_apis/build/builds"), &query)
            .await?;
        Ok(envelope.value)
    }

    async fn list_runs(&self, project: &str, build_id: i64) -> Result<Vec<CiTestRun>> {
        let envelope: ListEnvelope<CiTestRun> = self
            .get_json(
                &format!("{project}/_apis/test/runs"),
                &[("buildIds", build_id.to_string())],
            )
            .await?;
        Ok(envelope.value)
    }

    async fn list_results(&self, project: &str, run_id: i64) -> Result<Vec<CiTestResult>> {
        let envelope: ListEnvelope<CiTestResult> = self
            .get_json(
                &format!("{project}/_apis/test/Runs/{run_id}/results"),
                &[("detailsToInclude", "subResults".to_string())],
            )
            .await?;
        Ok(envelope.value)
    }
}

/// Builds a fresh client per sync cycle so credential changes are picked up
/// without restarting the process.
pub struct AzDoConnector {
    organization_url: String,
    access_token: String,
}

impl AzDoConnector {
    pub fn new(organization_url: &str, access_token: &str) -> Self {
        Self {
            organization_url: organization_url.to_string(),
            access_token: access_token.to_string(),
        }
    }
}

#[async_trait]
impl CiConnector for AzDoConnector {
    async fn connect(&self) -> Result<Arc<dyn CiSource>> {
        let client = AzDoClient::new(&self.organization_url, &self.access_token)?;
        Ok(Arc::new(client))
    }
}
