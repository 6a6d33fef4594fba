// src/analytics/kusto.rs
// Kusto-style REST backend plus the cached bearer-token provider.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use super::{AnalyticsBackend, QueryValue};

/// Credential source for the analytical cluster: either a static bearer
/// token from configuration, or client-credentials acquired on demand and
/// cached until shortly before expiry.
pub enum TokenProvider {
    Static(String),
    ClientCredentials {
        http: Client,
        token_url: String,
        client_id: String,
        client_secret: String,
        scope: String,
        cached: Mutex<Option<CachedToken>>,
    },
}

pub struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

impl TokenProvider {
    pub fn from_config(config: &crate::config::Config) -> Result<Self> {
        if let Some(token) = &config.analytics_token {
            return Ok(TokenProvider::Static(token.clone()));
        }
        match (
            &config.analytics_client_id,
            &config.analytics_client_secret,
            &config.analytics_token_url,
        ) {
            (Some(client_id), Some(client_secret), Some(token_url)) => {
                Ok(TokenProvider::ClientCredentials {
                    http: Client::new(),
                    token_url: token_url.clone(),
                    client_id: client_id.clone(),
                    client_secret: client_secret.clone(),
                    scope: config.analytics_scope.clone(),
                    cached: Mutex::new(None),
                })
            }
            _ => bail!(
                "Missing required configuration option: set 'FLAKETRACK_KUSTO_TOKEN' or all of \
                 'FLAKETRACK_KUSTO_CLIENT_ID'/'FLAKETRACK_KUSTO_CLIENT_SECRET'/'FLAKETRACK_KUSTO_TOKEN_URL'"
            ),
        }
    }

    pub async fn bearer(&self) -> Result<String> {
        match self {
            TokenProvider::Static(token) => Ok(token.clone()),
            TokenProvider::ClientCredentials {
                http,
                token_url,
                client_id,
                client_secret,
                scope,
                cached,
            } => {
                // The lock is held across the acquire so at most one
                // recomputation runs at a time; everyone else reuses it.
                let mut slot = cached.lock().await;
                if let Some(token) = slot.as_ref() {
                    if token.expires_at > Utc::now() + chrono::Duration::seconds(60) {
                        return Ok(token.token.clone());
                    }
                }

                debug!("refreshing analytical backend token");
                let response: TokenResponse = http
                    .post(token_url)
                    .form(&[
                        ("grant_type", "client_credentials"),
                        ("client_id", client_id.as_str()),
                        ("client_secret", client_secret.as_str()),
                        ("scope", scope.as_str()),
                    ])
                    .send()
                    .await
                    .context("requesting analytical backend token")?
                    .error_for_status()
                    .context("requesting analytical backend token")?
                    .json()
                    .await
                    .context("decoding analytical backend token")?;

                let token = response.access_token;
                *slot = Some(CachedToken {
                    token: token.clone(),
                    expires_at: Utc::now() + chrono::Duration::seconds(response.expires_in),
                });
                Ok(token)
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct KustoResponse {
    #[serde(rename = "Tables")]
    tables: Vec<KustoTable>,
}

#[derive(Debug, Deserialize)]
struct KustoTable {
    #[serde(rename = "Columns")]
    columns: Vec<KustoColumn>,
    #[serde(rename = "Rows")]
    rows: Vec<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct KustoColumn {
    #[serde(rename = "ColumnName")]
    column_name: String,
}

pub struct KustoClient {
    http: Client,
    cluster_url: String,
    database: String,
    tokens: TokenProvider,
}

impl KustoClient {
    pub fn from_config(config: &crate::config::Config) -> Result<Self> {
        Self::new(
            &config.analytics_cluster_url,
            &config.analytics_database,
            TokenProvider::from_config(config)?,
        )
    }

    pub fn new(cluster_url: &str, database: &str, tokens: TokenProvider) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .context("building analytical http client")?;
        Ok(Self {
            http,
            cluster_url: cluster_url.trim_end_matches('/').to_string(),
            database: database.to_string(),
            tokens,
        })
    }

    async fn post(&self, path: &str, body: Value) -> Result<reqwest::Response> {
        let token = self.tokens.bearer().await?;
        let url = format!("{}{}", self.cluster_url, path);
        self.http
            .post(&url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("requesting {url}"))?
            .error_for_status()
            .with_context(|| format!("requesting {url}"))
    }
}

#[async_trait]
impl AnalyticsBackend for KustoClient {
    async fn execute(
        &self,
        query: &str,
        parameters: &HashMap<String, QueryValue>,
        request_id: &str,
    ) -> Result<Vec<Value>> {
        let literals: HashMap<&str, String> = parameters
            .iter()
            .map(|(name, value)| (name.as_str(), value.to_literal()))
            .collect();
        let body = json!({
            "db": self.database,
            "csl": query,
            "properties": {
                "Options": { "ClientRequestId": request_id },
                "Parameters": literals,
            },
        });

        trace!("executing analytical query (request id {})", request_id);
        let response: KustoResponse = self
            .post("/v1/rest/query", body)
            .await?
            .json()
            .await
            .context("decoding analytical response")?;

        let Some(table) = response.tables.first() else {
            bail!("analytical response contained no tables");
        };

        let rows = table
            .rows
            .iter()
            .map(|row| {
                let fields = table
                    .columns
                    .iter()
                    .zip(row.iter())
                    .map(|(column, value)| (column.column_name.clone(), value.clone()))
                    .collect::<serde_json::Map<String, Value>>();
                Value::Object(fields)
            })
            .collect();
        Ok(rows)
    }

    async fn cancel(&self, request_id: &str) -> Result<()> {
        let body = json!({
            "db": self.database,
            "csl": format!(".cancel query '{request_id}'"),
        });
        self.post("/v1/rest/mgmt", body).await?;
        Ok(())
    }
}
