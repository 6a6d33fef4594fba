// src/analytics/mod.rs
//! Cancellable parameterized query execution against the analytical
//! backend.
//!
//! Every call gets a unique request id. If the caller's token is cancelled
//! while the request is outstanding, a single best-effort out-of-band
//! cancel command tagged with that id is issued on a detached task; the
//! caller's await completes through the cancellation path regardless of
//! the remote outcome.

pub mod kusto;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};
use uuid::Uuid;

/// The fixed set of parameter types accepted on the wire. Anything else is
/// unrepresentable here, so no unsupported value can reach a request.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryValue {
    Str(String),
    DateTime(DateTime<Utc>),
    Duration(Duration),
    Bool(bool),
    Int(i32),
    Long(i64),
    Guid(Uuid),
    Double(f64),
}

impl QueryValue {
    /// Literal text form substituted for a declared query parameter.
    pub fn to_literal(&self) -> String {
        match self {
            QueryValue::Str(s) => {
                format!("'{}'", s.replace('\\', r"\\").replace('\'', r"\'"))
            }
            QueryValue::DateTime(dt) => {
                format!("datetime({})", dt.to_rfc3339_opts(SecondsFormat::Millis, true))
            }
            QueryValue::Duration(d) => format!("time({}s)", d.as_secs()),
            QueryValue::Bool(b) => b.to_string(),
            QueryValue::Int(i) => i.to_string(),
            QueryValue::Long(l) => l.to_string(),
            QueryValue::Guid(g) => format!("guid({g})"),
            QueryValue::Double(d) => d.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("unknown named query '{0}'")]
    UnknownQuery(String),
    #[error("query '{request_id}' was cancelled")]
    Cancelled { request_id: String },
    #[error("analytical backend request failed: {0:#}")]
    Backend(anyhow::Error),
    #[error("failed to decode analytical row: {0}")]
    Decode(#[from] serde_json::Error),
}

/// The analytical collaborator. `execute` returns one row per JSON object;
/// `cancel` is a best-effort control call.
#[async_trait]
pub trait AnalyticsBackend: Send + Sync {
    async fn execute(
        &self,
        query: &str,
        parameters: &HashMap<String, QueryValue>,
        request_id: &str,
    ) -> anyhow::Result<Vec<serde_json::Value>>;

    async fn cancel(&self, request_id: &str) -> anyhow::Result<()>;
}

/// Named queries issued by the background data loader. The query text
/// itself is an implementation detail of the analytical database.
pub mod queries {
    pub const QUARANTINED_TESTS: &str = "quarantined_tests";
    pub const ALL_TEST_IDENTITIES: &str = "all_test_identities";

    pub(super) const QUARANTINED_TESTS_CSL: &str = r#"
declare query_parameters(ProjectList:string, BranchList:string);
QuarantinedTests
| where Project in (split(ProjectList, ','))
| where Branch in (split(BranchList, ','))
| distinct Project, Type, Method, ArgumentHash, Kind
"#;

    pub(super) const ALL_TEST_IDENTITIES_CSL: &str = r#"
declare query_parameters(ProjectList:string, MinDate:datetime);
TestResults
| where Project in (split(ProjectList, ','))
| where FinishedAt >= MinDate
| distinct Project, Type, Method, ArgumentHash, Kind
| order by Project asc, Type asc, Method asc
"#;
}

static REGISTRY: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        (queries::QUARANTINED_TESTS, queries::QUARANTINED_TESTS_CSL),
        (queries::ALL_TEST_IDENTITIES, queries::ALL_TEST_IDENTITIES_CSL),
    ])
});

pub struct QueryContext {
    backend: Arc<dyn AnalyticsBackend>,
}

impl QueryContext {
    pub fn new(backend: Arc<dyn AnalyticsBackend>) -> Self {
        Self { backend }
    }

    /// Execute a named query and decode the rows.
    ///
    /// An unknown name fails before anything is sent. Cancellation of
    /// `token` abandons the in-flight request and fires one detached
    /// best-effort remote cancel; remote failure is logged, never surfaced.
    pub async fn execute_named<T: DeserializeOwned>(
        &self,
        name: &str,
        parameters: HashMap<String, QueryValue>,
        token: &CancellationToken,
    ) -> Result<Vec<T>, QueryError> {
        let query = *REGISTRY
            .get(name)
            .ok_or_else(|| QueryError::UnknownQuery(name.to_string()))?;

        let request_id = format!("flaketrack;{}", Uuid::new_v4().simple());
        trace!("executing query '{}' (request id {})", name, request_id);

        tokio::select! {
            result = self.backend.execute(query, &parameters, &request_id) => {
                let rows = result.map_err(QueryError::Backend)?;
                rows.into_iter()
                    .map(serde_json::from_value)
                    .collect::<Result<Vec<T>, _>>()
                    .map_err(QueryError::Decode)
            }
            _ = token.cancelled() => {
                let backend = self.backend.clone();
                let id = request_id.clone();
                tokio::spawn(async move {
                    debug!("attempting to cancel query '{}'", id);
                    match backend.cancel(&id).await {
                        Ok(()) => debug!("cancelled query '{}'", id),
                        Err(e) => error!("error cancelling query '{}': {:#}", id, e),
                    }
                });
                Err(QueryError::Cancelled { request_id })
            }
        }
    }
}
