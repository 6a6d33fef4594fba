// src/model.rs
//! Row types for the sync graph plus the deduplicated test identity.

use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use sqlx::FromRow;

/// Ingestion schema revision. Stamped on builds at sync completion so rows
/// written by an older revision can be located and re-ingested.
pub const MODEL_VERSION: i64 = 2;

/// Closed outcome set. Source outcome strings are folded into this at the
/// ingestion boundary; unmapped values become `Unknown` and never propagate
/// past the upsert layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Passed,
    Failed,
    Unknown,
}

impl Outcome {
    pub fn from_source(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("passed") {
            Outcome::Passed
        } else if raw.eq_ignore_ascii_case("failed") {
            Outcome::Failed
        } else {
            Outcome::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Passed => "passed",
            Outcome::Failed => "failed",
            Outcome::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Build {
    pub id: i64,
    pub project_id: String,
    pub external_id: i64,
    pub pipeline_id: i64,
    pub build_number: String,
    pub finished_at: Option<DateTime<Utc>>,
    pub sync_started_at: Option<DateTime<Utc>>,
    /// Completion marker: `None` iff ingestion of this build is incomplete.
    pub sync_ended_at: Option<DateTime<Utc>>,
    pub model_version: Option<i64>,
}

#[derive(Debug, Clone, FromRow)]
pub struct TestCase {
    pub id: i64,
    pub project: String,
    pub type_name: String,
    pub method: String,
    pub arguments: Option<String>,
    pub argument_hash: Option<String>,
    pub kind: Option<String>,
}

/// Optional per-result detail, written only when at least one field is set.
#[derive(Debug, Clone, Default)]
pub struct ResultDetail {
    pub web_url: Option<String>,
    pub skip_reason: Option<String>,
    pub message: Option<String>,
    pub stack_trace: Option<String>,
}

impl ResultDetail {
    pub fn is_empty(&self) -> bool {
        self.web_url.is_none()
            && self.skip_reason.is_none()
            && self.message.is_none()
            && self.stack_trace.is_none()
    }
}

/// Dedup key for the per-session identity cache. Exact match on every
/// component; `kind` is lower-cased by the constructor so the key and the
/// stored row always agree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CaseKey {
    pub project: String,
    pub type_name: String,
    pub method: String,
    pub argument_hash: Option<String>,
    pub kind: Option<String>,
}

impl CaseKey {
    pub fn new(
        project: &str,
        type_name: &str,
        method: &str,
        argument_hash: Option<String>,
        kind: Option<&str>,
    ) -> Self {
        Self {
            project: project.to_string(),
            type_name: type_name.to_string(),
            method: method.to_string(),
            argument_hash,
            kind: kind.map(|k| k.to_lowercase()),
        }
    }
}

/// The logical identity of a test case as published to readers.
///
/// Equality treats the project name case-insensitively; type, method,
/// argument hash and kind compare exactly. `Hash` folds in the lower-cased
/// project so it agrees with `Eq`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TestCaseIdentity {
    #[serde(rename = "Project")]
    pub project: String,
    #[serde(rename = "Type")]
    pub type_name: String,
    #[serde(rename = "Method")]
    pub method: String,
    #[serde(rename = "ArgumentHash", default, deserialize_with = "empty_as_none")]
    pub argument_hash: Option<String>,
    #[serde(rename = "Kind", default, deserialize_with = "empty_as_none")]
    pub kind: Option<String>,
}

impl TestCaseIdentity {
    pub fn new(project: &str, type_name: &str, method: &str) -> Self {
        Self {
            project: project.to_string(),
            type_name: type_name.to_string(),
            method: method.to_string(),
            argument_hash: None,
            kind: None,
        }
    }
}

impl PartialEq for TestCaseIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.project.to_lowercase() == other.project.to_lowercase()
            && self.type_name == other.type_name
            && self.method == other.method
            && self.argument_hash == other.argument_hash
            && self.kind == other.kind
    }
}

impl Eq for TestCaseIdentity {}

impl Hash for TestCaseIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.project.to_lowercase().hash(state);
        self.type_name.hash(state);
        self.method.hash(state);
        self.argument_hash.hash(state);
        self.kind.hash(state);
    }
}

/// Analytical backends report absent columns as empty strings; treat those
/// the same as missing.
fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty()))
}
