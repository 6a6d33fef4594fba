// src/config/mod.rs
// Env-driven configuration; missing required values fail at startup.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;

/// One tracked pipeline. `pipeline` is the `path/name` of the build
/// definition; `/` is accepted as the separator to avoid escaping and is
/// translated to the source system's `\` during resolution.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSpec {
    pub project: String,
    pub pipeline: String,
    #[serde(default)]
    pub run_type: Option<String>,
}

/// What to do with a group-typed result that carries no sub-results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsupportedResultMode {
    /// Abort the whole sync cycle.
    Fatal,
    /// Log and skip the result, continue the cycle.
    Skip,
}

impl FromStr for UnsupportedResultMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "fatal" => Ok(UnsupportedResultMode::Fatal),
            "skip" => Ok(UnsupportedResultMode::Skip),
            other => Err(anyhow!("unknown unsupported-result mode: '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    // ── CI source
    pub organization_url: String,
    pub access_token: String,
    pub pipelines: Vec<PipelineSpec>,
    pub poll_interval: Duration,
    pub lookback_days: i64,
    pub build_limit: u32,
    pub skip_kinds: Vec<String>,
    pub on_unsupported_results: UnsupportedResultMode,

    // ── Analytical backend
    pub analytics_cluster_url: String,
    pub analytics_database: String,
    pub analytics_token: Option<String>,
    pub analytics_client_id: Option<String>,
    pub analytics_client_secret: Option<String>,
    pub analytics_token_url: Option<String>,
    pub analytics_scope: String,
    pub quarantine_projects: Vec<String>,
    pub quarantine_branches: Vec<String>,
    pub reload_interval: Duration,
    pub skip_blocking_load: bool,

    // ── Database
    pub database_url: String,
    pub sqlite_max_connections: u32,

    // ── Server
    pub host: String,
    pub port: u16,
    pub log_level: String,
}

fn env_var_or<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    match std::env::var(key) {
        Ok(val) => match val.trim().parse::<T>() {
            Ok(parsed) => parsed,
            Err(_) => {
                eprintln!("Config: {} = '{}' (parse failed, using default)", key, val);
                default
            }
        },
        Err(_) => default,
    }
}

fn env_var_required(key: &str) -> Result<String> {
    match std::env::var(key) {
        Ok(val) if !val.trim().is_empty() => Ok(val.trim().to_string()),
        _ => bail!("Missing required configuration option: '{key}'"),
    }
}

fn env_var_list(key: &str, default: &str) -> Vec<String> {
    let raw = std::env::var(key).unwrap_or_else(|_| default.to_string());
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl Config {
    pub fn from_env() -> Result<Self> {
        // Load a .env file if one exists; plain environment works too.
        dotenvy::dotenv().ok();

        let pipelines_raw = env_var_or("FLAKETRACK_PIPELINES", "[]".to_string());
        let pipelines: Vec<PipelineSpec> = serde_json::from_str(&pipelines_raw)
            .context("parsing FLAKETRACK_PIPELINES (expected a JSON array of pipeline specs)")?;

        Ok(Self {
            organization_url: env_var_required("FLAKETRACK_ORG_URL")?,
            access_token: env_var_required("FLAKETRACK_ACCESS_TOKEN")?,
            pipelines,
            poll_interval: Duration::from_secs(env_var_or("FLAKETRACK_POLL_INTERVAL_SECS", 600)),
            lookback_days: env_var_or("FLAKETRACK_LOOKBACK_DAYS", 7),
            build_limit: env_var_or("FLAKETRACK_BUILD_LIMIT", 10),
            skip_kinds: env_var_list("FLAKETRACK_SKIP_KINDS", "junit"),
            on_unsupported_results: env_var_or(
                "FLAKETRACK_ON_UNSUPPORTED_RESULTS",
                UnsupportedResultMode::Skip,
            ),
            analytics_cluster_url: env_var_required("FLAKETRACK_KUSTO_URL")?,
            analytics_database: env_var_required("FLAKETRACK_KUSTO_DATABASE")?,
            analytics_token: std::env::var("FLAKETRACK_KUSTO_TOKEN").ok(),
            analytics_client_id: std::env::var("FLAKETRACK_KUSTO_CLIENT_ID").ok(),
            analytics_client_secret: std::env::var("FLAKETRACK_KUSTO_CLIENT_SECRET").ok(),
            analytics_token_url: std::env::var("FLAKETRACK_KUSTO_TOKEN_URL").ok(),
            analytics_scope: env_var_or(
                "FLAKETRACK_KUSTO_SCOPE",
                "https://kusto.kusto.windows.net/.default".to_string(),
            ),
            quarantine_projects: env_var_list("FLAKETRACK_QUARANTINE_PROJECTS", ""),
            quarantine_branches: env_var_list(
                "FLAKETRACK_QUARANTINE_BRANCHES",
                "refs/heads/main",
            ),
            reload_interval: Duration::from_secs(env_var_or(
                "FLAKETRACK_RELOAD_INTERVAL_SECS",
                900,
            )),
            skip_blocking_load: env_var_or("FLAKETRACK_SKIP_BLOCKING_LOAD", false),
            database_url: env_var_or("DATABASE_URL", "sqlite:./flaketrack.db".to_string()),
            sqlite_max_connections: env_var_or("FLAKETRACK_SQLITE_MAX_CONNECTIONS", 5),
            host: env_var_or("FLAKETRACK_HOST", "0.0.0.0".to_string()),
            port: env_var_or("FLAKETRACK_PORT", 3400),
            log_level: env_var_or("FLAKETRACK_LOG_LEVEL", "info".to_string()),
        })
    }

    /// Bind address for the HTTP surface.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
