// src/state.rs
// Shared application state handed to the HTTP surface.

use std::sync::Arc;

use sqlx::SqlitePool;

use crate::config::Config;
use crate::snapshot::{ReadinessGate, SnapshotStore};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: SqlitePool,
    pub snapshot: Arc<SnapshotStore>,
    pub readiness: ReadinessGate,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        pool: SqlitePool,
        snapshot: Arc<SnapshotStore>,
        readiness: ReadinessGate,
    ) -> Self {
        Self {
            config,
            pool,
            snapshot,
            readiness,
        }
    }
}
