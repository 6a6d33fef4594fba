// src/web/mod.rs
// Minimal HTTP surface: readiness probe + snapshot summary.
// The actual dashboard lives elsewhere; these routes exist so deployments
// can gate on readiness and operators can eyeball the published state.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::model::Build;
use crate::snapshot::Readiness;
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/summary", get(summary))
        .route("/api/builds", get(recent_builds))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    match state.readiness.get() {
        Readiness::Ready => (StatusCode::OK, Json(json!({ "status": "ready" }))),
        Readiness::Starting => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "starting" })),
        ),
        Readiness::Failed(reason) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "failed", "reason": reason })),
        ),
    }
}

async fn recent_builds(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    let builds = sqlx::query_as::<_, Build>(
        "SELECT id, project_id, external_id, pipeline_id, build_number, \
                finished_at, sync_started_at, sync_ended_at, model_version \
         FROM builds ORDER BY finished_at DESC LIMIT 50",
    )
    .fetch_all(&state.pool)
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(json!({ "builds": builds })))
}

async fn summary(State(state): State<AppState>) -> Json<Value> {
    // One local copy for the whole read; the store may republish meanwhile.
    let snapshot = state.snapshot.current();
    Json(json!({
        "generation": snapshot.generation,
        "quarantined_tests": snapshot.quarantined.len(),
        "projects": snapshot.tests.projects.len(),
        "tests": snapshot.tests.all_tests.len(),
    }))
}
