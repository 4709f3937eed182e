use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;

use crate::metrics;
use crate::state::AppState;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    instance_id: String,
    store_mode: &'static str,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let store_mode = match state.store_mode() {
        classroom_store::StoreMode::Single => "single",
        classroom_store::StoreMode::Cluster => "cluster",
    };
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.uptime_secs(),
        instance_id: state.instance_id().to_string(),
        store_mode,
    })
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather(),
    )
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}
