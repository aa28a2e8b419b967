pub mod authz;
pub mod error;
pub mod kv;
pub mod objects;

use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
}

async fn healthz(axum::extract::State(state): axum::extract::State<AppState>) -> StatusCode {
    match sqlx::query("SELECT 1").execute(&state.pool).await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            log::error!("healthz probe failed: {e}");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Metrics export is explicitly out of scope (ambient observability
/// beyond structured logging is a documented non-goal); the route exists
/// so a caller gets a clear "not implemented" instead of a 404.
async fn metrics() -> (StatusCode, Json<HealthBody>) {
    (StatusCode::NOT_IMPLEMENTED, Json(HealthBody { status: "not-implemented" }))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(kv::router())
        .merge(objects::router())
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
}
