//! Liveness and readiness endpoints for the engine process.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use chrono::Utc;
use sea_orm::DatabaseConnection;
use serde_json::json;
use std::sync::Arc;
use tracing::error;

pub fn health_routes(db: Arc<DatabaseConnection>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/live", get(live))
        .route("/health/ready", get(ready))
        .with_state(db)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "up", "timestamp": Utc::now() }))
}

async fn live() -> impl IntoResponse {
    Json(json!({ "status": "up" }))
}

/// Ready only when the database answers a ping; the engine is useless without
/// it and load balancers should route elsewhere.
async fn ready(State(db): State<Arc<DatabaseConnection>>) -> impl IntoResponse {
    match db.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "status": "up", "database": "up" })),
        ),
        Err(e) => {
            error!(error = %e, "readiness probe failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "down", "database": "down" })),
            )
        }
    }
}
