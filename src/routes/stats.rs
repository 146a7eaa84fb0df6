use axum::{extract::State, http::HeaderMap, Json};
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::models::Stats;
use crate::routes::auth;
use crate::state::AppState;

pub async fn get_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Stats>, ApiError> {
    auth::authenticate(&state, &headers).await?;
    Ok(Json(state.ledger.stats().await?))
}

/// Liveness check, no token required.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let db = sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&state.db)
        .await
        .is_ok();
    if !db {
        tracing::warn!("Health check: database unreachable");
    }
    Json(json!({ "ok": true, "db": db }))
}

pub async fn relay_status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    auth::authenticate(&state, &headers).await?;
    Ok(Json(json!({ "state": state.relay.state() })))
}
