use axum::{extract::State, http::HeaderMap, Json};

use crate::error::ApiError;
use crate::models::{AuditEntry, Permissions};
use crate::routes::auth;
use crate::state::AppState;

const AUDIT_PAGE: i64 = 100;

/// GET /mod/actions: most recent moderation actions, newest first
pub async fn list_audit_logs(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<AuditEntry>>, ApiError> {
    auth::require(&state, &headers, Permissions::VIEW_ACTIONS).await?;
    Ok(Json(state.ledger.recent_audit(AUDIT_PAGE).await?))
}
