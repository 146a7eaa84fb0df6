use axum::{
    extract::{Path, Query, State},
    http::header,
    response::IntoResponse,
};
use serde::Deserialize;

use crate::avatar::AvatarError;
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct BustQuery {
    #[serde(default)]
    pub force: Option<String>,
}

impl BustQuery {
    fn force_refresh(&self) -> bool {
        matches!(self.force.as_deref(), Some("1" | "true"))
    }
}

/// GET /skins/{id}/bust?force=0|1
pub async fn get_bust(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<BustQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let avatar = state
        .avatars
        .get_avatar(&id, query.force_refresh())
        .await
        .map_err(|e| match e {
            AvatarError::InvalidIdentifier => {
                ApiError::Validation("Invalid player identifier".into())
            }
            other => ApiError::Internal(format!("Failed to load avatar: {other}")),
        })?;

    Ok((
        [
            (header::CONTENT_TYPE, "image/png"),
            (header::CACHE_CONTROL, avatar.freshness.cache_control()),
        ],
        avatar.bytes,
    ))
}
