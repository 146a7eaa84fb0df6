use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};

use crate::error::ApiError;
use crate::models::{Player, PlayerDetails, PunishmentRecord};
use crate::routes::auth;
use crate::state::AppState;

pub async fn list_players(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Player>>, ApiError> {
    auth::authenticate(&state, &headers).await?;
    Ok(Json(state.ledger.list_players().await?))
}

/// GET /players/{identifier}, where the identifier is a UUID or a name
pub async fn get_player(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(identifier): Path<String>,
) -> Result<Json<PlayerDetails>, ApiError> {
    auth::authenticate(&state, &headers).await?;

    let player = state
        .ledger
        .resolve_player(&identifier)
        .await?
        .ok_or_else(|| ApiError::NotFound("Player not found".into()))?;
    let punishments = state.ledger.list_for_player(&player.name).await?;

    Ok(Json(PlayerDetails {
        player,
        punishments,
    }))
}

/// Full history. Unknown identifiers are treated as a player name so that
/// punishments issued before the player ever joined are still visible.
pub async fn get_player_punishments(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(identifier): Path<String>,
) -> Result<Json<Vec<PunishmentRecord>>, ApiError> {
    auth::authenticate(&state, &headers).await?;

    let name = match state.ledger.resolve_player(&identifier).await? {
        Some(player) => player.name,
        None => identifier,
    };
    Ok(Json(state.ledger.list_for_player(&name).await?))
}
