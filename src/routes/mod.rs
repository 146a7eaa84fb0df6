pub mod audit_logs;
pub mod auth;
pub mod moderation;
pub mod players;
pub mod roles;
pub mod skins;
pub mod stats;

use axum::{
    body::Bytes,
    routing::{delete, get, post, put},
    Router,
};
use serde::de::DeserializeOwned;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::error::ApiError;
use crate::state::AppState;

/// Decode a JSON body. Handlers call this after authorization so that token
/// and capability failures win over malformed input. An empty body decodes
/// as `T::default()`.
pub fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.is_empty() {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| ApiError::Validation(format!("Invalid request body: {e}")))
}

pub fn router(state: AppState, enable_cors: bool) -> Router {
    let app = Router::new()
        // Auth
        .route("/auth/login", post(auth::login))
        .route("/auth/me", get(auth::get_me))
        // Moderation
        .route("/mod/actions", get(audit_logs::list_audit_logs))
        .route("/mod/{action}", post(moderation::moderate))
        // Roles
        .route("/roles", get(roles::list_roles).post(roles::create_role))
        .route("/roles/{id}", put(roles::update_role).delete(roles::delete_role))
        // Moderators
        .route("/moderators", get(roles::list_moderators))
        .route(
            "/moderators/{id}/roles",
            get(roles::get_moderator_roles).post(roles::assign_role),
        )
        .route("/moderators/{id}/roles/{role_id}", delete(roles::remove_role))
        .route("/moderators/{id}/active", put(roles::set_moderator_active))
        // Players
        .route("/players", get(players::list_players))
        .route("/players/{identifier}", get(players::get_player))
        .route(
            "/players/{identifier}/punishments",
            get(players::get_player_punishments),
        )
        .route("/stats", get(stats::get_stats))
        .route("/health", get(stats::health))
        .route("/relay/status", get(stats::relay_status))
        // Avatars
        .route("/skins/{id}/bust", get(skins::get_bust))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    if enable_cors {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}
