use std::collections::BTreeMap;

use axum::{body::Bytes, extract::State, http::HeaderMap, Json};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::models::Permissions;
use crate::password::verify_password;
use crate::permissions::{self, ResolvedOperator};
use crate::routes;
use crate::state::AppState;
use crate::token::{issue_token, validate_token, TokenIdentity};

// ─── Request/Response types ───

#[derive(Debug, Default, Deserialize)]
pub struct LoginRequest {
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub operator: OperatorInfo,
}

#[derive(Debug, Serialize)]
pub struct OperatorInfo {
    pub id: i64,
    pub username: String,
}

#[derive(Debug, Serialize)]
pub struct MeResponse {
    pub id: i64,
    pub username: String,
    pub permissions: BTreeMap<&'static str, bool>,
}

// ─── Routes ───

pub async fn login(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<LoginResponse>, ApiError> {
    let req: LoginRequest = routes::parse_body(&body)?;
    let username = req
        .username
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .ok_or_else(|| ApiError::missing_field("username"))?;
    let password = req
        .password
        .as_deref()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ApiError::missing_field("password"))?;

    if !state.login_throttle.allow(username) {
        tracing::warn!("Login rate limit hit for {username}");
        return Err(ApiError::RateLimited);
    }

    let operator: Option<(i64, String, String, bool)> = sqlx::query_as(
        "SELECT id, username, password_hash, is_active FROM moderators WHERE username = ?",
    )
    .bind(username)
    .fetch_optional(&state.db)
    .await?;

    let Some((id, username, password_hash, is_active)) = operator else {
        return Err(ApiError::Unauthorized("Invalid credentials"));
    };

    if !verify_password(password, &password_hash) {
        return Err(ApiError::Unauthorized("Invalid credentials"));
    }
    if !is_active {
        return Err(ApiError::Unauthorized("Account is inactive"));
    }

    let token = issue_token(&state.jwt_secret, id, &username)
        .map_err(|e| ApiError::Internal(format!("JWT error: {e}")))?;

    tracing::info!("Operator {username} logged in");
    Ok(Json(LoginResponse {
        token,
        operator: OperatorInfo { id, username },
    }))
}

pub async fn get_me(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<MeResponse>, ApiError> {
    let operator = authenticate(&state, &headers).await?;

    Ok(Json(MeResponse {
        id: operator.id,
        username: operator.username,
        permissions: operator.permissions.to_map(),
    }))
}

// ─── Auth helpers ───

pub fn extract_identity(secret: &str, headers: &HeaderMap) -> Result<TokenIdentity, ApiError> {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(ApiError::unauthorized)?;

    let token = auth
        .strip_prefix("Bearer ")
        .ok_or_else(ApiError::unauthorized)?;

    validate_token(secret, token.trim()).ok_or_else(ApiError::unauthorized)
}

/// Validate the bearer token and load the operator's current permissions.
pub async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<ResolvedOperator, ApiError> {
    let identity = extract_identity(&state.jwt_secret, headers)?;
    permissions::resolve(&state.db, identity.operator_id)
        .await?
        .ok_or_else(ApiError::unauthorized)
}

/// [`authenticate`] plus a capability check.
pub async fn require(
    state: &AppState,
    headers: &HeaderMap,
    required: Permissions,
) -> Result<ResolvedOperator, ApiError> {
    let operator = authenticate(state, headers).await?;
    if !operator.can(required) {
        return Err(ApiError::Forbidden);
    }
    Ok(operator)
}
