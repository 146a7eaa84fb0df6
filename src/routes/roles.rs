use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};

use crate::error::ApiError;
use crate::models::{
    AssignRoleRequest, CreateRoleRequest, Moderator, Permissions, Role, RoleRow,
    SetActiveRequest, UpdateRoleRequest,
};
use crate::routes::{self, auth};
use crate::state::AppState;

const MAX_ROLE_NAME: usize = 64;

fn validate_role_name(raw: &str) -> Result<String, ApiError> {
    let name = raw.trim().to_string();
    if name.is_empty() {
        return Err(ApiError::missing_field("name"));
    }
    if name.len() > MAX_ROLE_NAME {
        return Err(ApiError::Validation(format!(
            "name must be at most {MAX_ROLE_NAME} characters"
        )));
    }
    Ok(name)
}

async fn name_taken(
    state: &AppState,
    name: &str,
    except_id: Option<i64>,
) -> Result<bool, ApiError> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM roles WHERE name = ? AND id != ?")
        .bind(name)
        .bind(except_id.unwrap_or(-1))
        .fetch_one(&state.db)
        .await?;
    Ok(count > 0)
}

async fn find_role(state: &AppState, role_id: i64) -> Result<RoleRow, ApiError> {
    sqlx::query_as::<_, RoleRow>("SELECT id, name, permissions, created_at FROM roles WHERE id = ?")
        .bind(role_id)
        .fetch_optional(&state.db)
        .await?
        .ok_or_else(|| ApiError::NotFound("Role not found".into()))
}

async fn ensure_moderator(state: &AppState, moderator_id: i64) -> Result<(), ApiError> {
    let exists: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM moderators WHERE id = ?")
        .bind(moderator_id)
        .fetch_one(&state.db)
        .await?;
    if exists == 0 {
        return Err(ApiError::NotFound("Moderator not found".into()));
    }
    Ok(())
}

// ─── Roles (all require manageRoles) ───

pub async fn list_roles(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Role>>, ApiError> {
    auth::require(&state, &headers, Permissions::MANAGE_ROLES).await?;

    let roles = sqlx::query_as::<_, RoleRow>(
        "SELECT id, name, permissions, created_at FROM roles ORDER BY id",
    )
    .fetch_all(&state.db)
    .await?;

    Ok(Json(roles.into_iter().map(Role::from).collect()))
}

pub async fn create_role(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Role>), ApiError> {
    let operator = auth::require(&state, &headers, Permissions::MANAGE_ROLES).await?;
    let req: CreateRoleRequest = routes::parse_body(&body)?;

    let name = validate_role_name(req.name.as_deref().unwrap_or_default())?;
    if name_taken(&state, &name, None).await? {
        return Err(ApiError::Conflict("Role name already exists".into()));
    }

    // Stored normalized: every known capability, nothing else
    let permissions = Permissions::from_map(&req.permissions).to_stored();
    let role_id = sqlx::query("INSERT INTO roles (name, permissions) VALUES (?, ?)")
        .bind(&name)
        .bind(&permissions)
        .execute(&state.db)
        .await?
        .last_insert_rowid();

    tracing::info!("{} created role {name}", operator.username);
    let role = find_role(&state, role_id).await?;
    Ok((StatusCode::CREATED, Json(role.into())))
}

pub async fn update_role(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(role_id): Path<i64>,
    body: Bytes,
) -> Result<Json<Role>, ApiError> {
    let operator = auth::require(&state, &headers, Permissions::MANAGE_ROLES).await?;
    let req: UpdateRoleRequest = routes::parse_body(&body)?;

    let role = find_role(&state, role_id).await?;

    let name = match req.name {
        Some(raw) => validate_role_name(&raw)?,
        None => role.name,
    };
    if name_taken(&state, &name, Some(role_id)).await? {
        return Err(ApiError::Conflict("Role name already exists".into()));
    }
    let permissions = match req.permissions {
        Some(map) => Permissions::from_map(&map).to_stored(),
        None => role.permissions,
    };

    sqlx::query("UPDATE roles SET name = ?, permissions = ? WHERE id = ?")
        .bind(&name)
        .bind(&permissions)
        .bind(role_id)
        .execute(&state.db)
        .await?;

    tracing::info!("{} updated role {name}", operator.username);
    Ok(Json(find_role(&state, role_id).await?.into()))
}

pub async fn delete_role(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(role_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let operator = auth::require(&state, &headers, Permissions::MANAGE_ROLES).await?;

    // Assignments go with the role (ON DELETE CASCADE)
    let deleted = sqlx::query("DELETE FROM roles WHERE id = ?")
        .bind(role_id)
        .execute(&state.db)
        .await?
        .rows_affected();

    if deleted == 0 {
        return Err(ApiError::NotFound("Role not found".into()));
    }

    tracing::info!("{} deleted role {role_id}", operator.username);
    Ok(StatusCode::NO_CONTENT)
}

// ─── Moderators & role assignment (require manageRoles) ───

pub async fn list_moderators(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Moderator>>, ApiError> {
    auth::require(&state, &headers, Permissions::MANAGE_ROLES).await?;

    let moderators = sqlx::query_as::<_, Moderator>(
        "SELECT id, username, is_active, created_at FROM moderators ORDER BY username",
    )
    .fetch_all(&state.db)
    .await?;

    Ok(Json(moderators))
}

pub async fn get_moderator_roles(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(moderator_id): Path<i64>,
) -> Result<Json<Vec<Role>>, ApiError> {
    auth::require(&state, &headers, Permissions::MANAGE_ROLES).await?;
    ensure_moderator(&state, moderator_id).await?;

    let roles = sqlx::query_as::<_, RoleRow>(
        "SELECT r.id, r.name, r.permissions, r.created_at FROM roles r
         INNER JOIN moderator_roles mr ON r.id = mr.role_id
         WHERE mr.moderator_id = ?
         ORDER BY r.id",
    )
    .bind(moderator_id)
    .fetch_all(&state.db)
    .await?;

    Ok(Json(roles.into_iter().map(Role::from).collect()))
}

pub async fn assign_role(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(moderator_id): Path<i64>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let operator = auth::require(&state, &headers, Permissions::MANAGE_ROLES).await?;
    let req: AssignRoleRequest = routes::parse_body(&body)?;
    let role_id = req.role_id.ok_or_else(|| ApiError::missing_field("roleId"))?;

    ensure_moderator(&state, moderator_id).await?;
    let role = find_role(&state, role_id).await?;

    // Assign role (ignore if already assigned)
    sqlx::query("INSERT OR IGNORE INTO moderator_roles (moderator_id, role_id) VALUES (?, ?)")
        .bind(moderator_id)
        .bind(role.id)
        .execute(&state.db)
        .await?;

    tracing::info!(
        "{} assigned role {} to moderator {moderator_id}",
        operator.username,
        role.name
    );
    Ok(StatusCode::OK)
}

pub async fn remove_role(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((moderator_id, role_id)): Path<(i64, i64)>,
) -> Result<StatusCode, ApiError> {
    let operator = auth::require(&state, &headers, Permissions::MANAGE_ROLES).await?;

    let removed = sqlx::query("DELETE FROM moderator_roles WHERE moderator_id = ? AND role_id = ?")
        .bind(moderator_id)
        .bind(role_id)
        .execute(&state.db)
        .await?
        .rows_affected();

    if removed == 0 {
        return Err(ApiError::NotFound("Role assignment not found".into()));
    }

    tracing::info!(
        "{} removed role {role_id} from moderator {moderator_id}",
        operator.username
    );
    Ok(StatusCode::NO_CONTENT)
}

pub async fn set_moderator_active(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(moderator_id): Path<i64>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let operator = auth::require(&state, &headers, Permissions::MANAGE_ROLES).await?;
    let req: SetActiveRequest = routes::parse_body(&body)?;
    let is_active = req.is_active.ok_or_else(|| ApiError::missing_field("isActive"))?;

    ensure_moderator(&state, moderator_id).await?;

    if moderator_id == operator.id && !is_active {
        return Err(ApiError::Validation("Cannot deactivate your own account".into()));
    }

    sqlx::query("UPDATE moderators SET is_active = ? WHERE id = ?")
        .bind(is_active)
        .bind(moderator_id)
        .execute(&state.db)
        .await?;

    tracing::info!(
        "{} set moderator {moderator_id} active={is_active}",
        operator.username
    );
    Ok(StatusCode::NO_CONTENT)
}
