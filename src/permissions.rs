use sqlx::SqlitePool;

use crate::ledger::Actor;
use crate::models::Permissions;

/// An authenticated, active operator with its effective capabilities.
#[derive(Debug, Clone)]
pub struct ResolvedOperator {
    pub id: i64,
    pub username: String,
    pub permissions: Permissions,
}

impl ResolvedOperator {
    pub fn can(&self, required: Permissions) -> bool {
        self.permissions.contains(required)
    }

    pub fn actor(&self) -> Actor<'_> {
        Actor {
            id: self.id,
            username: &self.username,
        }
    }
}

/// Union of the given role permission maps.
///
/// A capability is granted when any role grants it; a key missing from
/// every role stays denied.
pub fn merge_role_permissions<'a>(stored: impl IntoIterator<Item = &'a str>) -> Permissions {
    stored
        .into_iter()
        .map(Permissions::from_stored)
        .fold(Permissions::empty(), |acc, perms| acc | perms)
}

/// Load an operator and compute its effective permissions.
///
/// Returns `None` when the operator does not exist or is inactive. Nothing
/// is cached: role edits apply to the very next request.
pub async fn resolve(
    db: &SqlitePool,
    operator_id: i64,
) -> Result<Option<ResolvedOperator>, sqlx::Error> {
    let operator: Option<(i64, String, bool)> =
        sqlx::query_as("SELECT id, username, is_active FROM moderators WHERE id = ?")
            .bind(operator_id)
            .fetch_optional(db)
            .await?;

    let Some((id, username, true)) = operator else {
        return Ok(None);
    };

    let role_permissions: Vec<String> = sqlx::query_scalar(
        "SELECT r.permissions FROM roles r
         INNER JOIN moderator_roles mr ON r.id = mr.role_id
         WHERE mr.moderator_id = ?
         ORDER BY r.id",
    )
    .bind(id)
    .fetch_all(db)
    .await?;

    Ok(Some(ResolvedOperator {
        id,
        username,
        permissions: merge_role_permissions(role_permissions.iter().map(String::as_str)),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;

    async fn insert_moderator(db: &SqlitePool, username: &str, active: bool) -> i64 {
        sqlx::query("INSERT INTO moderators (username, password_hash, is_active) VALUES (?, 'x', ?)")
            .bind(username)
            .bind(active)
            .execute(db)
            .await
            .unwrap()
            .last_insert_rowid()
    }

    async fn insert_role(db: &SqlitePool, name: &str, perms: Permissions) -> i64 {
        sqlx::query("INSERT INTO roles (name, permissions) VALUES (?, ?)")
            .bind(name)
            .bind(perms.to_stored())
            .execute(db)
            .await
            .unwrap()
            .last_insert_rowid()
    }

    async fn assign(db: &SqlitePool, moderator_id: i64, role_id: i64) {
        sqlx::query("INSERT INTO moderator_roles (moderator_id, role_id) VALUES (?, ?)")
            .bind(moderator_id)
            .bind(role_id)
            .execute(db)
            .await
            .unwrap();
    }

    #[test]
    fn merge_is_logical_or() {
        let merged = merge_role_permissions([
            r#"{"ban": true, "kick": false}"#,
            r#"{"kick": true, "warn": false}"#,
            r#"{"bogus": true}"#,
        ]);
        assert_eq!(merged, Permissions::BAN | Permissions::KICK);
        assert_eq!(merge_role_permissions(Vec::<&str>::new()), Permissions::empty());
    }

    #[tokio::test]
    async fn resolves_union_of_assigned_roles() {
        let db = memory_pool().await;
        let op = insert_moderator(&db, "alice", true).await;
        let helper = insert_role(&db, "Helper", Permissions::WARN).await;
        let mod_role = insert_role(&db, "Mod", Permissions::KICK | Permissions::MUTE).await;
        insert_role(&db, "Unassigned", Permissions::all()).await;
        assign(&db, op, helper).await;
        assign(&db, op, mod_role).await;

        let resolved = resolve(&db, op).await.unwrap().unwrap();
        assert_eq!(resolved.username, "alice");
        assert_eq!(
            resolved.permissions,
            Permissions::WARN | Permissions::KICK | Permissions::MUTE
        );
        assert!(!resolved.can(Permissions::BAN));
    }

    #[tokio::test]
    async fn role_changes_apply_on_next_resolve() {
        let db = memory_pool().await;
        let op = insert_moderator(&db, "bob", true).await;
        assert_eq!(resolve(&db, op).await.unwrap().unwrap().permissions, Permissions::empty());

        let role = insert_role(&db, "Banner", Permissions::BAN).await;
        assign(&db, op, role).await;
        assert!(resolve(&db, op).await.unwrap().unwrap().can(Permissions::BAN));

        sqlx::query("UPDATE roles SET permissions = ? WHERE id = ?")
            .bind(Permissions::WARN.to_stored())
            .bind(role)
            .execute(&db)
            .await
            .unwrap();
        let resolved = resolve(&db, op).await.unwrap().unwrap();
        assert!(!resolved.can(Permissions::BAN));
        assert!(resolved.can(Permissions::WARN));
    }

    #[tokio::test]
    async fn inactive_or_missing_operator_is_none() {
        let db = memory_pool().await;
        let op = insert_moderator(&db, "carol", false).await;
        assert!(resolve(&db, op).await.unwrap().is_none());
        assert!(resolve(&db, 9999).await.unwrap().is_none());
    }
}
