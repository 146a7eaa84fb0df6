//! Punishment ledger: the authoritative record of moderation actions.
//!
//! Every mutation writes its punishment change and one `mod_actions` audit
//! row inside a single transaction. Capability checks are the caller's job.

use chrono::{Timelike, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::models::{
    millis_to_datetime, AuditEntry, ModAction, Player, PunishmentKind, PunishmentRecord, Stats,
    DEFAULT_REASON,
};

/// The operator performing a mutation.
#[derive(Debug, Clone, Copy)]
pub struct Actor<'a> {
    pub id: i64,
    pub username: &'a str,
}

#[derive(Debug, sqlx::FromRow)]
struct PunishmentRow {
    id: i64,
    player_name: String,
    kind: String,
    reason: String,
    operator: String,
    start_ms: i64,
    end_ms: Option<i64>,
    duration_ms: Option<i64>,
    is_active: bool,
}

impl PunishmentRow {
    fn into_record(self, now_ms: i64) -> Result<PunishmentRecord, sqlx::Error> {
        let kind = self
            .kind
            .parse::<PunishmentKind>()
            .map_err(|e| sqlx::Error::Decode(e.into()))?;
        Ok(PunishmentRecord {
            id: self.id,
            player_name: self.player_name,
            kind,
            reason: self.reason,
            operator: self.operator,
            start: millis_to_datetime(self.start_ms),
            end: self.end_ms.map(millis_to_datetime),
            duration: self.duration_ms,
            is_active: self.is_active,
            expired: self.end_ms.is_some_and(|end| end <= now_ms),
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AuditRow {
    id: i64,
    moderator_id: i64,
    moderator_username: Option<String>,
    action_type: String,
    target_player: String,
    reason: Option<String>,
    duration_ms: Option<i64>,
    timestamp_ms: i64,
}

impl From<AuditRow> for AuditEntry {
    fn from(row: AuditRow) -> Self {
        Self {
            id: row.id,
            moderator_id: row.moderator_id,
            moderator_username: row.moderator_username.unwrap_or_else(|| "-".to_string()),
            action_type: row.action_type,
            target_player: row.target_player,
            reason: row.reason,
            duration: row.duration_ms,
            timestamp: millis_to_datetime(row.timestamp_ms),
        }
    }
}

/// A punishment about to be written.
struct NewPunishment<'a> {
    action: ModAction,
    kind: PunishmentKind,
    player: &'a str,
    reason: String,
    duration_ms: Option<i64>,
    active: bool,
}

const PUNISHMENT_COLUMNS: &str =
    "id, player_name, kind, reason, operator, start_ms, end_ms, duration_ms, is_active";

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn reason_or_default(reason: Option<&str>) -> String {
    match reason.map(str::trim) {
        Some(r) if !r.is_empty() => r.to_string(),
        _ => DEFAULT_REASON.to_string(),
    }
}

#[derive(Clone)]
pub struct Ledger {
    db: SqlitePool,
}

impl Ledger {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub async fn ban(
        &self,
        actor: Actor<'_>,
        player: &str,
        reason: Option<&str>,
    ) -> Result<PunishmentRecord, sqlx::Error> {
        self.punish(
            actor,
            NewPunishment {
                action: ModAction::Ban,
                kind: PunishmentKind::Ban,
                player,
                reason: reason_or_default(reason),
                duration_ms: None,
                active: true,
            },
        )
        .await
    }

    pub async fn temp_ban(
        &self,
        actor: Actor<'_>,
        player: &str,
        reason: Option<&str>,
        duration_ms: i64,
    ) -> Result<PunishmentRecord, sqlx::Error> {
        self.punish(
            actor,
            NewPunishment {
                action: ModAction::TempBan,
                kind: PunishmentKind::TempBan,
                player,
                reason: reason_or_default(reason),
                duration_ms: Some(duration_ms),
                active: true,
            },
        )
        .await
    }

    /// Deactivate every active ban or tempban. Zero affected rows is fine.
    pub async fn unban(&self, actor: Actor<'_>, player: &str) -> Result<u64, sqlx::Error> {
        self.deactivate(
            actor,
            ModAction::Unban,
            player,
            "kind IN ('ban', 'tempban')",
        )
        .await
    }

    pub async fn warn(
        &self,
        actor: Actor<'_>,
        player: &str,
        reason: Option<&str>,
    ) -> Result<PunishmentRecord, sqlx::Error> {
        self.punish(
            actor,
            NewPunishment {
                action: ModAction::Warn,
                kind: PunishmentKind::Warn,
                player,
                reason: reason_or_default(reason),
                duration_ms: None,
                active: true,
            },
        )
        .await
    }

    /// Kicks have no standing effect, so the record starts inactive.
    pub async fn kick(
        &self,
        actor: Actor<'_>,
        player: &str,
        reason: Option<&str>,
    ) -> Result<PunishmentRecord, sqlx::Error> {
        self.punish(
            actor,
            NewPunishment {
                action: ModAction::Kick,
                kind: PunishmentKind::Kick,
                player,
                reason: reason_or_default(reason),
                duration_ms: None,
                active: false,
            },
        )
        .await
    }

    /// Timed when `duration_ms` is a positive value, permanent otherwise.
    pub async fn mute(
        &self,
        actor: Actor<'_>,
        player: &str,
        reason: Option<&str>,
        duration_ms: Option<i64>,
    ) -> Result<PunishmentRecord, sqlx::Error> {
        self.punish(
            actor,
            NewPunishment {
                action: ModAction::Mute,
                kind: PunishmentKind::Mute,
                player,
                reason: reason_or_default(reason),
                duration_ms: duration_ms.filter(|d| *d > 0),
                active: true,
            },
        )
        .await
    }

    pub async fn unmute(&self, actor: Actor<'_>, player: &str) -> Result<u64, sqlx::Error> {
        self.deactivate(actor, ModAction::Unmute, player, "kind = 'mute'")
            .await
    }

    async fn punish(
        &self,
        actor: Actor<'_>,
        new: NewPunishment<'_>,
    ) -> Result<PunishmentRecord, sqlx::Error> {
        let start_ms = now_ms();
        let end_ms = match new.duration_ms {
            Some(d) => Some(start_ms.checked_add(d).ok_or_else(|| {
                sqlx::Error::Protocol(format!("duration of {d} ms is out of range"))
            })?),
            None => None,
        };

        let mut tx = self.db.begin().await?;

        let id = sqlx::query(
            "INSERT INTO punishments (player_name, kind, reason, operator, start_ms, end_ms, duration_ms, is_active)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(new.player)
        .bind(new.kind.as_str())
        .bind(&new.reason)
        .bind(actor.username)
        .bind(start_ms)
        .bind(end_ms)
        .bind(new.duration_ms)
        .bind(new.active)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        record_audit(
            &mut tx,
            actor,
            new.action,
            new.player,
            Some(&new.reason),
            new.duration_ms,
            start_ms,
        )
        .await?;

        tx.commit().await?;

        tracing::info!(
            "{} {} {} (record {id})",
            actor.username,
            new.action.past_tense(),
            new.player
        );

        PunishmentRow {
            id,
            player_name: new.player.to_string(),
            kind: new.kind.as_str().to_string(),
            reason: new.reason,
            operator: actor.username.to_string(),
            start_ms,
            end_ms,
            duration_ms: new.duration_ms,
            is_active: new.active,
        }
        .into_record(start_ms)
    }

    async fn deactivate(
        &self,
        actor: Actor<'_>,
        action: ModAction,
        player: &str,
        kind_filter: &'static str,
    ) -> Result<u64, sqlx::Error> {
        let now = now_ms();
        let mut tx = self.db.begin().await?;

        let affected = sqlx::query(&format!(
            "UPDATE punishments SET is_active = 0
             WHERE player_name = ? AND is_active = 1 AND {kind_filter}"
        ))
        .bind(player)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        record_audit(&mut tx, actor, action, player, None, None, now).await?;

        tx.commit().await?;

        tracing::info!(
            "{} {} {player} ({affected} records deactivated)",
            actor.username,
            action.past_tense()
        );
        Ok(affected)
    }

    /// Full history for a player, newest first.
    pub async fn list_for_player(
        &self,
        player: &str,
    ) -> Result<Vec<PunishmentRecord>, sqlx::Error> {
        let rows: Vec<PunishmentRow> = sqlx::query_as(&format!(
            "SELECT {PUNISHMENT_COLUMNS} FROM punishments
             WHERE player_name = ? ORDER BY start_ms DESC, id DESC"
        ))
        .bind(player)
        .fetch_all(&self.db)
        .await?;

        let now = now_ms();
        rows.into_iter().map(|r| r.into_record(now)).collect()
    }

    /// Records currently in effect: active and not past their end time.
    pub async fn list_active_for_player(
        &self,
        player: &str,
    ) -> Result<Vec<PunishmentRecord>, sqlx::Error> {
        let now = now_ms();
        let rows: Vec<PunishmentRow> = sqlx::query_as(&format!(
            "SELECT {PUNISHMENT_COLUMNS} FROM punishments
             WHERE player_name = ? AND is_active = 1 AND (end_ms IS NULL OR end_ms > ?)
             ORDER BY start_ms DESC, id DESC"
        ))
        .bind(player)
        .bind(now)
        .fetch_all(&self.db)
        .await?;

        rows.into_iter().map(|r| r.into_record(now)).collect()
    }

    pub async fn recent_audit(&self, limit: i64) -> Result<Vec<AuditEntry>, sqlx::Error> {
        let rows: Vec<AuditRow> = sqlx::query_as(
            "SELECT a.id, a.moderator_id, m.username AS moderator_username, a.action_type,
                    a.target_player, a.reason, a.duration_ms, a.timestamp_ms
             FROM mod_actions a
             LEFT JOIN moderators m ON m.id = a.moderator_id
             ORDER BY a.timestamp_ms DESC, a.id DESC
             LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.db)
        .await?;

        Ok(rows.into_iter().map(AuditEntry::from).collect())
    }

    /// Look a player up by UUID or by name (case-insensitive).
    pub async fn resolve_player(&self, identifier: &str) -> Result<Option<Player>, sqlx::Error> {
        let row: Option<(String, Option<String>, Option<i64>)> = sqlx::query_as(
            "SELECT name, uuid, last_login_ms FROM players
             WHERE uuid = ? OR name = ?
             ORDER BY CASE WHEN uuid = ? THEN 0 ELSE 1 END
             LIMIT 1",
        )
        .bind(identifier)
        .bind(identifier)
        .bind(identifier)
        .fetch_optional(&self.db)
        .await?;

        Ok(row.map(|(name, uuid, last_login_ms)| Player {
            uuid,
            name,
            last_login: last_login_ms.map(millis_to_datetime),
        }))
    }

    pub async fn list_players(&self) -> Result<Vec<Player>, sqlx::Error> {
        let rows: Vec<(String, Option<String>, Option<i64>)> =
            sqlx::query_as("SELECT name, uuid, last_login_ms FROM players ORDER BY name ASC")
                .fetch_all(&self.db)
                .await?;

        Ok(rows
            .into_iter()
            .map(|(name, uuid, last_login_ms)| Player {
                uuid,
                name,
                last_login: last_login_ms.map(millis_to_datetime),
            })
            .collect())
    }

    pub async fn stats(&self) -> Result<Stats, sqlx::Error> {
        let now = Utc::now();
        let midnight_ms = now
            .with_hour(0)
            .and_then(|t| t.with_minute(0))
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(now)
            .timestamp_millis();

        let (total_punishments, total_bans, bans_today): (i64, i64, i64) = sqlx::query_as(
            "SELECT COUNT(*),
                    COALESCE(SUM(kind IN ('ban', 'tempban')), 0),
                    COALESCE(SUM(kind IN ('ban', 'tempban') AND start_ms >= ?), 0)
             FROM punishments",
        )
        .bind(midnight_ms)
        .fetch_one(&self.db)
        .await?;

        Ok(Stats {
            bans_today,
            total_bans,
            total_punishments,
        })
    }
}

async fn record_audit(
    tx: &mut Transaction<'_, Sqlite>,
    actor: Actor<'_>,
    action: ModAction,
    player: &str,
    reason: Option<&str>,
    duration_ms: Option<i64>,
    timestamp_ms: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO mod_actions (moderator_id, action_type, target_player, reason, duration_ms, timestamp_ms)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(actor.id)
    .bind(action.as_str())
    .bind(player)
    .bind(reason)
    .bind(duration_ms)
    .bind(timestamp_ms)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Insert or refresh a player row the way the game server does on join.
#[cfg(test)]
pub async fn upsert_player(db: &SqlitePool, name: &str, uuid: &str) {
    sqlx::query(
        "INSERT INTO players (name, uuid, last_login_ms) VALUES (?, ?, ?)
         ON CONFLICT(name) DO UPDATE SET uuid = excluded.uuid, last_login_ms = excluded.last_login_ms",
    )
    .bind(name)
    .bind(uuid)
    .bind(now_ms())
    .execute(db)
    .await
    .unwrap();
}
