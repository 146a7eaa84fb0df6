use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Reason stored when a moderator does not give one.
pub const DEFAULT_REASON: &str = "No reason specified";

// ─── Permissions ───
// SYNC NOTE: capability keys must match the web panel's role editor.
bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Permissions: u32 {
        const BAN          = 1 << 0;
        const UNBAN        = 1 << 1;
        const WARN         = 1 << 2;
        const KICK         = 1 << 3;
        const MUTE         = 1 << 4;
        const UNMUTE       = 1 << 5;
        const MANAGE_ROLES = 1 << 6;
        const VIEW_ACTIONS = 1 << 7;
    }
}

/// Every capability the panel knows about, in display order.
pub const CAPABILITIES: [(&str, Permissions); 8] = [
    ("ban", Permissions::BAN),
    ("unban", Permissions::UNBAN),
    ("warn", Permissions::WARN),
    ("kick", Permissions::KICK),
    ("mute", Permissions::MUTE),
    ("unmute", Permissions::UNMUTE),
    ("manageRoles", Permissions::MANAGE_ROLES),
    ("viewActions", Permissions::VIEW_ACTIONS),
];

impl Permissions {
    /// Build a capability set from a `capability -> bool` map.
    ///
    /// Only keys from [`CAPABILITIES`] are consulted; anything else in the
    /// map is ignored.
    pub fn from_map(map: &HashMap<String, bool>) -> Self {
        CAPABILITIES
            .iter()
            .fold(Self::empty(), |acc, (key, flag)| {
                if map.get(*key).copied().unwrap_or(false) {
                    acc | *flag
                } else {
                    acc
                }
            })
    }

    /// Full `capability -> bool` map, one entry per known capability.
    pub fn to_map(self) -> BTreeMap<&'static str, bool> {
        CAPABILITIES
            .iter()
            .map(|(key, flag)| (*key, self.contains(*flag)))
            .collect()
    }

    /// Decode a role's stored JSON permission map. Malformed data grants nothing.
    pub fn from_stored(raw: &str) -> Self {
        match serde_json::from_str::<HashMap<String, bool>>(raw) {
            Ok(map) => Self::from_map(&map),
            Err(e) => {
                tracing::warn!("Ignoring malformed role permissions {raw:?}: {e}");
                Self::empty()
            }
        }
    }

    /// JSON form written to the `roles.permissions` column.
    pub fn to_stored(self) -> String {
        serde_json::to_string(&self.to_map()).unwrap_or_else(|_| "{}".to_string())
    }
}

// ─── Moderation actions ───

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModAction {
    Ban,
    TempBan,
    Unban,
    Warn,
    Kick,
    Mute,
    Unmute,
}

impl ModAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ban => "ban",
            Self::TempBan => "tempban",
            Self::Unban => "unban",
            Self::Warn => "warn",
            Self::Kick => "kick",
            Self::Mute => "mute",
            Self::Unmute => "unmute",
        }
    }

    /// Capability an operator needs to perform this action.
    pub fn required_capability(self) -> Permissions {
        match self {
            Self::Ban | Self::TempBan => Permissions::BAN,
            Self::Unban => Permissions::UNBAN,
            Self::Warn => Permissions::WARN,
            Self::Kick => Permissions::KICK,
            Self::Mute => Permissions::MUTE,
            Self::Unmute => Permissions::UNMUTE,
        }
    }

    /// Past tense used in response messages.
    pub fn past_tense(self) -> &'static str {
        match self {
            Self::Ban => "banned",
            Self::TempBan => "temporarily banned",
            Self::Unban => "unbanned",
            Self::Warn => "warned",
            Self::Kick => "kicked",
            Self::Mute => "muted",
            Self::Unmute => "unmuted",
        }
    }
}

impl fmt::Display for ModAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ban" => Ok(Self::Ban),
            "tempban" => Ok(Self::TempBan),
            "unban" => Ok(Self::Unban),
            "warn" => Ok(Self::Warn),
            "kick" => Ok(Self::Kick),
            "mute" => Ok(Self::Mute),
            "unmute" => Ok(Self::Unmute),
            other => Err(format!("Unknown action: {other}")),
        }
    }
}

// ─── Punishments ───

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PunishmentKind {
    Ban,
    TempBan,
    Warn,
    Kick,
    Mute,
}

impl PunishmentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ban => "ban",
            Self::TempBan => "tempban",
            Self::Warn => "warn",
            Self::Kick => "kick",
            Self::Mute => "mute",
        }
    }
}

impl FromStr for PunishmentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ban" => Ok(Self::Ban),
            "tempban" => Ok(Self::TempBan),
            "warn" => Ok(Self::Warn),
            "kick" => Ok(Self::Kick),
            "mute" => Ok(Self::Mute),
            other => Err(format!("unknown punishment kind {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PunishmentRecord {
    pub id: i64,
    pub player_name: String,
    #[serde(rename = "type")]
    pub kind: PunishmentKind,
    pub reason: String,
    pub operator: String,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    /// Milliseconds
    pub duration: Option<i64>,
    pub is_active: bool,
    /// Timed record whose end has already passed.
    pub expired: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: i64,
    pub moderator_id: i64,
    pub moderator_username: String,
    pub action_type: String,
    pub target_player: String,
    pub reason: Option<String>,
    /// Milliseconds
    pub duration: Option<i64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    pub uuid: Option<String>,
    pub name: String,
    pub last_login: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerDetails {
    #[serde(flatten)]
    pub player: Player,
    pub punishments: Vec<PunishmentRecord>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub bans_today: i64,
    pub total_bans: i64,
    pub total_punishments: i64,
}

pub fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

// ─── Roles & moderators ───

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub id: i64,
    pub name: String,
    pub permissions: BTreeMap<&'static str, bool>,
    pub created_at: String,
}

#[derive(Debug, sqlx::FromRow)]
pub struct RoleRow {
    pub id: i64,
    pub name: String,
    pub permissions: String,
    pub created_at: String,
}

impl From<RoleRow> for Role {
    fn from(row: RoleRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            permissions: Permissions::from_stored(&row.permissions).to_map(),
            created_at: row.created_at,
        }
    }
}

// Request fields are optional so a missing key gets a named 400.

#[derive(Debug, Default, Deserialize)]
pub struct CreateRoleRequest {
    pub name: Option<String>,
    #[serde(default)]
    pub permissions: HashMap<String, bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateRoleRequest {
    pub name: Option<String>,
    pub permissions: Option<HashMap<String, bool>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignRoleRequest {
    pub role_id: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetActiveRequest {
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Moderator {
    pub id: i64,
    pub username: String,
    pub is_active: bool,
    pub created_at: String,
}

// ─── Moderation API ───

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModActionRequest {
    pub player_name: Option<String>,
    pub reason: Option<String>,
    /// Milliseconds
    pub duration: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ModActionResponse {
    pub success: bool,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_capability_keys_are_dropped() {
        let map: HashMap<String, bool> = [
            ("ban".to_string(), true),
            ("kick".to_string(), false),
            ("superuser".to_string(), true),
        ]
        .into_iter()
        .collect();

        let perms = Permissions::from_map(&map);
        assert_eq!(perms, Permissions::BAN);

        let out = perms.to_map();
        assert_eq!(out.len(), CAPABILITIES.len());
        assert!(!out.contains_key("superuser"));
        assert_eq!(out.get("ban"), Some(&true));
        assert_eq!(out.get("manageRoles"), Some(&false));
    }

    #[test]
    fn malformed_stored_permissions_grant_nothing() {
        assert_eq!(Permissions::from_stored("not json"), Permissions::empty());
        assert_eq!(Permissions::from_stored(r#"{"ban": "yes"}"#), Permissions::empty());
        assert_eq!(
            Permissions::from_stored(&Permissions::all().to_stored()),
            Permissions::all()
        );
    }

    #[test]
    fn tempban_needs_ban_capability() {
        assert_eq!(ModAction::TempBan.required_capability(), Permissions::BAN);
        assert_eq!("tempban".parse::<ModAction>(), Ok(ModAction::TempBan));
        assert!("ipban".parse::<ModAction>().is_err());
    }
}
