use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    Json,
};

use crate::error::ApiError;
use crate::models::{ModAction, ModActionRequest, ModActionResponse};
use crate::relay::RelayCommand;
use crate::routes::{self, auth};
use crate::state::AppState;

/// Longest timed punishment accepted, 100 years in milliseconds.
const MAX_DURATION_MS: i64 = 100 * 365 * 24 * 60 * 60 * 1000;

fn checked_duration(duration_ms: i64) -> Result<i64, ApiError> {
    if duration_ms <= 0 {
        return Err(ApiError::Validation("duration must be positive".into()));
    }
    if duration_ms > MAX_DURATION_MS {
        return Err(ApiError::Validation(format!(
            "duration must be at most {MAX_DURATION_MS} ms"
        )));
    }
    Ok(duration_ms)
}

/// POST /mod/{action}
///
/// Order of checks: token, operator, capability, input. The ledger write is
/// the source of truth; the relay send afterwards is best effort.
pub async fn moderate(
    State(state): State<AppState>,
    Path(action): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ModActionResponse>, ApiError> {
    let operator = auth::authenticate(&state, &headers).await?;

    let action: ModAction = action.parse().map_err(ApiError::NotFound)?;
    if !operator.can(action.required_capability()) {
        tracing::warn!("{} lacks permission for {action}", operator.username);
        return Err(ApiError::Forbidden);
    }

    let req: ModActionRequest = routes::parse_body(&body)?;

    let player = req
        .player_name
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ApiError::missing_field("playerName"))?;
    let reason = req.reason.as_deref();
    let ledger = &state.ledger;
    let actor = operator.actor();

    let command = match action {
        ModAction::Ban => {
            let record = ledger.ban(actor, player, reason).await?;
            RelayCommand::new(action, player).with_reason(&record.reason)
        }
        ModAction::TempBan => {
            let duration = req
                .duration
                .ok_or_else(|| ApiError::missing_field("duration"))?;
            let duration = checked_duration(duration)?;
            let record = ledger.temp_ban(actor, player, reason, duration).await?;
            RelayCommand::new(action, player)
                .with_reason(&record.reason)
                .with_duration_ms(record.duration)
        }
        ModAction::Unban => {
            ledger.unban(actor, player).await?;
            RelayCommand::new(action, player)
        }
        ModAction::Warn => {
            let record = ledger.warn(actor, player, reason).await?;
            RelayCommand::new(action, player).with_reason(&record.reason)
        }
        ModAction::Kick => {
            let record = ledger.kick(actor, player, reason).await?;
            RelayCommand::new(action, player).with_reason(&record.reason)
        }
        ModAction::Mute => {
            // Zero or negative means permanent
            let duration = req
                .duration
                .filter(|d| *d > 0)
                .map(checked_duration)
                .transpose()?;
            let record = ledger.mute(actor, player, reason, duration).await?;
            RelayCommand::new(action, player)
                .with_reason(&record.reason)
                .with_duration_ms(record.duration)
        }
        ModAction::Unmute => {
            ledger.unmute(actor, player).await?;
            RelayCommand::new(action, player)
        }
    };

    state.relay.send(command);

    Ok(Json(ModActionResponse {
        success: true,
        message: format!("Player {player} has been {}", action.past_tense()),
    }))
}
