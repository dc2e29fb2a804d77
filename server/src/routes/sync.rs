//! Control-call routes — request/response companions to the push channel.
//!
//! DESIGN
//! ======
//! Everything a client needs to say to the server travels here as plain
//! HTTP: tab registration, heartbeat acks, foreground promotion, and
//! offline-move drains. The push channel stays write-only from the
//! server's side.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use events::{EventPayload, GameMove, OwnerKey, TabStatus};

use crate::moves::MoveError;
use crate::routes::{authenticated_user, resolve_owner};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct TabRequest {
    /// Owner key; defaults to the caller's personal stream.
    pub owner: Option<String>,
    pub tab_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct AckResponse {
    pub ok: bool,
}

/// `POST /api/sync/register` — announce a tab and fetch session status.
pub async fn register_tab(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<TabRequest>,
) -> Result<Json<TabStatus>, StatusCode> {
    let user_id = authenticated_user(&headers)?;
    let owner = resolve_owner(user_id, body.owner.as_deref())?;
    Ok(Json(state.registry.tab_status(&owner).await))
}

/// `POST /api/sync/heartbeat` — liveness ack refreshing `last_seen`.
pub async fn heartbeat_ack(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<TabRequest>,
) -> Result<Json<AckResponse>, StatusCode> {
    let user_id = authenticated_user(&headers)?;
    let owner = resolve_owner(user_id, body.owner.as_deref())?;
    state.registry.update_heartbeat(&owner, body.tab_id).await;
    Ok(Json(AckResponse { ok: true }))
}

/// `POST /api/sync/active-tab` — explicit foreground promotion.
pub async fn set_active_tab(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<TabRequest>,
) -> Result<Json<AckResponse>, StatusCode> {
    let user_id = authenticated_user(&headers)?;
    let owner = resolve_owner(user_id, body.owner.as_deref())?;
    if state.registry.set_active_tab(&owner, body.tab_id).await {
        Ok(Json(AckResponse { ok: true }))
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

#[derive(Debug, Deserialize)]
pub struct SyncMovesRequest {
    /// Must be a `game:` owner key.
    pub owner: String,
    pub tab_id: Uuid,
    /// Offline queue contents in original submission order.
    pub moves: Vec<GameMove>,
}

#[derive(Debug, Serialize)]
pub struct SyncMovesResponse {
    pub applied: usize,
}

/// `POST /api/sync/moves` — drain a client's offline queue in order.
///
/// The batch goes to the external move write path as a unit; on success
/// every applied move is emitted as `MOVE_APPLIED` carrying the move id as
/// correlation id, followed by the authoritative snapshot when the engine
/// produced one. On rejection nothing is emitted and the client keeps its
/// queue for the next attempt.
pub async fn sync_offline_moves(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SyncMovesRequest>,
) -> Result<Json<SyncMovesResponse>, StatusCode> {
    let user_id = authenticated_user(&headers)?;
    let owner = resolve_owner(user_id, Some(&body.owner))?;
    let OwnerKey::Game(game_id) = owner else {
        return Err(StatusCode::BAD_REQUEST);
    };
    let owner = OwnerKey::game(game_id);

    let outcome = state
        .moves
        .apply_moves(game_id, &body.moves)
        .await
        .map_err(move_error_to_status)?;

    state.registry.update_heartbeat(&owner, body.tab_id).await;

    let applied = outcome.applied.len();
    for game_move in outcome.applied {
        let sync_id = game_move.id;
        state
            .registry
            .emit(&owner, EventPayload::MoveApplied { game_id, game_move, sync_id: Some(sync_id) })
            .await;
    }
    if let Some(snapshot) = outcome.snapshot {
        state.registry.emit(&owner, EventPayload::GameState(snapshot)).await;
    }

    Ok(Json(SyncMovesResponse { applied }))
}

pub(crate) fn move_error_to_status(err: MoveError) -> StatusCode {
    match err {
        MoveError::UnknownGame(_) => StatusCode::NOT_FOUND,
        MoveError::IllegalMove(_) => StatusCode::BAD_REQUEST,
        MoveError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

#[cfg(test)]
#[path = "sync_test.rs"]
mod tests;
