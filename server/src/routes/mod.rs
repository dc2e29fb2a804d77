//! Router assembly and request identity.
//!
//! SYSTEM CONTEXT
//! ==============
//! Authentication itself lives upstream: a gateway validates the session
//! and injects the stable user id as the `x-sync-user` header. This layer
//! only checks that the header is present and that `user:` owner keys
//! match it.

pub mod sync;
pub mod ws;

use axum::Router;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use events::{OwnerKey, USER_HEADER};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::state::AppState;

/// Push channel, control calls, and health probe under a single router.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/sync/ws", get(ws::handle_ws))
        .route("/api/sync/register", post(sync::register_tab))
        .route("/api/sync/heartbeat", post(sync::heartbeat_ack))
        .route("/api/sync/active-tab", post(sync::set_active_tab))
        .route("/api/sync/moves", post(sync::sync_offline_moves))
        .route("/healthz", get(healthz))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

/// Authenticated user id from the gateway-injected header.
pub(crate) fn authenticated_user(headers: &HeaderMap) -> Result<Uuid, StatusCode> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .ok_or(StatusCode::UNAUTHORIZED)
}

/// Resolve the owner key for a request. Absent means the caller's personal
/// stream; an explicit `user:` key must match the authenticated identity;
/// `game:` keys pass through.
pub(crate) fn resolve_owner(user_id: Uuid, owner_param: Option<&str>) -> Result<OwnerKey, StatusCode> {
    let Some(raw) = owner_param else {
        return Ok(OwnerKey::user(user_id));
    };
    let key: OwnerKey = raw.parse().map_err(|_| StatusCode::BAD_REQUEST)?;
    match &key {
        OwnerKey::User(id) if *id != user_id => Err(StatusCode::FORBIDDEN),
        _ => Ok(key),
    }
}
