//! WebSocket push route — the server→client event channel.
//!
//! DESIGN
//! ======
//! The channel is unidirectional at the protocol level: the server pushes
//! `SyncEvent` frames, one JSON event per text frame. Inbound text from
//! the client is treated purely as a liveness signal; the real control
//! calls are ordinary HTTP requests (see `routes::sync`).
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → admit into the registry (sink ownership moves there)
//! 2. `CONNECTED` welcome envelope directly on the socket
//! 3. `select!` loop: registry events → socket; inbound text → liveness ack
//! 4. Close, write failure, or sink closed by the registry → remove + exit

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use events::{EventPayload, OwnerKey, SyncEvent};

use crate::routes::{authenticated_user, resolve_owner};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    /// Owner key to subscribe to; defaults to the caller's personal stream.
    pub owner: Option<String>,
    /// Caller-supplied tab id identifying this client instance.
    pub tab: Uuid,
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let user_id = match authenticated_user(&headers) {
        Ok(user_id) => user_id,
        Err(status) => return (status, "authentication required").into_response(),
    };
    let owner = match resolve_owner(user_id, params.owner.as_deref()) {
        Ok(owner) => owner,
        Err(status) => return (status, "invalid owner key").into_response(),
    };

    ws.on_upgrade(move |socket| run_ws(socket, state, owner, params.tab))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState, owner: OwnerKey, tab_id: Uuid) {
    let (tx, mut rx) = mpsc::channel::<SyncEvent>(state.registry.config().sink_capacity);
    // Weak handle for teardown: identifies our sink without keeping the
    // channel open after the registry drops its sender.
    let sink_id = tx.downgrade();
    state.registry.add_connection(&owner, tab_id, tx).await;
    info!(%owner, tab = %tab_id, "ws: client connected");

    let welcome = SyncEvent::new(owner.clone(), EventPayload::Connected { tab_id });
    if send_event(&mut socket, &welcome).await.is_err() {
        cleanup(&state, &owner, tab_id, &sink_id).await;
        return;
    }

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        // Any inbound frame proves the tab is alive.
                        state.registry.update_heartbeat(&owner, tab_id).await;
                        if let Err(e) = serde_json::from_str::<serde_json::Value>(&text) {
                            warn!(%owner, tab = %tab_id, error = %e, "ws: malformed inbound frame ignored");
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            event = rx.recv() => {
                // `None` means the registry dropped our sink (superseded or evicted).
                let Some(event) = event else { break };
                let terminal = matches!(event.payload, EventPayload::Superseded);
                if send_event(&mut socket, &event).await.is_err() {
                    break;
                }
                if terminal {
                    break;
                }
            }
        }
    }

    cleanup(&state, &owner, tab_id, &sink_id).await;
    info!(%owner, tab = %tab_id, "ws: client disconnected");
}

// =============================================================================
// HELPERS
// =============================================================================

/// Remove our registry entry, but only if it is still ours. If the sink
/// cannot be upgraded the registry has already dropped it (supersession or
/// eviction), and a tab that re-registered under the same id must survive.
async fn cleanup(
    state: &AppState,
    owner: &OwnerKey,
    tab_id: Uuid,
    sink_id: &mpsc::WeakSender<SyncEvent>,
) {
    if let Some(sink) = sink_id.upgrade() {
        state.registry.remove_connection_for_sink(owner, tab_id, &sink).await;
    }
}

async fn send_event(socket: &mut WebSocket, event: &SyncEvent) -> Result<(), ()> {
    let json = events::encode_event(event);
    debug!(id = %event.id, kind = event.payload.kind(), "ws: send event");
    socket.send(Message::Text(json.into())).await.map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
