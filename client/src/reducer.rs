//! Pure event reducer producing the UI-facing state.
//!
//! DESIGN
//! ======
//! `reduce` is a total, I/O-free fold over a closed action union: every
//! inbound payload plus the purely-local optimistic actions. Ordering
//! correctness is the transport's and registry's concern — by the time an
//! action reaches this module it is applied unconditionally, and game
//! snapshots are last-write-wins.

use std::collections::{BTreeSet, HashMap};

use events::{ChatMessage, EventPayload, GameSnapshot, Notification};
use uuid::Uuid;

// =============================================================================
// STATE
// =============================================================================

/// Connection status as the UI sees it. Fed by `CONNECTION_OPENED` /
/// `CONNECTION_ERROR` actions, not derived from transport internals.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub connected: bool,
    pub reconnecting: bool,
    pub error: Option<String>,
    pub attempts: u32,
}

/// Everything the UI renders from the sync stream.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClientState {
    /// Live (unarchived) notifications, newest first. Read notifications
    /// leave the list entirely.
    pub notifications: Vec<Notification>,
    pub unread_count: usize,
    pub connection: ConnectionInfo,
    /// Currently-typing user ids per chat. No empty sets are retained.
    pub typing: HashMap<Uuid, BTreeSet<Uuid>>,
    /// Message history per chat, oldest first.
    pub messages: HashMap<Uuid, Vec<ChatMessage>>,
    /// Latest authoritative snapshot per game.
    pub games: HashMap<Uuid, GameSnapshot>,
    /// Notifications optimistically marked read, kept verbatim for rollback.
    pending_reads: HashMap<Uuid, Notification>,
}

// =============================================================================
// ACTIONS
// =============================================================================

/// Closed union of reducer inputs: inbound envelope payloads plus local
/// actions originated by the sync manager or the UI.
#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    /// An inbound envelope payload, applied in receipt order.
    Event(EventPayload),
    /// Mark a notification read before the server confirms, stashing the
    /// original for rollback.
    OptimisticMarkRead { notification_id: Uuid },
    /// Restore a stashed notification after the server rejected the
    /// mutation. Re-inserted at the head; original position is not kept.
    RevertOptimistic { notification_id: Uuid },
    ConnectionOpened,
    ConnectionError { message: String, attempts: u32 },
}

// =============================================================================
// REDUCER
// =============================================================================

/// Apply one action. Pure: no I/O, no clocks, no randomness.
#[must_use]
pub fn reduce(mut state: ClientState, action: Action) -> ClientState {
    match action {
        Action::Event(payload) => apply_event(state, payload),
        Action::OptimisticMarkRead { notification_id } => {
            if let Some(original) = take_notification(&mut state, notification_id) {
                state.pending_reads.insert(notification_id, original);
            }
            state
        }
        Action::RevertOptimistic { notification_id } => {
            if let Some(original) = state.pending_reads.remove(&notification_id) {
                if !original.read {
                    state.unread_count += 1;
                }
                state.notifications.insert(0, original);
            }
            state
        }
        Action::ConnectionOpened => {
            state.connection =
                ConnectionInfo { connected: true, reconnecting: false, error: None, attempts: 0 };
            state
        }
        Action::ConnectionError { message, attempts } => {
            state.connection = ConnectionInfo {
                connected: false,
                reconnecting: true,
                error: Some(message),
                attempts,
            };
            state
        }
    }
}

fn apply_event(mut state: ClientState, payload: EventPayload) -> ClientState {
    match payload {
        EventPayload::NotificationReceived(notification) => {
            if !notification.read {
                state.unread_count += 1;
            }
            state.notifications.insert(0, notification);
        }
        EventPayload::NotificationRead { notification_id, .. } => {
            take_notification(&mut state, notification_id);
        }
        EventPayload::MessageReceived(message) => {
            // A message from a user implies they stopped typing.
            stop_typing(&mut state, message.chat_id, message.sender_id);
            state.messages.entry(message.chat_id).or_default().push(message);
        }
        EventPayload::TypingStart { chat_id, user_id } => {
            state.typing.entry(chat_id).or_default().insert(user_id);
        }
        EventPayload::TypingStop { chat_id, user_id } => {
            stop_typing(&mut state, chat_id, user_id);
        }
        EventPayload::GameState(snapshot) => {
            state.games.insert(snapshot.game_id, snapshot);
        }
        // The authoritative GAME_STATE follows a MOVE_APPLIED; the latter
        // exists for optimistic-update correlation only.
        EventPayload::MoveApplied { .. } => {}
        EventPayload::Superseded => {
            state.connection.connected = false;
            state.connection.reconnecting = false;
        }
        EventPayload::Connected { .. }
        | EventPayload::Heartbeat
        | EventPayload::TabStatusUpdate(_)
        | EventPayload::ActiveTabChanged { .. } => {}
    }
    state
}

/// Remove a notification from the live list, keeping `unread_count`
/// consistent. Returns the removed notification.
fn take_notification(state: &mut ClientState, notification_id: Uuid) -> Option<Notification> {
    let index = state.notifications.iter().position(|n| n.id == notification_id)?;
    let notification = state.notifications.remove(index);
    if !notification.read {
        state.unread_count = state.unread_count.saturating_sub(1);
    }
    Some(notification)
}

fn stop_typing(state: &mut ClientState, chat_id: Uuid, user_id: Uuid) {
    if let Some(users) = state.typing.get_mut(&chat_id) {
        users.remove(&user_id);
        if users.is_empty() {
            state.typing.remove(&chat_id);
        }
    }
}

#[cfg(test)]
#[path = "reducer_test.rs"]
mod tests;
