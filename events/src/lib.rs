//! Shared sync-event model for realtime push transport.
//!
//! This crate owns the wire representation used by both `server` and
//! `client`: the [`SyncEvent`] envelope, the [`OwnerKey`] partitioning
//! identifier, and the closed [`EventPayload`] union. Every frame on the
//! push channel is one UTF-8 JSON-encoded `SyncEvent`.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Header carrying the authenticated user id, injected by the upstream
/// auth gateway on every HTTP request and WS upgrade.
pub const USER_HEADER: &str = "x-sync-user";

/// Error returned by [`decode_event`].
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The frame text could not be decoded as a JSON `SyncEvent`.
    #[error("failed to decode event frame: {0}")]
    Decode(#[from] serde_json::Error),
}

// =============================================================================
// OWNER KEY
// =============================================================================

/// Identifier partitioning all registry and session state.
///
/// A `User` key aggregates one person's notification/message stream and is
/// admitted in exclusive mode (at most one live tab). A `Game` key
/// aggregates every tab watching one game and is admitted in shared mode.
/// On the wire both render as opaque strings: `user:<uuid>` / `game:<uuid>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum OwnerKey {
    User(Uuid),
    Game(Uuid),
}

impl OwnerKey {
    #[must_use]
    pub fn user(id: Uuid) -> Self {
        Self::User(id)
    }

    #[must_use]
    pub fn game(id: Uuid) -> Self {
        Self::Game(id)
    }

    /// Exclusive-mode keys allow at most one live connection.
    #[must_use]
    pub fn is_exclusive(&self) -> bool {
        matches!(self, Self::User(_))
    }
}

impl fmt::Display for OwnerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{id}"),
            Self::Game(id) => write!(f, "game:{id}"),
        }
    }
}

/// Error returned when parsing an [`OwnerKey`] from its wire form.
#[derive(Debug, thiserror::Error)]
#[error("invalid owner key: {0:?}")]
pub struct OwnerKeyError(String);

impl FromStr for OwnerKey {
    type Err = OwnerKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((namespace, raw_id)) = s.split_once(':') else {
            return Err(OwnerKeyError(s.to_owned()));
        };
        let Ok(id) = raw_id.parse::<Uuid>() else {
            return Err(OwnerKeyError(s.to_owned()));
        };
        match namespace {
            "user" => Ok(Self::User(id)),
            "game" => Ok(Self::Game(id)),
            _ => Err(OwnerKeyError(s.to_owned())),
        }
    }
}

impl From<OwnerKey> for String {
    fn from(key: OwnerKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for OwnerKey {
    type Error = OwnerKeyError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

// =============================================================================
// FEATURE DATA
// =============================================================================

/// A user-facing notification (friend request, message alert, game invite).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    /// Feature discriminator, e.g. `"friend_request"` or `"game_invite"`.
    pub kind: String,
    pub title: String,
    pub message: String,
    pub read: bool,
    /// Milliseconds since Unix epoch.
    pub created_at: i64,
}

/// One chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub sender_id: Uuid,
    pub body: String,
    /// Milliseconds since Unix epoch.
    pub sent_at: i64,
}

/// A single checkers move. Squares are 0-31 board indices; legality is the
/// rules engine's concern, not this crate's.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameMove {
    pub id: Uuid,
    pub game_id: Uuid,
    pub from: u8,
    pub to: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captured: Option<u8>,
}

/// Authoritative whole-board snapshot. Cells are opaque to the sync core;
/// the reducer replaces snapshots wholesale (last-write-wins).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameSnapshot {
    pub game_id: Uuid,
    pub board: Vec<String>,
    /// Side to move, e.g. `"red"` / `"black"`.
    pub turn: String,
    pub version: u64,
}

/// Active-tab status for a shared-mode owner session. Returned by the
/// register-tab control call and carried by `TAB_STATUS_UPDATE` envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabStatus {
    pub active_tab_id: Option<Uuid>,
    pub total_tabs: usize,
}

// =============================================================================
// PAYLOAD UNION
// =============================================================================

/// Closed union of everything the server pushes. Adjacently tagged on the
/// wire as `{"type": ..., "payload": ...}`; consumers match exhaustively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventPayload {
    /// Welcome frame sent once per connection, immediately after upgrade.
    Connected { tab_id: Uuid },
    /// Zero-payload liveness probe.
    Heartbeat,
    /// Terminal frame sent to a tab evicted by exclusive-mode admission.
    Superseded,
    /// Shared-mode membership update, broadcast after every admission.
    TabStatusUpdate(TabStatus),
    /// A new tab was promoted after the active tab disconnected.
    ActiveTabChanged { active_tab_id: Uuid },
    NotificationReceived(Notification),
    NotificationRead {
        notification_id: Uuid,
        /// Correlation id clearing a pending optimistic update.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sync_id: Option<Uuid>,
    },
    MessageReceived(ChatMessage),
    TypingStart { chat_id: Uuid, user_id: Uuid },
    TypingStop { chat_id: Uuid, user_id: Uuid },
    MoveApplied {
        game_id: Uuid,
        game_move: GameMove,
        /// Correlation id clearing a pending optimistic update.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sync_id: Option<Uuid>,
    },
    GameState(GameSnapshot),
}

impl EventPayload {
    /// Wire tag of this payload, for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "CONNECTED",
            Self::Heartbeat => "HEARTBEAT",
            Self::Superseded => "SUPERSEDED",
            Self::TabStatusUpdate(_) => "TAB_STATUS_UPDATE",
            Self::ActiveTabChanged { .. } => "ACTIVE_TAB_CHANGED",
            Self::NotificationReceived(_) => "NOTIFICATION_RECEIVED",
            Self::NotificationRead { .. } => "NOTIFICATION_READ",
            Self::MessageReceived(_) => "MESSAGE_RECEIVED",
            Self::TypingStart { .. } => "TYPING_START",
            Self::TypingStop { .. } => "TYPING_STOP",
            Self::MoveApplied { .. } => "MOVE_APPLIED",
            Self::GameState(_) => "GAME_STATE",
        }
    }
}

// =============================================================================
// ENVELOPE
// =============================================================================

/// Current time as milliseconds since Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

/// The immutable wire unit: one event, one frame.
///
/// Ordering is per-owner FIFO as delivered by the registry; no global
/// order exists across owner keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    pub id: Uuid,
    pub owner_key: OwnerKey,
    /// Milliseconds since Unix epoch. Set at construction.
    pub ts: i64,
    /// Tab that caused the event, when one did (e.g. typing indicators).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_tab_id: Option<Uuid>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl SyncEvent {
    /// Create an envelope stamped with a fresh id and the current time.
    #[must_use]
    pub fn new(owner_key: OwnerKey, payload: EventPayload) -> Self {
        Self { id: Uuid::new_v4(), owner_key, ts: now_ms(), origin_tab_id: None, payload }
    }

    #[must_use]
    pub fn with_origin(mut self, tab_id: Uuid) -> Self {
        self.origin_tab_id = Some(tab_id);
        self
    }
}

// =============================================================================
// CODEC
// =============================================================================

/// Encode an event as one UTF-8 JSON text frame.
#[must_use]
pub fn encode_event(event: &SyncEvent) -> String {
    // Serialization of the closed union cannot fail; every variant is a map.
    serde_json::to_string(event).unwrap_or_default()
}

/// Decode one text frame.
///
/// # Errors
///
/// Returns [`CodecError::Decode`] if the text is not a valid `SyncEvent`,
/// including frames carrying an unknown `type` tag.
pub fn decode_event(text: &str) -> Result<SyncEvent, CodecError> {
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
