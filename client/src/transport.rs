//! Transport seam — the push channel plus the HTTP control calls.
//!
//! DESIGN
//! ======
//! The sync manager never touches sockets directly; it drives a
//! [`SyncTransport`]. The production [`HttpTransport`] speaks to a live
//! server (websocket push channel, JSON control calls); tests substitute
//! scripted implementations.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use uuid::Uuid;

use events::{GameMove, OwnerKey, TabStatus, USER_HEADER};

/// Raw text frames from the push channel, one JSON event per item. The
/// consumer decodes each frame and skips malformed ones individually.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// An HTTP control call failed at the request layer.
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The websocket connection or handshake failed.
    #[error("websocket error: {0}")]
    Ws(#[from] Box<tokio_tungstenite::tungstenite::Error>),
    /// A control call returned a non-success status.
    #[error("server returned status {0}")]
    Status(u16),
    /// The configured base URL cannot be mapped to a websocket endpoint.
    #[error("invalid endpoint url: {0}")]
    InvalidUrl(String),
    /// A header value could not be constructed.
    #[error("invalid header value: {0}")]
    InvalidHeader(#[from] tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue),
    /// The channel or peer is gone.
    #[error("channel closed")]
    Closed,
}

/// Everything the sync manager needs from the outside world.
#[async_trait]
pub trait SyncTransport: Send + Sync + 'static {
    /// Open the push channel for one owner key and tab.
    async fn open_channel(&self, owner: &OwnerKey, tab_id: Uuid) -> Result<EventStream, TransportError>;

    /// Announce a tab; returns the owner session's current status.
    async fn register_tab(&self, owner: &OwnerKey, tab_id: Uuid) -> Result<TabStatus, TransportError>;

    /// Liveness ack, refreshing the server-side `last_seen`.
    async fn heartbeat_ack(&self, owner: &OwnerKey, tab_id: Uuid) -> Result<(), TransportError>;

    /// Assert foreground focus for this tab.
    async fn set_active_tab(&self, owner: &OwnerKey, tab_id: Uuid) -> Result<(), TransportError>;

    /// Send the offline queue as one ordered batch.
    async fn sync_moves(&self, owner: &OwnerKey, tab_id: Uuid, moves: &[GameMove]) -> Result<(), TransportError>;
}

// =============================================================================
// HTTP TRANSPORT
// =============================================================================

/// Production transport: `tokio-tungstenite` for the push channel and
/// `reqwest` for the control calls, both stamped with the identity header
/// the upstream gateway expects.
pub struct HttpTransport {
    base_url: String,
    user_id: Uuid,
    http: reqwest::Client,
}

impl HttpTransport {
    #[must_use]
    pub fn new(base_url: impl Into<String>, user_id: Uuid) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            user_id,
            http: reqwest::Client::new(),
        }
    }

    fn ws_url(&self, owner: &OwnerKey, tab_id: Uuid) -> Result<String, TransportError> {
        let ws_base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            return Err(TransportError::InvalidUrl(self.base_url.clone()));
        };
        Ok(format!("{ws_base}/api/sync/ws?owner={owner}&tab={tab_id}"))
    }

    async fn post_control(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, TransportError> {
        let response = self
            .http
            .post(format!("{}{path}", self.base_url))
            .header(USER_HEADER, self.user_id.to_string())
            .json(body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(TransportError::Status(response.status().as_u16()));
        }
        Ok(response)
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn open_channel(&self, owner: &OwnerKey, tab_id: Uuid) -> Result<EventStream, TransportError> {
        let mut request = self
            .ws_url(owner, tab_id)?
            .into_client_request()
            .map_err(|e| TransportError::Ws(Box::new(e)))?;
        request
            .headers_mut()
            .insert(USER_HEADER, self.user_id.to_string().parse()?);

        let (ws, _) = connect_async(request)
            .await
            .map_err(|e| TransportError::Ws(Box::new(e)))?;

        let stream = futures_util::stream::unfold(ws, |mut ws| async move {
            loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => return Some((Ok(text.to_string()), ws)),
                    // Ping/pong/binary frames carry nothing for us.
                    Some(Ok(Message::Close(_))) | None => return None,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Some((Err(TransportError::Ws(Box::new(e))), ws)),
                }
            }
        });
        Ok(Box::pin(stream))
    }

    async fn register_tab(&self, owner: &OwnerKey, tab_id: Uuid) -> Result<TabStatus, TransportError> {
        let body = serde_json::json!({ "owner": owner.to_string(), "tab_id": tab_id });
        let response = self.post_control("/api/sync/register", &body).await?;
        Ok(response.json::<TabStatus>().await?)
    }

    async fn heartbeat_ack(&self, owner: &OwnerKey, tab_id: Uuid) -> Result<(), TransportError> {
        let body = serde_json::json!({ "owner": owner.to_string(), "tab_id": tab_id });
        self.post_control("/api/sync/heartbeat", &body).await?;
        Ok(())
    }

    async fn set_active_tab(&self, owner: &OwnerKey, tab_id: Uuid) -> Result<(), TransportError> {
        let body = serde_json::json!({ "owner": owner.to_string(), "tab_id": tab_id });
        self.post_control("/api/sync/active-tab", &body).await?;
        Ok(())
    }

    async fn sync_moves(&self, owner: &OwnerKey, tab_id: Uuid, moves: &[GameMove]) -> Result<(), TransportError> {
        let body = serde_json::json!({
            "owner": owner.to_string(),
            "tab_id": tab_id,
            "moves": moves,
        });
        self.post_control("/api/sync/moves", &body).await?;
        Ok(())
    }
}
