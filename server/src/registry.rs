//! Connection registry — per-owner admission, fan-out, and eviction.
//!
//! DESIGN
//! ======
//! Registry state is an outer `RwLock` map of per-key `Mutex`es, so every
//! mutation of one owner's tabs is serialized while unrelated owner keys
//! proceed concurrently. Admission transfers sink ownership to the
//! registry: only the registry drops a connection's sender, which closes
//! the push channel on the other side.
//!
//! Admission policy follows the owner-key namespace. `user:` keys are
//! exclusive — a new tab supersedes and closes every prior one, so one
//! person never has two live personal streams toasting in parallel.
//! `game:` keys are shared — spectating tabs coexist, one of them marked
//! active.
//!
//! ERROR HANDLING
//! ==============
//! A failed sink write (closed, or a queue the client stopped draining)
//! evicts that one connection and never blocks delivery to siblings.

use std::collections::HashMap;
use std::sync::Arc;

use events::{EventPayload, OwnerKey, SyncEvent, TabStatus};
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RegistryConfig;

// =============================================================================
// CONNECTION
// =============================================================================

/// One live push channel to a specific client tab.
pub(crate) struct Connection {
    pub(crate) tab_id: Uuid,
    /// Admission order within the session. Promotion picks the lowest.
    pub(crate) seq: u64,
    pub(crate) last_seen: Instant,
    pub(crate) sink: mpsc::Sender<SyncEvent>,
}

// =============================================================================
// OWNER SESSION
// =============================================================================

/// All live tabs for one owner key.
///
/// Invariant: `active_tab_id` is `None` iff `tabs` is empty; otherwise it
/// keys an entry in `tabs`.
#[derive(Default)]
pub(crate) struct OwnerSession {
    pub(crate) tabs: HashMap<Uuid, Connection>,
    pub(crate) active_tab_id: Option<Uuid>,
    next_seq: u64,
}

impl OwnerSession {
    fn admit(&mut self, tab_id: Uuid, sink: mpsc::Sender<SyncEvent>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.tabs
            .insert(tab_id, Connection { tab_id, seq, last_seen: Instant::now(), sink });
        if self.active_tab_id.is_none() {
            self.active_tab_id = Some(tab_id);
        }
    }

    /// Oldest member by admission order.
    fn oldest_tab(&self) -> Option<Uuid> {
        self.tabs.values().min_by_key(|c| c.seq).map(|c| c.tab_id)
    }

    fn status(&self) -> TabStatus {
        TabStatus { active_tab_id: self.active_tab_id, total_tabs: self.tabs.len() }
    }
}

/// Write an event to every tab in a session. A successful write refreshes
/// the connection's `last_seen`; failed tabs are returned for eviction.
fn deliver_all(session: &mut OwnerSession, event: &SyncEvent) -> Vec<Uuid> {
    let mut failed = Vec::new();
    for conn in session.tabs.values_mut() {
        if conn.sink.try_send(event.clone()).is_ok() {
            conn.last_seen = Instant::now();
        } else {
            failed.push(conn.tab_id);
        }
    }
    failed
}

/// Remove one tab. When the active tab leaves and others remain, the
/// oldest remaining tab is promoted and `ACTIVE_TAB_CHANGED` is broadcast.
/// Returns `true` when the tab was a member.
fn remove_and_promote(owner_key: &OwnerKey, session: &mut OwnerSession, tab_id: Uuid) -> bool {
    if session.tabs.remove(&tab_id).is_none() {
        return false;
    }
    if session.active_tab_id == Some(tab_id) {
        session.active_tab_id = session.oldest_tab();
        if let Some(next) = session.active_tab_id {
            info!(%owner_key, active_tab = %next, "active tab promoted");
            let event = SyncEvent::new(
                owner_key.clone(),
                EventPayload::ActiveTabChanged { active_tab_id: next },
            );
            for stale in deliver_all(session, &event) {
                warn!(%owner_key, tab = %stale, "sink write failed during promotion; evicting");
                remove_and_promote(owner_key, session, stale);
            }
        }
    }
    true
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Read-only view of one owner session, for control calls and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub active_tab_id: Option<Uuid>,
    /// Tab ids in admission order.
    pub tab_ids: Vec<Uuid>,
}

struct RegistryInner {
    config: RegistryConfig,
    sessions: RwLock<HashMap<OwnerKey, Arc<Mutex<OwnerSession>>>>,
    upkeep: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// The connection broker. Cheap to clone; construct one per process (or
/// per test) and pass it into handlers — there is no global instance.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    #[must_use]
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                sessions: RwLock::new(HashMap::new()),
                upkeep: std::sync::Mutex::new(Vec::new()),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> RegistryConfig {
        self.inner.config
    }

    /// Start the background heartbeat and reaper tasks. A second call while
    /// they are running is a no-op.
    pub fn spawn_upkeep(&self) {
        let mut upkeep = self.inner.upkeep.lock().expect("upkeep mutex poisoned");
        if !upkeep.is_empty() {
            return;
        }
        upkeep.extend(crate::upkeep::spawn_upkeep_tasks(self.clone()));
    }

    /// Abort the registry's own timers. Idempotent.
    pub fn shutdown(&self) {
        let mut upkeep = self.inner.upkeep.lock().expect("upkeep mutex poisoned");
        for handle in upkeep.drain(..) {
            handle.abort();
        }
    }

    async fn session_handle(&self, owner_key: &OwnerKey) -> Option<Arc<Mutex<OwnerSession>>> {
        self.inner.sessions.read().await.get(owner_key).cloned()
    }

    /// Drop the session entry once its last tab is gone. Membership is
    /// re-checked under the map lock: a tab may have been admitted between
    /// releasing the session and acquiring the map.
    async fn drop_session_if_empty(&self, owner_key: &OwnerKey) {
        let mut sessions = self.inner.sessions.write().await;
        let Some(handle) = sessions.get(owner_key) else {
            return;
        };
        if handle.lock().await.tabs.is_empty() {
            sessions.remove(owner_key);
            debug!(%owner_key, "owner session dropped");
        }
    }

    /// Admit a connection, taking ownership of its sink.
    ///
    /// Exclusive keys supersede: every prior tab receives a terminal
    /// `SUPERSEDED` envelope and its sink is closed before the new tab is
    /// inserted as sole active member. Shared keys append; the first tab
    /// becomes active, and `TAB_STATUS_UPDATE` is broadcast after every
    /// admission.
    pub async fn add_connection(&self, owner_key: &OwnerKey, tab_id: Uuid, sink: mpsc::Sender<SyncEvent>) {
        let mut sessions = self.inner.sessions.write().await;
        let handle = sessions.entry(owner_key.clone()).or_default().clone();
        let mut session = handle.lock().await;
        drop(sessions);

        if owner_key.is_exclusive() && !session.tabs.is_empty() {
            let superseded = SyncEvent::new(owner_key.clone(), EventPayload::Superseded);
            for (_, conn) in session.tabs.drain() {
                // Terminal envelope, then the sender drops and the channel closes.
                let _ = conn.sink.try_send(superseded.clone());
                info!(%owner_key, tab = %conn.tab_id, "superseded by newer connection");
            }
            session.active_tab_id = None;
        }

        session.admit(tab_id, sink);
        info!(%owner_key, tab = %tab_id, total = session.tabs.len(), "connection admitted");

        if !owner_key.is_exclusive() {
            let event = SyncEvent::new(owner_key.clone(), EventPayload::TabStatusUpdate(session.status()));
            for stale in deliver_all(&mut session, &event) {
                warn!(%owner_key, tab = %stale, "sink write failed; evicting connection");
                remove_and_promote(owner_key, &mut session, stale);
            }
        }
    }

    /// Remove a tab. Removing a non-member (or a tab of an unknown owner)
    /// is a no-op. The session is dropped when its last tab leaves.
    pub async fn remove_connection(&self, owner_key: &OwnerKey, tab_id: Uuid) {
        let Some(handle) = self.session_handle(owner_key).await else {
            return;
        };
        let mut session = handle.lock().await;
        if !remove_and_promote(owner_key, &mut session, tab_id) {
            return;
        }
        info!(%owner_key, tab = %tab_id, remaining = session.tabs.len(), "connection removed");
        let empty = session.tabs.is_empty();
        drop(session);
        if empty {
            self.drop_session_if_empty(owner_key).await;
        }
    }

    /// Remove a tab only while it still holds the given sink. Used by the
    /// socket task on teardown: a tab that reconnected under the same id
    /// has a fresh sink, and the stale task's cleanup must not evict it.
    pub async fn remove_connection_for_sink(
        &self,
        owner_key: &OwnerKey,
        tab_id: Uuid,
        sink: &mpsc::Sender<SyncEvent>,
    ) {
        let Some(handle) = self.session_handle(owner_key).await else {
            return;
        };
        let mut session = handle.lock().await;
        let Some(conn) = session.tabs.get(&tab_id) else {
            return;
        };
        if !conn.sink.same_channel(sink) {
            return;
        }
        remove_and_promote(owner_key, &mut session, tab_id);
        info!(%owner_key, tab = %tab_id, remaining = session.tabs.len(), "connection removed");
        let empty = session.tabs.is_empty();
        drop(session);
        if empty {
            self.drop_session_if_empty(owner_key).await;
        }
    }

    /// Explicit promotion, used when a client asserts foreground focus.
    /// Returns `false` when the tab is not a member.
    pub async fn set_active_tab(&self, owner_key: &OwnerKey, tab_id: Uuid) -> bool {
        let Some(handle) = self.session_handle(owner_key).await else {
            return false;
        };
        let mut session = handle.lock().await;
        if !session.tabs.contains_key(&tab_id) {
            return false;
        }
        session.active_tab_id = Some(tab_id);
        info!(%owner_key, active_tab = %tab_id, "active tab set");
        let event = SyncEvent::new(owner_key.clone(), EventPayload::TabStatusUpdate(session.status()));
        for stale in deliver_all(&mut session, &event) {
            warn!(%owner_key, tab = %stale, "sink write failed; evicting connection");
            remove_and_promote(owner_key, &mut session, stale);
        }
        let empty = session.tabs.is_empty();
        drop(session);
        if empty {
            self.drop_session_if_empty(owner_key).await;
        }
        true
    }

    /// Write an event to every tab of one owner. Failed sinks are evicted;
    /// siblings are unaffected.
    pub async fn broadcast(&self, owner_key: &OwnerKey, event: &SyncEvent) {
        let Some(handle) = self.session_handle(owner_key).await else {
            return;
        };
        let mut session = handle.lock().await;
        for stale in deliver_all(&mut session, event) {
            warn!(%owner_key, tab = %stale, "sink write failed; evicting connection");
            remove_and_promote(owner_key, &mut session, stale);
        }
        let empty = session.tabs.is_empty();
        drop(session);
        if empty {
            self.drop_session_if_empty(owner_key).await;
        }
    }

    /// Write an event to a single tab.
    pub async fn send_to(&self, owner_key: &OwnerKey, tab_id: Uuid, event: &SyncEvent) {
        let Some(handle) = self.session_handle(owner_key).await else {
            return;
        };
        let mut session = handle.lock().await;
        let Some(conn) = session.tabs.get_mut(&tab_id) else {
            return;
        };
        if conn.sink.try_send(event.clone()).is_ok() {
            conn.last_seen = Instant::now();
            return;
        }
        warn!(%owner_key, tab = %tab_id, "sink write failed; evicting connection");
        remove_and_promote(owner_key, &mut session, tab_id);
        let empty = session.tabs.is_empty();
        drop(session);
        if empty {
            self.drop_session_if_empty(owner_key).await;
        }
    }

    /// Refresh a connection's liveness. Called for heartbeat acks and for
    /// any inbound message, not only on the heartbeat timer.
    pub async fn update_heartbeat(&self, owner_key: &OwnerKey, tab_id: Uuid) {
        let Some(handle) = self.session_handle(owner_key).await else {
            return;
        };
        let mut session = handle.lock().await;
        if let Some(conn) = session.tabs.get_mut(&tab_id) {
            conn.last_seen = Instant::now();
        }
    }

    /// Fire-and-forget inbound interface for feature write paths: wrap a
    /// payload in a fresh envelope and fan it out. The registry never
    /// persists anything.
    pub async fn emit(&self, owner_key: &OwnerKey, payload: EventPayload) {
        let event = SyncEvent::new(owner_key.clone(), payload);
        debug!(%owner_key, kind = event.payload.kind(), "emit");
        self.broadcast(owner_key, &event).await;
    }

    /// Snapshot one owner session; `None` once the last tab is gone.
    pub async fn session(&self, owner_key: &OwnerKey) -> Option<SessionSnapshot> {
        let handle = self.session_handle(owner_key).await?;
        let session = handle.lock().await;
        let mut tabs: Vec<(u64, Uuid)> = session.tabs.values().map(|c| (c.seq, c.tab_id)).collect();
        tabs.sort_unstable();
        Some(SessionSnapshot {
            active_tab_id: session.active_tab_id,
            tab_ids: tabs.into_iter().map(|(_, id)| id).collect(),
        })
    }

    /// Active-tab status for the register control call. Unknown owners
    /// report an empty session rather than an error.
    pub async fn tab_status(&self, owner_key: &OwnerKey) -> TabStatus {
        match self.session_handle(owner_key).await {
            Some(handle) => handle.lock().await.status(),
            None => TabStatus { active_tab_id: None, total_tabs: 0 },
        }
    }

    // =========================================================================
    // UPKEEP SWEEPS
    // =========================================================================

    /// Broadcast a liveness probe to every connection across all sessions.
    /// Successful writes refresh `last_seen`; failures evict.
    pub async fn broadcast_heartbeat(&self) {
        let handles: Vec<(OwnerKey, Arc<Mutex<OwnerSession>>)> = self
            .inner
            .sessions
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        for (owner_key, handle) in handles {
            let event = SyncEvent::new(owner_key.clone(), EventPayload::Heartbeat);
            let mut session = handle.lock().await;
            for stale in deliver_all(&mut session, &event) {
                warn!(%owner_key, tab = %stale, "heartbeat write failed; evicting connection");
                remove_and_promote(&owner_key, &mut session, stale);
            }
            let empty = session.tabs.is_empty();
            drop(session);
            if empty {
                self.drop_session_if_empty(&owner_key).await;
            }
        }
    }

    /// Evict every connection not refreshed within the stale window.
    /// Returns the number of evictions.
    pub async fn reap_stale(&self) -> usize {
        let stale_after = self.inner.config.stale_after;
        let handles: Vec<(OwnerKey, Arc<Mutex<OwnerSession>>)> = self
            .inner
            .sessions
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut reaped = 0;
        for (owner_key, handle) in handles {
            let mut session = handle.lock().await;
            let now = Instant::now();
            let stale: Vec<Uuid> = session
                .tabs
                .values()
                .filter(|c| now.duration_since(c.last_seen) > stale_after)
                .map(|c| c.tab_id)
                .collect();
            for tab_id in stale {
                debug!(%owner_key, tab = %tab_id, "reaping stale connection");
                if remove_and_promote(&owner_key, &mut session, tab_id) {
                    reaped += 1;
                }
            }
            let empty = session.tabs.is_empty();
            drop(session);
            if empty {
                self.drop_session_if_empty(&owner_key).await;
            }
        }
        reaped
    }
}

#[cfg(test)]
#[path = "registry_test.rs"]
mod tests;
