//! Sync manager — connection lifecycle, offline queue, optimistic updates.
//!
//! DESIGN
//! ======
//! One manager owns one push channel. Its lifecycle is a strict state
//! machine over `disconnected → connecting → connected → reconnecting`,
//! driven by the channel task and fed (never bypassed) by side signals:
//! network online/offline, page visibility, and a periodic liveness check
//! on the inbound stream.
//!
//! Timers are `tokio` tasks held in `Option` slots — one per role, always
//! aborted before a replacement is spawned, all cancelled by
//! `disconnect()`. Call `disconnect()` before dropping the manager;
//! otherwise its background tasks keep their handle alive.
//!
//! ERROR HANDLING
//! ==============
//! Channel failures surface only as `CONNECTION_ERROR` reducer actions and
//! scheduled reconnects, never as panics or returned errors. A malformed
//! inbound frame is logged and skipped; the channel keeps going. A failed
//! offline-queue drain restores the queue intact for the next attempt.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use events::{EventPayload, GameMove, GameSnapshot, Notification, OwnerKey, SyncEvent};

use crate::backoff::{DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY, reconnect_delay};
use crate::reducer::{Action, ClientState, reduce};
use crate::transport::{SyncTransport, TransportError};

// =============================================================================
// CONFIG & STATE TYPES
// =============================================================================

#[derive(Clone, Copy, Debug)]
pub struct SyncConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Reconnect attempts after a drop before giving up until
    /// [`SyncManager::force_reconnect`].
    pub max_attempts: u32,
    /// How often the liveness check inspects the inbound stream.
    pub liveness_interval: Duration,
    /// Inbound silence past this long counts as a dead channel.
    pub stale_after: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_attempts: 10,
            liveness_interval: Duration::from_secs(10),
            stale_after: Duration::from_secs(60),
        }
    }
}

/// Connection lifecycle phase.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionPhase {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Observable connection state.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionState {
    pub phase: ConnectionPhase,
    /// Milliseconds since epoch of the last successful open.
    pub last_connected: Option<i64>,
    pub reconnect_attempts: u32,
    pub error: Option<String>,
}

/// Server-confirmed state captured when an optimistic mutation is applied.
/// Rollback swaps this value back in; nothing is diffed or mutated.
#[derive(Clone, Debug, PartialEq)]
pub enum OptimisticOriginal {
    Notification(Notification),
    Game(GameSnapshot),
}

struct OptimisticUpdate {
    original: OptimisticOriginal,
    applied_at: Instant,
}

// =============================================================================
// MANAGER
// =============================================================================

struct ManagerState {
    phase: ConnectionPhase,
    last_connected: Option<i64>,
    reconnect_attempts: u32,
    error: Option<String>,
    /// Set by `disconnect()`; suppresses every automatic reconnect path.
    manually_disconnected: bool,
    online: bool,
    visible: bool,
    last_event_at: Option<Instant>,
    /// Bumped on every new attempt and on disconnect; callbacks carrying a
    /// stale epoch are ignored, so aborted tasks cannot race live ones.
    epoch: u64,
    offline_queue: VecDeque<GameMove>,
    optimistic: HashMap<Uuid, OptimisticUpdate>,
    client_state: ClientState,
    channel_task: Option<JoinHandle<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
    liveness_timer: Option<JoinHandle<()>>,
}

fn cancel_timers(st: &mut ManagerState) {
    for handle in [
        st.channel_task.take(),
        st.reconnect_timer.take(),
        st.liveness_timer.take(),
    ]
    .into_iter()
    .flatten()
    {
        handle.abort();
    }
}

struct ManagerInner {
    owner: OwnerKey,
    tab_id: Uuid,
    config: SyncConfig,
    transport: Arc<dyn SyncTransport>,
    state: Mutex<ManagerState>,
    watch_tx: watch::Sender<ClientState>,
}

/// Client-side owner of one push channel. Cheap to clone; all clones share
/// one lifecycle.
#[derive(Clone)]
pub struct SyncManager {
    inner: Arc<ManagerInner>,
}

impl SyncManager {
    #[must_use]
    pub fn new(owner: OwnerKey, tab_id: Uuid, transport: Arc<dyn SyncTransport>, config: SyncConfig) -> Self {
        let (watch_tx, _) = watch::channel(ClientState::default());
        Self {
            inner: Arc::new(ManagerInner {
                owner,
                tab_id,
                config,
                transport,
                state: Mutex::new(ManagerState {
                    phase: ConnectionPhase::Disconnected,
                    last_connected: None,
                    reconnect_attempts: 0,
                    error: None,
                    manually_disconnected: false,
                    online: true,
                    visible: true,
                    last_event_at: None,
                    epoch: 0,
                    offline_queue: VecDeque::new(),
                    optimistic: HashMap::new(),
                    client_state: ClientState::default(),
                    channel_task: None,
                    reconnect_timer: None,
                    liveness_timer: None,
                }),
                watch_tx,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.inner.state.lock().expect("sync state mutex poisoned")
    }

    // =========================================================================
    // OBSERVATION
    // =========================================================================

    /// Watch the reduced UI state. The receiver sees every change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ClientState> {
        self.inner.watch_tx.subscribe()
    }

    #[must_use]
    pub fn client_state(&self) -> ClientState {
        self.lock().client_state.clone()
    }

    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        let st = self.lock();
        ConnectionState {
            phase: st.phase,
            last_connected: st.last_connected,
            reconnect_attempts: st.reconnect_attempts,
            error: st.error.clone(),
        }
    }

    #[must_use]
    pub fn offline_move_count(&self) -> usize {
        self.lock().offline_queue.len()
    }

    #[must_use]
    pub fn optimistic_count(&self) -> usize {
        self.lock().optimistic.len()
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Open the push channel. No-op while already connecting or connected.
    /// Must be called from within a Tokio runtime.
    pub fn connect(&self) {
        let mut st = self.lock();
        st.manually_disconnected = false;
        if matches!(st.phase, ConnectionPhase::Connecting | ConnectionPhase::Connected) {
            return;
        }
        self.start_attempt_locked(&mut st);
    }

    /// Tear everything down: channel task, reconnect timer, liveness timer.
    /// Idempotent. Automatic reconnection stays suppressed until
    /// [`connect`](Self::connect) or [`force_reconnect`](Self::force_reconnect).
    pub fn disconnect(&self) {
        let mut st = self.lock();
        st.manually_disconnected = true;
        cancel_timers(&mut st);
        st.epoch += 1;
        st.phase = ConnectionPhase::Disconnected;
        st.error = None;
        st.reconnect_attempts = 0;
        info!("sync manager disconnected");
    }

    /// Restart after a terminal error: clears the attempt budget and opens
    /// a fresh channel immediately.
    pub fn force_reconnect(&self) {
        let mut st = self.lock();
        st.manually_disconnected = false;
        st.reconnect_attempts = 0;
        st.error = None;
        self.start_attempt_locked(&mut st);
    }

    fn start_attempt_locked(&self, st: &mut ManagerState) {
        cancel_timers(st);
        st.phase = ConnectionPhase::Connecting;
        st.epoch += 1;
        let epoch = st.epoch;
        let mgr = self.clone();
        debug!(attempt = st.reconnect_attempts, "opening push channel");
        st.channel_task = Some(tokio::spawn(async move { mgr.run_channel(epoch).await }));
    }

    // =========================================================================
    // SIDE SIGNALS
    // =========================================================================

    /// Browser-style network signal. Regaining the network reconnects a
    /// dropped channel unless a reconnect timer is already pending, the
    /// manager was manually disconnected, or the attempt budget ran out.
    pub fn set_online(&self, online: bool) {
        let mut st = self.lock();
        let was_online = st.online;
        st.online = online;
        if online && !was_online {
            self.maybe_resume_locked(&mut st);
        }
    }

    /// Page-visibility signal; a tab returning to the foreground retries a
    /// dropped channel under the same conditions as [`set_online`](Self::set_online).
    pub fn set_visible(&self, visible: bool) {
        let mut st = self.lock();
        let was_visible = st.visible;
        st.visible = visible;
        if visible && !was_visible {
            self.maybe_resume_locked(&mut st);
        }
    }

    fn maybe_resume_locked(&self, st: &mut ManagerState) {
        if st.manually_disconnected || !st.online {
            return;
        }
        // Never stack attempts on top of a pending timer.
        if st.reconnect_timer.is_some() {
            return;
        }
        if !matches!(st.phase, ConnectionPhase::Disconnected | ConnectionPhase::Reconnecting) {
            return;
        }
        if st.reconnect_attempts >= self.inner.config.max_attempts {
            return;
        }
        self.start_attempt_locked(st);
    }

    // =========================================================================
    // CHANNEL TASK
    // =========================================================================

    async fn run_channel(self, epoch: u64) {
        let owner = self.inner.owner.clone();
        let tab_id = self.inner.tab_id;

        let mut stream = match self.inner.transport.open_channel(&owner, tab_id).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "push channel open failed");
                self.handle_channel_failure(epoch, e.to_string());
                return;
            }
        };

        if !self.handle_channel_opened(epoch) {
            return;
        }

        if let Err(e) = self.inner.transport.register_tab(&owner, tab_id).await {
            debug!(error = %e, "tab registration failed; continuing");
        }
        match self.process_offline_queue().await {
            Ok(0) => {}
            Ok(count) => info!(count, "offline queue drained"),
            Err(e) => warn!(error = %e, "offline queue sync failed; queue kept for next connection"),
        }

        while let Some(item) = stream.next().await {
            match item {
                Ok(text) => match events::decode_event(&text) {
                    Ok(event) => {
                        if !self.handle_event(epoch, event) {
                            return;
                        }
                    }
                    Err(e) => warn!(error = %e, "skipping malformed frame"),
                },
                Err(e) => {
                    self.handle_channel_failure(epoch, e.to_string());
                    return;
                }
            }
        }
        self.handle_channel_failure(epoch, "channel closed".to_owned());
    }

    /// Returns `false` when this channel attempt has been superseded.
    fn handle_channel_opened(&self, epoch: u64) -> bool {
        let mut st = self.lock();
        if st.epoch != epoch || st.manually_disconnected {
            return false;
        }
        st.phase = ConnectionPhase::Connected;
        st.reconnect_attempts = 0;
        st.last_connected = Some(events::now_ms());
        st.error = None;
        st.last_event_at = Some(Instant::now());
        self.start_liveness_locked(&mut st, epoch);
        self.dispatch_locked(&mut st, Action::ConnectionOpened);
        info!(owner = %self.inner.owner, "push channel connected");
        true
    }

    fn handle_channel_failure(&self, epoch: u64, message: String) {
        let mut st = self.lock();
        if st.epoch != epoch {
            return;
        }
        if let Some(timer) = st.liveness_timer.take() {
            timer.abort();
        }
        st.channel_task = None;

        if st.manually_disconnected {
            st.phase = ConnectionPhase::Disconnected;
            return;
        }

        if !st.online {
            // Wait for the network signal rather than burning attempts.
            st.phase = ConnectionPhase::Disconnected;
            st.error = Some(message.clone());
            let attempts = st.reconnect_attempts;
            self.dispatch_locked(&mut st, Action::ConnectionError { message, attempts });
            return;
        }

        st.phase = ConnectionPhase::Reconnecting;
        st.error = Some(message.clone());
        let attempts = st.reconnect_attempts;
        self.dispatch_locked(&mut st, Action::ConnectionError { message, attempts });
        self.schedule_reconnect_locked(&mut st);
    }

    fn schedule_reconnect_locked(&self, st: &mut ManagerState) {
        if st.reconnect_timer.is_some() {
            return;
        }
        if st.reconnect_attempts >= self.inner.config.max_attempts {
            let message = format!("giving up after {} reconnect attempts", st.reconnect_attempts);
            warn!(attempts = st.reconnect_attempts, "reconnect budget exhausted");
            st.phase = ConnectionPhase::Disconnected;
            st.error = Some(message.clone());
            let attempts = st.reconnect_attempts;
            self.dispatch_locked(st, Action::ConnectionError { message, attempts });
            return;
        }

        let attempt = st.reconnect_attempts;
        st.reconnect_attempts += 1;
        let delay = reconnect_delay(attempt, self.inner.config.base_delay, self.inner.config.max_delay);
        debug!(attempt, ?delay, "reconnect scheduled");
        let mgr = self.clone();
        st.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            mgr.reconnect_timer_fired();
        }));
    }

    fn reconnect_timer_fired(&self) {
        let mut st = self.lock();
        st.reconnect_timer = None;
        if st.manually_disconnected || !st.online {
            return;
        }
        if st.phase != ConnectionPhase::Reconnecting {
            return;
        }
        self.start_attempt_locked(&mut st);
    }

    // =========================================================================
    // LIVENESS
    // =========================================================================

    fn start_liveness_locked(&self, st: &mut ManagerState, epoch: u64) {
        if let Some(timer) = st.liveness_timer.take() {
            timer.abort();
        }
        let interval = self.inner.config.liveness_interval;
        let mgr = self.clone();
        st.liveness_timer = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if !mgr.liveness_check(epoch) {
                    return;
                }
            }
        }));
    }

    /// Returns `false` when the liveness timer should stop.
    fn liveness_check(&self, epoch: u64) -> bool {
        let mut st = self.lock();
        if st.epoch != epoch || st.phase != ConnectionPhase::Connected {
            return false;
        }
        let stale = st
            .last_event_at
            .is_none_or(|at| at.elapsed() > self.inner.config.stale_after);
        if !stale {
            return true;
        }

        warn!("push channel stale; forcing reconnect");
        if let Some(task) = st.channel_task.take() {
            task.abort();
        }
        st.liveness_timer = None;
        st.phase = ConnectionPhase::Reconnecting;
        let message = "push channel stale".to_owned();
        st.error = Some(message.clone());
        let attempts = st.reconnect_attempts;
        self.dispatch_locked(&mut st, Action::ConnectionError { message, attempts });
        self.schedule_reconnect_locked(&mut st);
        false
    }

    // =========================================================================
    // INBOUND EVENTS
    // =========================================================================

    /// Returns `false` when the channel task should exit.
    fn handle_event(&self, epoch: u64, event: SyncEvent) -> bool {
        let mut st = self.lock();
        if st.epoch != epoch {
            return false;
        }
        st.last_event_at = Some(Instant::now());

        let mut keep_channel = true;
        match &event.payload {
            EventPayload::Heartbeat => {
                // Ack over the control path so the server refreshes its side.
                let mgr = self.clone();
                tokio::spawn(async move {
                    let result = mgr
                        .inner
                        .transport
                        .heartbeat_ack(&mgr.inner.owner, mgr.inner.tab_id)
                        .await;
                    if let Err(e) = result {
                        debug!(error = %e, "heartbeat ack failed");
                    }
                });
            }
            EventPayload::Superseded => {
                // A newer tab owns this stream now; retrying would only
                // steal it back and forth.
                info!("superseded by another tab; reconnection suppressed");
                st.manually_disconnected = true;
                cancel_timers(&mut st);
                st.phase = ConnectionPhase::Disconnected;
                st.error = Some("superseded by another tab".to_owned());
                keep_channel = false;
            }
            EventPayload::NotificationRead { sync_id: Some(sync_id), .. }
            | EventPayload::MoveApplied { sync_id: Some(sync_id), .. } => {
                if st.optimistic.remove(sync_id).is_some() {
                    debug!(%sync_id, "optimistic update confirmed");
                }
            }
            _ => {}
        }

        self.dispatch_locked(&mut st, Action::Event(event.payload));
        keep_channel
    }

    // =========================================================================
    // OFFLINE QUEUE
    // =========================================================================

    /// Queue a move while the channel is down. Drained automatically on the
    /// next successful connection.
    pub fn queue_offline_move(&self, game_move: GameMove) {
        let mut st = self.lock();
        st.offline_queue.push_back(game_move);
        debug!(queued = st.offline_queue.len(), "offline move queued");
    }

    /// Send the entire queue as one ordered batch. On failure the batch
    /// returns to the head of the queue, ahead of anything queued while the
    /// call was in flight, so submission order survives end-to-end.
    ///
    /// # Errors
    ///
    /// Propagates the transport error after restoring the queue.
    pub async fn process_offline_queue(&self) -> Result<usize, TransportError> {
        let batch: Vec<GameMove> = {
            let mut st = self.lock();
            if st.offline_queue.is_empty() {
                return Ok(0);
            }
            st.offline_queue.drain(..).collect()
        };

        match self
            .inner
            .transport
            .sync_moves(&self.inner.owner, self.inner.tab_id, &batch)
            .await
        {
            Ok(()) => Ok(batch.len()),
            Err(e) => {
                let mut st = self.lock();
                let interim = std::mem::take(&mut st.offline_queue);
                st.offline_queue = batch.into_iter().collect();
                st.offline_queue.extend(interim);
                Err(e)
            }
        }
    }

    // =========================================================================
    // OPTIMISTIC UPDATES
    // =========================================================================

    /// Record the server-confirmed original behind an optimistic mutation.
    /// Returns the correlation id to attach to the outgoing call.
    pub fn add_optimistic_update(&self, original: OptimisticOriginal) -> Uuid {
        let id = Uuid::new_v4();
        self.lock()
            .optimistic
            .insert(id, OptimisticUpdate { original, applied_at: Instant::now() });
        id
    }

    /// Discard a pending optimistic update, returning the stored original
    /// so a failed mutation can feed the reducer's rollback action.
    pub fn remove_optimistic_update(&self, id: Uuid) -> Option<OptimisticOriginal> {
        self.lock().optimistic.remove(&id).map(|update| update.original)
    }

    /// Age of the oldest unconfirmed optimistic update, if any.
    #[must_use]
    pub fn oldest_optimistic_age(&self) -> Option<Duration> {
        let st = self.lock();
        st.optimistic
            .values()
            .map(|update| update.applied_at.elapsed())
            .max()
    }

    // =========================================================================
    // REDUCER DISPATCH
    // =========================================================================

    /// Apply a local reducer action (optimistic mark-read, rollback).
    pub fn dispatch(&self, action: Action) {
        let mut st = self.lock();
        self.dispatch_locked(&mut st, action);
    }

    fn dispatch_locked(&self, st: &mut ManagerState, action: Action) {
        let previous = std::mem::take(&mut st.client_state);
        st.client_state = reduce(previous, action);
        let _ = self.inner.watch_tx.send_replace(st.client_state.clone());
    }

    // =========================================================================
    // TEST HOOKS
    // =========================================================================

    #[cfg(test)]
    fn pending_reconnect(&self) -> bool {
        self.lock().reconnect_timer.is_some()
    }

    #[cfg(test)]
    fn timers_idle(&self) -> bool {
        let st = self.lock();
        st.channel_task.is_none() && st.reconnect_timer.is_none() && st.liveness_timer.is_none()
    }
}

#[cfg(test)]
#[path = "sync_test.rs"]
mod tests;
