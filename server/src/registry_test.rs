use super::*;
use tokio::time::{Duration, timeout};

fn test_registry() -> Registry {
    Registry::new(RegistryConfig::default())
}

fn sink() -> (mpsc::Sender<SyncEvent>, mpsc::Receiver<SyncEvent>) {
    mpsc::channel(8)
}

async fn recv_event(rx: &mut mpsc::Receiver<SyncEvent>) -> SyncEvent {
    timeout(Duration::from_millis(200), rx.recv())
        .await
        .expect("event receive timed out")
        .expect("event channel closed unexpectedly")
}

async fn assert_no_event(rx: &mut mpsc::Receiver<SyncEvent>) {
    assert!(
        timeout(Duration::from_millis(80), rx.recv()).await.is_err(),
        "expected no further event"
    );
}

async fn assert_closed(rx: &mut mpsc::Receiver<SyncEvent>) {
    let next = timeout(Duration::from_millis(200), rx.recv())
        .await
        .expect("channel close timed out");
    assert!(next.is_none(), "expected channel to be closed");
}

// =============================================================
// Exclusive mode
// =============================================================

#[tokio::test]
async fn exclusive_mode_holds_at_most_one_tab() {
    let registry = test_registry();
    let owner = OwnerKey::user(Uuid::new_v4());

    for _ in 0..3 {
        let (tx, _rx) = sink();
        registry.add_connection(&owner, Uuid::new_v4(), tx).await;
        let snapshot = registry.session(&owner).await.expect("session exists");
        assert!(snapshot.tab_ids.len() <= 1);
    }
}

#[tokio::test]
async fn exclusive_supersede_sends_one_terminal_envelope_then_closes() {
    let registry = test_registry();
    let owner = OwnerKey::user(Uuid::new_v4());
    let tab_a = Uuid::new_v4();
    let tab_b = Uuid::new_v4();

    let (tx_a, mut rx_a) = sink();
    registry.add_connection(&owner, tab_a, tx_a).await;

    let (tx_b, _rx_b) = sink();
    registry.add_connection(&owner, tab_b, tx_b).await;

    let event = recv_event(&mut rx_a).await;
    assert_eq!(event.payload, EventPayload::Superseded);
    assert_closed(&mut rx_a).await;

    let snapshot = registry.session(&owner).await.expect("session exists");
    assert_eq!(snapshot.tab_ids, vec![tab_b]);
    assert_eq!(snapshot.active_tab_id, Some(tab_b));
}

#[tokio::test]
async fn exclusive_admission_does_not_broadcast_tab_status() {
    let registry = test_registry();
    let owner = OwnerKey::user(Uuid::new_v4());

    let (tx, mut rx) = sink();
    registry.add_connection(&owner, Uuid::new_v4(), tx).await;
    assert_no_event(&mut rx).await;
}

// =============================================================
// Shared mode
// =============================================================

#[tokio::test]
async fn shared_admission_keeps_active_and_broadcasts_status() {
    let registry = test_registry();
    let owner = OwnerKey::game(Uuid::new_v4());
    let tab1 = Uuid::new_v4();
    let tab2 = Uuid::new_v4();

    let (tx1, mut rx1) = sink();
    registry.add_connection(&owner, tab1, tx1).await;
    let event = recv_event(&mut rx1).await;
    assert_eq!(
        event.payload,
        EventPayload::TabStatusUpdate(TabStatus { active_tab_id: Some(tab1), total_tabs: 1 })
    );

    let (tx2, mut rx2) = sink();
    registry.add_connection(&owner, tab2, tx2).await;
    let expected = EventPayload::TabStatusUpdate(TabStatus { active_tab_id: Some(tab1), total_tabs: 2 });
    assert_eq!(recv_event(&mut rx1).await.payload, expected);
    assert_eq!(recv_event(&mut rx2).await.payload, expected);

    let snapshot = registry.session(&owner).await.expect("session exists");
    assert_eq!(snapshot.active_tab_id, Some(tab1));
    assert_eq!(snapshot.tab_ids, vec![tab1, tab2]);
}

#[tokio::test]
async fn removing_active_tab_promotes_oldest_and_broadcasts_once() {
    let registry = test_registry();
    let owner = OwnerKey::game(Uuid::new_v4());
    let tab1 = Uuid::new_v4();
    let tab2 = Uuid::new_v4();
    let tab3 = Uuid::new_v4();

    let (tx1, _rx1) = sink();
    let (tx2, mut rx2) = sink();
    let (tx3, mut rx3) = sink();
    registry.add_connection(&owner, tab1, tx1).await;
    registry.add_connection(&owner, tab2, tx2).await;
    registry.add_connection(&owner, tab3, tx3).await;

    // Drain the admission status updates.
    recv_event(&mut rx2).await;
    recv_event(&mut rx2).await;
    recv_event(&mut rx3).await;

    registry.remove_connection(&owner, tab1).await;

    let expected = EventPayload::ActiveTabChanged { active_tab_id: tab2 };
    assert_eq!(recv_event(&mut rx2).await.payload, expected);
    assert_eq!(recv_event(&mut rx3).await.payload, expected);
    assert_no_event(&mut rx2).await;
    assert_no_event(&mut rx3).await;

    let snapshot = registry.session(&owner).await.expect("session exists");
    assert_eq!(snapshot.active_tab_id, Some(tab2));
    assert_eq!(snapshot.tab_ids, vec![tab2, tab3]);
}

#[tokio::test]
async fn removing_inactive_tab_does_not_change_active() {
    let registry = test_registry();
    let owner = OwnerKey::game(Uuid::new_v4());
    let tab1 = Uuid::new_v4();
    let tab2 = Uuid::new_v4();

    let (tx1, mut rx1) = sink();
    let (tx2, _rx2) = sink();
    registry.add_connection(&owner, tab1, tx1).await;
    registry.add_connection(&owner, tab2, tx2).await;
    recv_event(&mut rx1).await;
    recv_event(&mut rx1).await;

    registry.remove_connection(&owner, tab2).await;

    assert_no_event(&mut rx1).await;
    let snapshot = registry.session(&owner).await.expect("session exists");
    assert_eq!(snapshot.active_tab_id, Some(tab1));
}

// =============================================================
// Removal and session lifecycle
// =============================================================

#[tokio::test]
async fn removing_last_tab_drops_the_session() {
    let registry = test_registry();
    let owner = OwnerKey::user(Uuid::new_v4());
    let tab = Uuid::new_v4();

    let (tx, _rx) = sink();
    registry.add_connection(&owner, tab, tx).await;
    registry.remove_connection(&owner, tab).await;

    assert!(registry.session(&owner).await.is_none());
}

#[tokio::test]
async fn removing_unknown_tab_is_a_noop() {
    let registry = test_registry();
    let owner = OwnerKey::game(Uuid::new_v4());

    // Unknown owner entirely.
    registry.remove_connection(&owner, Uuid::new_v4()).await;

    // Known owner, unknown tab.
    let tab = Uuid::new_v4();
    let (tx, _rx) = sink();
    registry.add_connection(&owner, tab, tx).await;
    registry.remove_connection(&owner, Uuid::new_v4()).await;

    let snapshot = registry.session(&owner).await.expect("session exists");
    assert_eq!(snapshot.tab_ids, vec![tab]);
}

#[tokio::test]
async fn sink_scoped_removal_spares_a_reconnected_tab() {
    let registry = test_registry();
    let owner = OwnerKey::user(Uuid::new_v4());
    let tab = Uuid::new_v4();

    let (old_tx, _old_rx) = sink();
    let old_probe = old_tx.clone();
    registry.add_connection(&owner, tab, old_tx).await;

    // The same tab reconnects with a fresh sink; exclusive admission
    // supersedes the old connection.
    let (new_tx, _new_rx) = sink();
    let new_probe = new_tx.clone();
    registry.add_connection(&owner, tab, new_tx).await;

    // The stale socket task's cleanup must not evict the new connection.
    registry.remove_connection_for_sink(&owner, tab, &old_probe).await;
    let snapshot = registry.session(&owner).await.expect("session exists");
    assert_eq!(snapshot.tab_ids, vec![tab]);

    // Cleanup with the live sink removes it.
    registry.remove_connection_for_sink(&owner, tab, &new_probe).await;
    assert!(registry.session(&owner).await.is_none());
}

// =============================================================
// Explicit promotion
// =============================================================

#[tokio::test]
async fn set_active_tab_promotes_member_and_reports_status() {
    let registry = test_registry();
    let owner = OwnerKey::game(Uuid::new_v4());
    let tab1 = Uuid::new_v4();
    let tab2 = Uuid::new_v4();

    let (tx1, mut rx1) = sink();
    let (tx2, _rx2) = sink();
    registry.add_connection(&owner, tab1, tx1).await;
    registry.add_connection(&owner, tab2, tx2).await;
    recv_event(&mut rx1).await;
    recv_event(&mut rx1).await;

    assert!(registry.set_active_tab(&owner, tab2).await);
    assert_eq!(
        recv_event(&mut rx1).await.payload,
        EventPayload::TabStatusUpdate(TabStatus { active_tab_id: Some(tab2), total_tabs: 2 })
    );
}

#[tokio::test]
async fn set_active_tab_rejects_non_members() {
    let registry = test_registry();
    let owner = OwnerKey::game(Uuid::new_v4());

    assert!(!registry.set_active_tab(&owner, Uuid::new_v4()).await);

    let (tx, _rx) = sink();
    registry.add_connection(&owner, Uuid::new_v4(), tx).await;
    assert!(!registry.set_active_tab(&owner, Uuid::new_v4()).await);
}

// =============================================================
// Delivery
// =============================================================

#[tokio::test]
async fn broadcast_isolates_a_failed_sink() {
    let registry = test_registry();
    let owner = OwnerKey::game(Uuid::new_v4());
    let dead_tab = Uuid::new_v4();
    let live_tab = Uuid::new_v4();

    let (tx_dead, rx_dead) = sink();
    let (tx_live, mut rx_live) = sink();
    registry.add_connection(&owner, dead_tab, tx_dead).await;
    registry.add_connection(&owner, live_tab, tx_live).await;
    recv_event(&mut rx_live).await;

    // Simulate a silently dead client: its receiver is gone.
    drop(rx_dead);

    registry
        .emit(&owner, EventPayload::TypingStart { chat_id: Uuid::new_v4(), user_id: Uuid::new_v4() })
        .await;

    // The live sibling still receives the event, then the promotion that
    // follows the dead tab's eviction.
    let first = recv_event(&mut rx_live).await;
    assert!(matches!(first.payload, EventPayload::TypingStart { .. }));
    assert_eq!(
        recv_event(&mut rx_live).await.payload,
        EventPayload::ActiveTabChanged { active_tab_id: live_tab }
    );

    let snapshot = registry.session(&owner).await.expect("session exists");
    assert_eq!(snapshot.tab_ids, vec![live_tab]);
}

#[tokio::test]
async fn send_to_targets_a_single_tab() {
    let registry = test_registry();
    let owner = OwnerKey::game(Uuid::new_v4());
    let tab1 = Uuid::new_v4();
    let tab2 = Uuid::new_v4();

    let (tx1, mut rx1) = sink();
    let (tx2, mut rx2) = sink();
    registry.add_connection(&owner, tab1, tx1).await;
    registry.add_connection(&owner, tab2, tx2).await;
    recv_event(&mut rx1).await;
    recv_event(&mut rx1).await;
    recv_event(&mut rx2).await;

    let event = SyncEvent::new(owner.clone(), EventPayload::Heartbeat);
    registry.send_to(&owner, tab2, &event).await;

    assert_eq!(recv_event(&mut rx2).await.payload, EventPayload::Heartbeat);
    assert_no_event(&mut rx1).await;
}

#[tokio::test]
async fn emit_stamps_the_owner_key() {
    let registry = test_registry();
    let owner = OwnerKey::user(Uuid::new_v4());

    let (tx, mut rx) = sink();
    registry.add_connection(&owner, Uuid::new_v4(), tx).await;

    registry
        .emit(
            &owner,
            EventPayload::NotificationRead { notification_id: Uuid::new_v4(), sync_id: None },
        )
        .await;

    let event = recv_event(&mut rx).await;
    assert_eq!(event.owner_key, owner);
    assert!(matches!(event.payload, EventPayload::NotificationRead { .. }));
}

#[tokio::test]
async fn owner_keys_are_fully_isolated() {
    let registry = test_registry();
    let owner_a = OwnerKey::user(Uuid::new_v4());
    let owner_b = OwnerKey::user(Uuid::new_v4());

    let (tx_a, mut rx_a) = sink();
    let (tx_b, mut rx_b) = sink();
    registry.add_connection(&owner_a, Uuid::new_v4(), tx_a).await;
    registry.add_connection(&owner_b, Uuid::new_v4(), tx_b).await;

    registry.emit(&owner_a, EventPayload::Heartbeat).await;

    assert_eq!(recv_event(&mut rx_a).await.payload, EventPayload::Heartbeat);
    assert_no_event(&mut rx_b).await;
}

// =============================================================
// End-to-end scenarios
// =============================================================

#[tokio::test]
async fn personal_stream_scenario_second_tab_takes_over() {
    let registry = test_registry();
    let owner = OwnerKey::user(Uuid::new_v4());
    let tab_a = Uuid::new_v4();
    let tab_b = Uuid::new_v4();

    let (tx_a, mut rx_a) = sink();
    registry.add_connection(&owner, tab_a, tx_a).await;
    let snapshot = registry.session(&owner).await.expect("session exists");
    assert_eq!(snapshot.tab_ids.len(), 1);
    assert_eq!(snapshot.active_tab_id, Some(tab_a));

    let (tx_b, _rx_b) = sink();
    registry.add_connection(&owner, tab_b, tx_b).await;

    assert_eq!(recv_event(&mut rx_a).await.payload, EventPayload::Superseded);
    assert_closed(&mut rx_a).await;

    let snapshot = registry.session(&owner).await.expect("session exists");
    assert_eq!(snapshot.tab_ids.len(), 1);
    assert_eq!(snapshot.active_tab_id, Some(tab_b));
}

#[tokio::test]
async fn game_stream_scenario_spectator_takeover() {
    let registry = test_registry();
    let owner = OwnerKey::game(Uuid::new_v4());
    let tab1 = Uuid::new_v4();
    let tab2 = Uuid::new_v4();

    let (tx1, mut rx1) = sink();
    registry.add_connection(&owner, tab1, tx1).await;
    assert_eq!(
        recv_event(&mut rx1).await.payload,
        EventPayload::TabStatusUpdate(TabStatus { active_tab_id: Some(tab1), total_tabs: 1 })
    );

    let (tx2, mut rx2) = sink();
    registry.add_connection(&owner, tab2, tx2).await;
    assert_eq!(
        recv_event(&mut rx2).await.payload,
        EventPayload::TabStatusUpdate(TabStatus { active_tab_id: Some(tab1), total_tabs: 2 })
    );

    registry.remove_connection(&owner, tab1).await;

    assert_eq!(
        recv_event(&mut rx2).await.payload,
        EventPayload::ActiveTabChanged { active_tab_id: tab2 }
    );
    assert_no_event(&mut rx2).await;

    let snapshot = registry.session(&owner).await.expect("session exists");
    assert_eq!(snapshot.active_tab_id, Some(tab2));
    assert_eq!(snapshot.tab_ids, vec![tab2]);
}
