use super::*;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::time::{Duration, timeout};

use events::SyncEvent;

use crate::moves::{MoveOutcome, MoveProcessor};
use crate::state::test_helpers;

fn auth_headers(user_id: Uuid) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(events::USER_HEADER, user_id.to_string().parse().expect("header value"));
    headers
}

async fn recv_event(rx: &mut mpsc::Receiver<SyncEvent>) -> SyncEvent {
    timeout(Duration::from_millis(200), rx.recv())
        .await
        .expect("event receive timed out")
        .expect("event channel closed unexpectedly")
}

/// Records every batch it is handed; optionally rejects them all.
struct RecordingProcessor {
    batches: Mutex<Vec<Vec<GameMove>>>,
    rejection: Option<fn() -> MoveError>,
    snapshot: Option<events::GameSnapshot>,
}

impl RecordingProcessor {
    fn accepting() -> Arc<Self> {
        Arc::new(Self { batches: Mutex::new(Vec::new()), rejection: None, snapshot: None })
    }

    fn rejecting(rejection: fn() -> MoveError) -> Arc<Self> {
        Arc::new(Self { batches: Mutex::new(Vec::new()), rejection: Some(rejection), snapshot: None })
    }

    fn with_snapshot(snapshot: events::GameSnapshot) -> Arc<Self> {
        Arc::new(Self { batches: Mutex::new(Vec::new()), rejection: None, snapshot: Some(snapshot) })
    }
}

#[async_trait::async_trait]
impl MoveProcessor for RecordingProcessor {
    async fn apply_moves(&self, _game_id: Uuid, moves: &[GameMove]) -> Result<MoveOutcome, MoveError> {
        self.batches
            .lock()
            .expect("batches mutex should lock")
            .push(moves.to_vec());
        if let Some(rejection) = self.rejection {
            return Err(rejection());
        }
        Ok(MoveOutcome { applied: moves.to_vec(), snapshot: self.snapshot.clone() })
    }
}

// =============================================================
// register
// =============================================================

#[tokio::test]
async fn register_reports_empty_session_for_unknown_owner() {
    let state = test_helpers::test_app_state();
    let body = TabRequest { owner: None, tab_id: Uuid::new_v4() };

    let Json(status) = register_tab(State(state), auth_headers(Uuid::new_v4()), Json(body))
        .await
        .expect("register should succeed");

    assert_eq!(status, TabStatus { active_tab_id: None, total_tabs: 0 });
}

#[tokio::test]
async fn register_reports_live_session_status() {
    let state = test_helpers::test_app_state();
    let user_id = Uuid::new_v4();
    let owner = OwnerKey::user(user_id);
    let tab = Uuid::new_v4();

    let (tx, _rx) = mpsc::channel(8);
    state.registry.add_connection(&owner, tab, tx).await;

    let body = TabRequest { owner: None, tab_id: Uuid::new_v4() };
    let Json(status) = register_tab(State(state), auth_headers(user_id), Json(body))
        .await
        .expect("register should succeed");

    assert_eq!(status, TabStatus { active_tab_id: Some(tab), total_tabs: 1 });
}

#[tokio::test]
async fn register_requires_identity_header() {
    let state = test_helpers::test_app_state();
    let body = TabRequest { owner: None, tab_id: Uuid::new_v4() };

    let err = register_tab(State(state), HeaderMap::new(), Json(body))
        .await
        .expect_err("register should fail");
    assert_eq!(err, StatusCode::UNAUTHORIZED);
}

// =============================================================
// heartbeat
// =============================================================

#[tokio::test]
async fn heartbeat_ack_acknowledges() {
    let state = test_helpers::test_app_state();
    let user_id = Uuid::new_v4();
    let body = TabRequest { owner: None, tab_id: Uuid::new_v4() };

    let Json(response) = heartbeat_ack(State(state), auth_headers(user_id), Json(body))
        .await
        .expect("heartbeat should succeed");
    assert!(response.ok);
}

// =============================================================
// active tab
// =============================================================

#[tokio::test]
async fn set_active_tab_promotes_a_member() {
    let state = test_helpers::test_app_state();
    let game_id = Uuid::new_v4();
    let owner = OwnerKey::game(game_id);
    let tab1 = Uuid::new_v4();
    let tab2 = Uuid::new_v4();

    let (tx1, _rx1) = mpsc::channel(8);
    let (tx2, _rx2) = mpsc::channel(8);
    state.registry.add_connection(&owner, tab1, tx1).await;
    state.registry.add_connection(&owner, tab2, tx2).await;

    let body = TabRequest { owner: Some(format!("game:{game_id}")), tab_id: tab2 };
    let registry = state.registry.clone();
    set_active_tab(State(state), auth_headers(Uuid::new_v4()), Json(body))
        .await
        .expect("promotion should succeed");

    let snapshot = registry.session(&owner).await.expect("session exists");
    assert_eq!(snapshot.active_tab_id, Some(tab2));
}

#[tokio::test]
async fn set_active_tab_rejects_unknown_tab() {
    let state = test_helpers::test_app_state();
    let game_id = Uuid::new_v4();
    let body = TabRequest { owner: Some(format!("game:{game_id}")), tab_id: Uuid::new_v4() };

    let err = set_active_tab(State(state), auth_headers(Uuid::new_v4()), Json(body))
        .await
        .expect_err("promotion should fail");
    assert_eq!(err, StatusCode::NOT_FOUND);
}

// =============================================================
// offline moves
// =============================================================

fn moves_body(game_id: Uuid, tab_id: Uuid, moves: Vec<GameMove>) -> SyncMovesRequest {
    SyncMovesRequest { owner: format!("game:{game_id}"), tab_id, moves }
}

#[tokio::test]
async fn sync_moves_requires_a_game_owner() {
    let state = test_helpers::test_app_state();
    let user_id = Uuid::new_v4();
    let body = SyncMovesRequest {
        owner: format!("user:{user_id}"),
        tab_id: Uuid::new_v4(),
        moves: vec![],
    };

    let err = sync_offline_moves(State(state), auth_headers(user_id), Json(body))
        .await
        .expect_err("personal streams carry no moves");
    assert_eq!(err, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn sync_moves_hands_the_batch_over_in_order() {
    let processor = RecordingProcessor::accepting();
    let state = test_helpers::test_app_state_with_moves(processor.clone());
    let game_id = Uuid::new_v4();
    let moves: Vec<GameMove> = (0..3).map(|_| test_helpers::sample_move(game_id)).collect();

    let body = moves_body(game_id, Uuid::new_v4(), moves.clone());
    let Json(response) = sync_offline_moves(State(state), auth_headers(Uuid::new_v4()), Json(body))
        .await
        .expect("sync should succeed");

    assert_eq!(response.applied, 3);
    let batches = processor.batches.lock().expect("batches mutex should lock");
    assert_eq!(batches.as_slice(), &[moves]);
}

#[tokio::test]
async fn sync_moves_emits_move_applied_with_correlation_ids() {
    let processor = RecordingProcessor::accepting();
    let state = test_helpers::test_app_state_with_moves(processor);
    let game_id = Uuid::new_v4();
    let owner = OwnerKey::game(game_id);
    let moves: Vec<GameMove> = (0..2).map(|_| test_helpers::sample_move(game_id)).collect();

    let (tx, mut rx) = mpsc::channel(8);
    state.registry.add_connection(&owner, Uuid::new_v4(), tx).await;
    recv_event(&mut rx).await; // admission status update

    let body = moves_body(game_id, Uuid::new_v4(), moves.clone());
    let registry = state.registry.clone();
    sync_offline_moves(State(state), auth_headers(Uuid::new_v4()), Json(body))
        .await
        .expect("sync should succeed");
    drop(registry);

    for expected in &moves {
        let event = recv_event(&mut rx).await;
        let EventPayload::MoveApplied { game_id: event_game, game_move, sync_id } = event.payload else {
            panic!("expected MOVE_APPLIED payload");
        };
        assert_eq!(event_game, game_id);
        assert_eq!(&game_move, expected);
        assert_eq!(sync_id, Some(expected.id));
    }
}

#[tokio::test]
async fn sync_moves_emits_snapshot_after_the_batch() {
    let game_id = Uuid::new_v4();
    let snapshot = events::GameSnapshot {
        game_id,
        board: vec!["r".to_owned(); 32],
        turn: "black".to_owned(),
        version: 7,
    };
    let processor = RecordingProcessor::with_snapshot(snapshot.clone());
    let state = test_helpers::test_app_state_with_moves(processor);
    let owner = OwnerKey::game(game_id);

    let (tx, mut rx) = mpsc::channel(8);
    state.registry.add_connection(&owner, Uuid::new_v4(), tx).await;
    recv_event(&mut rx).await;

    let body = moves_body(game_id, Uuid::new_v4(), vec![test_helpers::sample_move(game_id)]);
    sync_offline_moves(State(state), auth_headers(Uuid::new_v4()), Json(body))
        .await
        .expect("sync should succeed");

    let first = recv_event(&mut rx).await;
    assert!(matches!(first.payload, EventPayload::MoveApplied { .. }));
    let second = recv_event(&mut rx).await;
    assert_eq!(second.payload, EventPayload::GameState(snapshot));
}

#[tokio::test]
async fn rejected_batch_emits_nothing_and_maps_status() {
    let processor = RecordingProcessor::rejecting(|| MoveError::Unavailable("engine down".into()));
    let state = test_helpers::test_app_state_with_moves(processor);
    let game_id = Uuid::new_v4();
    let owner = OwnerKey::game(game_id);

    let (tx, mut rx) = mpsc::channel(8);
    state.registry.add_connection(&owner, Uuid::new_v4(), tx).await;
    recv_event(&mut rx).await;

    let body = moves_body(game_id, Uuid::new_v4(), vec![test_helpers::sample_move(game_id)]);
    let registry = state.registry.clone();
    let err = sync_offline_moves(State(state), auth_headers(Uuid::new_v4()), Json(body))
        .await
        .expect_err("sync should fail");

    assert_eq!(err, StatusCode::SERVICE_UNAVAILABLE);
    assert!(
        timeout(Duration::from_millis(80), rx.recv()).await.is_err(),
        "no events should be emitted for a rejected batch"
    );
    drop(registry);
}

#[tokio::test]
async fn move_error_statuses_are_stable() {
    assert_eq!(move_error_to_status(MoveError::UnknownGame(Uuid::new_v4())), StatusCode::NOT_FOUND);
    assert_eq!(move_error_to_status(MoveError::IllegalMove("occupied".into())), StatusCode::BAD_REQUEST);
    assert_eq!(
        move_error_to_status(MoveError::Unavailable("engine down".into())),
        StatusCode::SERVICE_UNAVAILABLE
    );
}
