//! External write path for game moves.
//!
//! The checkers rules engine and its storage live outside this service.
//! The sync core hands ordered batches across this seam and emits the
//! resulting envelopes; implementations are injected as
//! `Arc<dyn MoveProcessor>` so tests can substitute recording or failing
//! ones.

use async_trait::async_trait;
use events::{GameMove, GameSnapshot};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum MoveError {
    #[error("unknown game: {0}")]
    UnknownGame(Uuid),
    #[error("illegal move: {0}")]
    IllegalMove(String),
    #[error("move write path unavailable: {0}")]
    Unavailable(String),
}

/// Outcome of a successfully applied batch.
#[derive(Debug, Clone, Default)]
pub struct MoveOutcome {
    /// Moves accepted, in submission order.
    pub applied: Vec<GameMove>,
    /// Authoritative snapshot after the batch, when the engine produced one.
    pub snapshot: Option<GameSnapshot>,
}

#[async_trait]
pub trait MoveProcessor: Send + Sync {
    /// Validate and apply an ordered batch of moves.
    ///
    /// # Errors
    ///
    /// Rejection is all-or-nothing: on any `MoveError` the caller treats
    /// the whole batch as unapplied, and the client retries it intact on
    /// its next successful connection.
    async fn apply_moves(&self, game_id: Uuid, moves: &[GameMove]) -> Result<MoveOutcome, MoveError>;
}

/// Stand-in write path wired by the server binary until the rules engine
/// service is linked in: accepts every move, produces no snapshot.
pub struct PassthroughProcessor;

#[async_trait]
impl MoveProcessor for PassthroughProcessor {
    async fn apply_moves(&self, _game_id: Uuid, moves: &[GameMove]) -> Result<MoveOutcome, MoveError> {
        Ok(MoveOutcome { applied: moves.to_vec(), snapshot: None })
    }
}
