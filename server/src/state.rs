//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor.
//! It holds the connection registry and the external move write path.
//! Nothing here is durable; every session dies with the process.

use std::sync::Arc;

use crate::moves::MoveProcessor;
use crate::registry::Registry;

/// Shared application state. Clone is required by Axum — all inner fields
/// are cheap handles.
#[derive(Clone)]
pub struct AppState {
    pub registry: Registry,
    pub moves: Arc<dyn MoveProcessor>,
}

impl AppState {
    #[must_use]
    pub fn new(registry: Registry, moves: Arc<dyn MoveProcessor>) -> Self {
        Self { registry, moves }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================
