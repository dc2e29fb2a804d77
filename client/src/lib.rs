//! Client-side synchronization engine.
//!
//! ARCHITECTURE
//! ============
//! Three layers, wired together by [`sync::SyncManager`]:
//!
//! - [`transport`] — how bytes move: the push channel plus the HTTP
//!   control calls, behind the [`transport::SyncTransport`] trait so tests
//!   can swap in scripted peers.
//! - [`sync`] — connection lifecycle: the state machine, exponential
//!   backoff, the offline mutation queue, and optimistic-update
//!   bookkeeping.
//! - [`reducer`] — a pure `(state, action) -> state` fold producing the
//!   UI-facing [`reducer::ClientState`].

pub mod backoff;
pub mod reducer;
pub mod sync;
pub mod transport;

pub use reducer::{Action, ClientState, ConnectionInfo, reduce};
pub use sync::{ConnectionPhase, ConnectionState, OptimisticOriginal, SyncConfig, SyncManager};
pub use transport::{HttpTransport, SyncTransport, TransportError};
