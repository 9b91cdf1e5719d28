//! Sync engine error types.

use roomsync_types::SessionId;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in the sync engine.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A remote write/read/delete rejected. The adapter never retries;
    /// retry policy lives in the coordinator and supervisor.
    #[error("remote write failed: {0}")]
    RemoteWrite(String),

    /// Full-session replace without `force` lost the last-write-wins
    /// guard: the remote copy is newer.
    #[error("stale write rejected for session {0}")]
    StaleWrite(SessionId),

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("entity {entity} not found in session {session}")]
    EntityNotFound {
        session: SessionId,
        entity: roomsync_types::EntityId,
    },

    /// Enrichment batch result count does not match the input batch.
    /// The whole batch is discarded, never partially applied.
    #[error("refinement count mismatch: expected {expected}, got {got}")]
    RefinementCountMismatch { expected: usize, got: usize },

    /// A nuclear reconnect was requested while one is already in flight.
    #[error("reconnect already in progress")]
    ReconnectInFlight,

    /// Manual reconnect requested inside the rate-limit window.
    #[error("reconnect cooldown active")]
    ReconnectCooldown,

    /// The engine loop has stopped; its command channel is gone.
    #[error("engine channel closed")]
    ChannelClosed,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
