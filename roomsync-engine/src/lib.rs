//! Sync & reconciliation engine for RoomSync.
//!
//! Keeps per-day sessions consistent across any number of simultaneously
//! connected devices over an eventually-consistent realtime store, with:
//! - Optimistic local applies (read-your-own-write, zero perceived latency)
//! - Pending-write tracking that defeats the self-echo race
//! - A deletion guard so slow remote echoes cannot resurrect deletes
//! - Escalating reconnection (soft → nuclear → full reload)
//! - A per-session debouncer bounding write amplification
//!
//! The remote store is consumed only through the [`RemoteStore`] adapter
//! trait, so tests inject an in-memory fake and drive virtual time.

pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod reconcile;
pub mod remote;
pub mod state;
pub mod supervisor;

pub use config::SyncConfig;
pub use coordinator::WriteCoordinator;
pub use engine::{create_sync_engine, SyncCommand, SyncEngine, SyncEvent, SyncHandle};
pub use error::{SyncError, SyncResult};
pub use reconcile::merge;
pub use remote::RemoteStore;
pub use state::{LocalStore, PendingCreationSet, PendingDeletionSet, PendingWriteSet, SyncState};
pub use supervisor::{ConnectionStatus, ConnectionSupervisor, LifecycleSignal, NuclearOutcome};
