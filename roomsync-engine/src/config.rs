//! Sync engine configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for the sync engine. All timing below goes through
/// `tokio::time`, so tests drive it with a paused clock.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Grace delay after a pending write settles before its entity leaves
    /// the pending set. Bounds the self-echo race window.
    pub write_grace: Duration,

    /// Hard cap on how long an entity may stay pending, even if its write
    /// promise never settles (dropped network).
    pub pending_write_max: Duration,

    /// Safety delay after a remote delete settles before the session
    /// leaves the pending-deletion set, so snapshots already queued
    /// before the delete are still filtered.
    pub deletion_grace: Duration,

    /// Hard cap on pending-deletion membership when the remote delete
    /// never completes. Expiry is the accepted rare-resurrection risk.
    pub deletion_timeout: Duration,

    /// Window coalescing bursts of atomic patches to one session into a
    /// single network call.
    pub debounce_window: Duration,

    /// Window collapsing repeated soft-reconnect triggers into one.
    pub soft_debounce: Duration,

    /// Settle delay between cycling the transport and re-subscribing.
    pub soft_settle: Duration,

    /// How often the stale watchdog (and pending-set sweeps) run.
    pub watchdog_interval: Duration,

    /// No data for this long while claiming `connected` forces a soft
    /// reconnect.
    pub stale_threshold: Duration,

    /// Bounded wait for the connectivity bit after a nuclear client
    /// rebuild.
    pub nuclear_connect_timeout: Duration,

    /// Consecutive nuclear failures before escalating to a full reload.
    pub max_nuclear_attempts: u32,

    /// Rate limit for manual reconnect requests.
    pub manual_reconnect_cooldown: Duration,

    /// Presence heartbeat period for the active session.
    pub heartbeat_interval: Duration,

    /// Maximum retained audit-trail entries (oldest dropped first).
    pub audit_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            write_grace: Duration::from_secs(2),
            pending_write_max: Duration::from_secs(10),
            deletion_grace: Duration::from_secs(3),
            deletion_timeout: Duration::from_secs(10),
            debounce_window: Duration::from_millis(300),
            soft_debounce: Duration::from_secs(2),
            soft_settle: Duration::from_secs(1),
            watchdog_interval: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(60),
            nuclear_connect_timeout: Duration::from_secs(12),
            max_nuclear_attempts: 2,
            manual_reconnect_cooldown: Duration::from_secs(15),
            heartbeat_interval: Duration::from_secs(30),
            audit_capacity: 1024,
        }
    }
}
