//! Remote store adapter.
//!
//! Thin interface over the managed realtime backend. The store's only
//! consistency guarantee is "eventually every subscriber sees every
//! write"; everything cleverer (pending-write protection, deletion
//! suppression, reconnect escalation) lives above this trait.
//!
//! Contract notes:
//! - Every operation is asynchronous and non-blocking.
//! - The adapter NEVER retries internally. A failed operation surfaces
//!   as [`SyncError::RemoteWrite`] (or [`SyncError::StaleWrite`] for the
//!   guarded full replace) and retry policy belongs to the coordinator
//!   and supervisor.
//! - Subscriptions and watches are cancelled by dropping the receiver.

use crate::error::SyncResult;
use async_trait::async_trait;
use roomsync_types::{DeviceId, EntityId, EntityPatch, Session, SessionId};
use std::collections::BTreeMap;
use tokio::sync::{mpsc, watch};

/// Adapter over the realtime publish/subscribe store.
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    /// Subscribes to the full session collection. The receiver yields a
    /// complete snapshot whenever any session changes anywhere. Dropping
    /// the receiver unsubscribes.
    async fn subscribe_all(&self) -> SyncResult<mpsc::Receiver<Vec<Session>>>;

    /// One-shot read of a single session, used when a device joins a
    /// session it has not cached.
    async fn fetch_once(&self, session_id: &SessionId) -> SyncResult<Option<Session>>;

    /// Atomic single-entity field patch.
    async fn write_field(
        &self,
        session_id: &SessionId,
        entity_id: &EntityId,
        patch: EntityPatch,
    ) -> SyncResult<()>;

    /// Atomic multi-entity patch to one session: one network call for a
    /// coalesced burst of field edits.
    async fn write_fields(
        &self,
        session_id: &SessionId,
        patches: BTreeMap<EntityId, EntityPatch>,
    ) -> SyncResult<()>;

    /// Full session replace. With `force = false` the store rejects the
    /// write with [`SyncError::StaleWrite`] when its copy has a newer
    /// `last_modified`; `force = true` bypasses the guard (first-time
    /// imports, new sessions).
    async fn write_session(&self, session: &Session, force: bool) -> SyncResult<()>;

    async fn delete_session(&self, session_id: &SessionId) -> SyncResult<()>;

    /// Streams the "socket is live" bit.
    fn connection_state(&self) -> watch::Receiver<bool>;

    /// Presence ping for `session_id/device_id`. The store auto-removes
    /// the record on ungraceful disconnect.
    async fn heartbeat(&self, session_id: &SessionId, device_id: &DeviceId) -> SyncResult<()>;

    /// Graceful presence removal on session switch or shutdown.
    async fn clear_presence(&self, session_id: &SessionId, device_id: &DeviceId)
        -> SyncResult<()>;

    /// Cycles the transport offline then online (soft reconnect). Some
    /// transports silently die without flipping the connectivity bit;
    /// the caller re-subscribes after a settle delay.
    async fn cycle_transport(&self) -> SyncResult<()>;

    /// Destroys and recreates the underlying client from scratch
    /// (nuclear reconnect). Existing subscriptions and watches are dead
    /// after this; the caller re-establishes everything.
    async fn reset(&self) -> SyncResult<()>;
}

/// Subscription channel depth. Snapshots are full-state, so a slow
/// consumer only ever needs the latest few.
pub const SNAPSHOT_CHANNEL_CAPACITY: usize = 16;

#[async_trait]
impl<T: RemoteStore + ?Sized> RemoteStore for std::sync::Arc<T> {
    async fn subscribe_all(&self) -> SyncResult<mpsc::Receiver<Vec<Session>>> {
        (**self).subscribe_all().await
    }

    async fn fetch_once(&self, session_id: &SessionId) -> SyncResult<Option<Session>> {
        (**self).fetch_once(session_id).await
    }

    async fn write_field(
        &self,
        session_id: &SessionId,
        entity_id: &EntityId,
        patch: EntityPatch,
    ) -> SyncResult<()> {
        (**self).write_field(session_id, entity_id, patch).await
    }

    async fn write_fields(
        &self,
        session_id: &SessionId,
        patches: BTreeMap<EntityId, EntityPatch>,
    ) -> SyncResult<()> {
        (**self).write_fields(session_id, patches).await
    }

    async fn write_session(&self, session: &Session, force: bool) -> SyncResult<()> {
        (**self).write_session(session, force).await
    }

    async fn delete_session(&self, session_id: &SessionId) -> SyncResult<()> {
        (**self).delete_session(session_id).await
    }

    fn connection_state(&self) -> watch::Receiver<bool> {
        (**self).connection_state()
    }

    async fn heartbeat(&self, session_id: &SessionId, device_id: &DeviceId) -> SyncResult<()> {
        (**self).heartbeat(session_id, device_id).await
    }

    async fn clear_presence(
        &self,
        session_id: &SessionId,
        device_id: &DeviceId,
    ) -> SyncResult<()> {
        (**self).clear_presence(session_id, device_id).await
    }

    async fn cycle_transport(&self) -> SyncResult<()> {
        (**self).cycle_transport().await
    }

    async fn reset(&self) -> SyncResult<()> {
        (**self).reset().await
    }
}
