//! Shared test helpers: an in-memory remote store implementing the
//! adapter contract, with fault injection for reconnect and write-path
//! tests.

// Not every test binary exercises every helper.
#![allow(dead_code)]

use async_trait::async_trait;
use roomsync_engine::error::{SyncError, SyncResult};
use roomsync_engine::remote::{RemoteStore, SNAPSHOT_CHANNEL_CAPACITY};
use roomsync_types::{
    now_ms, DeviceId, Entity, EntityId, EntityPatch, PresenceRecord, Session, SessionId,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;

/// Opt-in test logging: `RUST_LOG=roomsync_engine=debug cargo test`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Default)]
struct Inner {
    sessions: BTreeMap<SessionId, Session>,
    presence: BTreeMap<(SessionId, DeviceId), PresenceRecord>,
    subscribers: Vec<mpsc::Sender<Vec<Session>>>,
}

/// In-memory realtime store. Every committed write fans out a full
/// snapshot to all subscribers, like the real backend.
pub struct InMemoryRemote {
    inner: Mutex<Inner>,
    conn_tx: Mutex<watch::Sender<bool>>,
    pub fail_writes: AtomicBool,
    pub fail_deletes: AtomicBool,
    pub fail_cycle: AtomicBool,
    /// Whether `reset()` brings the connectivity bit back up.
    pub reset_restores_connectivity: AtomicBool,
    pub cycle_count: AtomicUsize,
    pub reset_count: AtomicUsize,
    pub write_fields_calls: AtomicUsize,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        let (conn_tx, _) = watch::channel(true);
        Self {
            inner: Mutex::new(Inner::default()),
            conn_tx: Mutex::new(conn_tx),
            fail_writes: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
            fail_cycle: AtomicBool::new(false),
            reset_restores_connectivity: AtomicBool::new(true),
            cycle_count: AtomicUsize::new(0),
            reset_count: AtomicUsize::new(0),
            write_fields_calls: AtomicUsize::new(0),
        }
    }

    /// Seeds a session without notifying subscribers.
    pub fn seed(&self, session: Session) {
        self.inner
            .lock()
            .unwrap()
            .sessions
            .insert(session.id.clone(), session);
    }

    pub fn stored_session(&self, id: &SessionId) -> Option<Session> {
        self.inner.lock().unwrap().sessions.get(id).cloned()
    }

    pub fn presence_records(&self) -> Vec<PresenceRecord> {
        self.inner.lock().unwrap().presence.values().cloned().collect()
    }

    /// Flips the connectivity bit.
    pub fn set_connectivity(&self, live: bool) {
        let _ = self.conn_tx.lock().unwrap().send(live);
    }

    /// Delivers an arbitrary snapshot to every subscriber without
    /// touching stored state: a stale echo from the store's fan-out.
    pub fn push_snapshot(&self, sessions: Vec<Session>) {
        let subscribers = self.inner.lock().unwrap().subscribers.clone();
        for tx in subscribers {
            let _ = tx.try_send(sessions.clone());
        }
    }

    /// Broadcasts the current stored state to every subscriber.
    pub fn broadcast(&self) {
        let (snapshot, subscribers) = {
            let inner = self.inner.lock().unwrap();
            (
                inner.sessions.values().cloned().collect::<Vec<_>>(),
                inner.subscribers.clone(),
            )
        };
        for tx in subscribers {
            let _ = tx.try_send(snapshot.clone());
        }
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemote {
    async fn subscribe_all(&self) -> SyncResult<mpsc::Receiver<Vec<Session>>> {
        let (tx, rx) = mpsc::channel(SNAPSHOT_CHANNEL_CAPACITY);
        let snapshot: Vec<Session> = {
            let mut inner = self.inner.lock().unwrap();
            inner.subscribers.push(tx.clone());
            inner.sessions.values().cloned().collect()
        };
        // Initial snapshot on subscribe, like the real backend.
        let _ = tx.try_send(snapshot);
        Ok(rx)
    }

    async fn fetch_once(&self, session_id: &SessionId) -> SyncResult<Option<Session>> {
        Ok(self.inner.lock().unwrap().sessions.get(session_id).cloned())
    }

    async fn write_field(
        &self,
        session_id: &SessionId,
        entity_id: &EntityId,
        patch: EntityPatch,
    ) -> SyncResult<()> {
        let mut patches = BTreeMap::new();
        patches.insert(entity_id.clone(), patch);
        self.write_fields(session_id, patches).await
    }

    async fn write_fields(
        &self,
        session_id: &SessionId,
        patches: BTreeMap<EntityId, EntityPatch>,
    ) -> SyncResult<()> {
        self.write_fields_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SyncError::RemoteWrite("injected write failure".into()));
        }
        {
            let mut inner = self.inner.lock().unwrap();
            let session = inner
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| SyncError::SessionNotFound(session_id.clone()))?;
            for (entity_id, patch) in patches {
                if let Some(entity) = session.entity_mut(&entity_id) {
                    entity.apply_patch(&patch);
                }
            }
            session.touch(now_ms());
        }
        self.broadcast();
        Ok(())
    }

    async fn write_session(&self, session: &Session, force: bool) -> SyncResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SyncError::RemoteWrite("injected write failure".into()));
        }
        {
            let mut inner = self.inner.lock().unwrap();
            if !force {
                if let Some(existing) = inner.sessions.get(&session.id) {
                    if existing.last_modified > session.last_modified {
                        return Err(SyncError::StaleWrite(session.id.clone()));
                    }
                }
            }
            inner.sessions.insert(session.id.clone(), session.clone());
        }
        self.broadcast();
        Ok(())
    }

    async fn delete_session(&self, session_id: &SessionId) -> SyncResult<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(SyncError::RemoteWrite("injected delete failure".into()));
        }
        self.inner.lock().unwrap().sessions.remove(session_id);
        self.broadcast();
        Ok(())
    }

    fn connection_state(&self) -> watch::Receiver<bool> {
        self.conn_tx.lock().unwrap().subscribe()
    }

    async fn heartbeat(&self, session_id: &SessionId, device_id: &DeviceId) -> SyncResult<()> {
        let now = now_ms();
        let mut inner = self.inner.lock().unwrap();
        inner
            .presence
            .entry((session_id.clone(), device_id.clone()))
            .and_modify(|r| r.last_seen = now)
            .or_insert_with(|| PresenceRecord {
                session_id: session_id.clone(),
                device_id: device_id.clone(),
                joined_at: now,
                last_seen: now,
            });
        Ok(())
    }

    async fn clear_presence(
        &self,
        session_id: &SessionId,
        device_id: &DeviceId,
    ) -> SyncResult<()> {
        self.inner
            .lock()
            .unwrap()
            .presence
            .remove(&(session_id.clone(), device_id.clone()));
        Ok(())
    }

    async fn cycle_transport(&self) -> SyncResult<()> {
        self.cycle_count.fetch_add(1, Ordering::SeqCst);
        if self.fail_cycle.load(Ordering::SeqCst) {
            return Err(SyncError::RemoteWrite("injected cycle failure".into()));
        }
        Ok(())
    }

    async fn reset(&self) -> SyncResult<()> {
        self.reset_count.fetch_add(1, Ordering::SeqCst);
        let live = self.reset_restores_connectivity.load(Ordering::SeqCst);
        // The rebuilt client has fresh channels; old subscriptions and
        // watches are dead.
        let (conn_tx, _) = watch::channel(live);
        *self.conn_tx.lock().unwrap() = conn_tx;
        self.inner.lock().unwrap().subscribers.clear();
        Ok(())
    }
}

/// A session with `count` entities whose `hkStatus` starts `"pending"`.
pub fn make_session(label: &str, count: usize) -> Session {
    let date = chrono::NaiveDate::from_ymd_opt(2026, 8, 23).unwrap();
    let mut session = Session::new(label, date);
    for i in 0..count {
        let mut entity = Entity::new(EntityId::from_string(format!("g{i}")));
        entity.fields.insert("hkStatus".into(), json!("pending"));
        entity.source_text = Some(format!("guest {i} room {} late checkout vip", 100 + i));
        session.upsert_entity(entity);
    }
    session
}
