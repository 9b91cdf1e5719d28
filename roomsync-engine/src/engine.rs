//! Sync engine event loop.
//!
//! Ties together the remote store adapter, reconciler, write
//! coordinator, and connection supervisor. The loop owns all I/O: the
//! snapshot subscription, the connectivity watch, the staleness
//! watchdog, and the presence heartbeat. The supervisor is a pure state
//! machine; the merge is a pure function.
//!
//! Teardown order on session switch or shutdown is subscription →
//! presence → heartbeat → watchdog, and every step is idempotent.

use crate::config::SyncConfig;
use crate::coordinator::WriteCoordinator;
use crate::error::{SyncError, SyncResult};
use crate::reconcile;
use crate::remote::RemoteStore;
use crate::state::SyncState;
use crate::supervisor::{ConnectionStatus, ConnectionSupervisor, LifecycleSignal, NuclearOutcome};
use roomsync_types::{AuditEntry, DeviceId, Entity, EntityId, EntityPatch, Session, SessionId};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Consecutive soft-reconnect failures before escalating to nuclear.
const SOFT_FAILURES_BEFORE_NUCLEAR: u32 = 2;

/// Commands sent to the engine loop.
#[derive(Debug)]
pub enum SyncCommand {
    /// Application-lifecycle hint (visibility, focus, resume, network).
    Lifecycle(LifecycleSignal),
    /// User-requested reconnect; rate-limited, escalates to nuclear.
    ManualReconnect,
    /// Switch which session this device is present in.
    SetActiveSession(Option<SessionId>),
    /// Stop the engine.
    Shutdown,
}

/// Events emitted for the presentation layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncEvent {
    /// Local state changed (merge applied); re-read the store.
    SessionsUpdated,
    ConnectionChanged(ConnectionStatus),
    /// The nuclear attempt budget is exhausted; the host must perform a
    /// full reload. The engine has stopped. Data survives because the
    /// remote store is authoritative.
    ReloadRequired,
}

/// Cloneable handle to the running engine.
///
/// Mutations go straight to the write coordinator (optimistic apply is
/// synchronous, so read-your-own-write holds when the call returns);
/// lifecycle and reconnect signals go through the command channel.
#[derive(Clone)]
pub struct SyncHandle {
    command_tx: mpsc::Sender<SyncCommand>,
    coordinator: Arc<WriteCoordinator>,
    state: Arc<SyncState>,
    status_rx: watch::Receiver<ConnectionStatus>,
}

impl SyncHandle {
    // ── Reads ───────────────────────────────────────────────────────

    pub fn sessions(&self) -> Vec<Session> {
        self.state.local.read().unwrap().sessions().to_vec()
    }

    pub fn session(&self, id: &SessionId) -> Option<Session> {
        self.state.local.read().unwrap().session(id).cloned()
    }

    pub fn active_session(&self) -> Option<Session> {
        self.state.local.read().unwrap().active_session().cloned()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        *self.status_rx.borrow()
    }

    /// Watch channel mirroring [`Self::connection_status`].
    pub fn status_watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    pub fn audit_trail(&self) -> Vec<AuditEntry> {
        self.state.audit_trail()
    }

    pub fn pending_write_count(&self) -> usize {
        self.coordinator.pending_write_count()
    }

    // ── Mutations (write coordinator) ───────────────────────────────

    pub fn update_entity(
        &self,
        session_id: &SessionId,
        entity_id: &EntityId,
        patch: EntityPatch,
    ) -> SyncResult<()> {
        self.coordinator.update_entity(session_id, entity_id, patch)
    }

    pub async fn create_session(
        &self,
        label: impl Into<String>,
        date: chrono::NaiveDate,
    ) -> SyncResult<SessionId> {
        self.coordinator.create_session(label, date).await
    }

    pub async fn import_session(&self, session: Session) -> SyncResult<()> {
        self.coordinator.import_session(session).await
    }

    pub async fn add_entity(&self, session_id: &SessionId, entity: Entity) -> SyncResult<()> {
        self.coordinator.add_entity(session_id, entity).await
    }

    pub async fn remove_entity(
        &self,
        session_id: &SessionId,
        entity_id: &EntityId,
    ) -> SyncResult<()> {
        self.coordinator.remove_entity(session_id, entity_id).await
    }

    pub async fn lock_session(&self, session_id: &SessionId) -> SyncResult<()> {
        self.coordinator.lock_session(session_id).await
    }

    pub async fn unlock_session(&self, session_id: &SessionId) -> SyncResult<()> {
        self.coordinator.unlock_session(session_id).await
    }

    pub async fn verify_session(&self, session_id: &SessionId) -> SyncResult<()> {
        self.coordinator.verify_session(session_id).await
    }

    pub fn delete_session(&self, session_id: &SessionId) -> SyncResult<()> {
        self.coordinator.delete_session(session_id)
    }

    pub fn apply_refinements(
        &self,
        session_id: &SessionId,
        entity_ids: &[EntityId],
        refinements: Vec<EntityPatch>,
    ) -> SyncResult<usize> {
        self.coordinator
            .apply_refinements(session_id, entity_ids, refinements)
    }

    // ── Engine commands ─────────────────────────────────────────────

    pub async fn lifecycle(&self, signal: LifecycleSignal) -> SyncResult<()> {
        self.send(SyncCommand::Lifecycle(signal)).await
    }

    pub async fn manual_reconnect(&self) -> SyncResult<()> {
        self.send(SyncCommand::ManualReconnect).await
    }

    pub async fn set_active_session(&self, session_id: Option<SessionId>) -> SyncResult<()> {
        self.send(SyncCommand::SetActiveSession(session_id)).await
    }

    pub async fn shutdown(&self) -> SyncResult<()> {
        self.send(SyncCommand::Shutdown).await
    }

    async fn send(&self, cmd: SyncCommand) -> SyncResult<()> {
        self.command_tx
            .send(cmd)
            .await
            .map_err(|_| SyncError::ChannelClosed)
    }
}

/// Creates a sync engine and the pieces needed to run it.
pub fn create_sync_engine(
    remote: Arc<dyn RemoteStore>,
    device_id: DeviceId,
    config: SyncConfig,
) -> (SyncHandle, mpsc::Receiver<SyncEvent>, SyncEngine) {
    let (command_tx, command_rx) = mpsc::channel(32);
    let (event_tx, event_rx) = mpsc::channel(64);

    let state = Arc::new(SyncState::new(&config));
    let coordinator = Arc::new(WriteCoordinator::new(
        Arc::clone(&remote),
        Arc::clone(&state),
        config.clone(),
        device_id.clone(),
    ));
    let (supervisor, status_rx) = ConnectionSupervisor::new(config.clone());

    let handle = SyncHandle {
        command_tx,
        coordinator,
        state: Arc::clone(&state),
        status_rx,
    };

    let engine = SyncEngine {
        remote,
        state,
        supervisor,
        config,
        device_id,
        command_rx,
        event_tx,
        heartbeat: None,
        soft_failures: 0,
    };

    (handle, event_rx, engine)
}

/// Outcome of one nuclear reconnect cycle, including the replacement
/// channels on recovery (the reset invalidates the old ones).
enum NuclearResult {
    Recovered {
        snapshots: mpsc::Receiver<Vec<Session>>,
        connectivity: watch::Receiver<bool>,
    },
    Escalated,
    Skipped,
}

/// The sync engine event loop.
pub struct SyncEngine {
    remote: Arc<dyn RemoteStore>,
    state: Arc<SyncState>,
    supervisor: ConnectionSupervisor,
    config: SyncConfig,
    device_id: DeviceId,
    command_rx: mpsc::Receiver<SyncCommand>,
    event_tx: mpsc::Sender<SyncEvent>,
    heartbeat: Option<tokio::task::JoinHandle<()>>,
    soft_failures: u32,
}

impl SyncEngine {
    /// Runs the engine until shutdown or escalation. The initial
    /// subscription failure is the only fatal startup error; everything
    /// after goes through the reconnect escalation ladder.
    pub async fn run(mut self) -> SyncResult<()> {
        info!("sync engine started for device {}", self.device_id);

        let mut snapshot_rx = self.remote.subscribe_all().await?;
        let mut conn_rx = self.remote.connection_state();
        self.supervisor.on_connectivity(*conn_rx.borrow_and_update());

        let mut watchdog = tokio::time::interval(self.config.watchdog_interval);
        watchdog.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Skip first immediate tick
        watchdog.tick().await;

        loop {
            tokio::select! {
                maybe_snapshot = snapshot_rx.recv() => {
                    match maybe_snapshot {
                        Some(snapshot) => {
                            self.handle_snapshot(snapshot);
                        }
                        None => {
                            // Subscription died without the connectivity
                            // bit flipping. Treat as a soft-reconnect
                            // trigger.
                            warn!("snapshot stream ended unexpectedly");
                            if self.soft_then_nuclear(&mut snapshot_rx, &mut conn_rx).await {
                                break;
                            }
                        }
                    }
                }

                changed = conn_rx.changed() => {
                    match changed {
                        Ok(()) => {
                            let live = *conn_rx.borrow_and_update();
                            let before = self.supervisor.status();
                            self.supervisor.on_connectivity(live);
                            let after = self.supervisor.status();
                            if before != after {
                                self.emit(SyncEvent::ConnectionChanged(after));
                            }
                        }
                        Err(_) => {
                            // Sender replaced by a client rebuild.
                            conn_rx = self.remote.connection_state();
                        }
                    }
                }

                _ = watchdog.tick() => {
                    self.sweep_pending();
                    if self.supervisor.check_stale() {
                        if self.soft_then_nuclear(&mut snapshot_rx, &mut conn_rx).await {
                            break;
                        }
                    }
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(SyncCommand::Lifecycle(signal)) => {
                            if self.supervisor.on_lifecycle(signal)
                                && self.soft_then_nuclear(&mut snapshot_rx, &mut conn_rx).await
                            {
                                break;
                            }
                        }
                        Some(SyncCommand::ManualReconnect) => {
                            match self.supervisor.manual_reconnect_allowed() {
                                Ok(()) => match self.nuclear_with_retry().await {
                                    NuclearResult::Recovered { snapshots, connectivity } => {
                                        snapshot_rx = snapshots;
                                        conn_rx = connectivity;
                                    }
                                    NuclearResult::Escalated => {
                                        self.emit(SyncEvent::ReloadRequired);
                                        break;
                                    }
                                    NuclearResult::Skipped => {}
                                },
                                Err(e) => debug!("manual reconnect ignored: {e}"),
                            }
                        }
                        Some(SyncCommand::SetActiveSession(session_id)) => {
                            self.switch_active(session_id).await;
                        }
                        Some(SyncCommand::Shutdown) => {
                            info!("sync engine shutting down");
                            break;
                        }
                        None => {
                            info!("command channel closed, stopping sync engine");
                            break;
                        }
                    }
                }
            }
        }

        // Teardown: subscription (dropped on return) → presence →
        // heartbeat → watchdog (dropped on return).
        drop(snapshot_rx);
        self.clear_presence().await;
        self.stop_heartbeat();
        info!("sync engine stopped");
        Ok(())
    }

    /// Merges an incoming snapshot against local state and the pending
    /// sets, then publishes the result.
    fn handle_snapshot(&mut self, snapshot: Vec<Session>) {
        self.supervisor.record_data();
        self.soft_failures = 0;
        self.sweep_pending();

        // Merge and install under one critical section. An optimistic
        // apply holds the same write lock, so it can never land between
        // computing the merge and installing its output.
        {
            let mut local = self.state.local.write().unwrap();
            let pending_writes = self.state.pending_writes.lock().unwrap();
            let pending_deletions = self.state.pending_deletions.lock().unwrap();
            let pending_creations = self.state.pending_creations.lock().unwrap();
            let merged = reconcile::merge(
                local.sessions(),
                snapshot,
                &pending_writes,
                &pending_deletions,
                &pending_creations,
            );
            local.replace_all(merged);
        }
        self.emit(SyncEvent::SessionsUpdated);
    }

    /// Non-blocking event emission. A presentation layer that stops
    /// draining events must never stall the loop; every event is either
    /// idempotent or re-readable from the handle, so dropping under
    /// backpressure is safe.
    fn emit(&self, event: SyncEvent) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.event_tx.try_send(event) {
            debug!("event channel full, dropping {event:?}");
        }
    }

    /// Enforces the bounded-lifetime invariant on both pending sets.
    fn sweep_pending(&self) {
        let now = Instant::now();
        let evicted = self.state.pending_writes.lock().unwrap().sweep(now);
        if evicted > 0 {
            warn!("{evicted} pending writes expired without settling");
        }
        for session_id in self.state.pending_creations.lock().unwrap().sweep(now) {
            warn!("creation guard expired for session {session_id}");
        }
        let expired = self.state.pending_deletions.lock().unwrap().sweep(now);
        for session_id in expired {
            // Accepted tradeoff: past this point a slow remote echo can
            // resurrect the session. Logged, never a crash.
            warn!("deletion guard expired for session {session_id}");
        }
    }

    /// Soft reconnect: cycle the transport, settle, re-subscribe.
    /// Repeated soft failures escalate to nuclear. Returns `true` when
    /// the escalation budget is exhausted (caller stops the loop; the
    /// `ReloadRequired` event has been emitted).
    async fn soft_then_nuclear(
        &mut self,
        snapshot_rx: &mut mpsc::Receiver<Vec<Session>>,
        conn_rx: &mut watch::Receiver<bool>,
    ) -> bool {
        match self.soft_reconnect().await {
            Ok(rx) => {
                self.soft_failures = 0;
                *snapshot_rx = rx;
                return false;
            }
            Err(e) => {
                self.soft_failures += 1;
                warn!(
                    "soft reconnect failed ({} consecutive): {e}",
                    self.soft_failures
                );
            }
        }

        if self.soft_failures < SOFT_FAILURES_BEFORE_NUCLEAR {
            // Pace the retry so a closed snapshot stream cannot spin the
            // loop; the next trigger escalates.
            tokio::time::sleep(self.config.soft_debounce).await;
            if let Ok(rx) = self.remote.subscribe_all().await {
                *snapshot_rx = rx;
            }
            return false;
        }

        match self.nuclear_with_retry().await {
            NuclearResult::Recovered { snapshots, connectivity } => {
                *snapshot_rx = snapshots;
                *conn_rx = connectivity;
                false
            }
            NuclearResult::Escalated => {
                self.emit(SyncEvent::ReloadRequired);
                true
            }
            NuclearResult::Skipped => {
                tokio::time::sleep(self.config.soft_debounce).await;
                false
            }
        }
    }

    async fn soft_reconnect(&mut self) -> SyncResult<mpsc::Receiver<Vec<Session>>> {
        debug!("soft reconnect: cycling transport");
        self.remote.cycle_transport().await?;
        tokio::time::sleep(self.config.soft_settle).await;
        self.remote.subscribe_all().await
    }

    /// Runs nuclear cycles until recovery or budget exhaustion. Two
    /// consecutive failures escalate; a third cycle is never attempted.
    async fn nuclear_with_retry(&mut self) -> NuclearResult {
        loop {
            match self.nuclear_once().await {
                Some(NuclearOutcome::Recovered) => {
                    let Ok(snapshots) = self.remote.subscribe_all().await else {
                        // Recovered connectivity but cannot re-subscribe;
                        // treat as a failed attempt.
                        match self.supervisor.finish_nuclear(false) {
                            NuclearOutcome::Escalate => return NuclearResult::Escalated,
                            _ => continue,
                        }
                    };
                    let connectivity = self.remote.connection_state();
                    self.start_heartbeat();
                    self.emit(SyncEvent::ConnectionChanged(ConnectionStatus::Connected));
                    return NuclearResult::Recovered { snapshots, connectivity };
                }
                Some(NuclearOutcome::Failed) => continue,
                Some(NuclearOutcome::Escalate) => return NuclearResult::Escalated,
                None => return NuclearResult::Skipped,
            }
        }
    }

    /// One nuclear reconnect attempt. Returns `None` when an attempt is
    /// already in flight (the request is ignored, not queued).
    async fn nuclear_once(&mut self) -> Option<NuclearOutcome> {
        if self.supervisor.begin_nuclear().is_err() {
            debug!("nuclear reconnect already in flight, ignoring");
            return None;
        }
        self.emit(SyncEvent::ConnectionChanged(ConnectionStatus::Connecting));

        // Teardown: presence, then heartbeat. The caller already owns
        // (and replaces) the subscription and watchdog.
        self.clear_presence().await;
        self.stop_heartbeat();

        if let Err(e) = self.remote.reset().await {
            error!("client rebuild failed: {e}");
            return Some(self.supervisor.finish_nuclear(false));
        }

        let mut conn_rx = self.remote.connection_state();
        let connected = tokio::time::timeout(self.config.nuclear_connect_timeout, async {
            loop {
                if *conn_rx.borrow_and_update() {
                    return;
                }
                if conn_rx.changed().await.is_err() {
                    // Sender gone mid-rebuild; wait out the timeout.
                    std::future::pending::<()>().await;
                }
            }
        })
        .await
        .is_ok();

        Some(self.supervisor.finish_nuclear(connected))
    }

    // ── Presence ────────────────────────────────────────────────────

    /// Switches the active session, moving presence with it. An unknown
    /// session id is fetched once from the remote store (joining a
    /// session this device has not cached).
    async fn switch_active(&mut self, session_id: Option<SessionId>) {
        self.clear_presence().await;
        self.stop_heartbeat();

        if let Some(id) = &session_id {
            let cached = self.state.local.read().unwrap().session(id).is_some();
            if !cached {
                match self.remote.fetch_once(id).await {
                    Ok(Some(session)) => {
                        self.state.local.write().unwrap().upsert(session);
                        self.emit(SyncEvent::SessionsUpdated);
                    }
                    Ok(None) => warn!("active session {id} not found on remote"),
                    Err(e) => warn!("fetch of session {id} failed: {e}"),
                }
            }
        }

        self.state.local.write().unwrap().set_active(session_id);
        self.start_heartbeat();
    }

    /// Spawns the presence heartbeat for the active session. Idempotent:
    /// an existing heartbeat is stopped first.
    fn start_heartbeat(&mut self) {
        self.stop_heartbeat();
        let Some(session_id) = self.state.local.read().unwrap().active_session_id().cloned()
        else {
            return;
        };

        let remote = Arc::clone(&self.remote);
        let device_id = self.device_id.clone();
        let interval = self.config.heartbeat_interval;
        self.heartbeat = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = remote.heartbeat(&session_id, &device_id).await {
                    debug!("presence heartbeat failed: {e}");
                }
            }
        }));
    }

    fn stop_heartbeat(&mut self) {
        if let Some(handle) = self.heartbeat.take() {
            handle.abort();
        }
    }

    async fn clear_presence(&self) {
        let active = self.state.local.read().unwrap().active_session_id().cloned();
        if let Some(session_id) = active {
            if let Err(e) = self.remote.clear_presence(&session_id, &self.device_id).await {
                debug!("presence cleanup failed: {e}");
            }
        }
    }
}
