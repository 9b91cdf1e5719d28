//! Write coordinator.
//!
//! Accepts mutation intents from the presentation layer and turns them
//! into remote writes:
//! - **Atomic field patches** (status toggles, short notes) apply to the
//!   local store immediately, mark the entity pending *before* the
//!   network call, and go out through a per-session debouncer that
//!   coalesces a burst of edits into one network call.
//! - **Full-session replaces** (entity add/remove, imports, lock/unlock,
//!   verification stamps) go out directly; their errors propagate to the
//!   caller, which may retry explicitly.
//!
//! Transient atomic-write failures are logged and never surfaced: the
//! entity stays pending until its grace window, after which the next
//! remote snapshot reconciles state (retry-by-resync).

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::remote::RemoteStore;
use crate::state::{SyncState, WriteGeneration};
use roomsync_types::{
    now_ms, AuditEntry, DeviceId, Entity, EntityId, EntityPatch, Session, SessionId,
};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Buffered patches for one session awaiting a debounce flush.
#[derive(Default)]
struct SessionBuffer {
    /// Merged per-entity patches; a later edit to the same field within
    /// the window overwrites the earlier one.
    patches: BTreeMap<EntityId, EntityPatch>,
    /// Latest pending-write generation per entity, presented on settle.
    generations: BTreeMap<EntityId, WriteGeneration>,
    /// Whether a flush task is already armed for this session.
    armed: bool,
}

/// Coordinates optimistic local applies, pending-write tracking,
/// debounced dispatch, and the deletion guard.
pub struct WriteCoordinator {
    remote: Arc<dyn RemoteStore>,
    state: Arc<SyncState>,
    config: SyncConfig,
    device_id: DeviceId,
    debounce: Mutex<HashMap<SessionId, SessionBuffer>>,
}

impl WriteCoordinator {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        state: Arc<SyncState>,
        config: SyncConfig,
        device_id: DeviceId,
    ) -> Self {
        Self {
            remote,
            state,
            config,
            device_id,
            debounce: Mutex::new(HashMap::new()),
        }
    }

    // ── Atomic field patches ────────────────────────────────────────

    /// Applies a field patch optimistically and schedules the remote
    /// write. Read-your-own-write holds the moment this returns.
    pub fn update_entity(
        self: &Arc<Self>,
        session_id: &SessionId,
        entity_id: &EntityId,
        patch: EntityPatch,
    ) -> SyncResult<()> {
        let now = now_ms();

        let (changed, generation) = {
            let mut local = self.state.local.write().unwrap();
            let session = local
                .session_mut(session_id)
                .ok_or_else(|| SyncError::SessionNotFound(session_id.clone()))?;
            let entity = session
                .entity_mut(entity_id)
                .ok_or_else(|| SyncError::EntityNotFound {
                    session: session_id.clone(),
                    entity: entity_id.clone(),
                })?;
            let changed = entity.apply_patch(&patch);
            if changed.is_empty() {
                return Ok(());
            }
            entity.updated_at = Some(now);
            entity.updated_by = Some(self.device_id.clone());
            session.touch(now);
            // The pending entry goes in while the local write lock is
            // still held: a merge running against the store can never
            // observe the new value without its protection.
            let generation = self
                .state
                .pending_writes
                .lock()
                .unwrap()
                .insert(entity_id.clone(), self.config.pending_write_max);
            (changed, generation)
        };

        self.state.record_audit(changed.iter().map(|(field, old)| AuditEntry {
            session_id: session_id.clone(),
            entity_id: entity_id.clone(),
            field: field.clone(),
            old_value: old.clone(),
            new_value: patch.get(field).cloned().unwrap_or(Value::Null),
            actor: self.device_id.clone(),
            at: now,
        }));

        self.buffer_patch(session_id, entity_id, patch, generation);
        Ok(())
    }

    fn buffer_patch(
        self: &Arc<Self>,
        session_id: &SessionId,
        entity_id: &EntityId,
        patch: EntityPatch,
        generation: WriteGeneration,
    ) {
        let mut debounce = self.debounce.lock().unwrap();
        let buffer = debounce.entry(session_id.clone()).or_default();
        buffer
            .patches
            .entry(entity_id.clone())
            .or_default()
            .extend(patch);
        buffer.generations.insert(entity_id.clone(), generation);

        if !buffer.armed {
            buffer.armed = true;
            let coordinator = Arc::clone(self);
            let session_id = session_id.clone();
            let window = self.config.debounce_window;
            tokio::spawn(async move {
                tokio::time::sleep(window).await;
                coordinator.flush_session(&session_id).await;
            });
        }
    }

    /// Takes the buffered burst for one session and issues it as a
    /// single network call, then settles the pending entries after the
    /// grace delay.
    async fn flush_session(self: &Arc<Self>, session_id: &SessionId) {
        let (patches, generations) = {
            let mut debounce = self.debounce.lock().unwrap();
            let Some(buffer) = debounce.get_mut(session_id) else {
                return;
            };
            buffer.armed = false;
            (
                std::mem::take(&mut buffer.patches),
                std::mem::take(&mut buffer.generations),
            )
        };
        if patches.is_empty() {
            return;
        }

        let entity_count = patches.len();
        match self.remote.write_fields(session_id, patches).await {
            Ok(()) => {
                debug!("flushed patches for {entity_count} entities in session {session_id}");
            }
            Err(e) => {
                // Not retried here: the entity stays pending until its
                // grace window, then the next snapshot reconciles state.
                warn!("atomic write failed for session {session_id}: {e}");
            }
        }

        tokio::time::sleep(self.config.write_grace).await;

        let mut pending = self.state.pending_writes.lock().unwrap();
        for (entity_id, generation) in generations {
            pending.settle(&entity_id, generation);
        }
    }

    // ── Structural writes ───────────────────────────────────────────

    /// Creates a brand-new session. `force` is implied: no prior remote
    /// state can conflict.
    pub async fn create_session(
        self: &Arc<Self>,
        label: impl Into<String>,
        date: chrono::NaiveDate,
    ) -> SyncResult<SessionId> {
        let session = Session::new(label, date);
        let id = session.id.clone();
        self.write_new_session(session).await?;
        info!("created session {id}");
        Ok(id)
    }

    /// Imports a complete session produced by the ingestion pipeline.
    pub async fn import_session(self: &Arc<Self>, session: Session) -> SyncResult<()> {
        self.write_new_session(session).await
    }

    /// Upserts a new session locally, shielded by the creation guard so
    /// a snapshot queued before the remote write (which does not yet
    /// list the session) cannot drop it from the local store. The guard
    /// clears after the write settles plus a grace delay; on a failed
    /// write it clears at once and the next merge removes the session.
    async fn write_new_session(self: &Arc<Self>, session: Session) -> SyncResult<()> {
        let id = session.id.clone();
        self.state
            .pending_creations
            .lock()
            .unwrap()
            .insert(id.clone(), self.config.pending_write_max);
        self.state.local.write().unwrap().upsert(session.clone());

        if let Err(e) = self.remote.write_session(&session, true).await {
            self.state.pending_creations.lock().unwrap().remove(&id);
            return Err(e);
        }

        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(coordinator.config.write_grace).await;
            coordinator
                .state
                .pending_creations
                .lock()
                .unwrap()
                .remove(&id);
        });
        Ok(())
    }

    /// Adds an entity to a session (structural, guarded replace).
    pub async fn add_entity(&self, session_id: &SessionId, entity: Entity) -> SyncResult<()> {
        self.replace_session(session_id, |session, _now| {
            session.upsert_entity(entity);
        })
        .await
    }

    /// Removes an entity from a session (structural, guarded replace).
    pub async fn remove_entity(
        &self,
        session_id: &SessionId,
        entity_id: &EntityId,
    ) -> SyncResult<()> {
        let entity_id = entity_id.clone();
        self.replace_session(session_id, move |session, _now| {
            session.remove_entity(&entity_id);
        })
        .await
    }

    pub async fn lock_session(&self, session_id: &SessionId) -> SyncResult<()> {
        let device = self.device_id.clone();
        self.replace_session(session_id, move |session, now| {
            session.locked_at = Some(now);
            session.locked_by = Some(device);
        })
        .await
    }

    pub async fn unlock_session(&self, session_id: &SessionId) -> SyncResult<()> {
        self.replace_session(session_id, |session, _now| {
            session.locked_at = None;
            session.locked_by = None;
        })
        .await
    }

    pub async fn verify_session(&self, session_id: &SessionId) -> SyncResult<()> {
        let device = self.device_id.clone();
        self.replace_session(session_id, move |session, now| {
            session.verified_at = Some(now);
            session.verified_by = Some(device);
        })
        .await
    }

    /// Applies a structural mutation locally then replaces the remote
    /// copy with the last-write-wins guard. Errors propagate: structural
    /// retries are the caller's decision.
    async fn replace_session(
        &self,
        session_id: &SessionId,
        mutate: impl FnOnce(&mut Session, i64),
    ) -> SyncResult<()> {
        let now = now_ms();
        let session = {
            let mut local = self.state.local.write().unwrap();
            let session = local
                .session_mut(session_id)
                .ok_or_else(|| SyncError::SessionNotFound(session_id.clone()))?;
            mutate(session, now);
            session.touch(now);
            session.clone()
        };
        self.remote.write_session(&session, false).await
    }

    // ── Deletion guard ──────────────────────────────────────────────

    /// Deletes a session: removed from local state synchronously, held
    /// in the pending-deletion set so a slow remote echo cannot
    /// resurrect it, then deleted remotely. The entry clears after the
    /// delete settles (either way) plus a safety delay; the engine's
    /// sweep expires it if the delete never completes.
    pub fn delete_session(self: &Arc<Self>, session_id: &SessionId) -> SyncResult<()> {
        let removed = self.state.local.write().unwrap().remove(session_id);
        if removed.is_none() {
            return Err(SyncError::SessionNotFound(session_id.clone()));
        }

        self.state
            .pending_deletions
            .lock()
            .unwrap()
            .insert(session_id.clone(), self.config.deletion_timeout);

        let coordinator = Arc::clone(self);
        let session_id = session_id.clone();
        tokio::spawn(async move {
            if let Err(e) = coordinator.remote.delete_session(&session_id).await {
                warn!("remote delete failed for session {session_id}: {e}");
            }
            tokio::time::sleep(coordinator.config.deletion_grace).await;
            coordinator
                .state
                .pending_deletions
                .lock()
                .unwrap()
                .remove(&session_id);
            debug!("deletion guard cleared for session {session_id}");
        });

        Ok(())
    }

    // ── Batch enrichment ────────────────────────────────────────────

    /// Applies a batch of field refinements from the enrichment service.
    ///
    /// The service must return exactly one refinement per input entity,
    /// order-preserving; a count mismatch discards the entire batch
    /// rather than risking a misaligned partial apply. Refined string
    /// values that cannot be corroborated against the entity's source
    /// text are dropped field-by-field (anti-fabrication guard).
    ///
    /// Returns the number of entities actually patched.
    pub fn apply_refinements(
        self: &Arc<Self>,
        session_id: &SessionId,
        entity_ids: &[EntityId],
        refinements: Vec<EntityPatch>,
    ) -> SyncResult<usize> {
        if refinements.len() != entity_ids.len() {
            return Err(SyncError::RefinementCountMismatch {
                expected: entity_ids.len(),
                got: refinements.len(),
            });
        }

        let mut applied = 0;
        for (entity_id, refinement) in entity_ids.iter().zip(refinements) {
            let source_text = {
                let local = self.state.local.read().unwrap();
                local
                    .session(session_id)
                    .and_then(|s| s.entity(entity_id))
                    .and_then(|e| e.source_text.clone())
            };

            let vetted = vet_refinement(refinement, source_text.as_deref());
            if vetted.is_empty() {
                continue;
            }
            self.update_entity(session_id, entity_id, vetted)?;
            applied += 1;
        }

        info!("applied refinements to {applied}/{} entities", entity_ids.len());
        Ok(applied)
    }

    /// Count of writes still awaiting confirmation (for status surfaces).
    pub fn pending_write_count(&self) -> usize {
        self.state.pending_writes.lock().unwrap().len()
    }
}

/// Keeps only refined string values corroborated by the source text
/// (case-insensitive containment). Non-string values pass through: they
/// are derived counters, not free text the service could fabricate.
fn vet_refinement(refinement: EntityPatch, source_text: Option<&str>) -> EntityPatch {
    let Some(source) = source_text else {
        // Nothing to corroborate against: reject free text entirely.
        return refinement
            .into_iter()
            .filter(|(_, v)| !v.is_string())
            .collect();
    };
    let source_lower = source.to_lowercase();

    refinement
        .into_iter()
        .filter(|(field, value)| match value.as_str() {
            Some(text) => {
                let ok = source_lower.contains(&text.to_lowercase());
                if !ok {
                    debug!("discarding uncorroborated refinement for field {field}");
                }
                ok
            }
            None => true,
        })
        .collect()
}
