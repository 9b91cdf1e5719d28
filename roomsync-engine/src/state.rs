//! Engine-owned mutable state.
//!
//! One explicit [`SyncState`] object replaces what would otherwise be a
//! scatter of module-level mutable refs: the local session list, both
//! pending sets, and the audit trail. It is shared between the engine
//! loop (reconciler) and the write coordinator; nothing else mutates it.

use crate::config::SyncConfig;
use roomsync_types::{AuditEntry, EntityId, Session, SessionId};
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::{Mutex, RwLock};
use tokio::time::Instant;

/// The in-memory session list the presentation layer reads.
#[derive(Debug, Default)]
pub struct LocalStore {
    sessions: Vec<Session>,
    active: Option<SessionId>,
}

impl LocalStore {
    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    pub fn session(&self, id: &SessionId) -> Option<&Session> {
        self.sessions.iter().find(|s| &s.id == id)
    }

    pub fn session_mut(&mut self, id: &SessionId) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|s| &s.id == id)
    }

    /// Replaces the entire session list with a merge output.
    pub fn replace_all(&mut self, sessions: Vec<Session>) {
        self.sessions = sessions;
    }

    pub fn upsert(&mut self, session: Session) {
        match self.session_mut(&session.id) {
            Some(slot) => *slot = session,
            None => self.sessions.push(session),
        }
    }

    pub fn remove(&mut self, id: &SessionId) -> Option<Session> {
        let idx = self.sessions.iter().position(|s| &s.id == id)?;
        if self.active.as_ref() == Some(id) {
            self.active = None;
        }
        Some(self.sessions.remove(idx))
    }

    pub fn active_session(&self) -> Option<&Session> {
        self.active.as_ref().and_then(|id| self.session(id))
    }

    pub fn active_session_id(&self) -> Option<&SessionId> {
        self.active.as_ref()
    }

    pub fn set_active(&mut self, id: Option<SessionId>) {
        self.active = id;
    }
}

/// Token identifying one outbound write. A later write to the same
/// entity supersedes the earlier one; the earlier settle must not strip
/// protection from the newer write.
pub type WriteGeneration = u64;

#[derive(Debug)]
struct PendingWrite {
    generation: WriteGeneration,
    expires_at: Instant,
}

/// Entities with an unconfirmed outbound write.
///
/// Entries are added synchronously before the network call and removed
/// by [`settle`](Self::settle) after the write's promise settles plus a
/// grace delay, never immediately, so the remote echo of that very
/// write is not mistaken for a stale snapshot. [`sweep`](Self::sweep)
/// enforces the hard lifetime cap for writes that never settle.
#[derive(Debug, Default)]
pub struct PendingWriteSet {
    entries: HashMap<EntityId, PendingWrite>,
    next_generation: WriteGeneration,
}

impl PendingWriteSet {
    /// Marks an entity pending, returning the generation token the
    /// eventual settle must present.
    pub fn insert(&mut self, entity_id: EntityId, max_lifetime: std::time::Duration) -> WriteGeneration {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.entries.insert(
            entity_id,
            PendingWrite {
                generation,
                expires_at: Instant::now() + max_lifetime,
            },
        );
        generation
    }

    /// Removes the entry if (and only if) it still belongs to the given
    /// generation. A newer write keeps its protection.
    pub fn settle(&mut self, entity_id: &EntityId, generation: WriteGeneration) -> bool {
        match self.entries.get(entity_id) {
            Some(entry) if entry.generation == generation => {
                self.entries.remove(entity_id);
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, entity_id: &EntityId) -> bool {
        self.entries.contains_key(entity_id)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Drops entries past their hard lifetime cap, returning how many
    /// were evicted.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before - self.entries.len()
    }
}

/// Sessions mid-deletion. A session in this set is excluded from every
/// merge output regardless of what the remote snapshot contains.
#[derive(Debug, Default)]
pub struct PendingDeletionSet {
    entries: HashMap<SessionId, Instant>,
}

impl PendingDeletionSet {
    pub fn insert(&mut self, session_id: SessionId, timeout: std::time::Duration) {
        self.entries.insert(session_id, Instant::now() + timeout);
    }

    pub fn remove(&mut self, session_id: &SessionId) -> bool {
        self.entries.remove(session_id).is_some()
    }

    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.entries.contains_key(session_id)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Expires timed-out entries. Each eviction is an accepted
    /// rare-resurrection risk; callers log it.
    pub fn sweep(&mut self, now: Instant) -> Vec<SessionId> {
        let expired: Vec<SessionId> = self
            .entries
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.entries.remove(id);
        }
        expired
    }
}

/// Sessions mid-creation: written locally but whose remote write has not
/// settled. The merge retains them even when a snapshot (queued before
/// the create) does not list them yet.
#[derive(Debug, Default)]
pub struct PendingCreationSet {
    entries: HashMap<SessionId, Instant>,
}

impl PendingCreationSet {
    pub fn insert(&mut self, session_id: SessionId, timeout: std::time::Duration) {
        self.entries.insert(session_id, Instant::now() + timeout);
    }

    pub fn remove(&mut self, session_id: &SessionId) -> bool {
        self.entries.remove(session_id).is_some()
    }

    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.entries.contains_key(session_id)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Expires entries whose remote write never settled.
    pub fn sweep(&mut self, now: Instant) -> Vec<SessionId> {
        let expired: Vec<SessionId> = self
            .entries
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.entries.remove(id);
        }
        expired
    }
}

/// Shared engine state: local store, pending sets, audit trail.
///
/// Lock discipline: every lock here guards a short synchronous section;
/// none is ever held across an await point. Nesting order is `local`
/// first, then the pending sets; no path acquires `local` while holding
/// a pending-set lock.
pub struct SyncState {
    pub local: RwLock<LocalStore>,
    pub pending_writes: Mutex<PendingWriteSet>,
    pub pending_deletions: Mutex<PendingDeletionSet>,
    pub pending_creations: Mutex<PendingCreationSet>,
    audit: Mutex<VecDeque<AuditEntry>>,
    audit_capacity: usize,
}

impl SyncState {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            local: RwLock::new(LocalStore::default()),
            pending_writes: Mutex::new(PendingWriteSet::default()),
            pending_deletions: Mutex::new(PendingDeletionSet::default()),
            pending_creations: Mutex::new(PendingCreationSet::default()),
            audit: Mutex::new(VecDeque::new()),
            audit_capacity: config.audit_capacity,
        }
    }

    /// Appends audit entries, dropping the oldest past capacity.
    pub fn record_audit(&self, entries: impl IntoIterator<Item = AuditEntry>) {
        let mut audit = self.audit.lock().unwrap();
        for entry in entries {
            if audit.len() == self.audit_capacity {
                audit.pop_front();
            }
            audit.push_back(entry);
        }
    }

    /// Snapshot of the audit trail, oldest first.
    pub fn audit_trail(&self) -> Vec<AuditEntry> {
        self.audit.lock().unwrap().iter().cloned().collect()
    }
}
