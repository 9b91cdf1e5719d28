//! Merge engine.
//!
//! Combines an incoming remote snapshot with current local state,
//! honoring in-flight pending writes and pending deletions. This is the
//! deterministic core: pure, synchronous, no awaits, output fully
//! determined by its inputs.
//!
//! # Algorithm
//!
//! 1. Drop remote sessions that are mid-deletion locally.
//! 2. With no pending writes, the filtered snapshot becomes local state
//!    verbatim (fast path).
//! 3. Otherwise merge per entity: an entity with an unconfirmed outbound
//!    write keeps its local value, everything else takes the remote
//!    value. Sessions present only remotely are added as-is; sessions
//!    present only locally are dropped (the remote store is
//!    authoritative for everything not pending).
//! 4. Local sessions mid-creation are retained even when the snapshot
//!    does not list them yet (it may have been queued before the
//!    creating write).
//!
//! Remote-wins keeps an unbounded fleet of idle devices convergent
//! without field-level vector clocks. The pending exception exists
//! solely to defeat the self-echo race: a device's own just-committed
//! write arriving back through its own subscription before the write's
//! promise resolves, carrying what looks like (but is not) a conflicting
//! value.

use crate::state::{PendingCreationSet, PendingDeletionSet, PendingWriteSet};
use roomsync_types::Session;

/// Merges a remote snapshot against local state and the pending sets,
/// producing the new local session list.
pub fn merge(
    local: &[Session],
    remote: Vec<Session>,
    pending_writes: &PendingWriteSet,
    pending_deletions: &PendingDeletionSet,
    pending_creations: &PendingCreationSet,
) -> Vec<Session> {
    let mut filtered: Vec<Session> = remote
        .into_iter()
        .filter(|session| !pending_deletions.contains(&session.id))
        .collect();

    if !pending_writes.is_empty() {
        for remote_session in &mut filtered {
            let Some(local_session) = local.iter().find(|s| s.id == remote_session.id) else {
                continue;
            };
            merge_entities(remote_session, local_session, pending_writes);
        }
    }

    if !pending_creations.is_empty() {
        for local_session in local {
            if pending_creations.contains(&local_session.id)
                && !filtered.iter().any(|s| s.id == local_session.id)
            {
                filtered.push(local_session.clone());
            }
        }
    }

    filtered
}

/// Per-entity merge for one session. Remote order and values win, except
/// entities with an unconfirmed outbound write keep their local value.
/// Pending entities the remote copy lacks entirely are retained from the
/// local copy (appended), so an in-flight write cannot be erased by a
/// stale echo that predates the entity.
fn merge_entities(remote: &mut Session, local: &Session, pending_writes: &PendingWriteSet) {
    for entity in &mut remote.entities {
        if !pending_writes.contains(&entity.id) {
            continue;
        }
        if let Some(local_entity) = local.entity(&entity.id) {
            *entity = local_entity.clone();
        }
    }

    for local_entity in &local.entities {
        if pending_writes.contains(&local_entity.id)
            && remote.entity(&local_entity.id).is_none()
        {
            remote.entities.push(local_entity.clone());
        }
    }
}
