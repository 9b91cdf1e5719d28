//! Write coordinator: optimistic applies, pending-write lifecycle,
//! debounced dispatch, deletion guard, and enrichment batch guards.

mod support;

use roomsync_engine::config::SyncConfig;
use roomsync_engine::coordinator::WriteCoordinator;
use roomsync_engine::error::SyncError;
use roomsync_engine::remote::RemoteStore;
use roomsync_engine::state::SyncState;
use roomsync_types::{now_ms, DeviceId, EntityId, EntityPatch, SessionId};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use support::{make_session, InMemoryRemote};

fn make_coordinator(
    remote: &Arc<InMemoryRemote>,
    config: SyncConfig,
) -> (Arc<WriteCoordinator>, Arc<SyncState>) {
    let state = Arc::new(SyncState::new(&config));
    let coordinator = Arc::new(WriteCoordinator::new(
        Arc::clone(remote) as Arc<dyn RemoteStore>,
        Arc::clone(&state),
        config,
        DeviceId::from_string("dev-1"),
    ));
    (coordinator, state)
}

fn patch(field: &str, value: serde_json::Value) -> EntityPatch {
    let mut p = EntityPatch::new();
    p.insert(field.into(), value);
    p
}

/// Seeds one session both remotely and locally, returning its id.
fn seed(remote: &Arc<InMemoryRemote>, state: &Arc<SyncState>, entities: usize) -> SessionId {
    let session = make_session("Day sheet", entities);
    let id = session.id.clone();
    remote.seed(session.clone());
    state.local.write().unwrap().upsert(session);
    id
}

#[tokio::test(start_paused = true)]
async fn optimistic_apply_is_immediate_and_pending_before_dispatch() {
    let remote = Arc::new(InMemoryRemote::new());
    let (coordinator, state) = make_coordinator(&remote, SyncConfig::default());
    let session_id = seed(&remote, &state, 2);
    let g1 = EntityId::from_string("g1");

    coordinator
        .update_entity(&session_id, &g1, patch("hkStatus", json!("cleaned")))
        .unwrap();

    // Read-your-own-write: visible before any network activity.
    {
        let local = state.local.read().unwrap();
        let entity = local.session(&session_id).unwrap().entity(&g1).unwrap();
        assert_eq!(entity.field("hkStatus"), Some(&json!("cleaned")));
        assert!(entity.updated_at.is_some());
    }
    assert!(state.pending_writes.lock().unwrap().contains(&g1));
    assert_eq!(remote.write_fields_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn debouncer_coalesces_burst_into_one_network_call() {
    let remote = Arc::new(InMemoryRemote::new());
    let config = SyncConfig::default();
    let (coordinator, state) = make_coordinator(&remote, config.clone());
    let session_id = seed(&remote, &state, 3);
    let g0 = EntityId::from_string("g0");
    let g1 = EntityId::from_string("g1");

    coordinator
        .update_entity(&session_id, &g0, patch("hkStatus", json!("cleaned")))
        .unwrap();
    coordinator
        .update_entity(&session_id, &g1, patch("notes", json!("do not disturb")))
        .unwrap();
    coordinator
        .update_entity(&session_id, &g1, patch("hkStatus", json!("inspected")))
        .unwrap();

    tokio::time::sleep(config.debounce_window + Duration::from_millis(50)).await;

    assert_eq!(remote.write_fields_calls.load(Ordering::SeqCst), 1);
    let stored = remote.stored_session(&session_id).unwrap();
    assert_eq!(stored.entity(&g0).unwrap().field("hkStatus"), Some(&json!("cleaned")));
    assert_eq!(stored.entity(&g1).unwrap().field("notes"), Some(&json!("do not disturb")));
    assert_eq!(stored.entity(&g1).unwrap().field("hkStatus"), Some(&json!("inspected")));
}

#[tokio::test(start_paused = true)]
async fn pending_entry_settles_after_grace_delay() {
    let remote = Arc::new(InMemoryRemote::new());
    let config = SyncConfig::default();
    let (coordinator, state) = make_coordinator(&remote, config.clone());
    let session_id = seed(&remote, &state, 1);
    let g0 = EntityId::from_string("g0");

    coordinator
        .update_entity(&session_id, &g0, patch("hkStatus", json!("cleaned")))
        .unwrap();

    // Flush has happened, grace has not elapsed: still protected.
    tokio::time::sleep(config.debounce_window + Duration::from_millis(50)).await;
    assert_eq!(remote.write_fields_calls.load(Ordering::SeqCst), 1);
    assert!(state.pending_writes.lock().unwrap().contains(&g0));

    tokio::time::sleep(config.write_grace + Duration::from_millis(50)).await;
    assert!(!state.pending_writes.lock().unwrap().contains(&g0));
}

#[tokio::test(start_paused = true)]
async fn failed_atomic_write_still_settles_and_never_errors() {
    let remote = Arc::new(InMemoryRemote::new());
    remote.fail_writes.store(true, Ordering::SeqCst);
    let config = SyncConfig::default();
    let (coordinator, state) = make_coordinator(&remote, config.clone());
    let session_id = seed(&remote, &state, 1);
    let g0 = EntityId::from_string("g0");

    // Transient failure is not surfaced to the caller.
    coordinator
        .update_entity(&session_id, &g0, patch("hkStatus", json!("cleaned")))
        .unwrap();

    tokio::time::sleep(config.debounce_window + config.write_grace + Duration::from_millis(100))
        .await;
    assert!(
        !state.pending_writes.lock().unwrap().contains(&g0),
        "pending set must never stay populated after settle"
    );
}

#[tokio::test(start_paused = true)]
async fn newer_write_keeps_protection_when_older_settles() {
    let remote = Arc::new(InMemoryRemote::new());
    let config = SyncConfig::default();
    let (coordinator, state) = make_coordinator(&remote, config.clone());
    let session_id = seed(&remote, &state, 1);
    let g0 = EntityId::from_string("g0");

    coordinator
        .update_entity(&session_id, &g0, patch("hkStatus", json!("cleaned")))
        .unwrap();
    // First burst flushes...
    tokio::time::sleep(config.debounce_window + Duration::from_millis(50)).await;
    // ...and during its grace window a newer write arrives.
    coordinator
        .update_entity(&session_id, &g0, patch("hkStatus", json!("inspected")))
        .unwrap();
    // The first write's settle fires now; it must not strip the newer
    // write's pending entry.
    tokio::time::sleep(config.write_grace).await;
    assert!(state.pending_writes.lock().unwrap().contains(&g0));
}

#[tokio::test(start_paused = true)]
async fn audit_trail_records_old_and_new_values() {
    let remote = Arc::new(InMemoryRemote::new());
    let (coordinator, state) = make_coordinator(&remote, SyncConfig::default());
    let session_id = seed(&remote, &state, 1);
    let g0 = EntityId::from_string("g0");

    coordinator
        .update_entity(&session_id, &g0, patch("hkStatus", json!("cleaned")))
        .unwrap();

    let trail = state.audit_trail();
    assert_eq!(trail.len(), 1);
    let entry = &trail[0];
    assert_eq!(entry.field, "hkStatus");
    assert_eq!(entry.old_value, Some(json!("pending")));
    assert_eq!(entry.new_value, json!("cleaned"));
    assert_eq!(entry.actor, DeviceId::from_string("dev-1"));
}

#[tokio::test(start_paused = true)]
async fn noop_patch_is_dropped_entirely() {
    let remote = Arc::new(InMemoryRemote::new());
    let config = SyncConfig::default();
    let (coordinator, state) = make_coordinator(&remote, config.clone());
    let session_id = seed(&remote, &state, 1);
    let g0 = EntityId::from_string("g0");

    coordinator
        .update_entity(&session_id, &g0, patch("hkStatus", json!("pending")))
        .unwrap();

    assert!(state.pending_writes.lock().unwrap().is_empty());
    assert!(state.audit_trail().is_empty());
    tokio::time::sleep(config.debounce_window * 2).await;
    assert_eq!(remote.write_fields_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn structural_write_propagates_stale_rejection() {
    let remote = Arc::new(InMemoryRemote::new());
    let (coordinator, state) = make_coordinator(&remote, SyncConfig::default());

    let mut session = make_session("Day sheet", 1);
    let session_id = session.id.clone();
    state.local.write().unwrap().upsert(session.clone());
    // Remote copy is newer than anything we can stamp locally.
    session.last_modified = now_ms() + 60_000;
    remote.seed(session);

    let err = coordinator.lock_session(&session_id).await.unwrap_err();
    assert!(matches!(err, SyncError::StaleWrite(id) if id == session_id));
}

#[tokio::test(start_paused = true)]
async fn lock_and_verify_round_trip_to_remote() {
    let remote = Arc::new(InMemoryRemote::new());
    let (coordinator, state) = make_coordinator(&remote, SyncConfig::default());
    let session_id = seed(&remote, &state, 1);

    coordinator.lock_session(&session_id).await.unwrap();
    let stored = remote.stored_session(&session_id).unwrap();
    assert!(stored.is_locked());
    assert_eq!(stored.locked_by, Some(DeviceId::from_string("dev-1")));

    coordinator.verify_session(&session_id).await.unwrap();
    coordinator.unlock_session(&session_id).await.unwrap();
    let stored = remote.stored_session(&session_id).unwrap();
    assert!(!stored.is_locked());
    assert!(stored.verified_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn delete_removes_locally_and_guards_until_grace_elapses() {
    let remote = Arc::new(InMemoryRemote::new());
    let config = SyncConfig::default();
    let (coordinator, state) = make_coordinator(&remote, config.clone());
    let session_id = seed(&remote, &state, 1);

    coordinator.delete_session(&session_id).unwrap();

    assert!(state.local.read().unwrap().session(&session_id).is_none());
    assert!(state.pending_deletions.lock().unwrap().contains(&session_id));

    tokio::time::sleep(config.deletion_grace + Duration::from_millis(100)).await;
    assert!(remote.stored_session(&session_id).is_none());
    assert!(!state.pending_deletions.lock().unwrap().contains(&session_id));
}

#[tokio::test(start_paused = true)]
async fn failed_delete_still_clears_guard_after_grace() {
    let remote = Arc::new(InMemoryRemote::new());
    remote.fail_deletes.store(true, Ordering::SeqCst);
    let config = SyncConfig::default();
    let (coordinator, state) = make_coordinator(&remote, config.clone());
    let session_id = seed(&remote, &state, 1);

    coordinator.delete_session(&session_id).unwrap();
    tokio::time::sleep(config.deletion_grace + Duration::from_millis(100)).await;
    assert!(!state.pending_deletions.lock().unwrap().contains(&session_id));
}

#[tokio::test(start_paused = true)]
async fn refinement_count_mismatch_rejects_whole_batch() {
    // 1 result for a 2-entity batch.
    let remote = Arc::new(InMemoryRemote::new());
    let (coordinator, state) = make_coordinator(&remote, SyncConfig::default());
    let session_id = seed(&remote, &state, 2);
    let ids = vec![EntityId::from_string("g0"), EntityId::from_string("g1")];

    let err = coordinator
        .apply_refinements(&session_id, &ids, vec![patch("notes", json!("vip"))])
        .unwrap_err();
    assert!(matches!(
        err,
        SyncError::RefinementCountMismatch { expected: 2, got: 1 }
    ));

    // Nothing applied, nothing pending.
    assert!(state.pending_writes.lock().unwrap().is_empty());
    assert!(state.audit_trail().is_empty());
}

#[tokio::test(start_paused = true)]
async fn uncorroborated_refinements_are_discarded_field_by_field() {
    let remote = Arc::new(InMemoryRemote::new());
    let (coordinator, state) = make_coordinator(&remote, SyncConfig::default());
    let session_id = seed(&remote, &state, 1);
    let g0 = EntityId::from_string("g0");

    // source_text for g0 contains "vip" but not "penthouse".
    let mut refinement = EntityPatch::new();
    refinement.insert("notes".into(), json!("vip"));
    refinement.insert("roomType".into(), json!("penthouse"));
    refinement.insert("nights".into(), json!(3));

    let applied = coordinator
        .apply_refinements(&session_id, &[g0.clone()], vec![refinement])
        .unwrap();
    assert_eq!(applied, 1);

    let local = state.local.read().unwrap();
    let entity = local.session(&session_id).unwrap().entity(&g0).unwrap();
    assert_eq!(entity.field("notes"), Some(&json!("vip")));
    assert_eq!(entity.field("roomType"), None, "fabricated value must be dropped");
    assert_eq!(entity.field("nights"), Some(&json!(3)));
}
