// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

#![allow(clippy::unwrap_used)]

use super::*;
use crate::resolve::Strategy;
use serde_json::json;
use tempfile::TempDir;

fn key(id: &str) -> ResourceKey {
    ResourceKey::new("org-1", "knowledge", id)
}

fn enqueue(db: &Database, id: &str, now: i64) -> i64 {
    let key = key(id);
    let payload = json!({"id": id});
    let clock: VectorClock = [("did:a", 1u64)].into_iter().collect();
    db.insert_queue_item(
        &NewQueueItem {
            key: &key,
            action: Action::Create,
            payload: &payload,
            version: 1,
            vector_clock: &clock,
        },
        now,
    )
    .unwrap()
}

fn open_conflict(db: &Database, id: &str) -> i64 {
    db.insert_conflict(
        &NewConflict {
            key: key(id),
            local: ConflictSide::known(Some(json!(1)), VectorClock::new(), 1),
            remote: ConflictSide::known(None, VectorClock::new(), 2),
            remote_author: Some("did:b".to_string()),
            strategy: Strategy::Manual,
            resolution: None,
            resolved_by: None,
        },
        10,
    )
    .unwrap()
}

#[test]
fn open_creates_file_and_parent_dirs() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("sync.db");

    let db = Database::open(&path).unwrap();
    db.put_resource(&key("k"), &json!({}), false, 1).unwrap();
    drop(db);

    let db = Database::open(&path).unwrap();
    assert!(db.get_resource(&key("k")).unwrap().is_some());
}

#[test]
fn migrations_are_idempotent() {
    let db = Database::open_in_memory().unwrap();
    run_migrations(&db.conn).unwrap();
    run_migrations(&db.conn).unwrap();
}

#[test]
fn sync_state_upsert_replaces_row() {
    let db = Database::open_in_memory().unwrap();
    let mut state = SyncState::new(&key("k"), 10);
    db.put_sync_state(&state).unwrap();

    state.local_version = 4;
    state.vector_clock.increment("did:a");
    state.status = SyncStatus::Conflict;
    db.put_sync_state(&state).unwrap();

    assert_eq!(db.get_sync_state(&key("k")).unwrap(), Some(state));
    assert_eq!(db.count_sync_status("org-1", SyncStatus::Conflict).unwrap(), 1);
}

#[test]
fn version_below_one_violates_schema() {
    let db = Database::open_in_memory().unwrap();
    let mut state = SyncState::new(&key("k"), 10);
    state.local_version = 0;
    assert!(matches!(db.put_sync_state(&state), Err(Error::Database(_))));
}

#[test]
fn mark_synced_skips_newer_local_version() {
    let db = Database::open_in_memory().unwrap();
    let mut state = SyncState::new(&key("k"), 10);
    state.local_version = 3;
    db.put_sync_state(&state).unwrap();

    assert!(!db.mark_synced(&key("k"), 2, 20).unwrap());
    assert!(db.mark_synced(&key("k"), 3, 20).unwrap());

    let state = db.get_sync_state(&key("k")).unwrap().unwrap();
    assert_eq!(state.status, SyncStatus::Synced);
    assert_eq!(state.last_synced_at, Some(20));
}

#[test]
fn changed_since_filters_by_type_and_time() {
    let db = Database::open_in_memory().unwrap();
    db.put_sync_state(&SyncState::new(&key("old"), 5)).unwrap();
    db.put_sync_state(&SyncState::new(&key("new"), 15)).unwrap();
    db.put_sync_state(&SyncState::new(&ResourceKey::new("org-1", "members", "m"), 15)).unwrap();
    db.put_sync_state(&SyncState::new(&ResourceKey::new("org-2", "knowledge", "x"), 15)).unwrap();

    let changed = db.changed_since("org-1", &["knowledge".to_string()], 10).unwrap();
    assert_eq!(changed.len(), 1);
    assert_eq!(changed[0].resource_id, "new");

    let both = db
        .changed_since("org-1", &["knowledge".to_string(), "members".to_string()], 0)
        .unwrap();
    assert_eq!(both.len(), 3);
}

#[test]
fn put_resource_returns_content_address() {
    let db = Database::open_in_memory().unwrap();
    let data = json!({"title": "a"});
    let address = db.put_resource(&key("k"), &data, false, 1).unwrap();

    assert_eq!(address.len(), 64);
    assert_eq!(address, content_address(&data));
    assert_ne!(address, content_address(&json!({"title": "b"})));
}

#[test]
fn purge_resource_removes_state() {
    let db = Database::open_in_memory().unwrap();
    db.put_resource(&key("k"), &json!({}), false, 1).unwrap();
    db.put_sync_state(&SyncState::new(&key("k"), 1)).unwrap();

    assert!(db.purge_resource(&key("k")).unwrap());
    assert!(db.get_resource(&key("k")).unwrap().is_none());
    assert!(db.get_sync_state(&key("k")).unwrap().is_none());
    assert!(!db.purge_resource(&key("k")).unwrap());
}

#[test]
fn pending_items_come_back_in_creation_order() {
    let db = Database::open_in_memory().unwrap();
    let c = enqueue(&db, "c", 30);
    let a = enqueue(&db, "a", 10);
    let b = enqueue(&db, "b", 20);

    let items = db.pending_queue_items("org-1", None, 10).unwrap();
    let ids: Vec<i64> = items.iter().map(|i| i.id).collect();
    assert_eq!(ids, vec![a, b, c]);

    let limited = db.pending_queue_items("org-1", None, 2).unwrap();
    assert_eq!(limited.len(), 2);
}

#[test]
fn pending_items_filter_by_type() {
    let db = Database::open_in_memory().unwrap();
    enqueue(&db, "a", 10);
    assert_eq!(db.pending_queue_items("org-1", Some("knowledge"), 10).unwrap().len(), 1);
    assert!(db.pending_queue_items("org-1", Some("members"), 10).unwrap().is_empty());
    assert_eq!(db.count_queue_items("org-1", Some("knowledge"), QueueStatus::Pending).unwrap(), 1);
    assert_eq!(db.count_queue_items("org-1", None, QueueStatus::Pending).unwrap(), 1);
}

#[test]
fn queue_item_round_trips_fields() {
    let db = Database::open_in_memory().unwrap();
    let id = enqueue(&db, "a", 10);
    let item = db.get_queue_item(id).unwrap().unwrap();

    assert_eq!(item.action, Action::Create);
    assert_eq!(item.payload, json!({"id": "a"}));
    assert_eq!(item.vector_clock.get("did:a"), 1);
    assert_eq!(item.retry_count, 0);
    assert_eq!(item.status, QueueStatus::Pending);
}

#[test]
fn mark_in_flight_claims_once() {
    let db = Database::open_in_memory().unwrap();
    let id = enqueue(&db, "a", 10);

    assert!(db.mark_in_flight(id).unwrap());
    assert!(!db.mark_in_flight(id).unwrap());
    assert!(db.pending_queue_items("org-1", None, 10).unwrap().is_empty());

    assert_eq!(db.recover_in_flight().unwrap(), 1);
    assert_eq!(db.pending_queue_items("org-1", None, 10).unwrap().len(), 1);
}

#[test]
fn failure_bookkeeping_fails_past_max() {
    let db = Database::open_in_memory().unwrap();
    let id = enqueue(&db, "a", 10);

    for attempt in 1..=2 {
        db.mark_in_flight(id).unwrap();
        let status = db.record_queue_failure(id, "offline", 2, 10 + attempt).unwrap();
        assert_eq!(status, QueueStatus::Pending);
    }
    db.mark_in_flight(id).unwrap();
    assert_eq!(db.record_queue_failure(id, "offline", 2, 20).unwrap(), QueueStatus::Failed);

    let item = db.get_queue_item(id).unwrap().unwrap();
    assert_eq!(item.retry_count, 3);
    assert_eq!(item.last_retry_at, Some(20));
    assert_eq!(item.last_error.as_deref(), Some("offline"));
    assert_eq!(db.failed_queue_items("org-1").unwrap().len(), 1);

    assert_eq!(db.reset_failed_queue_items("org-1").unwrap(), 1);
    let item = db.get_queue_item(id).unwrap().unwrap();
    assert_eq!(item.status, QueueStatus::Pending);
    assert_eq!(item.retry_count, 0);
}

#[test]
fn remove_queue_item_deletes_row() {
    let db = Database::open_in_memory().unwrap();
    let id = enqueue(&db, "a", 10);
    assert!(db.remove_queue_item(id).unwrap());
    assert!(db.get_queue_item(id).unwrap().is_none());
}

#[test]
fn conflict_round_trips_and_resolves_once() {
    let db = Database::open_in_memory().unwrap();
    let id = open_conflict(&db, "k");

    let conflict = db.get_conflict(id).unwrap();
    assert!(!conflict.resolved);
    assert_eq!(conflict.local.data, Some(json!(1)));
    assert_eq!(conflict.remote.data, None);
    assert_eq!(db.open_conflict_for(&key("k")).unwrap().map(|c| c.id), Some(id));
    assert_eq!(db.count_unresolved_conflicts("org-1", Some("knowledge")).unwrap(), 1);

    db.mark_conflict_resolved(id, Resolution::Local, "alice", 50).unwrap();
    assert!(db.open_conflict_for(&key("k")).unwrap().is_none());
    assert!(matches!(
        db.mark_conflict_resolved(id, Resolution::Remote, "bob", 60),
        Err(Error::ConflictAlreadyResolved(_))
    ));
    assert_eq!(db.conflicts_for(&key("k")).unwrap().len(), 1);
}

#[test]
fn unknown_remote_side_is_filled_in_while_open() {
    let db = Database::open_in_memory().unwrap();
    let id = db
        .insert_conflict(
            &NewConflict {
                key: key("k"),
                local: ConflictSide::known(Some(json!(1)), VectorClock::new(), 1),
                remote: ConflictSide::unknown(VectorClock::new(), 2),
                remote_author: None,
                strategy: Strategy::Manual,
                resolution: None,
                resolved_by: None,
            },
            10,
        )
        .unwrap();
    assert!(!db.get_conflict(id).unwrap().remote.known);

    let remote = ConflictSide::known(Some(json!(2)), VectorClock::new(), 2);
    assert!(db.update_conflict_remote(id, &remote, Some("did:b")).unwrap());

    let conflict = db.get_conflict(id).unwrap();
    assert!(conflict.remote.known);
    assert_eq!(conflict.remote.data, Some(json!(2)));
    assert_eq!(conflict.remote_author.as_deref(), Some("did:b"));

    db.mark_conflict_resolved(id, Resolution::Remote, "alice", 20).unwrap();
    assert!(!db.update_conflict_remote(id, &remote, None).unwrap());
}

#[test]
fn resolving_missing_conflict_is_not_found() {
    let db = Database::open_in_memory().unwrap();
    assert!(matches!(
        db.mark_conflict_resolved(7, Resolution::Local, "alice", 1),
        Err(Error::ConflictNotFound(7))
    ));
}

#[test]
fn applied_changes_dedup() {
    let db = Database::open_in_memory().unwrap();
    assert!(db.record_applied(&key("k"), 2, "did:b", 1).unwrap());
    assert!(!db.record_applied(&key("k"), 2, "did:b", 2).unwrap());
    assert!(db.record_applied(&key("k"), 3, "did:b", 3).unwrap());
    assert!(db.is_applied(&key("k"), 2, "did:b").unwrap());
    assert!(!db.is_applied(&key("k"), 2, "did:c").unwrap());
}

#[test]
fn corrupted_clock_surfaces_as_error() {
    let db = Database::open_in_memory().unwrap();
    db.put_sync_state(&SyncState::new(&key("k"), 1)).unwrap();
    db.conn.execute("UPDATE sync_state SET vector_clock = 'nope'", []).unwrap();
    assert!(db.get_sync_state(&key("k")).is_err());
}

#[test]
fn atomically_rolls_back_on_error() {
    let db = Database::open_in_memory().unwrap();
    let result: Result<()> = db.atomically(|db| {
        db.put_resource(&key("k"), &json!({}), false, 1)?;
        Err(Error::InvalidMessage("abort".to_string()))
    });

    assert!(result.is_err());
    assert!(db.get_resource(&key("k")).unwrap().is_none());
}

#[test]
fn atomically_nests() {
    let db = Database::open_in_memory().unwrap();
    db.atomically(|db| {
        db.put_resource(&key("outer"), &json!({}), false, 1)?;
        let inner: Result<()> = db.atomically(|db| {
            db.put_resource(&key("inner"), &json!({}), false, 1)?;
            Err(Error::InvalidMessage("abort".to_string()))
        });
        assert!(inner.is_err());
        db.atomically(|db| db.put_resource(&key("kept"), &json!({}), false, 1).map(|_| ()))
    })
    .unwrap();

    assert!(db.get_resource(&key("outer")).unwrap().is_some());
    assert!(db.get_resource(&key("inner")).unwrap().is_none());
    assert!(db.get_resource(&key("kept")).unwrap().is_some());
}

#[test]
fn supersede_drops_older_pending_items_only() {
    let db = Database::open_in_memory().unwrap();
    let old = enqueue(&db, "k", 1);
    let in_flight = enqueue(&db, "k", 2);
    db.mark_in_flight(in_flight).unwrap();
    let other = enqueue(&db, "other", 3);

    assert_eq!(db.supersede_queue_items(&key("k"), 5).unwrap(), 1);
    assert!(db.get_queue_item(old).unwrap().is_none());
    assert!(db.get_queue_item(in_flight).unwrap().is_some());
    assert!(db.get_queue_item(other).unwrap().is_some());
}
