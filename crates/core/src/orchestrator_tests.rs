// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

#![allow(clippy::unwrap_used)]

use super::*;
use crate::clock::ManualClock;
use crate::db::Database;
use crate::identity::KeyIdentity;
use crate::model::Resolution;
use crate::transport::{MemoryHub, MemoryTransport};
use serde_json::json;
use std::time::Duration;
use yare::parameterized;

const ORG: &str = "org-1";

struct Device {
    orch: SyncOrchestrator,
    transport: MemoryTransport,
    clock: Arc<ManualClock>,
    db: SharedDatabase,
}

fn device(hub: &MemoryHub, name: &str, config: SyncConfig) -> Device {
    let transport = hub.connect();
    transport.join(ORG);
    let db = Database::open_in_memory().unwrap().shared();
    let clock = Arc::new(ManualClock::new(1_000));
    let orch = SyncOrchestrator::new(
        Arc::clone(&db),
        Arc::new(transport.clone()),
        Arc::new(KeyIdentity::generate(name)),
        clock.clone(),
        config,
    );
    Device { orch, transport, clock, db }
}

fn config(strategy: Strategy) -> SyncConfig {
    SyncConfig {
        retry_base_delay_ms: 0,
        retry_max_delay_ms: 0,
        default_strategy: strategy,
        ..SyncConfig::default()
    }
}

fn pair(strategy: Strategy) -> (Device, Device) {
    let hub = MemoryHub::new();
    (device(&hub, "alice", config(strategy)), device(&hub, "bob", config(strategy)))
}

fn key(id: &str) -> ResourceKey {
    ResourceKey::new(ORG, "knowledge", id)
}

async fn data(d: &Device, key: &ResourceKey) -> Option<serde_json::Value> {
    d.orch.resource(key).await.unwrap().map(|r| r.data)
}

/// A change authored and signed outside any orchestrator.
fn signed(author: &KeyIdentity, key: &ResourceKey, version: i64, clock: &VectorClock, data: serde_json::Value) -> Change {
    let mut change = Change {
        org_id: key.org_id.clone(),
        resource_type: key.resource_type.clone(),
        resource_id: key.resource_id.clone(),
        action: Action::Update,
        data,
        version,
        vector_clock: clock.clone(),
        author_did: String::new(),
        timestamp: 5_000,
        signature: String::new(),
    };
    sign_change(author, &mut change).unwrap();
    change
}

/// Alice creates `k`, delivers it, and both sides end up with `{"v": 0}`.
async fn shared_resource(a: &Device, b: &Device, k: &ResourceKey) {
    a.orch.record_change(k, Action::Create, json!({"v": 0})).await.unwrap();
    assert_eq!(a.orch.drain(ORG).await.unwrap().delivered, 1);
    assert_eq!(data(b, k).await, Some(json!({"v": 0})));
}

// -- local mutations ----------------------------------------------------------

#[tokio::test]
async fn record_change_bumps_version_and_queues() {
    let (a, _b) = pair(Strategy::Manual);
    let k = key("k1");

    let first = a.orch.record_change(&k, Action::Create, json!({"title": "x"})).await.unwrap();
    let second = a.orch.record_change(&k, Action::Update, json!({"title": "y"})).await.unwrap();

    assert_eq!(first.local_version, 1);
    assert_eq!(second.local_version, 2);
    assert_eq!(second.vector_clock.get(a.orch.local_did()), 2);
    assert_eq!(second.status, SyncStatus::Pending);
    assert!(second.content_address.is_some());
    // Offline edits coalesce into the newest version
    assert_eq!(a.orch.queue().pending_count(ORG).await.unwrap(), 1);
    assert_eq!(data(&a, &k).await, Some(json!({"title": "y"})));
}

#[tokio::test]
async fn deleting_unknown_resource_is_not_found() {
    let (a, _b) = pair(Strategy::Manual);
    let err = a.orch.record_change(&key("nope"), Action::Delete, json!(null)).await.unwrap_err();
    assert!(matches!(err, Error::ResourceNotFound(_)));
    assert_eq!(a.orch.queue().pending_count(ORG).await.unwrap(), 0);
}

#[tokio::test]
async fn delete_resource_purges_local_copy() {
    let (a, _b) = pair(Strategy::Manual);
    let k = key("k1");
    a.orch.record_change(&k, Action::Create, json!({})).await.unwrap();

    assert!(a.orch.delete_resource(&k).await.unwrap());
    assert!(a.orch.sync_state(&k).await.unwrap().is_none());
    assert!(a.orch.resource(&k).await.unwrap().is_none());
}

// -- propagation --------------------------------------------------------------

#[tokio::test]
async fn drained_change_is_applied_by_peer() {
    let (a, b) = pair(Strategy::Manual);
    let k = key("k1");
    shared_resource(&a, &b, &k).await;

    let at_a = a.orch.sync_state(&k).await.unwrap().unwrap();
    let at_b = b.orch.sync_state(&k).await.unwrap().unwrap();
    assert_eq!(at_a.status, SyncStatus::Synced);
    assert_eq!(at_b.status, SyncStatus::Synced);
    assert_eq!(at_b.vector_clock, at_a.vector_clock);
    assert_eq!(at_b.remote_version, 1);
    assert_eq!(at_b.content_address, at_a.content_address);
}

#[tokio::test]
async fn newer_version_replaces_older() {
    let (a, b) = pair(Strategy::Manual);
    let k = key("k1");
    shared_resource(&a, &b, &k).await;

    a.orch.record_change(&k, Action::Update, json!({"v": 1})).await.unwrap();
    a.orch.drain(ORG).await.unwrap();

    assert_eq!(data(&b, &k).await, Some(json!({"v": 1})));
    assert_eq!(b.orch.sync_state(&k).await.unwrap().unwrap().local_version, 2);
}

#[tokio::test]
async fn delete_propagates_as_tombstone() {
    let (a, b) = pair(Strategy::Manual);
    let k = key("k1");
    shared_resource(&a, &b, &k).await;

    a.orch.record_change(&k, Action::Delete, json!(null)).await.unwrap();
    a.orch.drain(ORG).await.unwrap();

    assert!(b.orch.resource(&k).await.unwrap().is_none());
    let tombstone = b.db.lock().await.get_resource(&k).unwrap().unwrap();
    assert!(tombstone.deleted);
    assert_eq!(tombstone.data, json!({"v": 0}));
}

#[tokio::test]
async fn undelivered_changes_wait_for_reconnect() {
    let (a, b) = pair(Strategy::Manual);
    let k = key("k1");
    a.transport.set_offline(true);
    a.orch.record_change(&k, Action::Create, json!({"v": 0})).await.unwrap();

    assert_eq!(a.orch.drain(ORG).await.unwrap().retried, 1);
    assert!(data(&b, &k).await.is_none());

    a.transport.set_offline(false);
    assert_eq!(a.orch.drain(ORG).await.unwrap().delivered, 1);
    assert_eq!(data(&b, &k).await, Some(json!({"v": 0})));
}

// -- inbound validation -------------------------------------------------------

#[tokio::test]
async fn tampered_change_is_rejected() {
    let (_a, b) = pair(Strategy::Manual);
    let mallory = KeyIdentity::generate("mallory");
    let k = key("k1");
    let mut clock = VectorClock::new();
    clock.increment(&mallory.did());
    let mut change = signed(&mallory, &k, 1, &clock, json!({"v": 1}));
    change.data = json!({"v": "forged"});

    let err = b.orch.handle_change(change).await.unwrap_err();

    assert!(matches!(err, Error::SignatureVerification { .. }));
    assert!(b.orch.sync_state(&k).await.unwrap().is_none());
    assert!(data(&b, &k).await.is_none());
}

#[tokio::test]
async fn change_signed_by_other_author_is_rejected() {
    let (_a, b) = pair(Strategy::Manual);
    let mallory = KeyIdentity::generate("mallory");
    let victim = KeyIdentity::generate("victim");
    let mut change = signed(&mallory, &key("k1"), 1, &VectorClock::new(), json!({}));
    change.author_did = victim.did();

    assert!(matches!(
        b.orch.handle_change(change).await,
        Err(Error::SignatureVerification { .. })
    ));
}

#[tokio::test]
async fn malformed_change_is_rejected_before_verification() {
    let (_a, b) = pair(Strategy::Manual);
    let carol = KeyIdentity::generate("carol");
    let change = signed(&carol, &key("k1"), 0, &VectorClock::new(), json!({}));

    assert!(matches!(b.orch.handle_change(change).await, Err(Error::InvalidMessage(_))));
}

#[tokio::test]
async fn replayed_change_is_duplicate() {
    let (_a, b) = pair(Strategy::Manual);
    let carol = KeyIdentity::generate("carol");
    let mut clock = VectorClock::new();
    clock.increment(&carol.did());
    let change = signed(&carol, &key("k1"), 1, &clock, json!({"v": 1}));

    assert_eq!(b.orch.handle_change(change.clone()).await.unwrap(), ChangeOutcome::Applied);
    assert_eq!(b.orch.handle_change(change).await.unwrap(), ChangeOutcome::Duplicate);
}

#[tokio::test]
async fn older_change_is_stale() {
    let (_a, b) = pair(Strategy::Manual);
    let carol = KeyIdentity::generate("carol");
    let k = key("k1");
    let mut v1 = VectorClock::new();
    v1.increment(&carol.did());
    let mut v2 = v1.clone();
    v2.increment(&carol.did());

    b.orch.handle_change(signed(&carol, &k, 2, &v2, json!({"v": 2}))).await.unwrap();
    let outcome = b.orch.handle_change(signed(&carol, &k, 1, &v1, json!({"v": 1}))).await.unwrap();

    assert_eq!(outcome, ChangeOutcome::Stale);
    assert_eq!(data(&b, &k).await, Some(json!({"v": 2})));
}

#[tokio::test]
async fn same_clock_from_relay_is_unchanged() {
    let (_a, b) = pair(Strategy::Manual);
    let carol = KeyIdentity::generate("carol");
    let dave = KeyIdentity::generate("dave");
    let k = key("k1");
    let mut clock = VectorClock::new();
    clock.increment(&carol.did());

    b.orch.handle_change(signed(&carol, &k, 1, &clock, json!({"v": 1}))).await.unwrap();
    let outcome = b.orch.handle_change(signed(&dave, &k, 1, &clock, json!({"v": 1}))).await.unwrap();

    assert_eq!(outcome, ChangeOutcome::Unchanged);
}

// -- concurrent edits ---------------------------------------------------------

#[tokio::test]
async fn lww_later_remote_edit_wins() {
    let (a, b) = pair(Strategy::Lww);
    let k = key("k1");
    shared_resource(&a, &b, &k).await;

    b.clock.set(2_000);
    b.orch.record_change(&k, Action::Update, json!({"by": "bob"})).await.unwrap();
    a.clock.set(3_000);
    a.orch.record_change(&k, Action::Update, json!({"by": "alice"})).await.unwrap();
    a.orch.drain(ORG).await.unwrap();

    assert_eq!(data(&b, &k).await, Some(json!({"by": "alice"})));
    let state = b.orch.sync_state(&k).await.unwrap().unwrap();
    assert_eq!(state.status, SyncStatus::Synced);
    // Bob's overwritten edit is no longer sent
    assert_eq!(b.orch.queue().pending_count(ORG).await.unwrap(), 0);

    let conflicts = b.db.lock().await.conflicts_for(&k).unwrap();
    assert_eq!(conflicts.len(), 1);
    assert!(conflicts[0].resolved);
    assert_eq!(conflicts[0].resolution, Some(Resolution::Remote));
    assert!(b.orch.unresolved_conflicts(ORG).await.unwrap().is_empty());
}

#[tokio::test]
async fn lww_older_remote_edit_loses_and_local_converges() {
    let (a, b) = pair(Strategy::Lww);
    let k = key("k1");
    shared_resource(&a, &b, &k).await;

    b.clock.set(2_000);
    b.orch.record_change(&k, Action::Update, json!({"by": "bob"})).await.unwrap();
    // Alice's edit carries a timestamp before Bob last synced
    a.clock.set(500);
    a.orch.record_change(&k, Action::Update, json!({"by": "alice"})).await.unwrap();
    a.orch.drain(ORG).await.unwrap();

    assert_eq!(data(&b, &k).await, Some(json!({"by": "bob"})));
    let at_b = b.orch.sync_state(&k).await.unwrap().unwrap();
    assert_eq!(at_b.status, SyncStatus::Pending);
    assert_eq!(at_b.local_version, 3);
    assert_eq!(b.orch.queue().pending_count(ORG).await.unwrap(), 1);

    b.orch.drain(ORG).await.unwrap();

    assert_eq!(data(&a, &k).await, Some(json!({"by": "bob"})));
    let at_a = a.orch.sync_state(&k).await.unwrap().unwrap();
    let at_b = b.orch.sync_state(&k).await.unwrap().unwrap();
    assert_eq!(at_a.vector_clock, at_b.vector_clock);
}

#[tokio::test]
async fn manual_conflict_is_recorded_and_announced() {
    let (a, b) = pair(Strategy::Manual);
    let k = key("k1");
    shared_resource(&a, &b, &k).await;

    b.orch.record_change(&k, Action::Update, json!({"by": "bob"})).await.unwrap();
    a.orch.record_change(&k, Action::Update, json!({"by": "alice"})).await.unwrap();
    a.orch.drain(ORG).await.unwrap();

    // Bob keeps his version until someone decides
    assert_eq!(data(&b, &k).await, Some(json!({"by": "bob"})));
    assert_eq!(b.orch.sync_state(&k).await.unwrap().unwrap().status, SyncStatus::Conflict);
    let open = b.orch.unresolved_conflicts(ORG).await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].remote.data, Some(json!({"by": "alice"})));
    assert_eq!(open[0].local.data, Some(json!({"by": "bob"})));

    // Alice learned about it from the conflict notice
    assert_eq!(b.transport.sent_of(MessageKind::Conflict).len(), 1);
    assert_eq!(a.orch.unresolved_conflicts(ORG).await.unwrap().len(), 1);
    assert_eq!(a.orch.sync_state(&k).await.unwrap().unwrap().status, SyncStatus::Conflict);
}

#[parameterized(
    keep_local = { ManualChoice::KeepLocal, json!({"by": "bob"}) },
    take_remote = { ManualChoice::TakeRemote, json!({"by": "alice"}) },
    custom = { ManualChoice::Custom(json!({"by": "both"})), json!({"by": "both"}) },
)]
#[test_macro(tokio::test)]
async fn resolved_conflict_converges(choice: ManualChoice, expected: serde_json::Value) {
    let (a, b) = pair(Strategy::Manual);
    let k = key("k1");
    shared_resource(&a, &b, &k).await;
    b.orch.record_change(&k, Action::Update, json!({"by": "bob"})).await.unwrap();
    a.orch.record_change(&k, Action::Update, json!({"by": "alice"})).await.unwrap();
    a.orch.drain(ORG).await.unwrap();
    let conflict_id = b.orch.unresolved_conflicts(ORG).await.unwrap()[0].id;

    let state = b.orch.resolve_conflict(conflict_id, choice, "bob").await.unwrap();
    assert_eq!(state.status, SyncStatus::Pending);
    assert_eq!(state.local_version, 3);
    assert!(b.orch.unresolved_conflicts(ORG).await.unwrap().is_empty());
    assert_eq!(b.orch.queue().pending_count(ORG).await.unwrap(), 1);

    b.orch.drain(ORG).await.unwrap();

    assert_eq!(data(&a, &k).await, Some(expected.clone()));
    assert_eq!(data(&b, &k).await, Some(expected));
    assert_eq!(a.orch.sync_state(&k).await.unwrap().unwrap().status, SyncStatus::Synced);
}

#[tokio::test]
async fn resolving_twice_fails() {
    let (a, b) = pair(Strategy::Manual);
    let k = key("k1");
    shared_resource(&a, &b, &k).await;
    b.orch.record_change(&k, Action::Update, json!({"by": "bob"})).await.unwrap();
    a.orch.record_change(&k, Action::Update, json!({"by": "alice"})).await.unwrap();
    a.orch.drain(ORG).await.unwrap();
    let id = b.orch.unresolved_conflicts(ORG).await.unwrap()[0].id;

    b.orch.resolve_conflict(id, ManualChoice::KeepLocal, "bob").await.unwrap();
    let err = b.orch.resolve_conflict(id, ManualChoice::TakeRemote, "bob").await.unwrap_err();
    assert!(matches!(err, Error::ConflictAlreadyResolved(_)));
}

#[tokio::test]
async fn conflict_notice_opens_one_conflict() {
    let (a, _b) = pair(Strategy::Manual);
    let k = key("k1");
    a.orch.record_change(&k, Action::Create, json!({"v": 0})).await.unwrap();

    let first = a.orch.handle_conflict_notice(&k, 4, 1).await.unwrap();
    let second = a.orch.handle_conflict_notice(&k, 5, 1).await.unwrap();

    assert!(first.is_some());
    assert!(second.is_none());
    let open = a.orch.unresolved_conflicts(ORG).await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].remote.version, 4);
    assert_eq!(open[0].local.data, Some(json!({"v": 0})));
    assert!(!open[0].remote.known);
}

#[tokio::test]
async fn notice_only_conflict_cannot_take_remote() {
    let (a, _b) = pair(Strategy::Manual);
    let k = key("k1");
    a.orch.record_change(&k, Action::Create, json!({"v": 0})).await.unwrap();
    let id = a.orch.handle_conflict_notice(&k, 4, 1).await.unwrap().unwrap();

    let err = a.orch.resolve_conflict(id, ManualChoice::TakeRemote, "alice").await.unwrap_err();

    assert!(matches!(err, Error::RemoteUnknown(i) if i == id));
    assert_eq!(data(&a, &k).await, Some(json!({"v": 0})));
    assert_eq!(a.orch.unresolved_conflicts(ORG).await.unwrap().len(), 1);
}

#[tokio::test]
async fn both_sides_draining_share_one_conflict() {
    let (a, b) = pair(Strategy::Manual);
    let k = key("k1");
    shared_resource(&a, &b, &k).await;
    b.orch.record_change(&k, Action::Update, json!({"by": "bob"})).await.unwrap();
    a.orch.record_change(&k, Action::Update, json!({"by": "alice"})).await.unwrap();

    a.orch.drain(ORG).await.unwrap();
    b.orch.drain(ORG).await.unwrap();

    // Bob's change fills in the conflict Alice opened from his notice
    let open = a.orch.unresolved_conflicts(ORG).await.unwrap();
    assert_eq!(open.len(), 1);
    assert!(open[0].remote.known);
    assert_eq!(open[0].remote.data, Some(json!({"by": "bob"})));
    assert_eq!(open[0].local.data, Some(json!({"by": "alice"})));

    a.orch.resolve_conflict(open[0].id, ManualChoice::TakeRemote, "alice").await.unwrap();
    assert_eq!(data(&a, &k).await, Some(json!({"by": "bob"})));
    a.orch.drain(ORG).await.unwrap();
    assert_eq!(data(&b, &k).await, Some(json!({"by": "bob"})));
}

// -- table sync ---------------------------------------------------------------

#[tokio::test]
async fn request_is_answered_with_changes_since() {
    let (a, b) = pair(Strategy::Manual);
    b.clock.set(1_000);
    b.orch.record_change(&key("old"), Action::Create, json!({})).await.unwrap();
    b.clock.set(2_000);
    b.orch.record_change(&key("new"), Action::Create, json!({})).await.unwrap();
    b.orch
        .record_change(&ResourceKey::new(ORG, "members", "m"), Action::Create, json!({}))
        .await
        .unwrap();

    let sent = b.orch.handle_request(ORG, 1_500, &["knowledge".to_string()]).await.unwrap();

    assert_eq!(sent, 1);
    assert!(data(&a, &key("new")).await.is_some());
    assert!(data(&a, &key("old")).await.is_none());
}

#[tokio::test]
async fn request_without_changes_sends_nothing() {
    let (_a, b) = pair(Strategy::Manual);
    assert_eq!(b.orch.handle_request(ORG, 0, &["knowledge".to_string()]).await.unwrap(), 0);
    assert!(b.transport.sent().is_empty());
}

#[tokio::test]
async fn sync_after_login_uploads_and_downloads() {
    let (a, b) = pair(Strategy::Manual);
    a.orch.record_change(&key("from-a"), Action::Create, json!({"by": "alice"})).await.unwrap();
    b.orch.record_change(&key("from-b"), Action::Create, json!({"by": "bob"})).await.unwrap();
    a.clock.set(7_000);

    let stats = a.orch.sync_after_login(ORG).await.unwrap();

    assert_eq!(stats, SyncStats { success: 1, failed: 0, conflicts: 0, skipped: 2 });
    assert_eq!(data(&b, &key("from-a")).await, Some(json!({"by": "alice"})));
    assert_eq!(data(&a, &key("from-b")).await, Some(json!({"by": "bob"})));
    assert_eq!(a.orch.status(ORG).await.unwrap().last_sync_at, Some(7_000));
}

#[tokio::test]
async fn tables_without_pending_rows_are_skipped() {
    let (a, _b) = pair(Strategy::Manual);

    let stats = a.orch.sync_incremental(ORG).await.unwrap();

    assert_eq!(stats, SyncStats { skipped: 3, ..SyncStats::default() });
    assert!(a.transport.sent().is_empty());
}

#[tokio::test]
async fn failed_table_is_counted_and_keeps_cursor() {
    let (a, _b) = pair(Strategy::Manual);
    a.orch.record_change(&key("k1"), Action::Create, json!({})).await.unwrap();
    a.orch
        .record_change(&ResourceKey::new(ORG, "members", "m"), Action::Create, json!({}))
        .await
        .unwrap();
    a.transport.set_offline(true);

    let stats = a.orch.sync_incremental(ORG).await.unwrap();

    assert_eq!(stats.failed, 2);
    assert_eq!(stats.success, 0);
    assert_eq!(stats.skipped, 1);
    assert_eq!(a.orch.status(ORG).await.unwrap().last_sync_at, None);
    // Items were attempted and stay queued
    assert_eq!(a.orch.queue().pending_count(ORG).await.unwrap(), 2);
}

#[tokio::test]
async fn unreadable_queue_fails_tables_without_aborting_cycle() {
    let (a, _b) = pair(Strategy::Manual);
    a.orch.record_change(&key("k1"), Action::Create, json!({})).await.unwrap();
    a.db.lock().await.conn.execute_batch("ALTER TABLE queue_items RENAME TO queue_items_moved;").unwrap();
    a.clock.set(9_000);

    let stats = a.orch.sync_incremental(ORG).await.unwrap();

    assert_eq!(stats, SyncStats { failed: 3, ..SyncStats::default() });
    assert_eq!(a.orch.status(ORG).await.unwrap().last_sync_at, None);
    assert!(a.orch.begin(ORG, Cycle::Sync).is_some());

    a.db.lock().await.conn.execute_batch("ALTER TABLE queue_items_moved RENAME TO queue_items;").unwrap();
    let stats = a.orch.sync_incremental(ORG).await.unwrap();
    assert_eq!(stats, SyncStats { success: 1, skipped: 2, ..SyncStats::default() });
}

#[tokio::test]
async fn incremental_sync_asks_from_last_cycle() {
    let (a, _b) = pair(Strategy::Manual);
    a.orch.record_change(&key("k1"), Action::Create, json!({})).await.unwrap();
    a.clock.set(4_000);
    a.orch.sync_after_login(ORG).await.unwrap();

    a.orch.record_change(&key("k2"), Action::Create, json!({})).await.unwrap();
    a.orch.sync_incremental(ORG).await.unwrap();

    let requests = a.transport.sent_of(MessageKind::Request);
    let since: Vec<i64> = requests
        .iter()
        .map(|m| match m {
            SyncMessage::Request { last_sync_time, .. } => *last_sync_time,
            other => panic!("unexpected {other:?}"),
        })
        .collect();
    assert_eq!(since, vec![0, 4_000]);
}

#[tokio::test]
async fn table_sync_reports_unresolved_conflicts() {
    let (a, b) = pair(Strategy::Manual);
    let k = key("k1");
    shared_resource(&a, &b, &k).await;
    b.orch.record_change(&k, Action::Update, json!({"by": "bob"})).await.unwrap();
    a.orch.record_change(&k, Action::Update, json!({"by": "alice"})).await.unwrap();
    b.orch.record_change(&key("k2"), Action::Create, json!({})).await.unwrap();
    a.orch.drain(ORG).await.unwrap();

    let stats = b.orch.sync_incremental(ORG).await.unwrap();

    assert_eq!(stats.success, 1);
    assert_eq!(stats.conflicts, 1);
}

// -- cycle guards and timers --------------------------------------------------

#[tokio::test]
async fn overlapping_cycles_are_skipped() {
    let (a, _b) = pair(Strategy::Manual);
    a.orch.record_change(&key("k1"), Action::Create, json!({})).await.unwrap();

    {
        let _drain = a.orch.begin(ORG, Cycle::Drain).unwrap();
        let _sync = a.orch.begin(ORG, Cycle::Sync).unwrap();
        let status = a.orch.status(ORG).await.unwrap();
        assert!(status.syncing && status.draining);

        assert_eq!(a.orch.drain(ORG).await.unwrap(), DrainReport::default());
        assert_eq!(a.orch.sync_incremental(ORG).await.unwrap(), SyncStats::default());
        assert!(a.transport.sent().is_empty());
    }

    let status = a.orch.status(ORG).await.unwrap();
    assert!(!status.syncing && !status.draining);
    assert_eq!(a.orch.drain(ORG).await.unwrap().delivered, 1);
}

#[tokio::test(start_paused = true)]
async fn timers_drain_until_stopped() {
    let (a, b) = pair(Strategy::Manual);
    a.orch.start(ORG);
    a.orch.start(ORG);
    assert!(a.orch.is_running(ORG));

    a.orch.record_change(&key("k1"), Action::Create, json!({"v": 1})).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5_100)).await;
    assert_eq!(a.orch.queue().pending_count(ORG).await.unwrap(), 0);
    assert!(data(&b, &key("k1")).await.is_some());

    a.orch.stop(ORG);
    assert!(!a.orch.is_running(ORG));
    a.orch.record_change(&key("k2"), Action::Create, json!({"v": 2})).await.unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(a.orch.queue().pending_count(ORG).await.unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn zero_intervals_still_tick() {
    let hub = MemoryHub::new();
    let zero = SyncConfig { sync_interval_ms: 0, queue_drain_interval_ms: 0, ..config(Strategy::Manual) };
    let a = device(&hub, "alice", zero);
    let b = device(&hub, "bob", config(Strategy::Manual));
    a.orch.start(ORG);

    a.orch.record_change(&key("k1"), Action::Create, json!({"v": 1})).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(a.orch.is_running(ORG));
    assert_eq!(a.orch.queue().pending_count(ORG).await.unwrap(), 0);
    assert!(data(&b, &key("k1")).await.is_some());
    a.orch.stop(ORG);
}

#[tokio::test]
async fn status_counts_queue_and_conflicts() {
    let (a, b) = pair(Strategy::Manual);
    let k = key("k1");
    shared_resource(&a, &b, &k).await;
    b.orch.record_change(&k, Action::Update, json!({"by": "bob"})).await.unwrap();
    a.orch.record_change(&k, Action::Update, json!({"by": "alice"})).await.unwrap();
    a.orch.drain(ORG).await.unwrap();

    let status = b.orch.status(ORG).await.unwrap();

    assert_eq!(status.pending_items, 1);
    assert_eq!(status.failed_items, 0);
    assert_eq!(status.unresolved_conflicts, 1);
    assert!(!status.running);
}

#[tokio::test(start_paused = true)]
async fn hundred_changes_reach_peer_with_bounded_concurrency() {
    let (a, b) = pair(Strategy::Manual);
    a.transport.set_latency(Duration::from_millis(20));
    for i in 0..100 {
        a.orch.record_change(&key(&format!("k-{i}")), Action::Create, json!({"i": i})).await.unwrap();
    }

    let report = a.orch.drain(ORG).await.unwrap();

    assert_eq!(report.delivered, 100);
    assert_eq!(a.transport.peak_in_flight(), 3);
    assert_eq!(b.db.lock().await.list_resources(ORG, "knowledge").unwrap().len(), 100);
}
