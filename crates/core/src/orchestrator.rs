// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Sync orchestrator: the per-device entry point of the engine.
//!
//! Wires the store, queue, scheduler, detector and resolver to a transport:
//! - local mutations go through [`SyncOrchestrator::record_change`]
//! - inbound `sync:*` messages are handled by registered transport handlers
//! - table-level cycles and queue drains run on timers per organization
//!
//! Per organization, a sync cycle and a drain can each run at most once at
//! a time. A cycle that would overlap a running one is skipped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::clock::ClockSource;
use crate::config::SyncConfig;
use crate::db::SharedDatabase;
use crate::detect::{Causality, ConflictDetector};
use crate::error::{Error, Result};
use crate::identity::{sign_change, verify_change, IdentityService};
use crate::model::{
    Action, Conflict, ConflictSide, NewConflict, Resource, ResourceKey, SyncState, SyncStatus,
};
use crate::protocol::{Change, MessageKind, SyncMessage};
use crate::queue::{DrainReport, OfflineQueue};
use crate::resolve::{
    apply_remote, ConflictResolver, ManualChoice, ResolveOutcome, Strategy,
};
use crate::scheduler::ConcurrencyScheduler;
use crate::transport::{BoxFuture, MessageHandler, Transport};
use crate::vclock::VectorClock;

/// Scheduler priority of table sync tasks; queue drains run at 0.
const TABLE_SYNC_PRIORITY: i32 = 10;

/// Shortest timer period; zero intervals are raised to this.
const MIN_TIMER_PERIOD: std::time::Duration = std::time::Duration::from_millis(1);

/// Tally of a table-level sync cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Tables uploaded and requested without error.
    pub success: usize,
    /// Tables whose task returned an error.
    pub failed: usize,
    /// Unresolved conflicts in the synced tables after the cycle.
    pub conflicts: usize,
    /// Tables with nothing pending locally.
    pub skipped: usize,
}

/// What an inbound change did to local state.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeOutcome {
    /// Written as the new local version.
    Applied,
    /// Older than what we have; ignored.
    Stale,
    /// Same version as ours.
    Unchanged,
    /// Already processed earlier.
    Duplicate,
    /// Concurrent with our version and handed to the resolver.
    Resolved(ResolveOutcome),
}

/// Per-organization status snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrgStatus {
    pub pending_items: usize,
    pub failed_items: usize,
    pub unresolved_conflicts: usize,
    pub syncing: bool,
    pub draining: bool,
    pub running: bool,
    pub last_sync_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cycle {
    Sync,
    Drain,
}

#[derive(Default)]
struct OrgState {
    syncing: bool,
    draining: bool,
    last_sync_at: Option<i64>,
    timers: Vec<JoinHandle<()>>,
}

struct Inner {
    db: SharedDatabase,
    transport: Arc<dyn Transport>,
    identity: Arc<dyn IdentityService>,
    clock: Arc<dyn ClockSource>,
    config: Arc<SyncConfig>,
    scheduler: ConcurrencyScheduler,
    queue: OfflineQueue,
    detector: ConflictDetector,
    resolver: ConflictResolver,
    local_did: String,
    orgs: Mutex<HashMap<String, OrgState>>,
}

/// Clears a cycle flag when dropped.
struct CycleGuard {
    inner: Arc<Inner>,
    org_id: String,
    cycle: Cycle,
}

impl Drop for CycleGuard {
    fn drop(&mut self) {
        let mut orgs = self.inner.orgs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = orgs.get_mut(&self.org_id) {
            match self.cycle {
                Cycle::Sync => state.syncing = false,
                Cycle::Drain => state.draining = false,
            }
        }
    }
}

/// Coordinates sync for one device across its organizations.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

impl SyncOrchestrator {
    /// Builds the engine and registers its message handlers with `transport`.
    pub fn new(
        db: SharedDatabase,
        transport: Arc<dyn Transport>,
        identity: Arc<dyn IdentityService>,
        clock: Arc<dyn ClockSource>,
        config: SyncConfig,
    ) -> Self {
        let config = Arc::new(config);
        let scheduler = ConcurrencyScheduler::new(config.concurrency);
        let local_did = identity.default_identity().did;
        let queue = OfflineQueue::new(
            Arc::clone(&db),
            scheduler.clone(),
            Arc::clone(&transport),
            Arc::clone(&identity),
            Arc::clone(&clock),
            Arc::clone(&config),
        );
        let resolver = ConflictResolver::new(config.strategy_table(), local_did.clone());

        let inner = Arc::new(Inner {
            db,
            transport,
            identity,
            clock,
            config,
            scheduler,
            queue,
            detector: ConflictDetector,
            resolver,
            local_did,
            orgs: Mutex::new(HashMap::new()),
        });
        Self::register_handlers(&inner);
        SyncOrchestrator { inner }
    }

    fn register_handlers(inner: &Arc<Inner>) {
        for kind in MessageKind::ALL {
            let weak: Weak<Inner> = Arc::downgrade(inner);
            let handler: MessageHandler = Arc::new(move |message| -> BoxFuture<'static, ()> {
                let weak = weak.clone();
                Box::pin(async move {
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    let orchestrator = SyncOrchestrator { inner };
                    if let Err(e) = orchestrator.handle_message(message).await {
                        tracing::warn!(error = %e, "failed to handle inbound message");
                    }
                })
            });
            inner.transport.on(kind, handler);
        }
    }

    pub fn local_did(&self) -> &str {
        &self.inner.local_did
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.inner.queue
    }

    pub fn scheduler(&self) -> &ConcurrencyScheduler {
        &self.inner.scheduler
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    // -- inbound ------------------------------------------------------------

    /// Routes an inbound message to its handler.
    pub async fn handle_message(&self, message: SyncMessage) -> Result<()> {
        match message {
            SyncMessage::Request { org_id, last_sync_time, resource_types } => {
                self.handle_request(&org_id, last_sync_time, &resource_types).await?;
            }
            SyncMessage::Response { org_id, changes } => {
                self.handle_response(&org_id, changes).await;
            }
            SyncMessage::Change(change) => {
                self.handle_change(change).await?;
            }
            SyncMessage::Conflict { org_id, resource_type, resource_id, local_version, remote_version } => {
                let key = ResourceKey::new(org_id, resource_type, resource_id);
                self.handle_conflict_notice(&key, local_version, remote_version).await?;
            }
        }
        Ok(())
    }

    /// Answers a `sync:request` with our versions changed after `since`.
    ///
    /// Returns the number of changes sent; nothing is sent when there are none.
    pub async fn handle_request(&self, org_id: &str, since: i64, resource_types: &[String]) -> Result<usize> {
        let changes = {
            let db = self.inner.db.lock().await;
            let mut changes = Vec::new();
            for state in db.changed_since(org_id, resource_types, since)? {
                let key = state.resource_key();
                let Some(resource) = db.get_resource(&key)? else {
                    continue;
                };
                changes.push(self.signed_change(&state, &resource)?);
            }
            changes
        };

        tracing::debug!(org = org_id, since, count = changes.len(), "answering sync request");
        if changes.is_empty() {
            return Ok(0);
        }
        let count = changes.len();
        let sent = self
            .inner
            .transport
            .broadcast_to_org(org_id, SyncMessage::response(org_id, changes))
            .await
            .map_err(Error::from)?;
        if !sent {
            return Err(Error::Delivery("sync response declined by transport".to_string()));
        }
        Ok(count)
    }

    fn signed_change(&self, state: &SyncState, resource: &Resource) -> Result<Change> {
        let (action, data) = if resource.deleted {
            (Action::Delete, serde_json::Value::Null)
        } else {
            (Action::Update, resource.data.clone())
        };
        let mut change = Change {
            org_id: state.org_id.clone(),
            resource_type: state.resource_type.clone(),
            resource_id: state.resource_id.clone(),
            action,
            data,
            version: state.local_version,
            vector_clock: state.vector_clock.clone(),
            author_did: String::new(),
            timestamp: state.updated_at,
            signature: String::new(),
        };
        sign_change(self.inner.identity.as_ref(), &mut change)?;
        Ok(change)
    }

    /// Applies each change of a `sync:response`. Returns (applied, failed).
    pub async fn handle_response(&self, org_id: &str, changes: Vec<Change>) -> (usize, usize) {
        let mut applied = 0;
        let mut failed = 0;
        for change in changes {
            if change.org_id != org_id {
                tracing::warn!(org = org_id, other = %change.org_id, "response carries change of another org");
                failed += 1;
                continue;
            }
            match self.handle_change(change).await {
                Ok(_) => applied += 1,
                Err(e) => {
                    tracing::debug!(error = %e, "change in sync response rejected");
                    failed += 1;
                }
            }
        }
        tracing::debug!(org = org_id, applied, failed, "applied sync response");
        (applied, failed)
    }

    /// Validates, verifies and applies one inbound change.
    pub async fn handle_change(&self, change: Change) -> Result<ChangeOutcome> {
        change.validate()?;
        if let Err(e) = verify_change(self.inner.identity.as_ref(), &change) {
            tracing::warn!(
                target: "security",
                author = %change.author_did,
                resource = %change.resource_key(),
                "rejected change with invalid signature"
            );
            return Err(e);
        }

        let key = change.resource_key();
        let now = self.inner.clock.now_ms();
        let (outcome, notice) = {
            let db = self.inner.db.lock().await;
            if db.is_applied(&key, change.version, &change.author_did)? {
                tracing::debug!(resource = %key, version = change.version, "duplicate change");
                return Ok(ChangeOutcome::Duplicate);
            }

            db.atomically(|db| {
                let mut notice = None;
                let outcome = match db.get_sync_state(&key)? {
                    None => {
                        apply_remote(db, None, &change, now)?;
                        ChangeOutcome::Applied
                    }
                    Some(state) => match self.inner.detector.classify(&state.vector_clock, &change.vector_clock) {
                        Causality::RemoteAhead => {
                            apply_remote(db, Some(&state), &change, now)?;
                            ChangeOutcome::Applied
                        }
                        Causality::LocalAhead => ChangeOutcome::Stale,
                        Causality::Equal => ChangeOutcome::Unchanged,
                        Causality::Concurrent => {
                            let resolved = self.inner.resolver.resolve(db, &state, &change, now)?;
                            match &resolved {
                                ResolveOutcome::LocalKept { republish, .. } => {
                                    OfflineQueue::enqueue_in(
                                        db,
                                        &republish.key,
                                        republish.action,
                                        &republish.data,
                                        republish.version,
                                        &republish.vector_clock,
                                        now,
                                    )?;
                                }
                                ResolveOutcome::Deferred { .. } => {
                                    notice = Some(SyncMessage::Conflict {
                                        org_id: key.org_id.clone(),
                                        resource_type: key.resource_type.clone(),
                                        resource_id: key.resource_id.clone(),
                                        local_version: state.local_version,
                                        remote_version: change.version,
                                    });
                                }
                                ResolveOutcome::RemoteApplied { .. } => {}
                            }
                            ChangeOutcome::Resolved(resolved)
                        }
                    },
                };
                db.record_applied(&key, change.version, &change.author_did, now)?;
                Ok((outcome, notice))
            })?
        };

        tracing::debug!(resource = %key, version = change.version, author = %change.author_did, outcome = ?outcome, "handled change");

        if let Some(notice) = notice {
            // Best-effort; the conflict is already persisted locally
            match self.inner.transport.broadcast_to_org(&key.org_id, notice).await {
                Ok(true) => {}
                Ok(false) => tracing::debug!(resource = %key, "conflict notice declined"),
                Err(e) => tracing::debug!(resource = %key, error = %e, "conflict notice not sent"),
            }
        }
        Ok(outcome)
    }

    /// Records a divergence announced by a peer, unless one is already open.
    ///
    /// Returns the id of the new conflict, if one was created.
    pub async fn handle_conflict_notice(
        &self,
        key: &ResourceKey,
        peer_version: i64,
        our_version_seen_by_peer: i64,
    ) -> Result<Option<i64>> {
        let now = self.inner.clock.now_ms();
        let db = self.inner.db.lock().await;
        if db.open_conflict_for(key)?.is_some() {
            return Ok(None);
        }

        let id = db.atomically(|db| {
            let state = db.get_sync_state(key)?;
            let local = match &state {
                Some(state) => ConflictSide::known(
                    db.get_resource(key)?.filter(|r| !r.deleted).map(|r| r.data),
                    state.vector_clock.clone(),
                    state.local_version,
                ),
                None => ConflictSide::known(None, VectorClock::new(), our_version_seen_by_peer),
            };
            let id = db.insert_conflict(
                &NewConflict {
                    key: key.clone(),
                    local,
                    remote: ConflictSide::unknown(VectorClock::new(), peer_version),
                    remote_author: None,
                    strategy: Strategy::Manual,
                    resolution: None,
                    resolved_by: None,
                },
                now,
            )?;
            if let Some(mut state) = state {
                state.status = SyncStatus::Conflict;
                state.updated_at = now;
                db.put_sync_state(&state)?;
            }
            Ok(id)
        })?;

        tracing::info!(resource = %key, conflict_id = id, "peer reported conflict");
        Ok(Some(id))
    }

    // -- local mutations ----------------------------------------------------

    /// Writes a local mutation and queues it for delivery.
    ///
    /// Bumps `local_version`, increments this device's clock entry and marks
    /// the resource pending, all in one transaction with the queue row.
    pub async fn record_change(
        &self,
        key: &ResourceKey,
        action: Action,
        data: serde_json::Value,
    ) -> Result<SyncState> {
        let now = self.inner.clock.now_ms();
        let db = self.inner.db.lock().await;
        db.atomically(|db| {
            let mut state = match db.get_sync_state(key)? {
                Some(mut state) => {
                    state.local_version += 1;
                    state
                }
                None if action == Action::Delete => {
                    return Err(Error::ResourceNotFound(key.to_string()));
                }
                None => SyncState::new(key, now),
            };
            state.vector_clock.increment(&self.inner.local_did);
            state.status = SyncStatus::Pending;
            state.updated_at = now;

            let payload = match action {
                Action::Delete => {
                    let tombstone = db.get_resource(key)?.map(|r| r.data).unwrap_or(serde_json::Value::Null);
                    db.put_resource(key, &tombstone, true, now)?;
                    state.content_address = None;
                    serde_json::Value::Null
                }
                Action::Create | Action::Update => {
                    state.content_address = Some(db.put_resource(key, &data, false, now)?);
                    data
                }
            };
            db.put_sync_state(&state)?;
            OfflineQueue::enqueue_in(db, key, action, &payload, state.local_version, &state.vector_clock, now)?;
            Ok(state)
        })
    }

    /// Settles an open conflict and queues the chosen version for peers.
    pub async fn resolve_conflict(&self, conflict_id: i64, choice: ManualChoice, resolved_by: &str) -> Result<SyncState> {
        let now = self.inner.clock.now_ms();
        let db = self.inner.db.lock().await;
        db.atomically(|db| {
            let republish = self.inner.resolver.resolve_conflict(db, conflict_id, choice, resolved_by, now)?;
            OfflineQueue::enqueue_in(
                db,
                &republish.key,
                republish.action,
                &republish.data,
                republish.version,
                &republish.vector_clock,
                now,
            )?;
            db.get_sync_state(&republish.key)?
                .ok_or_else(|| Error::ResourceNotFound(republish.key.to_string()))
        })
    }

    /// Physically removes the local copy and its sync state.
    ///
    /// Peers are not told; use `record_change` with [`Action::Delete`] for that.
    pub async fn delete_resource(&self, key: &ResourceKey) -> Result<bool> {
        self.inner.db.lock().await.purge_resource(key)
    }

    // -- cycles -------------------------------------------------------------

    fn begin(&self, org_id: &str, cycle: Cycle) -> Option<CycleGuard> {
        let mut orgs = self.inner.orgs.lock().unwrap_or_else(|e| e.into_inner());
        let state = orgs.entry(org_id.to_string()).or_default();
        let flag = match cycle {
            Cycle::Sync => &mut state.syncing,
            Cycle::Drain => &mut state.draining,
        };
        if *flag {
            return None;
        }
        *flag = true;
        Some(CycleGuard { inner: Arc::clone(&self.inner), org_id: org_id.to_string(), cycle })
    }

    fn last_sync_at(&self, org_id: &str) -> Option<i64> {
        let orgs = self.inner.orgs.lock().unwrap_or_else(|e| e.into_inner());
        orgs.get(org_id).and_then(|s| s.last_sync_at)
    }

    /// Full sync of every tracked table, as after a fresh login.
    pub async fn sync_after_login(&self, org_id: &str) -> Result<SyncStats> {
        self.sync_tables(org_id, 0).await
    }

    /// Sync of every tracked table since the last successful cycle.
    pub async fn sync_incremental(&self, org_id: &str) -> Result<SyncStats> {
        let since = self.last_sync_at(org_id).unwrap_or(0);
        self.sync_tables(org_id, since).await
    }

    async fn sync_tables(&self, org_id: &str, since: i64) -> Result<SyncStats> {
        let Some(_guard) = self.begin(org_id, Cycle::Sync) else {
            tracing::debug!(org = org_id, "sync already running, skipped");
            return Ok(SyncStats::default());
        };
        let started = self.inner.clock.now_ms();
        let mut stats = SyncStats::default();

        let mut tasks = Vec::new();
        for table in &self.inner.config.tables {
            let pending = match self.inner.queue.pending_count_for(org_id, table).await {
                Ok(pending) => pending,
                Err(e) => {
                    tracing::warn!(org = org_id, table = %table, error = %e, "cannot count pending rows");
                    stats.failed += 1;
                    continue;
                }
            };
            if pending == 0 {
                stats.skipped += 1;
                continue;
            }
            let this = self.clone();
            let org = org_id.to_string();
            let table = table.clone();
            let handle = self.inner.scheduler.enqueue(TABLE_SYNC_PRIORITY, async move {
                this.sync_table(&org, &table, since).await
            });
            tasks.push(handle);
        }

        for result in join_all(tasks).await {
            match result {
                Ok(conflicts) => {
                    stats.success += 1;
                    stats.conflicts += conflicts;
                }
                Err(e) => {
                    tracing::warn!(org = org_id, error = %e, "table sync failed");
                    stats.failed += 1;
                }
            }
        }

        if stats.failed == 0 {
            let mut orgs = self.inner.orgs.lock().unwrap_or_else(|e| e.into_inner());
            orgs.entry(org_id.to_string()).or_default().last_sync_at = Some(started);
        }
        tracing::info!(
            org = org_id,
            success = stats.success,
            failed = stats.failed,
            conflicts = stats.conflicts,
            skipped = stats.skipped,
            "sync cycle finished"
        );
        Ok(stats)
    }

    /// Uploads one batch of a table and asks peers for their changes to it.
    ///
    /// Returns the table's unresolved conflict count.
    async fn sync_table(&self, org_id: &str, table: &str, since: i64) -> Result<usize> {
        let report = self.inner.queue.upload(org_id, table, self.inner.config.batch_size).await?;
        tracing::debug!(org = org_id, table, delivered = report.delivered, "table uploaded");

        let request = SyncMessage::request(org_id, since, vec![table.to_string()]);
        if !self.inner.transport.broadcast_to_org(org_id, request).await.map_err(Error::from)? {
            return Err(Error::Delivery(format!("sync request for {table} declined")));
        }
        self.inner.db.lock().await.count_unresolved_conflicts(org_id, Some(table))
    }

    /// Drains the offline queue unless a drain is already running.
    pub async fn drain(&self, org_id: &str) -> Result<DrainReport> {
        let Some(_guard) = self.begin(org_id, Cycle::Drain) else {
            tracing::debug!(org = org_id, "drain already running, skipped");
            return Ok(DrainReport::default());
        };
        self.inner.queue.drain(org_id).await
    }

    // -- timers -------------------------------------------------------------

    /// Starts the incremental sync and queue drain timers for `org_id`.
    ///
    /// Calling it again while running has no effect.
    pub fn start(&self, org_id: &str) {
        let mut orgs = self.inner.orgs.lock().unwrap_or_else(|e| e.into_inner());
        let state = orgs.entry(org_id.to_string()).or_default();
        if !state.timers.is_empty() {
            return;
        }

        let sync = self.spawn_timer(org_id, self.inner.config.sync_interval(), Cycle::Sync);
        let drain = self.spawn_timer(org_id, self.inner.config.queue_drain_interval(), Cycle::Drain);
        state.timers = vec![sync, drain];
        tracing::info!(org = org_id, "sync timers started");
    }

    fn spawn_timer(&self, org_id: &str, period: std::time::Duration, cycle: Cycle) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let org_id = org_id.to_string();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period.max(MIN_TIMER_PERIOD));
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let orchestrator = SyncOrchestrator { inner };
                let result = match cycle {
                    Cycle::Sync => orchestrator.sync_incremental(&org_id).await.map(|_| ()),
                    Cycle::Drain => orchestrator.drain(&org_id).await.map(|_| ()),
                };
                if let Err(e) = result {
                    tracing::warn!(org = %org_id, ?cycle, error = %e, "timer cycle failed");
                }
            }
        })
    }

    /// Stops the timers of `org_id`. Scheduled tasks run to completion.
    pub fn stop(&self, org_id: &str) {
        let mut orgs = self.inner.orgs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = orgs.get_mut(org_id) {
            for timer in state.timers.drain(..) {
                timer.abort();
            }
            tracing::info!(org = org_id, "sync timers stopped");
        }
    }

    pub fn is_running(&self, org_id: &str) -> bool {
        let orgs = self.inner.orgs.lock().unwrap_or_else(|e| e.into_inner());
        orgs.get(org_id).is_some_and(|s| !s.timers.is_empty())
    }

    // -- queries ------------------------------------------------------------

    pub async fn unresolved_conflicts(&self, org_id: &str) -> Result<Vec<Conflict>> {
        self.inner.db.lock().await.unresolved_conflicts(org_id)
    }

    pub async fn sync_state(&self, key: &ResourceKey) -> Result<Option<SyncState>> {
        self.inner.db.lock().await.get_sync_state(key)
    }

    /// The live resource; tombstones read as absent.
    pub async fn resource(&self, key: &ResourceKey) -> Result<Option<Resource>> {
        Ok(self.inner.db.lock().await.get_resource(key)?.filter(|r| !r.deleted))
    }

    pub async fn status(&self, org_id: &str) -> Result<OrgStatus> {
        let (pending_items, failed_items, unresolved_conflicts) = {
            let db = self.inner.db.lock().await;
            (
                db.count_queue_items(org_id, None, crate::model::QueueStatus::Pending)?,
                db.count_queue_items(org_id, None, crate::model::QueueStatus::Failed)?,
                db.count_unresolved_conflicts(org_id, None)?,
            )
        };
        let orgs = self.inner.orgs.lock().unwrap_or_else(|e| e.into_inner());
        let state = orgs.get(org_id);
        Ok(OrgStatus {
            pending_items,
            failed_items,
            unresolved_conflicts,
            syncing: state.is_some_and(|s| s.syncing),
            draining: state.is_some_and(|s| s.draining),
            running: state.is_some_and(|s| !s.timers.is_empty()),
            last_sync_at: state.and_then(|s| s.last_sync_at),
        })
    }
}

#[cfg(test)]
#[path = "orchestrator_tests.rs"]
mod tests;
