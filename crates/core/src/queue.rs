// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Offline queue for outbound changes.
//!
//! Every local mutation is written to `queue_items` in the same SQLite
//! transaction as the resource itself, so nothing is lost while the device
//! is offline or restarts. Draining signs each item as a `sync:change` and
//! hands it to the transport; delivered items are removed, failed ones are
//! retried with exponential backoff until `max_retry_count` is exceeded.

use std::sync::Arc;

use futures_util::future::join_all;

use crate::clock::ClockSource;
use crate::config::SyncConfig;
use crate::db::{Database, NewQueueItem, SharedDatabase};
use crate::error::{Error, Result};
use crate::identity::{sign_change, IdentityService};
use crate::model::{Action, QueueItem, QueueStatus, ResourceKey};
use crate::protocol::{Change, SyncMessage};
use crate::scheduler::ConcurrencyScheduler;
use crate::transport::Transport;
use crate::vclock::VectorClock;

/// Tally of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Removed from the queue after the transport accepted them.
    pub delivered: usize,
    /// Failed this time; still pending.
    pub retried: usize,
    /// Failed past `max_retry_count`; now excluded from automatic drains.
    pub failed: usize,
    /// Still waiting out their backoff.
    pub skipped: usize,
}

impl DrainReport {
    fn record(&mut self, outcome: Delivery) {
        match outcome {
            Delivery::Delivered => self.delivered += 1,
            Delivery::Retry => self.retried += 1,
            Delivery::Failed => self.failed += 1,
        }
    }

    /// Items this pass attempted to send.
    pub fn attempted(&self) -> usize {
        self.delivered + self.retried + self.failed
    }
}

/// Result of sending a single item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Delivered,
    Retry,
    Failed,
}

/// Durable outbound queue with bounded-concurrency draining.
#[derive(Clone)]
pub struct OfflineQueue {
    db: SharedDatabase,
    scheduler: ConcurrencyScheduler,
    transport: Arc<dyn Transport>,
    identity: Arc<dyn IdentityService>,
    clock: Arc<dyn ClockSource>,
    config: Arc<SyncConfig>,
}

impl OfflineQueue {
    pub fn new(
        db: SharedDatabase,
        scheduler: ConcurrencyScheduler,
        transport: Arc<dyn Transport>,
        identity: Arc<dyn IdentityService>,
        clock: Arc<dyn ClockSource>,
        config: Arc<SyncConfig>,
    ) -> Self {
        OfflineQueue { db, scheduler, transport, identity, clock, config }
    }

    /// Appends a change using an already locked database.
    ///
    /// Lets callers enqueue in the same transaction as the mutation itself.
    /// Older pending versions of the same resource are dropped.
    pub fn enqueue_in(
        db: &Database,
        key: &ResourceKey,
        action: Action,
        payload: &serde_json::Value,
        version: i64,
        vector_clock: &VectorClock,
        now: i64,
    ) -> Result<i64> {
        let superseded = db.supersede_queue_items(key, version)?;
        let id = db.insert_queue_item(
            &NewQueueItem { key, action, payload, version, vector_clock },
            now,
        )?;
        tracing::debug!(id, resource = %key, %action, version, superseded, "queued change");
        Ok(id)
    }

    /// Appends a change to the queue and returns its id.
    pub async fn enqueue(
        &self,
        key: &ResourceKey,
        action: Action,
        payload: &serde_json::Value,
        version: i64,
        vector_clock: &VectorClock,
    ) -> Result<i64> {
        let now = self.clock.now_ms();
        let db = self.db.lock().await;
        Self::enqueue_in(&db, key, action, payload, version, vector_clock, now)
    }

    /// Sends every due pending item of `org_id` through the scheduler.
    ///
    /// Items run concurrently up to the scheduler's limit. Delivery failures
    /// are counted in the report, never returned as errors.
    pub async fn drain(&self, org_id: &str) -> Result<DrainReport> {
        let (items, mut report) = self.claim(org_id, None, usize::MAX).await?;
        if items.is_empty() {
            return Ok(report);
        }

        let ids: Vec<i64> = items.iter().map(|item| item.id).collect();
        let handles: Vec<_> = items
            .into_iter()
            .map(|item| {
                let queue = self.clone();
                self.scheduler.enqueue(0, async move { Ok::<_, Error>(queue.deliver(item).await) })
            })
            .collect();

        for (id, result) in ids.into_iter().zip(join_all(handles).await) {
            match result {
                Ok(outcome) => report.record(outcome),
                Err(e) => {
                    tracing::warn!(id, error = %e, "queue delivery task failed");
                    report.record(self.settle(id, &e.to_string()).await);
                }
            }
        }

        tracing::info!(
            org = org_id,
            delivered = report.delivered,
            retried = report.retried,
            failed = report.failed,
            skipped = report.skipped,
            "queue drained"
        );
        Ok(report)
    }

    /// Sends up to `limit` due items of one resource type, one at a time.
    ///
    /// Used from inside scheduler tasks, so it must not schedule more work.
    pub async fn upload(&self, org_id: &str, resource_type: &str, limit: usize) -> Result<DrainReport> {
        let (items, mut report) = self.claim(org_id, Some(resource_type), limit).await?;
        for item in items {
            report.record(self.deliver(item).await);
        }
        Ok(report)
    }

    /// Marks due items in flight and returns them with the backoff tally.
    async fn claim(
        &self,
        org_id: &str,
        resource_type: Option<&str>,
        limit: usize,
    ) -> Result<(Vec<QueueItem>, DrainReport)> {
        let now = self.clock.now_ms();
        let mut report = DrainReport::default();
        let db = self.db.lock().await;
        let claimed = db.atomically(|db| {
            let mut claimed = Vec::new();
            for item in db.pending_queue_items(org_id, resource_type, usize::MAX)? {
                if claimed.len() >= limit {
                    break;
                }
                if !self.is_due(&item, now) {
                    report.skipped += 1;
                    continue;
                }
                if db.mark_in_flight(item.id)? {
                    claimed.push(item);
                }
            }
            Ok(claimed)
        })?;
        Ok((claimed, report))
    }

    fn is_due(&self, item: &QueueItem, now: i64) -> bool {
        let Some(last) = item.last_retry_at else {
            return true;
        };
        let delay = i64::try_from(self.config.retry_delay_ms(item.retry_count)).unwrap_or(i64::MAX);
        now >= last.saturating_add(delay)
    }

    /// Sends one claimed item. Never leaves it in flight.
    async fn deliver(&self, item: QueueItem) -> Delivery {
        let id = item.id;
        match self.try_deliver(item).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(id, error = %e, "delivery bookkeeping failed");
                self.settle(id, &e.to_string()).await
            }
        }
    }

    /// Counts a local error as a failed attempt on a claimed item.
    ///
    /// Falls back to plain release when even that cannot be written.
    async fn settle(&self, id: i64, error: &str) -> Delivery {
        let now = self.clock.now_ms();
        let db = self.db.lock().await;
        match db.record_queue_failure(id, error, self.config.max_retry_count, now) {
            Ok(QueueStatus::Failed) => Delivery::Failed,
            Ok(_) => Delivery::Retry,
            Err(e) => {
                if let Err(release) = db.release_queue_item(id) {
                    tracing::error!(id, error = %e, release = %release, "queue item left in flight");
                }
                Delivery::Retry
            }
        }
    }

    /// Signs and publishes one claimed item, then does the bookkeeping.
    async fn try_deliver(&self, item: QueueItem) -> Result<Delivery> {
        let key = item.resource_key();
        let mut change = Change {
            org_id: item.org_id.clone(),
            resource_type: item.resource_type.clone(),
            resource_id: item.resource_id.clone(),
            action: item.action,
            data: item.payload.clone(),
            version: item.version,
            vector_clock: item.vector_clock.clone(),
            author_did: String::new(),
            timestamp: item.created_at,
            signature: String::new(),
        };
        sign_change(self.identity.as_ref(), &mut change)?;

        let sent = self
            .transport
            .broadcast_to_org(&item.org_id, SyncMessage::Change(change))
            .await;

        let now = self.clock.now_ms();
        let db = self.db.lock().await;
        let error = match sent {
            Ok(true) => {
                db.atomically(|db| {
                    db.remove_queue_item(item.id)?;
                    db.mark_synced(&key, item.version, now)
                })?;
                tracing::debug!(id = item.id, resource = %key, version = item.version, "delivered");
                return Ok(Delivery::Delivered);
            }
            Ok(false) => "declined by transport".to_string(),
            Err(e) => Error::from(e).to_string(),
        };

        match db.record_queue_failure(item.id, &error, self.config.max_retry_count, now)? {
            QueueStatus::Failed => {
                tracing::warn!(
                    id = item.id,
                    resource = %key,
                    retries = item.retry_count + 1,
                    %error,
                    "delivery retries exhausted"
                );
                Ok(Delivery::Failed)
            }
            _ => {
                tracing::debug!(id = item.id, resource = %key, %error, "delivery failed, will retry");
                Ok(Delivery::Retry)
            }
        }
    }

    /// Items that exhausted their retries.
    pub async fn failed(&self, org_id: &str) -> Result<Vec<QueueItem>> {
        self.db.lock().await.failed_queue_items(org_id)
    }

    /// Puts failed items back into the automatic drain with a fresh budget.
    pub async fn retry_failed(&self, org_id: &str) -> Result<usize> {
        let reset = self.db.lock().await.reset_failed_queue_items(org_id)?;
        if reset > 0 {
            tracing::info!(org = org_id, reset, "failed queue items reset");
        }
        Ok(reset)
    }

    pub async fn pending_count(&self, org_id: &str) -> Result<usize> {
        self.db.lock().await.count_queue_items(org_id, None, QueueStatus::Pending)
    }

    pub async fn pending_count_for(&self, org_id: &str, resource_type: &str) -> Result<usize> {
        self.db.lock().await.count_queue_items(org_id, Some(resource_type), QueueStatus::Pending)
    }

    /// Returns items left in flight by an interrupted run to pending.
    pub async fn recover_in_flight(&self) -> Result<usize> {
        let recovered = self.db.lock().await.recover_in_flight()?;
        if recovered > 0 {
            tracing::info!(recovered, "recovered in-flight queue items");
        }
        Ok(recovered)
    }
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
