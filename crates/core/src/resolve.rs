// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Conflict resolution for concurrent versions of a resource.
//!
//! Each resource type maps to a [`Strategy`]:
//! - `lww`: the remote change wins if its timestamp is strictly later than
//!   the local `last_synced_at`, otherwise local is kept
//! - `manual`: an open conflict is recorded and the resource is left alone
//!
//! Every path writes a conflict row, so the history of divergences is
//! auditable even when resolution was automatic.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::db::Database;
use crate::error::{Error, Result};
use crate::model::{
    Action, ConflictSide, NewConflict, Resolution, ResourceKey, SyncState, SyncStatus,
};
use crate::protocol::Change;
use crate::vclock::VectorClock;

/// Name recorded in `resolved_by` for automatic resolutions.
pub const LWW_RESOLVER: &str = "lww";

/// How concurrent versions of a resource type are settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Lww,
    #[default]
    Manual,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Lww => "lww",
            Strategy::Manual => "manual",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "lww" => Ok(Strategy::Lww),
            "manual" => Ok(Strategy::Manual),
            _ => Err(Error::InvalidStrategy(s.to_string())),
        }
    }
}

/// Resource type → strategy, with a fallback for unlisted types.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StrategyTable {
    default: Strategy,
    by_type: BTreeMap<String, Strategy>,
}

impl StrategyTable {
    pub fn new(default: Strategy) -> Self {
        StrategyTable { default, by_type: BTreeMap::new() }
    }

    /// Builder-style override for one resource type.
    pub fn with(mut self, resource_type: impl Into<String>, strategy: Strategy) -> Self {
        self.by_type.insert(resource_type.into(), strategy);
        self
    }

    pub fn get(&self, resource_type: &str) -> Strategy {
        self.by_type.get(resource_type).copied().unwrap_or(self.default)
    }

    pub fn default_strategy(&self) -> Strategy {
        self.default
    }
}

impl<S: Into<String>> Extend<(S, Strategy)> for StrategyTable {
    fn extend<I: IntoIterator<Item = (S, Strategy)>>(&mut self, iter: I) {
        for (resource_type, strategy) in iter {
            self.by_type.insert(resource_type.into(), strategy);
        }
    }
}

/// A local version that must be delivered to peers again.
#[derive(Debug, Clone, PartialEq)]
pub struct Republish {
    pub key: ResourceKey,
    pub action: Action,
    pub data: serde_json::Value,
    pub version: i64,
    pub vector_clock: VectorClock,
}

/// What happened to a concurrent change.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolveOutcome {
    /// LWW picked the remote change; it is now the local version.
    RemoteApplied { conflict_id: i64 },
    /// LWW kept the local version, which was re-stamped and must be sent out.
    LocalKept { conflict_id: i64, republish: Republish },
    /// Recorded for manual resolution.
    Deferred { conflict_id: i64 },
}

impl ResolveOutcome {
    pub fn conflict_id(&self) -> i64 {
        match self {
            ResolveOutcome::RemoteApplied { conflict_id }
            | ResolveOutcome::LocalKept { conflict_id, .. }
            | ResolveOutcome::Deferred { conflict_id } => *conflict_id,
        }
    }
}

/// A human decision on an open conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum ManualChoice {
    KeepLocal,
    TakeRemote,
    /// A merged document written by the user.
    Custom(serde_json::Value),
}

impl ManualChoice {
    fn resolution(&self) -> Resolution {
        match self {
            ManualChoice::KeepLocal => Resolution::Local,
            ManualChoice::TakeRemote => Resolution::Remote,
            ManualChoice::Custom(_) => Resolution::Custom,
        }
    }
}

/// Overwrites the local resource with a remote version and returns the new state.
///
/// Used both for causally newer changes and for LWW remote wins. The
/// resulting clock is the merge of what we had and what arrived, and any
/// local versions still waiting in the queue are discarded.
pub fn apply_remote(
    db: &Database,
    prior: Option<&SyncState>,
    change: &Change,
    now: i64,
) -> Result<SyncState> {
    let key = change.resource_key();
    let content_address = match change.action {
        Action::Delete => {
            // Keep the last known document under the tombstone
            let data = match (&change.data, db.get_resource(&key)?) {
                (serde_json::Value::Null, Some(existing)) => existing.data,
                (data, _) => data.clone(),
            };
            db.put_resource(&key, &data, true, now)?;
            None
        }
        Action::Create | Action::Update => Some(db.put_resource(&key, &change.data, false, now)?),
    };

    let mut state = match prior {
        Some(prior) => prior.clone(),
        None => SyncState::new(&key, now),
    };
    state.vector_clock.merge(&change.vector_clock);
    state.local_version = state.local_version.max(change.version);
    state.remote_version = change.version;
    state.content_address = content_address;
    state.status = SyncStatus::Synced;
    state.last_synced_at = Some(now);
    state.updated_at = now;
    db.put_sync_state(&state)?;
    db.supersede_queue_items(&key, i64::MAX)?;
    Ok(state)
}

/// Applies per-type strategies to concurrent changes.
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    strategies: StrategyTable,
    local_did: String,
}

impl ConflictResolver {
    /// Creates a resolver acting on behalf of `local_did`.
    pub fn new(strategies: StrategyTable, local_did: impl Into<String>) -> Self {
        ConflictResolver { strategies, local_did: local_did.into() }
    }

    pub fn strategy_for(&self, resource_type: &str) -> Strategy {
        self.strategies.get(resource_type)
    }

    pub fn strategies(&self) -> &StrategyTable {
        &self.strategies
    }

    /// Dispatches a concurrent change to the configured strategy.
    pub fn resolve(&self, db: &Database, local: &SyncState, change: &Change, now: i64) -> Result<ResolveOutcome> {
        match self.strategy_for(&change.resource_type) {
            Strategy::Lww => self.resolve_lww(db, local, change, now),
            Strategy::Manual => self.resolve_manual(db, local, change, now),
        }
    }

    /// Last-writer-wins: remote `timestamp` against local `last_synced_at`.
    ///
    /// Strictly later wins; a tie keeps the local version.
    pub fn resolve_lww(&self, db: &Database, local: &SyncState, change: &Change, now: i64) -> Result<ResolveOutcome> {
        let key = change.resource_key();
        let local_data = db.get_resource(&key)?;
        let local_side = ConflictSide::known(
            local_data.as_ref().filter(|r| !r.deleted).map(|r| r.data.clone()),
            local.vector_clock.clone(),
            local.local_version,
        );
        let remote_wins = change.timestamp > local.last_synced_at.unwrap_or(0);

        let outcome = db.atomically(|db| {
            let conflict_id = db.insert_conflict(
                &NewConflict {
                    key: key.clone(),
                    local: local_side,
                    remote: remote_side(change),
                    remote_author: Some(change.author_did.clone()),
                    strategy: Strategy::Lww,
                    resolution: Some(if remote_wins { Resolution::Remote } else { Resolution::Local }),
                    resolved_by: Some(LWW_RESOLVER.to_string()),
                },
                now,
            )?;

            if remote_wins {
                apply_remote(db, Some(local), change, now)?;
                return Ok(ResolveOutcome::RemoteApplied { conflict_id });
            }

            let mut state = local.clone();
            state.vector_clock.merge(&change.vector_clock);
            state.vector_clock.increment(&self.local_did);
            state.local_version = state.local_version.max(change.version) + 1;
            state.remote_version = change.version;
            state.status = SyncStatus::Pending;
            state.updated_at = now;
            db.put_sync_state(&state)?;

            let (action, data) = match local_data {
                Some(r) if r.deleted => (Action::Delete, serde_json::Value::Null),
                Some(r) => (Action::Update, r.data),
                None => (Action::Delete, serde_json::Value::Null),
            };
            Ok(ResolveOutcome::LocalKept {
                conflict_id,
                republish: Republish {
                    key,
                    action,
                    data,
                    version: state.local_version,
                    vector_clock: state.vector_clock,
                },
            })
        })?;

        tracing::debug!(
            resource = %change.resource_key(),
            conflict_id = outcome.conflict_id(),
            remote_wins,
            "resolved concurrent change by lww"
        );
        Ok(outcome)
    }

    /// Records an open conflict and marks the state; the resource is untouched.
    ///
    /// A resource has at most one open conflict: when one exists, its remote
    /// side is replaced by this change instead of opening another.
    pub fn resolve_manual(&self, db: &Database, local: &SyncState, change: &Change, now: i64) -> Result<ResolveOutcome> {
        let key = change.resource_key();
        let local_data = db.get_resource(&key)?.filter(|r| !r.deleted).map(|r| r.data);

        let conflict_id = db.atomically(|db| {
            let remote = remote_side(change);
            let conflict_id = match db.open_conflict_for(&key)? {
                Some(open) => {
                    db.update_conflict_remote(open.id, &remote, Some(&change.author_did))?;
                    open.id
                }
                None => db.insert_conflict(
                    &NewConflict {
                        key: key.clone(),
                        local: ConflictSide::known(local_data, local.vector_clock.clone(), local.local_version),
                        remote,
                        remote_author: Some(change.author_did.clone()),
                        strategy: Strategy::Manual,
                        resolution: None,
                        resolved_by: None,
                    },
                    now,
                )?,
            };
            let mut state = local.clone();
            state.status = SyncStatus::Conflict;
            state.updated_at = now;
            db.put_sync_state(&state)?;
            Ok(conflict_id)
        })?;

        tracing::info!(resource = %key, conflict_id, "conflict recorded for manual resolution");
        Ok(ResolveOutcome::Deferred { conflict_id })
    }

    /// Settles an open conflict with a human decision.
    ///
    /// The chosen data becomes a new local version that dominates both sides,
    /// so the returned [`Republish`] converges every peer once delivered.
    pub fn resolve_conflict(
        &self,
        db: &Database,
        conflict_id: i64,
        choice: ManualChoice,
        resolved_by: &str,
        now: i64,
    ) -> Result<Republish> {
        let conflict = db.get_conflict(conflict_id)?;
        if conflict.resolved {
            return Err(Error::ConflictAlreadyResolved(conflict_id));
        }
        let key = conflict.resource_key();
        let resolution = choice.resolution();
        let data = match choice {
            ManualChoice::KeepLocal => conflict.local.data.clone(),
            ManualChoice::TakeRemote if !conflict.remote.known => {
                return Err(Error::RemoteUnknown(conflict_id));
            }
            ManualChoice::TakeRemote => conflict.remote.data.clone(),
            ManualChoice::Custom(data) => Some(data),
        };

        let republish = db.atomically(|db| {
            let mut state = match db.get_sync_state(&key)? {
                Some(state) => state,
                None => SyncState::new(&key, now),
            };
            state.vector_clock.merge(&conflict.local.vector_clock);
            state.vector_clock.merge(&conflict.remote.vector_clock);
            state.vector_clock.increment(&self.local_did);
            state.local_version =
                state.local_version.max(conflict.local.version).max(conflict.remote.version) + 1;
            state.remote_version = state.remote_version.max(conflict.remote.version);
            state.status = SyncStatus::Pending;
            state.updated_at = now;

            let (action, data) = match data {
                Some(data) => {
                    state.content_address = Some(db.put_resource(&key, &data, false, now)?);
                    (Action::Update, data)
                }
                None => {
                    let tombstone = db
                        .get_resource(&key)?
                        .map(|r| r.data)
                        .unwrap_or(serde_json::Value::Null);
                    db.put_resource(&key, &tombstone, true, now)?;
                    state.content_address = None;
                    (Action::Delete, serde_json::Value::Null)
                }
            };
            db.put_sync_state(&state)?;
            db.mark_conflict_resolved(conflict_id, resolution, resolved_by, now)?;
            Ok(Republish {
                key: key.clone(),
                action,
                data,
                version: state.local_version,
                vector_clock: state.vector_clock,
            })
        })?;

        tracing::info!(resource = %key, conflict_id, resolution = resolution.as_str(), resolved_by, "conflict resolved");
        Ok(republish)
    }
}

fn remote_side(change: &Change) -> ConflictSide {
    let data = match change.action {
        Action::Delete => None,
        Action::Create | Action::Update => Some(change.data.clone()),
    };
    ConflictSide::known(data, change.vector_clock.clone(), change.version)
}

#[cfg(test)]
#[path = "resolve_tests.rs"]
mod tests;
