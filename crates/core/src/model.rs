// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Persisted sync records: SyncState, QueueItem, Conflict, Resource.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::resolve::Strategy;
use crate::vclock::VectorClock;

/// Identifies one tracked resource inside an organization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub org_id: String,
    pub resource_type: String,
    pub resource_id: String,
}

impl ResourceKey {
    pub fn new(
        org_id: impl Into<String>,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        ResourceKey {
            org_id: org_id.into(),
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.org_id, self.resource_type, self.resource_id)
    }
}

/// Kind of mutation carried by a change or queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Create,
    Update,
    Delete,
}

impl Action {
    /// Returns the string representation used in storage and on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Action {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "create" => Ok(Action::Create),
            "update" => Ok(Action::Update),
            "delete" => Ok(Action::Delete),
            _ => Err(Error::InvalidAction(s.to_string())),
        }
    }
}

/// Sync status of a tracked resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Local and last known remote version agree.
    Synced,
    /// A local version has not been delivered yet.
    Pending,
    /// Concurrent versions are waiting for manual resolution.
    Conflict,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Synced => "synced",
            SyncStatus::Pending => "pending",
            SyncStatus::Conflict => "conflict",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "synced" => Ok(SyncStatus::Synced),
            "pending" => Ok(SyncStatus::Pending),
            "conflict" => Ok(SyncStatus::Conflict),
            _ => Err(Error::InvalidStatus(s.to_string())),
        }
    }
}

/// Per-resource sync metadata. One row per [`ResourceKey`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub org_id: String,
    pub resource_type: String,
    pub resource_id: String,
    pub local_version: i64,
    pub remote_version: i64,
    pub vector_clock: VectorClock,
    /// SHA-256 of the resource data, hex encoded.
    pub content_address: Option<String>,
    pub status: SyncStatus,
    pub last_synced_at: Option<i64>,
    pub updated_at: i64,
}

impl SyncState {
    /// A fresh state for a resource first seen at `now`.
    pub fn new(key: &ResourceKey, now: i64) -> Self {
        SyncState {
            org_id: key.org_id.clone(),
            resource_type: key.resource_type.clone(),
            resource_id: key.resource_id.clone(),
            local_version: 1,
            remote_version: 1,
            vector_clock: VectorClock::new(),
            content_address: None,
            status: SyncStatus::Pending,
            last_synced_at: None,
            updated_at: now,
        }
    }

    pub fn resource_key(&self) -> ResourceKey {
        ResourceKey::new(&self.org_id, &self.resource_type, &self.resource_id)
    }
}

/// Delivery status of a queued outbound change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    InFlight,
    /// Retries exhausted. Excluded from automatic drains.
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::InFlight => "in_flight",
            QueueStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(QueueStatus::Pending),
            "in_flight" => Ok(QueueStatus::InFlight),
            "failed" => Ok(QueueStatus::Failed),
            _ => Err(Error::InvalidStatus(s.to_string())),
        }
    }
}

/// A durable outbound mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: i64,
    pub org_id: String,
    pub action: Action,
    pub resource_type: String,
    pub resource_id: String,
    pub payload: serde_json::Value,
    pub version: i64,
    pub vector_clock: VectorClock,
    pub created_at: i64,
    pub retry_count: u32,
    pub last_retry_at: Option<i64>,
    pub status: QueueStatus,
    pub last_error: Option<String>,
}

impl QueueItem {
    pub fn resource_key(&self) -> ResourceKey {
        ResourceKey::new(&self.org_id, &self.resource_type, &self.resource_id)
    }
}

/// Which version a conflict resolution settled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Local,
    Remote,
    Custom,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Local => "local",
            Resolution::Remote => "remote",
            Resolution::Custom => "custom",
        }
    }
}

impl FromStr for Resolution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(Resolution::Local),
            "remote" => Ok(Resolution::Remote),
            "custom" => Ok(Resolution::Custom),
            _ => Err(Error::InvalidStatus(s.to_string())),
        }
    }
}

/// One side of a divergence as captured in a conflict record.
///
/// `data: None` is a deletion when `known`; otherwise the content was never
/// seen, as for a conflict announced by a peer without its document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictSide {
    pub data: Option<serde_json::Value>,
    pub vector_clock: VectorClock,
    pub version: i64,
    pub known: bool,
}

impl ConflictSide {
    pub fn known(data: Option<serde_json::Value>, vector_clock: VectorClock, version: i64) -> Self {
        ConflictSide { data, vector_clock, version, known: true }
    }

    /// A side whose version is known but whose content is not.
    pub fn unknown(vector_clock: VectorClock, version: i64) -> Self {
        ConflictSide { data: None, vector_clock, version, known: false }
    }
}

/// A recorded divergence between a local and a remote version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: i64,
    pub org_id: String,
    pub resource_type: String,
    pub resource_id: String,
    pub local: ConflictSide,
    pub remote: ConflictSide,
    pub remote_author: Option<String>,
    pub resolution_strategy: Strategy,
    pub resolved: bool,
    pub resolution: Option<Resolution>,
    pub resolved_at: Option<i64>,
    pub resolved_by: Option<String>,
    pub created_at: i64,
}

impl Conflict {
    pub fn resource_key(&self) -> ResourceKey {
        ResourceKey::new(&self.org_id, &self.resource_type, &self.resource_id)
    }
}

/// Fields needed to insert a conflict row.
#[derive(Debug, Clone)]
pub struct NewConflict {
    pub key: ResourceKey,
    pub local: ConflictSide,
    pub remote: ConflictSide,
    pub remote_author: Option<String>,
    pub strategy: Strategy,
    pub resolution: Option<Resolution>,
    pub resolved_by: Option<String>,
}

/// A row of a synchronized domain table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub org_id: String,
    pub resource_type: String,
    pub resource_id: String,
    pub data: serde_json::Value,
    pub deleted: bool,
    pub updated_at: i64,
}

#[cfg(test)]
#[path = "model_tests.rs"]
mod tests;
