// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Relay state: one broadcast channel per organization.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;

use orgsync_core::SyncMessage;

/// Default buffer of each organization channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Identifies one WebSocket connection.
pub type ConnectionId = u64;

/// A published message together with its sender, so it is not echoed back.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub sender: ConnectionId,
    pub message: SyncMessage,
}

/// Shared relay state.
#[derive(Clone)]
pub struct RelayState {
    inner: Arc<RelayStateInner>,
}

struct RelayStateInner {
    capacity: usize,
    /// Organization id → fan-out channel.
    channels: RwLock<HashMap<String, broadcast::Sender<Envelope>>>,
    next_connection: AtomicU64,
}

impl RelayState {
    pub fn new(capacity: usize) -> Self {
        RelayState {
            inner: Arc::new(RelayStateInner {
                capacity: capacity.max(1),
                channels: RwLock::new(HashMap::new()),
                next_connection: AtomicU64::new(1),
            }),
        }
    }

    /// Allocates an id for a new connection.
    pub fn connection_id(&self) -> ConnectionId {
        self.inner.next_connection.fetch_add(1, Ordering::Relaxed)
    }

    /// Subscribes to an organization, creating its channel on first use.
    pub fn subscribe(&self, org_id: &str) -> broadcast::Receiver<Envelope> {
        let mut channels = self.inner.channels.write().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(org_id.to_string())
            .or_insert_with(|| broadcast::channel(self.inner.capacity).0)
            .subscribe()
    }

    /// Forwards a message to every member of `org_id`.
    ///
    /// Returns the number of members reached, the sender included.
    pub fn publish(&self, sender: ConnectionId, org_id: &str, message: SyncMessage) -> usize {
        let channels = self.inner.channels.read().unwrap_or_else(|e| e.into_inner());
        match channels.get(org_id) {
            Some(tx) => tx.send(Envelope { sender, message }).unwrap_or(0),
            None => 0,
        }
    }

    /// Current subscribers of `org_id`.
    pub fn member_count(&self, org_id: &str) -> usize {
        let channels = self.inner.channels.read().unwrap_or_else(|e| e.into_inner());
        channels.get(org_id).map_or(0, |tx| tx.receiver_count())
    }

    /// Drops channels nobody listens to anymore.
    pub fn prune(&self) -> usize {
        let mut channels = self.inner.channels.write().unwrap_or_else(|e| e.into_inner());
        let before = channels.len();
        channels.retain(|_, tx| tx.receiver_count() > 0);
        before - channels.len()
    }

    pub fn org_count(&self) -> usize {
        self.inner.channels.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}
