// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Transport abstraction for delivering sync messages to an organization.
//!
//! Provides a trait-based transport layer that enables:
//! - A WebSocket relay client in the daemon
//! - An in-process hub for tests and embedding, with fault injection
//!
//! Delivery is best-effort: `broadcast_to_org` reports whether the message
//! left this device, never whether a peer applied it.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::Error;
use crate::protocol::{MessageKind, SyncMessage};

/// Boxed future returned by transport and handler calls.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Callback invoked for every inbound message of a registered kind.
pub type MessageHandler = Arc<dyn Fn(SyncMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// Error type for transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// No connection to the relay or hub.
    #[error("not connected")]
    NotConnected,

    /// Send failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        Error::Delivery(err.to_string())
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Message delivery to the peers of an organization.
pub trait Transport: Send + Sync {
    /// Sends `message` to every other member of `org_id`.
    ///
    /// `Ok(false)` means the transport declined the message without an
    /// error (e.g. a full outbound buffer); callers treat it like a failure.
    fn broadcast_to_org(
        &self,
        org_id: &str,
        message: SyncMessage,
    ) -> BoxFuture<'_, TransportResult<bool>>;

    /// Registers `handler` for inbound messages of `kind`.
    fn on(&self, kind: MessageKind, handler: MessageHandler);
}

/// Handlers keyed by message kind, shared by transport implementations.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Mutex<HashMap<MessageKind, Vec<MessageHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, kind: MessageKind, handler: MessageHandler) {
        let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        handlers.entry(kind).or_default().push(handler);
    }

    /// Runs every handler registered for the message's kind, in order.
    ///
    /// Returns the number of handlers invoked.
    pub async fn dispatch(&self, message: SyncMessage) -> usize {
        let targets: Vec<MessageHandler> = {
            let handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
            handlers.get(&message.kind()).cloned().unwrap_or_default()
        };
        if targets.is_empty() {
            tracing::debug!(kind = %message.kind(), "no handler for inbound message");
        }
        for handler in &targets {
            handler(message.clone()).await;
        }
        targets.len()
    }
}

struct HubPeer {
    id: u64,
    orgs: HashSet<String>,
    registry: Arc<HandlerRegistry>,
}

/// In-process message hub connecting [`MemoryTransport`]s.
///
/// Delivery is synchronous: when `broadcast_to_org` returns, every
/// recipient's handlers have run.
#[derive(Clone, Default)]
pub struct MemoryHub {
    peers: Arc<Mutex<Vec<HubPeer>>>,
    next_id: Arc<AtomicU64>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a new transport to the hub.
    pub fn connect(&self) -> MemoryTransport {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let registry = Arc::new(HandlerRegistry::new());
        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        peers.push(HubPeer { id, orgs: HashSet::new(), registry: Arc::clone(&registry) });
        MemoryTransport { hub: self.clone(), id, registry, faults: Arc::new(Faults::default()) }
    }

    fn join(&self, id: u64, org_id: &str) {
        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(peer) = peers.iter_mut().find(|p| p.id == id) {
            peer.orgs.insert(org_id.to_string());
        }
    }

    fn leave(&self, id: u64) {
        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        peers.retain(|p| p.id != id);
    }

    fn recipients(&self, sender: u64, org_id: &str) -> Vec<Arc<HandlerRegistry>> {
        let peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        peers
            .iter()
            .filter(|p| p.id != sender && p.orgs.contains(org_id))
            .map(|p| Arc::clone(&p.registry))
            .collect()
    }
}

/// Fault injection and instrumentation for [`MemoryTransport`].
#[derive(Default)]
struct Faults {
    offline: AtomicBool,
    fail_next: AtomicUsize,
    refuse_next: AtomicUsize,
    latency_ms: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    sent: Mutex<Vec<(String, SyncMessage)>>,
}

/// A transport attached to a [`MemoryHub`].
#[derive(Clone)]
pub struct MemoryTransport {
    hub: MemoryHub,
    id: u64,
    registry: Arc<HandlerRegistry>,
    faults: Arc<Faults>,
}

impl MemoryTransport {
    /// Subscribes this transport to an organization's messages.
    pub fn join(&self, org_id: &str) {
        self.hub.join(self.id, org_id);
    }

    /// Detaches from the hub. Later broadcasts fail with `NotConnected`.
    pub fn disconnect(&self) {
        self.hub.leave(self.id);
        self.faults.offline.store(true, Ordering::SeqCst);
    }

    /// While offline, every broadcast fails.
    pub fn set_offline(&self, offline: bool) {
        self.faults.offline.store(offline, Ordering::SeqCst);
    }

    /// The next `n` broadcasts fail with a send error.
    pub fn fail_next(&self, n: usize) {
        self.faults.fail_next.store(n, Ordering::SeqCst);
    }

    /// The next `n` broadcasts are declined with `Ok(false)`.
    pub fn refuse_next(&self, n: usize) {
        self.faults.refuse_next.store(n, Ordering::SeqCst);
    }

    /// Delay applied to every broadcast before delivery.
    pub fn set_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.faults.latency_ms.store(ms, Ordering::SeqCst);
    }

    /// Highest number of broadcasts that were in progress at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.faults.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Every message that left this transport, in send order.
    pub fn sent(&self) -> Vec<(String, SyncMessage)> {
        self.faults.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Sent messages of one kind.
    pub fn sent_of(&self, kind: MessageKind) -> Vec<SyncMessage> {
        self.sent().into_iter().map(|(_, m)| m).filter(|m| m.kind() == kind).collect()
    }

    /// Delivers `message` to this transport's own handlers, as if a peer sent it.
    pub async fn inject(&self, message: SyncMessage) -> usize {
        self.registry.dispatch(message).await
    }

    fn take_one(counter: &AtomicUsize) -> bool {
        counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
    }

    async fn deliver(&self, org_id: String, message: SyncMessage) -> TransportResult<bool> {
        let latency = self.faults.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.faults.offline.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        if Self::take_one(&self.faults.fail_next) {
            return Err(TransportError::SendFailed("injected failure".to_string()));
        }
        if Self::take_one(&self.faults.refuse_next) {
            return Ok(false);
        }

        self.faults
            .sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((org_id.clone(), message.clone()));

        for registry in self.hub.recipients(self.id, &org_id) {
            registry.dispatch(message.clone()).await;
        }
        Ok(true)
    }
}

impl Transport for MemoryTransport {
    fn broadcast_to_org(
        &self,
        org_id: &str,
        message: SyncMessage,
    ) -> BoxFuture<'_, TransportResult<bool>> {
        let org_id = org_id.to_string();
        Box::pin(async move {
            let now = self.faults.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.faults.peak_in_flight.fetch_max(now, Ordering::SeqCst);
            let result = self.deliver(org_id, message).await;
            self.faults.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        })
    }

    fn on(&self, kind: MessageKind, handler: MessageHandler) {
        self.registry.register(kind, handler);
    }
}

#[cfg(test)]
#[path = "transport_tests.rs"]
mod tests;
