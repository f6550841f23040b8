// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket transport to an `orgsync-relay`.
//!
//! One background task owns the socket. Outbound messages are handed to it
//! over a channel and acknowledged once written and flushed, so
//! `broadcast_to_org` only reports success for data that reached the wire.
//! Inbound `deliver` frames are dispatched to the registered handlers in
//! arrival order by a separate task, since handlers publish replies through
//! this same socket. The connection is re-established with exponential backoff
//! and organizations are re-joined on every connect.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;

use orgsync_core::transport::{BoxFuture, MessageHandler, TransportResult};
use orgsync_core::{HandlerRegistry, MessageKind, RelayClientFrame, RelayFrame, SyncMessage, Transport, TransportError};

/// Keepalive period for relay pings.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

/// First reconnect delay; doubles up to [`RECONNECT_MAX_DELAY`].
pub const RECONNECT_MIN_DELAY: Duration = Duration::from_millis(500);
pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

/// A serialized frame waiting for the socket task.
struct Outbound {
    json: String,
    ack: Option<oneshot::Sender<bool>>,
}

pub struct WsTransport {
    url: String,
    registry: Arc<HandlerRegistry>,
    orgs: Mutex<BTreeSet<String>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    connected: watch::Sender<bool>,
    connections: AtomicU64,
    next_ping: AtomicU64,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        WsTransport {
            url: url.into(),
            registry: Arc::new(HandlerRegistry::new()),
            orgs: Mutex::new(BTreeSet::new()),
            outbound: Mutex::new(None),
            connected: watch::channel(false).0,
            connections: AtomicU64::new(0),
            next_ping: AtomicU64::new(1),
        }
    }

    /// Joins an organization channel now and after every reconnect.
    pub fn join(&self, org_id: &str) {
        let added = self.orgs.lock().unwrap_or_else(|e| e.into_inner()).insert(org_id.to_string());
        if !added {
            return;
        }
        if let Ok(json) = RelayClientFrame::join(org_id).to_json() {
            // Not connected is fine: the next connect joins
            let _ = self.enqueue(json, None);
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Watches the connection state; `true` while a socket is open.
    pub fn subscribe_connected(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    /// Successful connects so far.
    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::SeqCst)
    }

    fn enqueue(&self, json: String, ack: Option<oneshot::Sender<bool>>) -> TransportResult<()> {
        let outbound = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
        let tx = outbound.as_ref().ok_or(TransportError::NotConnected)?;
        tx.send(Outbound { json, ack }).map_err(|_| TransportError::NotConnected)
    }

    /// Keeps a connection open until the task is aborted.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut delay = RECONNECT_MIN_DELAY;
            loop {
                let before = this.connection_count();
                match this.run_connection().await {
                    Ok(()) => tracing::info!(url = %this.url, "relay connection closed"),
                    Err(e) => tracing::warn!(url = %this.url, error = %e, "relay connection failed"),
                }
                if this.connection_count() > before {
                    delay = RECONNECT_MIN_DELAY;
                }
                tracing::debug!(delay_ms = delay.as_millis() as u64, "reconnecting");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(RECONNECT_MAX_DELAY);
            }
        })
    }

    /// Connects once and serves the socket until it closes.
    pub async fn run_connection(&self) -> TransportResult<()> {
        let (ws, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::SendFailed(format!("connect to {}: {e}", self.url)))?;
        let (mut sink, mut stream) = ws.split();

        // Installed before the snapshot so a concurrent `join` is never lost
        let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
        *self.outbound.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
        let orgs: Vec<String> = self.orgs.lock().unwrap_or_else(|e| e.into_inner()).iter().cloned().collect();
        for org_id in &orgs {
            let joined = match RelayClientFrame::join(org_id.as_str()).to_json() {
                Ok(json) => send_text(&mut sink, json).await,
                Err(e) => Err(TransportError::Serialization(e.to_string())),
            };
            if let Err(e) = joined {
                *self.outbound.lock().unwrap_or_else(|e| e.into_inner()) = None;
                return Err(e);
            }
        }

        self.connections.fetch_add(1, Ordering::SeqCst);
        self.connected.send_replace(true);
        tracing::info!(url = %self.url, orgs = ?orgs, "connected to relay");

        let (inbound, mut inbound_rx) = mpsc::unbounded_channel::<SyncMessage>();
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            while let Some(message) = inbound_rx.recv().await {
                let kind = message.kind();
                let handled = registry.dispatch(message).await;
                tracing::debug!(%kind, handled, "inbound message");
            }
        });

        let mut keepalive = tokio::time::interval_at(tokio::time::Instant::now() + PING_INTERVAL, PING_INTERVAL);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => handle_frame(&text, &inbound),
                    Some(Ok(Message::Close(_))) | None => break Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Err(TransportError::SendFailed(e.to_string())),
                },

                Some(out) = rx.recv() => {
                    let written = send_text(&mut sink, out.json).await;
                    if let Some(ack) = out.ack {
                        let _ = ack.send(written.is_ok());
                    }
                    if let Err(e) = written {
                        break Err(e);
                    }
                }

                _ = keepalive.tick() => {
                    let id = self.next_ping.fetch_add(1, Ordering::Relaxed);
                    let Ok(json) = RelayClientFrame::ping(id).to_json() else { continue };
                    if let Err(e) = send_text(&mut sink, json).await {
                        break Err(e);
                    }
                }
            }
        };

        // Queued frames lose their ack sender here and fail as not connected
        *self.outbound.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.connected.send_replace(false);
        result
    }
}

fn handle_frame(text: &str, inbound: &mpsc::UnboundedSender<SyncMessage>) {
    match RelayFrame::from_json(text) {
        Ok(RelayFrame::Deliver { org_id, message }) => {
            if message.org_id() != org_id {
                tracing::warn!(org = %org_id, other = message.org_id(), "relay delivered message of another org");
                return;
            }
            let _ = inbound.send(message);
        }
        Ok(RelayFrame::Pong { id }) => tracing::trace!(id, "pong"),
        Ok(RelayFrame::Error { message }) => tracing::warn!(%message, "relay reported error"),
        Err(e) => tracing::warn!(error = %e, "invalid frame from relay"),
    }
}

async fn send_text<S>(sink: &mut S, json: String) -> TransportResult<()>
where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    sink.send(Message::Text(json.into()))
        .await
        .map_err(|e| TransportError::SendFailed(e.to_string()))?;
    sink.flush().await.map_err(|e| TransportError::SendFailed(e.to_string()))
}

impl Transport for WsTransport {
    fn broadcast_to_org(&self, org_id: &str, message: SyncMessage) -> BoxFuture<'_, TransportResult<bool>> {
        let frame = RelayClientFrame::Publish { org_id: org_id.to_string(), message };
        Box::pin(async move {
            let json = frame.to_json().map_err(|e| TransportError::Serialization(e.to_string()))?;
            let (ack, written) = oneshot::channel();
            self.enqueue(json, Some(ack))?;
            written.await.map_err(|_| TransportError::NotConnected)
        })
    }

    fn on(&self, kind: MessageKind, handler: MessageHandler) {
        self.registry.register(kind, handler);
    }
}

#[cfg(test)]
#[path = "ws_tests.rs"]
mod tests;
