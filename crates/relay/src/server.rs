// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket server implementation.
//!
//! Each connection runs one task that reads client frames and writes
//! outbound frames. Every joined organization gets a small forwarding task
//! that moves messages from the organization channel to the connection,
//! skipping the connection's own publications.

use std::collections::HashMap;
use std::net::SocketAddr;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use orgsync_core::{RelayClientFrame, RelayFrame};

use crate::state::{ConnectionId, Envelope, RelayState};

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Run the WebSocket server on the given address.
pub async fn run(addr: SocketAddr, state: RelayState) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(addr).await?;
    info!("Listening on: {}", addr);

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let state = state.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer_addr, state).await {
                error!("Connection error from {}: {}", peer_addr, e);
            }
        });
    }
}

/// Organizations joined by one connection.
struct Session {
    id: ConnectionId,
    joined: HashMap<String, JoinHandle<()>>,
    outbound: mpsc::UnboundedSender<RelayFrame>,
}

impl Session {
    fn join(&mut self, state: &RelayState, org_id: &str) {
        if self.joined.contains_key(org_id) {
            return;
        }
        let rx = state.subscribe(org_id);
        let forwarder = forward(self.id, org_id.to_string(), rx, self.outbound.clone());
        self.joined.insert(org_id.to_string(), forwarder);
        debug!("Connection {} joined {} ({} members)", self.id, org_id, state.member_count(org_id));
    }

    /// Stops the forwarders and waits until their subscriptions are dropped.
    async fn leave_all(&mut self) {
        for (_, forwarder) in self.joined.drain() {
            forwarder.abort();
            let _ = forwarder.await;
        }
    }
}

/// Handle a single WebSocket connection.
pub(crate) async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: RelayState,
) -> Result<(), BoxError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel();
    let mut session = Session { id: state.connection_id(), joined: HashMap::new(), outbound };
    info!("New WebSocket connection from: {} (#{})", peer_addr, session.id);

    let (mut ws_sink, mut ws_stream) = ws_stream.split();

    let result: Result<(), BoxError> = async {
        loop {
            tokio::select! {
                msg = ws_stream.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(reply) = handle_client_frame(&text, &state, &mut session) {
                                send_frame(&mut ws_sink, &reply).await?;
                            }
                        }
                        Some(Ok(Message::Close(_))) => {
                            info!("Client {} disconnected", peer_addr);
                            break;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sink.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!("WebSocket error from {}: {}", peer_addr, e);
                            break;
                        }
                        None => {
                            info!("Client {} stream ended", peer_addr);
                            break;
                        }
                    }
                }

                frame = outbound_rx.recv() => {
                    let Some(frame) = frame else { break };
                    if let Err(e) = send_frame(&mut ws_sink, &frame).await {
                        warn!("Failed to forward to {}: {}", peer_addr, e);
                        break;
                    }
                }
            }
        }
        Ok(())
    }
    .await;

    session.leave_all().await;
    let pruned = state.prune();
    info!("Connection closed: {} ({} idle orgs pruned)", peer_addr, pruned);
    result
}

async fn send_frame<S>(sink: &mut S, frame: &RelayFrame) -> Result<(), BoxError>
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let json = frame.to_json()?;
    sink.send(Message::Text(json.into())).await?;
    Ok(())
}

/// Copies an organization's messages to one connection, minus its own.
fn forward(
    id: ConnectionId,
    org_id: String,
    mut rx: broadcast::Receiver<Envelope>,
    outbound: mpsc::UnboundedSender<RelayFrame>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(envelope) if envelope.sender == id => {}
                Ok(envelope) => {
                    if outbound.send(RelayFrame::deliver(&org_id, envelope.message)).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Connection {} lagged by {} messages on {}", id, n, org_id);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Process a client frame and return an optional direct reply.
fn handle_client_frame(text: &str, state: &RelayState, session: &mut Session) -> Option<RelayFrame> {
    let frame = match RelayClientFrame::from_json(text) {
        Ok(frame) => frame,
        Err(e) => return Some(RelayFrame::error(format!("invalid frame: {e}"))),
    };

    match frame {
        RelayClientFrame::Join { org_id } => {
            if org_id.is_empty() {
                return Some(RelayFrame::error("orgId must not be empty"));
            }
            session.join(state, &org_id);
            None
        }

        RelayClientFrame::Publish { org_id, message } => {
            if !session.joined.contains_key(&org_id) {
                return Some(RelayFrame::error(format!("not a member of {org_id}")));
            }
            if message.org_id() != org_id {
                return Some(RelayFrame::error(format!(
                    "message for {} published to {org_id}",
                    message.org_id()
                )));
            }
            let kind = message.kind();
            let reached = state.publish(session.id, &org_id, message);
            debug!("Connection {} published {} to {} ({} members)", session.id, kind, org_id, reached);
            None
        }

        RelayClientFrame::Ping { id } => Some(RelayFrame::pong(id)),
    }
}
