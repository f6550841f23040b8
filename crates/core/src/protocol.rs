// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Wire messages exchanged between peers and with the relay.
//!
//! Peer messages are JSON objects tagged by `"type"`:
//! - `sync:request` asks the org for everything changed since a time
//! - `sync:response` answers with signed changes
//! - `sync:change` carries one signed mutation
//! - `sync:conflict` announces a divergence that needs a human
//!
//! Relay frames wrap peer messages with the organization channel they
//! travel on.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::model::{Action, ResourceKey};
use crate::vclock::VectorClock;

/// One signed mutation of a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    pub org_id: String,
    pub resource_type: String,
    pub resource_id: String,
    pub action: Action,
    /// Resource document. `null` for deletes.
    #[serde(default)]
    pub data: serde_json::Value,
    pub version: i64,
    pub vector_clock: VectorClock,
    pub author_did: String,
    /// Author's wall clock when the version was produced (ms).
    pub timestamp: i64,
    /// Hex-encoded signature over [`Change::signing_payload`].
    #[serde(default)]
    pub signature: String,
}

/// Everything in a [`Change`] except its signature, in wire field order.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SignedFields<'a> {
    org_id: &'a str,
    resource_type: &'a str,
    resource_id: &'a str,
    action: Action,
    data: &'a serde_json::Value,
    version: i64,
    vector_clock: &'a VectorClock,
    author_did: &'a str,
    timestamp: i64,
}

impl Change {
    pub fn resource_key(&self) -> ResourceKey {
        ResourceKey::new(&self.org_id, &self.resource_type, &self.resource_id)
    }

    /// Canonical bytes covered by the signature.
    pub fn signing_payload(&self) -> Result<Vec<u8>> {
        let fields = SignedFields {
            org_id: &self.org_id,
            resource_type: &self.resource_type,
            resource_id: &self.resource_id,
            action: self.action,
            data: &self.data,
            version: self.version,
            vector_clock: &self.vector_clock,
            author_did: &self.author_did,
            timestamp: self.timestamp,
        };
        Ok(serde_json::to_vec(&fields)?)
    }

    /// Rejects structurally invalid changes before any crypto or storage work.
    pub fn validate(&self) -> Result<()> {
        if self.org_id.is_empty() || self.resource_type.is_empty() || self.resource_id.is_empty()
        {
            return Err(Error::InvalidMessage(format!(
                "change has an empty identifier: {}",
                self.resource_key()
            )));
        }
        if self.version < 1 {
            return Err(Error::InvalidMessage(format!(
                "change {} has version {}",
                self.resource_key(),
                self.version
            )));
        }
        if self.author_did.is_empty() {
            return Err(Error::InvalidMessage(format!(
                "change {} has no author",
                self.resource_key()
            )));
        }
        Ok(())
    }
}

/// Messages exchanged between peers of an organization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SyncMessage {
    /// Ask peers for resources of `resource_types` changed after `last_sync_time`.
    #[serde(rename = "sync:request", rename_all = "camelCase")]
    Request {
        org_id: String,
        last_sync_time: i64,
        resource_types: Vec<String>,
    },

    /// Signed changes answering a request.
    #[serde(rename = "sync:response", rename_all = "camelCase")]
    Response { org_id: String, changes: Vec<Change> },

    /// A single signed mutation.
    #[serde(rename = "sync:change")]
    Change(Change),

    /// A divergence recorded by the sender for manual resolution.
    #[serde(rename = "sync:conflict", rename_all = "camelCase")]
    Conflict {
        org_id: String,
        resource_type: String,
        resource_id: String,
        local_version: i64,
        remote_version: i64,
    },
}

impl SyncMessage {
    /// Creates a Request message.
    pub fn request(org_id: impl Into<String>, last_sync_time: i64, resource_types: Vec<String>) -> Self {
        SyncMessage::Request { org_id: org_id.into(), last_sync_time, resource_types }
    }

    /// Creates a Response message.
    pub fn response(org_id: impl Into<String>, changes: Vec<Change>) -> Self {
        SyncMessage::Response { org_id: org_id.into(), changes }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            SyncMessage::Request { .. } => MessageKind::Request,
            SyncMessage::Response { .. } => MessageKind::Response,
            SyncMessage::Change(_) => MessageKind::Change,
            SyncMessage::Conflict { .. } => MessageKind::Conflict,
        }
    }

    /// Organization the message belongs to.
    pub fn org_id(&self) -> &str {
        match self {
            SyncMessage::Request { org_id, .. }
            | SyncMessage::Response { org_id, .. }
            | SyncMessage::Conflict { org_id, .. } => org_id,
            SyncMessage::Change(change) => &change.org_id,
        }
    }

    /// Serializes the message to JSON.
    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserializes the message from JSON.
    pub fn from_json(s: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

/// The `type` tag of a [`SyncMessage`], used to route inbound messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Request,
    Response,
    Change,
    Conflict,
}

impl MessageKind {
    pub const ALL: [MessageKind; 4] =
        [MessageKind::Request, MessageKind::Response, MessageKind::Change, MessageKind::Conflict];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Request => "sync:request",
            MessageKind::Response => "sync:response",
            MessageKind::Change => "sync:change",
            MessageKind::Conflict => "sync:conflict",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        MessageKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::InvalidMessage(format!("unknown message type '{s}'")))
    }
}

/// Frames sent from a device to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayClientFrame {
    /// Subscribe this connection to an organization channel.
    #[serde(rename_all = "camelCase")]
    Join { org_id: String },

    /// Forward a message to the other members of an organization.
    #[serde(rename_all = "camelCase")]
    Publish { org_id: String, message: SyncMessage },

    /// Keepalive. The relay echoes `id` in a Pong.
    Ping { id: u64 },
}

/// Frames sent from the relay to a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayFrame {
    /// A message published by another member of the organization.
    #[serde(rename_all = "camelCase")]
    Deliver { org_id: String, message: SyncMessage },

    Pong { id: u64 },

    Error { message: String },
}

impl RelayClientFrame {
    pub fn join(org_id: impl Into<String>) -> Self {
        RelayClientFrame::Join { org_id: org_id.into() }
    }

    pub fn publish(message: SyncMessage) -> Self {
        RelayClientFrame::Publish { org_id: message.org_id().to_string(), message }
    }

    pub fn ping(id: u64) -> Self {
        RelayClientFrame::Ping { id }
    }

    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl RelayFrame {
    pub fn deliver(org_id: impl Into<String>, message: SyncMessage) -> Self {
        RelayFrame::Deliver { org_id: org_id.into(), message }
    }

    pub fn pong(id: u64) -> Self {
        RelayFrame::Pong { id }
    }

    pub fn error(message: impl Into<String>) -> Self {
        RelayFrame::Error { message: message.into() }
    }

    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
