// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Error types for orgsync-core operations.

use thiserror::Error;

/// All possible errors that can occur in orgsync-core operations.
///
/// An unresolved conflict is deliberately absent: it is persisted state,
/// surfaced through the conflict queries, never an `Err`.
#[derive(Debug, Error)]
pub enum Error {
    /// Peer unreachable or transport refused the message. Retried by the
    /// offline queue.
    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("signature verification failed for {resource} from {author}")]
    SignatureVerification { author: String, resource: String },

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("invalid action: '{0}'\n  hint: valid actions are: create, update, delete")]
    InvalidAction(String),

    #[error("invalid status: '{0}'")]
    InvalidStatus(String),

    #[error("invalid strategy: '{0}'\n  hint: valid strategies are: lww, manual")]
    InvalidStrategy(String),

    #[error("conflict not found: {0}")]
    ConflictNotFound(i64),

    #[error("conflict {0} is already resolved")]
    ConflictAlreadyResolved(i64),

    #[error("remote version of conflict {0} is unknown\n  hint: keep local or resolve with custom data")]
    RemoteUnknown(i64),

    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    #[error("identity error: {0}")]
    Identity(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("corrupted data: {0}")]
    CorruptedData(String),
}

impl Error {
    /// Returns true for failures the offline queue should retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Delivery(_))
    }
}

/// A specialized Result type for orgsync-core operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
