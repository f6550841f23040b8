// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! orgsync-core: offline-first sync engine for organization data
//!
//! This crate provides the persistent store, vector clocks, conflict
//! detection and resolution, the durable outbound queue, the bounded task
//! scheduler, and the orchestrator that ties them to a transport. It is
//! used by the `orgsyncd` daemon and can be embedded directly.

pub mod clock;
pub mod config;
pub mod db;
pub mod detect;
pub mod error;
pub mod identity;
pub mod model;
pub mod orchestrator;
pub mod protocol;
pub mod queue;
pub mod resolve;
pub mod scheduler;
pub mod transport;
pub mod vclock;

pub use clock::{ClockSource, ManualClock, SystemClock};
pub use config::SyncConfig;
pub use db::{Database, SharedDatabase};
pub use detect::{Causality, ConflictDetector};
pub use error::{Error, Result};
pub use identity::{Identity, IdentityService, KeyIdentity};
pub use model::{Action, Conflict, QueueItem, QueueStatus, Resource, ResourceKey, SyncState, SyncStatus};
pub use orchestrator::{ChangeOutcome, OrgStatus, SyncOrchestrator, SyncStats};
pub use protocol::{Change, MessageKind, RelayClientFrame, RelayFrame, SyncMessage};
pub use queue::{DrainReport, OfflineQueue};
pub use resolve::{ManualChoice, Strategy};
pub use scheduler::{ConcurrencyScheduler, TaskError, TaskHandle};
pub use transport::{HandlerRegistry, MemoryHub, MemoryTransport, Transport, TransportError};
pub use vclock::VectorClock;
