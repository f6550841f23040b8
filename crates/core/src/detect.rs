// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Causal conflict detection between two versions of a resource.
//!
//! Comparison is a partial order over vector clocks:
//! - local ≥ remote on every identity and > on one: local is ahead
//! - remote ≥ local on every identity and > on one: remote is ahead
//! - equal on every identity: already in sync
//! - otherwise the versions are concurrent and need a resolver
//!
//! An identity missing from one clock counts as zero there. Two peers that
//! have never exchanged a version therefore look concurrent as soon as both
//! have written, which is the intended cold-start behaviour: neither side
//! has seen the other's edit.

use serde::{Deserialize, Serialize};

use crate::vclock::VectorClock;

/// Which side of a comparison dominates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Local,
    Remote,
}

/// Causal relation between the local and remote clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Causality {
    LocalAhead,
    RemoteAhead,
    Concurrent,
    Equal,
}

/// Result of [`compare`]: `winner` is never set when `is_conflict` is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Comparison {
    pub is_conflict: bool,
    pub winner: Option<Side>,
}

impl Comparison {
    pub fn causality(&self) -> Causality {
        match (self.is_conflict, self.winner) {
            (true, _) => Causality::Concurrent,
            (false, Some(Side::Local)) => Causality::LocalAhead,
            (false, Some(Side::Remote)) => Causality::RemoteAhead,
            (false, None) => Causality::Equal,
        }
    }
}

/// Compares a local clock against a remote one.
pub fn compare(local: &VectorClock, remote: &VectorClock) -> Comparison {
    let mut local_greater = false;
    let mut remote_greater = false;

    for id in local.keys_with(remote) {
        let l = local.get(id);
        let r = remote.get(id);
        if l > r {
            local_greater = true;
        } else if r > l {
            remote_greater = true;
        }
        if local_greater && remote_greater {
            break;
        }
    }

    match (local_greater, remote_greater) {
        (true, true) => Comparison { is_conflict: true, winner: None },
        (true, false) => Comparison { is_conflict: false, winner: Some(Side::Local) },
        (false, true) => Comparison { is_conflict: false, winner: Some(Side::Remote) },
        (false, false) => Comparison { is_conflict: false, winner: None },
    }
}

/// Stateless detector, kept as a type so the orchestrator can hold one.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConflictDetector;

impl ConflictDetector {
    pub fn compare(&self, local: &VectorClock, remote: &VectorClock) -> Comparison {
        compare(local, remote)
    }

    pub fn classify(&self, local: &VectorClock, remote: &VectorClock) -> Causality {
        compare(local, remote).causality()
    }
}

#[cfg(test)]
#[path = "detect_tests.rs"]
mod tests;
