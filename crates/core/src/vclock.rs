// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Vector clocks for per-resource causality.
//!
//! A vector clock maps an identity (DID) to the number of versions that
//! identity has produced. Rules:
//! 1. A peer only increments its own entry, and only when it produces a new
//!    version of the resource.
//! 2. Entries never decrease; merging takes the pointwise maximum.
//! 3. A missing entry is equivalent to zero.
//!
//! Serialized as a plain JSON object (`{"did:...": 3}`) so peers running
//! other implementations can read it.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A vector clock keyed by identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    entries: BTreeMap<String, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the counter for `id`, zero if the identity never wrote.
    pub fn get(&self, id: &str) -> u64 {
        self.entries.get(id).copied().unwrap_or(0)
    }

    /// Records a new version produced by `id` and returns its counter.
    pub fn increment(&mut self, id: &str) -> u64 {
        let counter = self.entries.entry(id.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Folds `other` into this clock (pointwise maximum).
    pub fn merge(&mut self, other: &VectorClock) {
        for (id, &value) in &other.entries {
            let entry = self.entries.entry(id.clone()).or_insert(0);
            *entry = (*entry).max(value);
        }
    }

    /// Returns a new clock that is the merge of both.
    pub fn merged(&self, other: &VectorClock) -> VectorClock {
        let mut out = self.clone();
        out.merge(other);
        out
    }

    pub fn is_empty(&self) -> bool {
        self.entries.values().all(|&v| v == 0)
    }

    /// Iterates entries in identity order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.entries.iter().map(|(k, &v)| (k.as_str(), v))
    }

    /// Union of identities present in either clock.
    pub(crate) fn keys_with<'a>(&'a self, other: &'a VectorClock) -> Vec<&'a str> {
        let mut keys: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        for key in other.entries.keys() {
            if !self.entries.contains_key(key) {
                keys.push(key);
            }
        }
        keys
    }

    /// Serializes the clock to its JSON object form.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl<S: Into<String>> FromIterator<(S, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (S, u64)>>(iter: I) -> Self {
        VectorClock { entries: iter.into_iter().map(|(k, v)| (k.into(), v)).collect() }
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (id, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{id}:{value}")?;
        }
        f.write_str("}")
    }
}

impl FromStr for VectorClock {
    type Err = Error;

    /// Parses the JSON object form stored in the database.
    fn from_str(s: &str) -> Result<Self> {
        if s.trim().is_empty() {
            return Ok(VectorClock::new());
        }
        serde_json::from_str(s)
            .map_err(|e| Error::CorruptedData(format!("invalid vector clock '{s}': {e}")))
    }
}

#[cfg(test)]
#[path = "vclock_tests.rs"]
mod tests;
