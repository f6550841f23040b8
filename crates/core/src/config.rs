// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Sync engine configuration.
//!
//! Usually read from the `[sync]` table of the daemon's TOML file. Every
//! field has a default, so an empty table is a valid configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::resolve::{Strategy, StrategyTable};

/// Tunables of the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Failed deliveries allowed before an item is marked failed (default: 5).
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,
    /// Queue items uploaded per table per cycle (default: 50).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Scheduler tasks allowed to run at once (default: 3).
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Period of the incremental table sync in milliseconds (default: 30000).
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,
    /// Period of the queue drain in milliseconds (default: 5000).
    #[serde(default = "default_queue_drain_interval_ms")]
    pub queue_drain_interval_ms: u64,
    /// Backoff after the first failed delivery in milliseconds (default: 1000).
    /// Doubles with every further failure.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Upper bound on the retry backoff in milliseconds (default: 60000).
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// Resource types synchronized at table level.
    #[serde(default = "default_tables")]
    pub tables: Vec<String>,
    /// Per resource type conflict strategy.
    #[serde(default)]
    pub strategies: BTreeMap<String, Strategy>,
    /// Strategy for types missing from `strategies` (default: manual).
    #[serde(default)]
    pub default_strategy: Strategy,
}

fn default_max_retry_count() -> u32 {
    5
}

fn default_batch_size() -> usize {
    50
}

fn default_concurrency() -> usize {
    3
}

fn default_sync_interval_ms() -> u64 {
    30_000
}

fn default_queue_drain_interval_ms() -> u64 {
    5_000
}

fn default_retry_base_delay_ms() -> u64 {
    1_000
}

fn default_retry_max_delay_ms() -> u64 {
    60_000
}

fn default_tables() -> Vec<String> {
    ["knowledge", "members", "projects"].into_iter().map(String::from).collect()
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            max_retry_count: default_max_retry_count(),
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            sync_interval_ms: default_sync_interval_ms(),
            queue_drain_interval_ms: default_queue_drain_interval_ms(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            tables: default_tables(),
            strategies: BTreeMap::new(),
            default_strategy: Strategy::default(),
        }
    }
}

impl SyncConfig {
    /// Parses a TOML document holding the sync fields at top level.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: SyncConfig =
            toml::from_str(content).map_err(|e| Error::Config(format!("invalid sync config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a TOML file holding the sync fields at top level.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Rejects values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::Config("concurrency must be at least 1".to_string()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".to_string()));
        }
        if self.sync_interval_ms == 0 || self.queue_drain_interval_ms == 0 {
            return Err(Error::Config("timer intervals must be positive".to_string()));
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err(Error::Config(
                "retry_max_delay_ms must not be below retry_base_delay_ms".to_string(),
            ));
        }
        Ok(())
    }

    pub fn strategy_table(&self) -> StrategyTable {
        let mut table = StrategyTable::new(self.default_strategy);
        table.extend(self.strategies.iter().map(|(t, s)| (t.clone(), *s)));
        table
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn queue_drain_interval(&self) -> Duration {
        Duration::from_millis(self.queue_drain_interval_ms)
    }

    /// Wait before the next attempt of an item that failed `retry_count` times.
    pub fn retry_delay_ms(&self, retry_count: u32) -> u64 {
        if retry_count == 0 {
            return 0;
        }
        let shift = (retry_count - 1).min(32);
        self.retry_base_delay_ms
            .saturating_mul(1u64 << shift)
            .min(self.retry_max_delay_ms)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
