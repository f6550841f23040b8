// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon configuration, read from `orgsync.toml` in the state directory.
//!
//! ```toml
//! org_id = "acme"
//! relay_url = "ws://relay.example:7890"
//!
//! [sync]
//! concurrency = 3
//!
//! [sync.strategies]
//! knowledge = "lww"
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};

use orgsync_core::SyncConfig;

use crate::error::{DaemonError, Result};

/// Config filename within the state directory.
pub const CONFIG_NAME: &str = "orgsync.toml";

pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:7890";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    /// Organization this device syncs.
    #[serde(default)]
    pub org_id: String,

    #[serde(default = "default_relay_url")]
    pub relay_url: String,

    /// SQLite store; relative paths are resolved against the state directory.
    #[serde(default = "default_database")]
    pub database: PathBuf,

    /// Device key file; relative paths are resolved against the state directory.
    #[serde(default = "default_identity")]
    pub identity: PathBuf,

    /// Display name for a newly generated identity.
    #[serde(default)]
    pub display_name: Option<String>,

    #[serde(default)]
    pub sync: SyncConfig,
}

fn default_relay_url() -> String {
    DEFAULT_RELAY_URL.to_string()
}

fn default_database() -> PathBuf {
    PathBuf::from("orgsync.db")
}

fn default_identity() -> PathBuf {
    PathBuf::from("identity.json")
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            org_id: String::new(),
            relay_url: default_relay_url(),
            database: default_database(),
            identity: default_identity(),
            display_name: None,
            sync: SyncConfig::default(),
        }
    }
}

/// Command-line and environment values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub org_id: Option<String>,
    pub relay_url: Option<String>,
}

impl DaemonConfig {
    /// Parses a config document. Does not validate; see [`DaemonConfig::validate`].
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| DaemonError::Config(format!("invalid {CONFIG_NAME}: {e}")))
    }

    /// Loads `path`, or the defaults when it does not exist, applies
    /// `overrides` and validates the result.
    pub fn load(path: &Path, overrides: Overrides) -> Result<Self> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                DaemonConfig::default()
            }
            Err(e) => return Err(e.into()),
        };
        if let Some(org_id) = overrides.org_id {
            config.org_id = org_id;
        }
        if let Some(relay_url) = overrides.relay_url {
            config.relay_url = relay_url;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.org_id.trim().is_empty() {
            return Err(DaemonError::Config(format!(
                "org_id is required (set it in {CONFIG_NAME} or pass --org)"
            )));
        }
        if !(self.relay_url.starts_with("ws://") || self.relay_url.starts_with("wss://")) {
            return Err(DaemonError::Config(format!(
                "relay_url must be a ws:// or wss:// URL, got '{}'",
                self.relay_url
            )));
        }
        self.sync.validate()?;
        Ok(())
    }

    pub fn database_path(&self, state_dir: &Path) -> PathBuf {
        state_dir.join(&self.database)
    }

    pub fn identity_path(&self, state_dir: &Path) -> PathBuf {
        state_dir.join(&self.identity)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
