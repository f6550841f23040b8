// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Environment variables read by the daemon.

use std::path::PathBuf;

/// Generated environment variable name constants.
pub mod names {
    include!(concat!(env!("OUT_DIR"), "/env_names.rs"));
}

/// Returns the value of `ORGSYNC_STATE_DIR` if set.
pub fn state_dir() -> Option<PathBuf> {
    std::env::var(names::ORGSYNC_STATE_DIR).ok().map(PathBuf::from)
}

/// Returns the value of `ORGSYNC_RELAY_URL` if set and non-empty.
pub fn relay_url() -> Option<String> {
    std::env::var(names::ORGSYNC_RELAY_URL).ok().filter(|v| !v.is_empty())
}

/// Returns the value of `XDG_STATE_HOME` if set.
pub fn xdg_state_home() -> Option<PathBuf> {
    std::env::var(names::XDG_STATE_HOME).ok().map(PathBuf::from)
}

/// Names of the known variables set in this process.
pub fn set_names() -> Vec<&'static str> {
    names::ALL.iter().copied().filter(|name| std::env::var_os(name).is_some()).collect()
}

/// Where the daemon keeps its database, key and log when not told otherwise.
pub fn default_state_dir() -> PathBuf {
    if let Some(dir) = state_dir() {
        return dir;
    }
    if let Some(dir) = xdg_state_home() {
        return dir.join("orgsync");
    }
    dirs::home_dir()
        .map(|h| h.join(".local/state/orgsync"))
        .unwrap_or_else(|| PathBuf::from(".local/state/orgsync"))
}

#[cfg(test)]
#[path = "env_tests.rs"]
mod tests;
