// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("{0}")]
    Core(#[from] orgsync_core::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("another orgsyncd instance is already running in {0}")]
    AlreadyRunning(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DaemonError>;
