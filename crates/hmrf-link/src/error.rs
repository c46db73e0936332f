// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types for hmrf-link

use thiserror::Error;

/// Result type for link operations
pub type Result<T> = std::result::Result<T, LinkError>;

/// Errors returned by the link stack.
///
/// Only setup and teardown paths return these. Background loops log and
/// drop bad input instead of propagating it.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("UART driver not installed")]
    NotStarted,

    #[error("already started")]
    AlreadyStarted,

    #[error("LED registry full ({0} slots)")]
    LedRegistryFull(usize),

    #[error("unknown LED handle {0}")]
    UnknownLed(usize),

    #[error("failed to spawn thread: {0}")]
    Spawn(String),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}
