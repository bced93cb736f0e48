// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use thiserror::Error;

use crate::registry::RegistryError;
use crate::session::SessionState;

/// Result type for executor operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the executor API.
///
/// Synchronous calls return these unchanged. Failures that happen after
/// `start` has returned are delivered as `Error` events on the session
/// stream instead and never retroactively fail the call that caused them.
#[derive(Debug, Error)]
pub enum Error {
    /// No session with the given id.
    #[error("no such session: {0}")]
    NotFound(String),

    /// The state machine rejected the requested transition.
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: SessionState, to: SessionState },

    /// The provider does not implement the requested operation.
    #[error("provider {provider} does not support {operation}")]
    NotSupported { provider: String, operation: &'static str },

    /// The provider subprocess or connection could not be launched.
    #[error("provider start failed: {0}")]
    ProviderStart(String),

    /// Reading from or writing to the provider failed.
    #[error("provider i/o: {0}")]
    ProviderIo(String),

    /// The input buffer's overflow capacity was exceeded while paused.
    #[error("input buffer full")]
    BufferFull,

    /// The session's circuit breaker is in cooldown.
    #[error("circuit breaker open, retry in {retry_in:?}")]
    BreakerOpen { retry_in: Duration },

    /// Disk persistence failed.
    #[error("persistence: {0}")]
    Persistence(#[from] std::io::Error),

    /// The subprocess-command registry rejected a spawn request.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The caller's cancellation fired before the operation completed.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Stable wire-format code for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::NotSupported { .. } => "not_supported",
            Self::ProviderStart(_) => "provider_start",
            Self::ProviderIo(_) => "provider_io",
            Self::BufferFull => "buffer_full",
            Self::BreakerOpen { .. } => "breaker_open",
            Self::Persistence(_) => "persistence",
            Self::Registry(_) => "registry_rejected",
            Self::Cancelled => "cancelled",
        }
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
