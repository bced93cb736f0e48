// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The user-visible session state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// User-visible state of a session.
///
/// There is no terminal state: Idle after a completed run differs from
/// Idle-at-creation only through the transitions history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Running,
    Suspended,
}

impl SessionState {
    /// Wire-format string for this state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Suspended => "suspended",
        }
    }

    /// Whether the state machine permits `self -> to`.
    ///
    /// ```text
    /// Idle      -> Running
    /// Running   -> Suspended | Idle
    /// Suspended -> Running | Idle
    /// ```
    ///
    /// Self-loops are rejected like every other unlisted pair.
    pub fn can_transition_to(self, to: SessionState) -> bool {
        matches!(
            (self, to),
            (Self::Idle, Self::Running)
                | (Self::Running, Self::Suspended)
                | (Self::Running, Self::Idle)
                | (Self::Suspended, Self::Running)
                | (Self::Suspended, Self::Idle)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One applied state change. Immutable once appended to the history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub from: SessionState,
    pub to: SessionState,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
