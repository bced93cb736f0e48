// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The event model: a closed union of the five observable things that can
//! happen inside a session. Events are pure values — immutable once built
//! and safe to clone across tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::SessionState;

/// Error code reserved for unrecoverable provider transport failures.
///
/// The event pump treats a run as failed only when it observed an `Error`
/// event carrying this code; everything else (parse errors, agent-reported
/// errors) is non-fatal and the stream continues to EOF.
pub const FATAL_CODE: &str = "fatal";

/// One observable occurrence in a session.
///
/// Wire form: `{type, data, timestamp, session_id}` with RFC3339
/// timestamps and snake_case payload keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(flatten)]
    pub payload: EventPayload,
    pub timestamp: DateTime<Utc>,
    /// Empty when the emitting provider does not know its session; the
    /// event pump stamps it before the event leaves the runtime.
    pub session_id: String,
}

/// The five event variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    StatusChange {
        old_state: SessionState,
        new_state: SessionState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Output {
        content: String,
    },
    Metric {
        tokens_in: u64,
        tokens_out: u64,
        request_count: u64,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    Metadata {
        key: String,
        value: serde_json::Value,
    },
}

impl Event {
    /// Build an event stamped with the current time.
    pub fn new(session_id: impl Into<String>, payload: EventPayload) -> Self {
        Self { payload, timestamp: Utc::now(), session_id: session_id.into() }
    }

    pub fn status_change(
        session_id: impl Into<String>,
        old_state: SessionState,
        new_state: SessionState,
        reason: Option<String>,
    ) -> Self {
        Self::new(session_id, EventPayload::StatusChange { old_state, new_state, reason })
    }

    pub fn output(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(session_id, EventPayload::Output { content: content.into() })
    }

    pub fn metric(
        session_id: impl Into<String>,
        tokens_in: u64,
        tokens_out: u64,
        request_count: u64,
    ) -> Self {
        Self::new(session_id, EventPayload::Metric { tokens_in, tokens_out, request_count })
    }

    pub fn error(
        session_id: impl Into<String>,
        message: impl Into<String>,
        code: Option<String>,
    ) -> Self {
        Self::new(session_id, EventPayload::Error { message: message.into(), code })
    }

    /// An `Error` event marking an unrecoverable provider failure.
    pub fn fatal(session_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::error(session_id, message, Some(FATAL_CODE.to_owned()))
    }

    pub fn metadata(
        session_id: impl Into<String>,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        Self::new(session_id, EventPayload::Metadata { key: key.into(), value })
    }

    /// Wire-format discriminator for this event's variant.
    pub fn kind(&self) -> &'static str {
        match self.payload {
            EventPayload::StatusChange { .. } => "status_change",
            EventPayload::Output { .. } => "output",
            EventPayload::Metric { .. } => "metric",
            EventPayload::Error { .. } => "error",
            EventPayload::Metadata { .. } => "metadata",
        }
    }

    pub fn is_output(&self) -> bool {
        matches!(self.payload, EventPayload::Output { .. })
    }

    /// True for `Error` events carrying the [`FATAL_CODE`] marker.
    pub fn is_fatal(&self) -> bool {
        matches!(
            &self.payload,
            EventPayload::Error { code: Some(code), .. } if code == FATAL_CODE
        )
    }
}

#[cfg(test)]
#[path = "event_tests.rs"]
mod tests;
