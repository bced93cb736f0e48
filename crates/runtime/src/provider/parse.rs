// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Incremental parser for the agent line protocol: one JSON document per
//! line, translated into domain events. Used by the stdio, pty, and
//! sidecar providers.
//!
//! A malformed line never kills the stream — it degrades to a non-fatal
//! `Error` event and parsing continues. Lines beyond the configured byte
//! cap are dropped the same way.

use crate::event::Event;
use crate::session::SessionState;

/// Line-buffered translator from agent output bytes to events.
#[derive(Debug)]
pub struct LineParser {
    line_buf: Vec<u8>,
    max_line_bytes: usize,
    /// Set while discarding an oversized line up to its terminator.
    overflowed: bool,
    /// Last state the agent announced; seeds `old_state` on the next
    /// status line. Agents start out running.
    last_state: SessionState,
}

impl LineParser {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            line_buf: Vec::new(),
            max_line_bytes,
            overflowed: false,
            last_state: SessionState::Running,
        }
    }

    /// Feed one chunk of raw agent output, returning the events completed
    /// by it. Partial trailing lines stay buffered for the next chunk.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Event> {
        let mut events = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let (line_end, remainder) = rest.split_at(pos);
            rest = &remainder[1..];

            if self.overflowed {
                // The terminator of the oversized line: report and resync.
                self.overflowed = false;
                self.line_buf.clear();
                events.push(Event::error(
                    "",
                    format!("agent line exceeds {} bytes, dropped", self.max_line_bytes),
                    Some("line_too_long".to_owned()),
                ));
                continue;
            }

            self.line_buf.extend_from_slice(line_end);
            let line = std::mem::take(&mut self.line_buf);
            if let Some(event) = self.parse_line(&line) {
                events.push(event);
            }
        }

        if !self.overflowed {
            self.line_buf.extend_from_slice(rest);
            if self.line_buf.len() > self.max_line_bytes {
                self.line_buf.clear();
                self.overflowed = true;
            }
        }

        events
    }

    /// Flush any buffered partial line at EOF.
    pub fn finish(&mut self) -> Option<Event> {
        if self.overflowed {
            self.overflowed = false;
            return Some(Event::error(
                "",
                format!("agent line exceeds {} bytes, dropped", self.max_line_bytes),
                Some("line_too_long".to_owned()),
            ));
        }
        if self.line_buf.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.line_buf);
        self.parse_line(&line)
    }

    fn parse_line(&mut self, line: &[u8]) -> Option<Event> {
        let trimmed = trim_ascii(line);
        if trimmed.is_empty() {
            return None;
        }

        let value: serde_json::Value = match serde_json::from_slice(trimmed) {
            Ok(value) => value,
            Err(err) => {
                return Some(Event::error(
                    "",
                    format!("malformed agent line: {err}"),
                    Some("parse".to_owned()),
                ));
            }
        };

        match value.get("type").and_then(|t| t.as_str()) {
            Some("output") => {
                let content = value.get("content").and_then(|c| c.as_str()).unwrap_or_default();
                Some(Event::output("", content))
            }
            Some("status") => {
                let state = value.get("state").and_then(|s| s.as_str()).unwrap_or_default();
                let Some(new_state) = parse_state(state) else {
                    return Some(Event::error(
                        "",
                        format!("unknown agent state: {state}"),
                        Some("parse".to_owned()),
                    ));
                };
                let reason =
                    value.get("reason").and_then(|r| r.as_str()).map(ToOwned::to_owned);
                let old_state = self.last_state;
                self.last_state = new_state;
                Some(Event::status_change("", old_state, new_state, reason))
            }
            Some("metric") => Some(Event::metric(
                "",
                value.get("tokens_in").and_then(|v| v.as_u64()).unwrap_or(0),
                value.get("tokens_out").and_then(|v| v.as_u64()).unwrap_or(0),
                value.get("request_count").and_then(|v| v.as_u64()).unwrap_or(0),
            )),
            Some("error") => {
                let message =
                    value.get("message").and_then(|m| m.as_str()).unwrap_or_default();
                let code = value.get("code").and_then(|c| c.as_str()).map(ToOwned::to_owned);
                Some(Event::error("", message, code))
            }
            Some("metadata") => {
                let key = value.get("key").and_then(|k| k.as_str()).unwrap_or_default();
                let payload = value.get("value").cloned().unwrap_or(serde_json::Value::Null);
                Some(Event::metadata("", key, payload))
            }
            Some(other) => Some(Event::error(
                "",
                format!("unknown agent event type: {other}"),
                Some("parse".to_owned()),
            )),
            None => Some(Event::error(
                "",
                "agent line missing type field",
                Some("parse".to_owned()),
            )),
        }
    }
}

/// Encode one user input for the stdio/sidecar input direction.
pub fn encode_input(text: &str) -> String {
    serde_json::json!({ "type": "input", "text": text }).to_string()
}

fn parse_state(state: &str) -> Option<SessionState> {
    match state {
        "idle" => Some(SessionState::Idle),
        "running" => Some(SessionState::Running),
        "suspended" => Some(SessionState::Suspended),
        _ => None,
    }
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |p| p + 1);
    &bytes[start..end]
}

#[cfg(test)]
#[path = "parse_tests.rs"]
mod tests;
