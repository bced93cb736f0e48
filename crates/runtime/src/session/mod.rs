// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session domain object: identity, configuration, state machine,
//! accumulators, and the snapshot facility.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub mod state;

pub use state::{SessionState, Transition};

/// Descriptor for an agent subprocess a provider may spawn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCommand {
    pub name: String,
    pub command: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Immutable configuration a session is created with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Provider kind resolved through the provider factory.
    pub provider: String,
    pub working_dir: PathBuf,
    /// Extra environment for the agent subprocess; overrides inherited vars.
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Agent subprocess descriptors, validated against the command registry.
    #[serde(default)]
    pub commands: Vec<AgentCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    /// Provider-specific options bag.
    #[serde(default)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl SessionConfig {
    pub fn new(provider: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            provider: provider.into(),
            working_dir: working_dir.into(),
            environment: HashMap::new(),
            system_prompt: None,
            commands: Vec::new(),
            task: None,
            options: serde_json::Map::new(),
        }
    }

    pub fn with_command(mut self, command: AgentCommand) -> Self {
        self.commands.push(command);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.task = Some(task.into());
        self
    }
}

/// Accumulated usage totals reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricTotals {
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub request_count: u64,
}

impl MetricTotals {
    pub fn add(&mut self, tokens_in: u64, tokens_out: u64, request_count: u64) {
        self.tokens_in += tokens_in;
        self.tokens_out += tokens_out;
        self.request_count += request_count;
    }
}

/// A live session. Mutations happen under the owning executor's
/// per-session lock; [`Session::snapshot`] returns an atomic copy.
#[derive(Debug)]
pub struct Session {
    id: String,
    config: SessionConfig,
    state: SessionState,
    task: Option<String>,
    output: String,
    last_error: Option<String>,
    metrics: MetricTotals,
    transitions: Vec<Transition>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    output_cap: usize,
}

/// Atomic copy of a session's visible state; also the persisted document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub config: SessionConfig,
    pub state: SessionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub metrics: MetricTotals,
    pub transitions: Vec<Transition>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: impl Into<String>, config: SessionConfig, output_cap: usize) -> Self {
        let now = Utc::now();
        let task = config.task.clone();
        Self {
            id: id.into(),
            config,
            state: SessionState::Idle,
            task,
            output: String::new(),
            last_error: None,
            metrics: MetricTotals::default(),
            transitions: Vec::new(),
            created_at: now,
            updated_at: now,
            output_cap,
        }
    }

    /// Rebuild a session from a persisted snapshot.
    pub fn from_snapshot(snapshot: SessionSnapshot, output_cap: usize) -> Self {
        Self {
            id: snapshot.id,
            config: snapshot.config,
            state: snapshot.state,
            task: snapshot.task,
            output: snapshot.output,
            last_error: snapshot.last_error,
            metrics: snapshot.metrics,
            transitions: snapshot.transitions,
            created_at: snapshot.created_at,
            updated_at: snapshot.updated_at,
            output_cap,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Apply one state transition, appending the history record atomically
    /// with the state change. Illegal transitions leave the session
    /// untouched.
    pub fn transition_to(&mut self, to: SessionState, reason: impl Into<String>) -> Result<Transition> {
        if !self.state.can_transition_to(to) {
            return Err(Error::InvalidTransition { from: self.state, to });
        }
        // Transition timestamps are monotonic non-decreasing even if the
        // wall clock steps backwards.
        let mut timestamp = Utc::now();
        if let Some(last) = self.transitions.last() {
            if timestamp < last.timestamp {
                timestamp = last.timestamp;
            }
        }
        let transition =
            Transition { from: self.state, to, reason: reason.into(), timestamp };
        self.state = to;
        self.transitions.push(transition.clone());
        self.updated_at = timestamp;
        Ok(transition)
    }

    /// Append provider output to the rolling snapshot, clipping the front
    /// to the configured byte cap on a char boundary.
    pub fn append_output(&mut self, content: &str) {
        self.output.push_str(content);
        if self.output.len() > self.output_cap {
            let mut cut = self.output.len() - self.output_cap;
            while !self.output.is_char_boundary(cut) {
                cut += 1;
            }
            self.output.drain(..cut);
        }
        self.touch();
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.last_error = Some(message.into());
        self.touch();
    }

    pub fn add_metrics(&mut self, tokens_in: u64, tokens_out: u64, request_count: u64) {
        self.metrics.add(tokens_in, tokens_out, request_count);
        self.touch();
    }

    pub fn set_task(&mut self, task: impl Into<String>) {
        self.task = Some(task.into());
        self.touch();
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            config: self.config.clone(),
            state: self.state,
            task: self.task.clone(),
            output: self.output.clone(),
            last_error: self.last_error.clone(),
            metrics: self.metrics,
            transitions: self.transitions.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    fn touch(&mut self) {
        let now = Utc::now();
        if now > self.updated_at {
            self.updated_at = now;
        }
    }
}

#[cfg(test)]
#[path = "../session_tests.rs"]
mod tests;
