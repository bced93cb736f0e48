// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Provider abstraction: one uniform capability set over heterogeneous
//! agent backends, plus the constructor registry mapping kind strings to
//! provider builders.

pub mod parse;
pub mod pty;
pub mod shell;
pub mod sidecar;
pub mod stdio;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::event::Event;
use crate::registry::CommandRegistry;
use crate::session::{MetricTotals, SessionConfig};

/// Bytes of recent output retained in a provider's status snapshot.
const STATUS_TAIL: usize = 4096;

/// Provider-level state, independent of the session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderState {
    Starting,
    Active,
    Exited,
    Failed,
}

impl Default for ProviderState {
    fn default() -> Self {
        Self::Starting
    }
}

/// Snapshot of a provider's observable state.
#[derive(Debug, Clone, Default)]
pub struct ProviderStatus {
    pub state: ProviderState,
    /// Tail of the most recent output.
    pub last_output: String,
    pub metrics: MetricTotals,
    /// Most recent non-fatal error, if any.
    pub last_error: Option<String>,
}

/// Shared, cheaply clonable status holder updated by a provider's reader
/// tasks and snapshotted by [`Provider::status`].
#[derive(Clone, Default)]
pub struct StatusCell(Arc<Mutex<ProviderStatus>>);

impl StatusCell {
    pub fn snapshot(&self) -> ProviderStatus {
        self.0.lock().clone()
    }

    pub fn set_state(&self, state: ProviderState) {
        self.0.lock().state = state;
    }

    pub fn record_output(&self, content: &str) {
        let mut status = self.0.lock();
        status.last_output.push_str(content);
        if status.last_output.len() > STATUS_TAIL {
            let mut cut = status.last_output.len() - STATUS_TAIL;
            while !status.last_output.is_char_boundary(cut) {
                cut += 1;
            }
            status.last_output.drain(..cut);
        }
    }

    pub fn record_error(&self, message: &str) {
        self.0.lock().last_error = Some(message.to_owned());
    }

    pub fn add_metrics(&self, tokens_in: u64, tokens_out: u64, request_count: u64) {
        self.0.lock().metrics.add(tokens_in, tokens_out, request_count);
    }
}

/// Tuning knobs shared by all provider variants, derived from the runtime
/// configuration.
#[derive(Debug, Clone, Copy)]
pub struct ProviderSettings {
    /// Hard cap on one JSON line from a stdio/pty/sidecar agent.
    pub max_line_bytes: usize,
    /// How long a sidecar gets to dial back before start fails.
    pub handshake_timeout: Duration,
    /// Capacity of the provider-owned event channel.
    pub channel_capacity: usize,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            max_line_bytes: 1024 * 1024,
            handshake_timeout: Duration::from_secs(10),
            channel_capacity: 256,
        }
    }
}

/// One external agent binding.
///
/// A provider owns its event stream and closes it when the run
/// terminates; the stream is yielded exactly once through
/// [`take_events`](Provider::take_events) to the run's event pump.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider kind string as registered with the factory.
    fn kind(&self) -> &'static str;

    /// Prepare the subprocess or connection. May emit events to the
    /// provider's event channel as part of starting.
    async fn start(&mut self, cancel: &CancellationToken, config: &SessionConfig) -> Result<()>;

    /// Push one piece of user input.
    async fn send_input(&self, cancel: &CancellationToken, text: &str) -> Result<()>;

    /// Graceful shutdown; idempotent.
    async fn stop(&self, cancel: &CancellationToken) -> Result<()>;

    /// Immediate termination; idempotent and non-blocking.
    fn kill(&self) -> Result<()>;

    /// Snapshot of provider state, recent output, metrics, and any
    /// non-fatal error.
    fn status(&self) -> ProviderStatus;

    /// Yield the provider-owned event receiver. Returns `None` on
    /// subsequent calls — there is exactly one consumer.
    fn take_events(&mut self) -> Option<mpsc::Receiver<Event>>;

    /// Whether `Executor::suspend` may pause this provider.
    fn supports_suspend(&self) -> bool {
        true
    }
}

/// Apply session working directory and environment to a command about to
/// be spawned. The config's environment overrides inherited variables.
pub(crate) fn prepare_command(cmd: &mut tokio::process::Command, config: &SessionConfig) {
    cmd.current_dir(&config.working_dir);
    for (key, value) in &config.environment {
        cmd.env(key, value);
    }
}

type Constructor = Box<dyn Fn() -> Box<dyn Provider> + Send + Sync>;

/// Maps provider kind strings to constructors.
pub struct ProviderFactory {
    ctors: HashMap<String, Constructor>,
}

impl ProviderFactory {
    pub fn new() -> Self {
        Self { ctors: HashMap::new() }
    }

    /// Factory with the four built-in variants registered.
    pub fn with_defaults(registry: Arc<CommandRegistry>, settings: ProviderSettings) -> Self {
        let mut factory = Self::new();
        {
            let registry = Arc::clone(&registry);
            factory.register("shell", move || {
                Box::new(shell::ShellProvider::new(Arc::clone(&registry), settings))
            });
        }
        {
            let registry = Arc::clone(&registry);
            factory.register("stdio", move || {
                Box::new(stdio::StdioProvider::new(Arc::clone(&registry), settings))
            });
        }
        {
            let registry = Arc::clone(&registry);
            factory.register("pty", move || {
                Box::new(pty::PtyProvider::new(Arc::clone(&registry), settings))
            });
        }
        factory.register("sidecar", move || {
            Box::new(sidecar::SidecarProvider::new(Arc::clone(&registry), settings))
        });
        factory
    }

    pub fn register(
        &mut self,
        kind: impl Into<String>,
        ctor: impl Fn() -> Box<dyn Provider> + Send + Sync + 'static,
    ) {
        self.ctors.insert(kind.into(), Box::new(ctor));
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.ctors.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.ctors.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Build a fresh provider for one run.
    pub fn build(&self, kind: &str) -> Result<Box<dyn Provider>> {
        match self.ctors.get(kind) {
            Some(ctor) => Ok(ctor()),
            None => Err(Error::ProviderStart(format!("unknown provider kind: {kind}"))),
        }
    }
}

impl Default for ProviderFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "factory_tests.rs"]
mod tests;
