// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! One execution of a provider within a session, with its own
//! cancellation scope. Sessions may accumulate multiple runs (restart).

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::provider::Provider;

/// Lifecycle of a single provider execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Starting,
    Active,
    Done,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// Supervision handle for one provider execution.
pub struct Run {
    provider: Arc<dyn Provider>,
    state: Mutex<RunState>,
    error: Mutex<Option<String>>,
    /// First stop/kill reason wins; labels the pump's final transition.
    stop_reason: Mutex<Option<String>>,
    cancel: CancellationToken,
    drained: CancellationToken,
}

impl Run {
    pub fn new(provider: Arc<dyn Provider>, cancel: CancellationToken) -> Self {
        Self {
            provider,
            state: Mutex::new(RunState::Starting),
            error: Mutex::new(None),
            stop_reason: Mutex::new(None),
            cancel,
            drained: CancellationToken::new(),
        }
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    pub fn state(&self) -> RunState {
        *self.state.lock()
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn error(&self) -> Option<String> {
        self.error.lock().clone()
    }

    pub fn set_active(&self) {
        let mut state = self.state.lock();
        if *state == RunState::Starting {
            *state = RunState::Active;
        }
    }

    pub fn finish_done(&self) {
        let mut state = self.state.lock();
        if !state.is_terminal() {
            *state = RunState::Done;
        }
    }

    pub fn finish_failed(&self, error: impl Into<String>) {
        let mut state = self.state.lock();
        if !state.is_terminal() {
            *state = RunState::Failed;
            *self.error.lock() = Some(error.into());
        }
    }

    /// Record why the run is being torn down. The first caller wins so a
    /// stop that later escalates to kill still reads as "stopped".
    pub fn set_stop_reason(&self, reason: &str) {
        let mut stop_reason = self.stop_reason.lock();
        if stop_reason.is_none() {
            *stop_reason = Some(reason.to_owned());
        }
    }

    pub fn stop_reason(&self) -> Option<String> {
        self.stop_reason.lock().clone()
    }

    /// Cancellation scope covering the provider and its pumps.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Mark the event pump as drained. Idempotent.
    pub fn mark_drained(&self) {
        self.drained.cancel();
    }

    pub fn is_drained(&self) -> bool {
        self.drained.is_cancelled()
    }

    /// Completes once the event pump for this run has drained.
    pub async fn wait_drained(&self) {
        self.drained.cancelled().await;
    }
}

#[cfg(test)]
#[path = "run_tests.rs"]
mod tests;
