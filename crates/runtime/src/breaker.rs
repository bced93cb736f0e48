// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Circuit breaker guarding session restarts against flapping providers.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Consecutive-failure counter with a cooldown window.
///
/// Trips after `threshold` consecutive failures and then refuses work for
/// `cooldown`. All operations are atomic with respect to concurrent
/// callers.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    failures: u32,
    cooldown_until: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self { threshold, cooldown, inner: Mutex::new(Inner::default()) }
    }

    /// Record one failure. Returns `true` when this failure trips the
    /// breaker: the counter reached the threshold, the cooldown window
    /// opened, and the counter reset.
    pub fn record_failure(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.failures += 1;
        if inner.failures >= self.threshold {
            inner.failures = 0;
            inner.cooldown_until = Some(Instant::now() + self.cooldown);
            return true;
        }
        false
    }

    /// Whether the breaker currently refuses work.
    pub fn is_in_cooldown(&self) -> bool {
        match self.inner.lock().cooldown_until {
            Some(until) => Instant::now() < until,
            None => false,
        }
    }

    /// Time until the cooldown window closes, clamped at zero.
    pub fn cooldown_remaining(&self) -> Duration {
        match self.inner.lock().cooldown_until {
            Some(until) => until.saturating_duration_since(Instant::now()),
            None => Duration::ZERO,
        }
    }

    /// Clear the failure counter and any open cooldown window.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.failures = 0;
        inner.cooldown_until = None;
    }
}

#[cfg(test)]
#[path = "breaker_tests.rs"]
mod tests;
