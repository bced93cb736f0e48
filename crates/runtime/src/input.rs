// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Input buffering between the executor and a provider's input loop:
//! a bounded queue with pause/buffer/flush semantics.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Bounded FIFO of input strings feeding one provider.
///
/// While paused, sends land in an overflow buffer that is flushed back
/// into the queue in insertion order on resume. While unpaused, sends
/// block until queue space frees up or the caller's cancellation fires.
pub struct InputBuffer {
    tx: Mutex<Option<mpsc::Sender<String>>>,
    rx: Mutex<Option<mpsc::Receiver<String>>>,
    shared: Mutex<Overflow>,
}

struct Overflow {
    paused: bool,
    buffered: VecDeque<String>,
    /// Overflow cap; zero means unbounded.
    cap: usize,
}

impl InputBuffer {
    /// `capacity` bounds the consumer queue; `overflow_cap` bounds the
    /// paused-side buffer (zero = unbounded).
    pub fn new(capacity: usize, overflow_cap: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            shared: Mutex::new(Overflow { paused: false, buffered: VecDeque::new(), cap: overflow_cap }),
        }
    }

    /// Queue one input item.
    ///
    /// Unpaused sends first flush any overflow leftovers so insertion
    /// order is preserved; if leftovers still don't fit, the new item
    /// queues behind them in the overflow buffer instead of jumping ahead.
    pub async fn send(&self, cancel: &CancellationToken, input: String) -> Result<()> {
        let Some(tx) = self.tx.lock().clone() else {
            return Err(Error::ProviderIo("input buffer closed".to_owned()));
        };

        {
            let mut shared = self.shared.lock();
            if shared.paused {
                return push_overflow(&mut shared, input);
            }
            if !flush_overflow(&mut shared, &tx)? {
                // Leftovers remain queued; keep FIFO by buffering behind them.
                return push_overflow(&mut shared, input);
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            sent = tx.send(input) => {
                sent.map_err(|_| Error::ProviderIo("input buffer closed".to_owned()))
            }
        }
    }

    /// Hand the consumer endpoint to the provider input loop. Yields once.
    pub fn take_receiver(&self) -> Option<mpsc::Receiver<String>> {
        self.rx.lock().take()
    }

    /// Retain subsequent sends in the overflow buffer.
    pub fn pause(&self) {
        self.shared.lock().paused = true;
    }

    /// Clear the paused flag and drain the overflow buffer into the queue
    /// without blocking. Items that don't fit stay buffered for the next
    /// resume or the next successful send.
    pub fn resume(&self) {
        let tx = self.tx.lock().clone();
        let mut shared = self.shared.lock();
        shared.paused = false;
        if let Some(tx) = tx {
            let _ = flush_overflow(&mut shared, &tx);
        }
    }

    pub fn is_paused(&self) -> bool {
        self.shared.lock().paused
    }

    /// Number of items waiting in the overflow buffer.
    pub fn buffered_len(&self) -> usize {
        self.shared.lock().buffered.len()
    }

    /// Close the consumer channel; further sends fail.
    pub fn close(&self) {
        self.tx.lock().take();
        self.shared.lock().buffered.clear();
    }
}

fn push_overflow(shared: &mut Overflow, input: String) -> Result<()> {
    if shared.cap > 0 && shared.buffered.len() >= shared.cap {
        return Err(Error::BufferFull);
    }
    shared.buffered.push_back(input);
    Ok(())
}

/// Non-blocking drain of the overflow buffer into the queue, preserving
/// insertion order. Returns `true` when the buffer is empty afterwards.
fn flush_overflow(shared: &mut Overflow, tx: &mpsc::Sender<String>) -> Result<bool> {
    while let Some(item) = shared.buffered.pop_front() {
        match tx.try_send(item) {
            Ok(()) => {}
            Err(TrySendError::Full(item)) => {
                shared.buffered.push_front(item);
                return Ok(false);
            }
            Err(TrySendError::Closed(_)) => {
                return Err(Error::ProviderIo("input buffer closed".to_owned()));
            }
        }
    }
    Ok(true)
}

#[cfg(test)]
#[path = "input_tests.rs"]
mod tests;
