// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Many-to-many event fan-out with bounded per-subscriber channels.
//!
//! Producers never block: a subscriber whose channel is full drops that
//! event. Delivered events always arrive in broadcast order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::trace;

use crate::event::Event;

/// Fan-out distributor of session events.
#[derive(Default)]
pub struct EventBroadcaster {
    registry: Arc<Mutex<Registry>>,
    next_id: AtomicU64,
}

#[derive(Default)]
struct Registry {
    subscribers: HashMap<u64, mpsc::Sender<Event>>,
    closed: bool,
}

/// One subscriber's endpoint. Unregisters on [`Subscription::cancel`] or
/// drop; after that the subscriber receives no further events.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Event>,
    registry: Arc<Mutex<Registry>>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber with its own bounded channel.
    ///
    /// Subscribing after [`close`](Self::close) yields an immediately
    /// end-of-stream subscription.
    pub fn subscribe(&self, capacity: usize) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(capacity.max(1));
        {
            let mut registry = self.registry.lock();
            if !registry.closed {
                registry.subscribers.insert(id, tx);
            }
        }
        Subscription { id, rx, registry: Arc::clone(&self.registry) }
    }

    /// Deliver one event to every live subscriber without blocking.
    ///
    /// Returns `false` once the broadcaster is closed. Subscribers with a
    /// full channel miss this event; everything they do receive stays in
    /// broadcast order.
    pub fn broadcast(&self, event: &Event) -> bool {
        let senders: Vec<(u64, mpsc::Sender<Event>)> = {
            let registry = self.registry.lock();
            if registry.closed {
                return false;
            }
            registry.subscribers.iter().map(|(id, tx)| (*id, tx.clone())).collect()
        };

        for (id, tx) in senders {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    trace!(subscriber = id, kind = event.kind(), "subscriber full, dropping event");
                }
                Err(TrySendError::Closed(_)) => {
                    self.registry.lock().subscribers.remove(&id);
                }
            }
        }
        true
    }

    /// Close every subscriber's channel exactly once and reject further
    /// broadcasts.
    pub fn close(&self) {
        let mut registry = self.registry.lock();
        registry.closed = true;
        registry.subscribers.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.lock().subscribers.len()
    }
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Receive the next event; `None` once the broadcaster closed or the
    /// subscription was cancelled.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Unregister explicitly. Equivalent to dropping the subscription.
    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.lock().subscribers.remove(&self.id);
    }
}

#[cfg(test)]
#[path = "broadcast_tests.rs"]
mod tests;
