use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::api::events::InboundEvent;
use crate::api::models::ServerId;

/// Default time an event waits for the message it references.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(10);
pub const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug)]
pub struct Deferred {
    pub target: ServerId,
    pub event: InboundEvent,
    pub received_at: Instant,
}

/// Events that arrived before the message they reference, in arrival order.
#[derive(Debug)]
pub struct DeferredEvents {
    window: Duration,
    capacity: usize,
    entries: VecDeque<Deferred>,
}

impl DeferredEvents {
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            window,
            capacity: capacity.max(1),
            entries: VecDeque::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_waiting_on(&self, target: ServerId) -> bool {
        self.entries.iter().any(|d| d.target == target)
    }

    /// Buffers `event`. Returns the oldest entry when the buffer was full.
    pub fn push(&mut self, target: ServerId, event: InboundEvent, now: Instant) -> Option<Deferred> {
        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(Deferred {
            target,
            event,
            received_at: now,
        });
        evicted
    }

    /// Removes and returns every event waiting on `target`, oldest first.
    pub fn take_for(&mut self, target: ServerId) -> Vec<InboundEvent> {
        if !self.is_waiting_on(target) {
            return Vec::new();
        }
        let (ready, rest): (VecDeque<_>, VecDeque<_>) =
            self.entries.drain(..).partition(|d| d.target == target);
        self.entries = rest;
        ready.into_iter().map(|d| d.event).collect()
    }

    /// Drops and returns events that have waited longer than the window.
    pub fn expire(&mut self, now: Instant) -> Vec<Deferred> {
        let window = self.window;
        let (expired, rest): (VecDeque<_>, VecDeque<_>) = self
            .entries
            .drain(..)
            .partition(|d| now.saturating_duration_since(d.received_at) > window);
        self.entries = rest;
        expired.into_iter().collect()
    }
}
