//! Two-priority event queue.
//!
//! Completion events represent synchronous follow-ups dispatched from within
//! entry actions and effects; they must be drained before any queued normal
//! event so chained internal progression finishes before new external input
//! is considered. Normal events are FIFO, completion events LIFO.

use crate::event::Event;
use crate::kind::Kind;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Thread-safe queue with a normal FIFO bucket and a completion LIFO bucket.
#[derive(Debug, Default)]
pub struct EventQueue {
    inner: Mutex<Buckets>,
}

#[derive(Debug, Default)]
struct Buckets {
    normal: VecDeque<Event>,
    completion: Vec<Event>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes an event into the bucket matching its kind.
    pub fn push(&self, event: Event) {
        let mut inner = self.inner.lock();
        if event.kind.is(Kind::COMPLETION_EVENT) {
            inner.completion.push(event);
        } else {
            inner.normal.push_back(event);
        }
    }

    /// Pops the next event: the most recent completion event if any exist,
    /// else the oldest normal event.
    pub fn pop(&self) -> Option<Event> {
        let mut inner = self.inner.lock();
        if let Some(event) = inner.completion.pop() {
            return Some(event);
        }
        inner.normal.pop_front()
    }

    /// Appends events to the tail of the normal bucket, preserving order.
    /// Used to re-queue deferred events after an RTC sweep.
    pub fn requeue(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        inner.normal.extend(events);
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.normal.len() + inner.completion.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
