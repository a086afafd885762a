//! Outgoing segment backlog
//!
//! FIFO hand-off between the transmission control (producer) and the
//! query pump (consumer). Insertion order is transmission order.

use crate::segment::Segment;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Inner {
    queue: VecDeque<Segment>,
    latest: Option<Segment>,
}

/// Segments waiting to be carried by a DNS query or answer
#[derive(Debug, Default)]
pub struct SegmentBacklog {
    inner: Mutex<Inner>,
}

impl SegmentBacklog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock cannot leave the queue half-updated
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a newly produced segment
    pub fn absorb(&self, segment: Segment) {
        let mut inner = self.lock();
        inner.latest = Some(segment.clone());
        inner.queue.push_back(segment);
    }

    /// Remove and return the oldest pending segment
    pub fn pop(&self) -> Option<Segment> {
        self.lock().queue.pop_front()
    }

    /// Inspect the oldest pending segment without removing it
    pub fn first(&self) -> Option<Segment> {
        self.lock().queue.front().cloned()
    }

    /// Most recently absorbed segment, whether or not it was popped since
    pub fn latest(&self) -> Option<Segment> {
        self.lock().latest.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }
}
