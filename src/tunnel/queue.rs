//! Outbound segment queue.
//!
//! FIFO between a tunnel's reader context (producer) and writer context
//! (consumer). The writer blocks on a condition variable while the queue is
//! empty; closing the queue wakes it.

use crate::codec::Segment;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct QueueState {
    segments: VecDeque<Segment>,
    closed: bool,
}

/// FIFO of segments waiting for the radio.
#[derive(Debug, Default)]
pub(crate) struct OutboundQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl OutboundQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append segments in order. Ignored once closed.
    pub(crate) fn push_all(&self, segments: impl IntoIterator<Item = Segment>) -> usize {
        let mut state = self.lock();
        if state.closed {
            return 0;
        }
        let before = state.segments.len();
        state.segments.extend(segments);
        let added = state.segments.len() - before;
        if added > 0 {
            self.available.notify_one();
        }
        added
    }

    /// Take the oldest segment, waiting up to `timeout`.
    ///
    /// Returns `None` on timeout or once the queue is closed.
    pub(crate) fn pop_timeout(&self, timeout: Duration) -> Option<Segment> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(segment) = state.segments.pop_front() {
                return Some(segment);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = match self.available.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Close the queue, wake the consumer and discard what is left.
    ///
    /// Returns the number of discarded segments.
    pub(crate) fn close(&self) -> usize {
        let mut state = self.lock();
        state.closed = true;
        let discarded = state.segments.len();
        state.segments.clear();
        self.available.notify_all();
        discarded
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().segments.len()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // Handle poisoned mutex - recover by taking the inner value
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
