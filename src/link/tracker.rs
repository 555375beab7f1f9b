//! Delivery tracker.
//!
//! The radio accepts one message at a time, so the gateway keeps a table of
//! outstanding sends that never holds more than one entry. A sender claims
//! the table with [`DeliveryTracker::acquire`], submits to the link, and
//! records the returned correlation id with [`SendSlot::commit`]. The entry is
//! removed when the link reports completion through [`CompletionHandler`], or
//! evicted once it is older than the configured completion timeout.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use mesh_tunnel::link::{CompletionHandler, CorrelationId, DeliveryTracker, SendOutcome};
//! use mesh_tunnel::{GatewayStats, TrackerConfig};
//!
//! let tracker = DeliveryTracker::new(TrackerConfig::default(), Arc::new(GatewayStats::default()));
//!
//! let slot = tracker.acquire(Duration::from_secs(1)).unwrap();
//! slot.commit(CorrelationId(1), "segment 0/1".into());
//! assert!(tracker.acquire(Duration::from_millis(10)).is_none());
//!
//! tracker.on_complete(SendOutcome::confirmed(CorrelationId(1)));
//! assert!(tracker.is_idle());
//! ```

use super::{CompletionHandler, CorrelationId, DeliveryFailure, SendOutcome};
use crate::config::TrackerConfig;
use crate::stats::GatewayStats;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// An accepted send awaiting completion.
#[derive(Debug, Clone)]
struct PendingSend {
    description: String,
    submitted_at: Instant,
}

#[derive(Debug, Default)]
struct TrackerState {
    /// Outstanding sends; never more than one entry.
    pending: HashMap<CorrelationId, PendingSend>,
    /// A sender holds the slot but has not committed yet.
    claimed: bool,
    /// Completions that arrived while the slot was claimed but uncommitted.
    early: HashMap<CorrelationId, Result<(), DeliveryFailure>>,
}

impl TrackerState {
    fn is_free(&self) -> bool {
        self.pending.is_empty() && !self.claimed
    }
}

/// Process-wide table of outstanding radio sends.
pub struct DeliveryTracker {
    state: Mutex<TrackerState>,
    changed: Condvar,
    config: TrackerConfig,
    stats: Arc<GatewayStats>,
}

impl DeliveryTracker {
    /// Create an empty tracker.
    pub fn new(config: TrackerConfig, stats: Arc<GatewayStats>) -> Self {
        Self {
            state: Mutex::new(TrackerState::default()),
            changed: Condvar::new(),
            config,
            stats,
        }
    }

    /// Record an outstanding send directly.
    ///
    /// Fails with [`TrackerError::AlreadyPending`] if another send is
    /// outstanding or a sender holds the slot.
    pub fn reserve(
        &self,
        correlation_id: CorrelationId,
        description: String,
    ) -> Result<(), TrackerError> {
        let mut state = self.lock();
        if !state.is_free() {
            return Err(TrackerError::AlreadyPending);
        }
        state.pending.insert(
            correlation_id,
            PendingSend {
                description,
                submitted_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Remove an outstanding send and return its description.
    pub fn resolve(&self, correlation_id: CorrelationId) -> Option<String> {
        let mut state = self.lock();
        let removed = state.pending.remove(&correlation_id);
        if removed.is_some() {
            self.changed.notify_all();
        }
        removed.map(|p| p.description)
    }

    /// Wait until no send is outstanding and claim the slot.
    ///
    /// Returns `None` if the slot did not become free within `timeout`.
    /// Entries older than the completion timeout are evicted while waiting.
    pub fn acquire(&self, timeout: Duration) -> Option<SendSlot<'_>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();

        loop {
            self.evict_stale(&mut state);

            if state.is_free() {
                state.claimed = true;
                state.early.clear();
                return Some(SendSlot {
                    tracker: self,
                    committed: false,
                });
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }

            let mut wait = deadline - now;
            if let Some(expiry) = self.next_expiry(&state) {
                wait = wait.min(expiry.saturating_duration_since(now));
            }
            state = match self.changed.wait_timeout(state, wait) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Returns true if no send is outstanding and the slot is unclaimed.
    pub fn is_idle(&self) -> bool {
        self.lock().is_free()
    }

    /// Number of outstanding sends (0 or 1).
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    fn complete(&self, outcome: SendOutcome) {
        let mut state = self.lock();

        if let Some(pending) = state.pending.remove(&outcome.correlation_id) {
            self.changed.notify_all();
            drop(state);
            self.report(outcome.correlation_id, &pending.description, &outcome.result);
            return;
        }

        if state.claimed {
            // Synchronous links complete before the sender commits.
            state.early.insert(outcome.correlation_id, outcome.result);
            return;
        }

        debug!(
            "Completion for unknown send {} ({:?})",
            outcome.correlation_id, outcome.result
        );
    }

    fn report(
        &self,
        correlation_id: CorrelationId,
        description: &str,
        result: &Result<(), DeliveryFailure>,
    ) {
        match result {
            Ok(()) => {
                info!("Delivered {} ({})", correlation_id, description);
                GatewayStats::incr(&self.stats.deliveries_confirmed);
            }
            Err(failure) => {
                warn!(
                    "Delivery unconfirmed {} ({}): {}",
                    correlation_id, description, failure
                );
                GatewayStats::incr(&self.stats.deliveries_unconfirmed);
            }
        }
    }

    fn evict_stale(&self, state: &mut TrackerState) {
        let timeout = self.config.completion_timeout();
        let stale: Vec<CorrelationId> = state
            .pending
            .iter()
            .filter(|(_, p)| p.submitted_at.elapsed() >= timeout)
            .map(|(id, _)| *id)
            .collect();

        for id in stale {
            if let Some(pending) = state.pending.remove(&id) {
                warn!(
                    "Delivery unconfirmed {} ({}): no completion after {:?}",
                    id, pending.description, timeout
                );
                GatewayStats::incr(&self.stats.deliveries_unconfirmed);
            }
        }
    }

    fn next_expiry(&self, state: &TrackerState) -> Option<Instant> {
        let timeout = self.config.completion_timeout();
        state
            .pending
            .values()
            .map(|p| p.submitted_at + timeout)
            .min()
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        // Handle poisoned mutex - recover by taking the inner value
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl CompletionHandler for DeliveryTracker {
    fn on_complete(&self, outcome: SendOutcome) {
        self.complete(outcome);
    }
}

impl std::fmt::Debug for DeliveryTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("DeliveryTracker")
            .field("pending", &state.pending.len())
            .field("claimed", &state.claimed)
            .finish()
    }
}

/// Exclusive right to submit the next send.
///
/// Dropping an uncommitted slot releases it.
pub struct SendSlot<'a> {
    tracker: &'a DeliveryTracker,
    committed: bool,
}

impl SendSlot<'_> {
    /// Record the send the link accepted.
    pub fn commit(mut self, correlation_id: CorrelationId, description: String) {
        self.committed = true;
        let tracker = self.tracker;
        let mut state = tracker.lock();
        state.claimed = false;

        let early = state.early.remove(&correlation_id);
        state.early.clear();

        match early {
            Some(result) => {
                tracker.changed.notify_all();
                drop(state);
                tracker.report(correlation_id, &description, &result);
            }
            None => {
                state.pending.insert(
                    correlation_id,
                    PendingSend {
                        description,
                        submitted_at: Instant::now(),
                    },
                );
            }
        }
    }
}

impl Drop for SendSlot<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut state = self.tracker.lock();
        state.claimed = false;
        state.early.clear();
        self.tracker.changed.notify_all();
    }
}

/// Tracker errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerError {
    /// Another send is outstanding.
    AlreadyPending,
}

impl std::fmt::Display for TrackerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyPending => write!(f, "a send is already pending"),
        }
    }
}

impl std::error::Error for TrackerError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::thread;

    fn tracker() -> DeliveryTracker {
        DeliveryTracker::new(TrackerConfig::default(), Arc::new(GatewayStats::default()))
    }

    #[test]
    fn test_reserve_rejects_second_send() {
        let tracker = tracker();
        tracker.reserve(CorrelationId(1), "first".into()).unwrap();
        assert_eq!(
            tracker.reserve(CorrelationId(2), "second".into()),
            Err(TrackerError::AlreadyPending)
        );
        assert_eq!(tracker.pending_count(), 1);
    }

    #[test]
    fn test_reserve_after_resolve() {
        let tracker = tracker();
        tracker.reserve(CorrelationId(1), "first".into()).unwrap();
        assert_eq!(tracker.resolve(CorrelationId(1)), Some("first".to_string()));
        assert!(tracker.is_idle());
        assert!(tracker.reserve(CorrelationId(2), "second".into()).is_ok());
    }

    #[test]
    fn test_resolve_unknown() {
        let tracker = tracker();
        assert_eq!(tracker.resolve(CorrelationId(99)), None);
    }

    #[test]
    fn test_acquire_times_out_while_pending() {
        let tracker = tracker();
        tracker.reserve(CorrelationId(1), "busy".into()).unwrap();
        assert!(tracker.acquire(Duration::from_millis(20)).is_none());
    }

    #[test]
    fn test_acquire_excludes_second_sender() {
        let tracker = tracker();
        let slot = tracker.acquire(Duration::from_millis(10)).unwrap();
        assert!(tracker.acquire(Duration::from_millis(10)).is_none());
        assert!(tracker.reserve(CorrelationId(1), "x".into()).is_err());
        drop(slot);
        assert!(tracker.is_idle());
        assert!(tracker.acquire(Duration::from_millis(10)).is_some());
    }

    #[test]
    fn test_completion_wakes_waiting_sender() {
        let tracker = Arc::new(tracker());
        tracker
            .acquire(Duration::from_millis(10))
            .unwrap()
            .commit(CorrelationId(1), "segment 0/1".into());

        let completer = {
            let tracker = tracker.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                tracker.on_complete(SendOutcome::confirmed(CorrelationId(1)));
            })
        };

        let start = Instant::now();
        let slot = tracker.acquire(Duration::from_secs(5));
        assert!(slot.is_some());
        assert!(start.elapsed() < Duration::from_secs(5));
        completer.join().unwrap();
        assert_eq!(
            tracker.stats.deliveries_confirmed.load(Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn test_early_completion_matched_at_commit() {
        let tracker = tracker();
        let slot = tracker.acquire(Duration::from_millis(10)).unwrap();
        tracker.on_complete(SendOutcome::failed(
            CorrelationId(5),
            DeliveryFailure::LinkDisrupted,
        ));
        slot.commit(CorrelationId(5), "segment 2/3".into());

        assert!(tracker.is_idle());
        assert_eq!(
            tracker.stats.deliveries_unconfirmed.load(Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn test_unknown_completion_ignored() {
        let tracker = tracker();
        tracker.on_complete(SendOutcome::confirmed(CorrelationId(77)));
        assert!(tracker.is_idle());
        assert_eq!(
            tracker.stats.deliveries_confirmed.load(Ordering::Relaxed),
            0
        );
    }

    #[test]
    fn test_stale_entry_evicted() {
        let tracker = DeliveryTracker::new(
            TrackerConfig {
                completion_timeout_ms: 20,
            },
            Arc::new(GatewayStats::default()),
        );
        tracker.reserve(CorrelationId(1), "lost".into()).unwrap();

        let slot = tracker.acquire(Duration::from_secs(5));
        assert!(slot.is_some());
        assert_eq!(
            tracker.stats.deliveries_unconfirmed.load(Ordering::Relaxed),
            1
        );
    }
}
