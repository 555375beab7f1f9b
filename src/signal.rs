//! Cooperative stop signal for blocking threads.
//!
//! Tunnel threads cannot be preempted, so every wait they perform (backoff,
//! idle polling, waiting for the send slot) goes through a [`StopSignal`] that
//! wakes them early once a stop is requested.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// A one-shot flag with interruptible sleeps.
#[derive(Debug, Default)]
pub struct StopSignal {
    stopped: Mutex<bool>,
    changed: Condvar,
}

impl StopSignal {
    /// Create a signal that is not stopped.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop and wake every sleeper.
    ///
    /// Returns `true` if this call changed the state.
    pub fn stop(&self) -> bool {
        let mut stopped = self.lock();
        let changed = !*stopped;
        *stopped = true;
        self.changed.notify_all();
        changed
    }

    /// Check whether a stop was requested.
    pub fn is_stopped(&self) -> bool {
        *self.lock()
    }

    /// Sleep for `duration` unless stopped first.
    ///
    /// Returns `true` if the full duration elapsed, `false` if the signal
    /// was (or became) stopped.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut stopped = self.lock();
        loop {
            if *stopped {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            stopped = match self.changed.wait_timeout(stopped, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        // Handle poisoned mutex - recover by taking the inner value
        match self.stopped.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_sleep_runs_full_duration() {
        let signal = StopSignal::new();
        let start = Instant::now();
        assert!(signal.sleep(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_stop_interrupts_sleep() {
        let signal = Arc::new(StopSignal::new());
        let sleeper = {
            let signal = signal.clone();
            thread::spawn(move || {
                let start = Instant::now();
                let completed = signal.sleep(Duration::from_secs(10));
                (completed, start.elapsed())
            })
        };

        thread::sleep(Duration::from_millis(20));
        assert!(signal.stop());
        let (completed, elapsed) = sleeper.join().unwrap();
        assert!(!completed);
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let signal = StopSignal::new();
        assert!(!signal.is_stopped());
        assert!(signal.stop());
        assert!(!signal.stop());
        assert!(signal.is_stopped());
        assert!(!signal.sleep(Duration::from_millis(1)));
    }
}
