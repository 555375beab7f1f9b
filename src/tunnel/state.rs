//! Tunnel lifecycle.

use crate::signal::StopSignal;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Tunnel lifecycle states.
///
/// ```text
/// Establishing ──▶ Active ──▶ Draining ──▶ Closed
///       │                                    ▲
///       └────────── open failure ────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TunnelState {
    /// Responder is opening the local connection.
    Establishing,
    /// Both contexts are moving data.
    Active,
    /// Stop requested; the writer is closing the socket.
    Draining,
    /// Socket closed, threads finished or finishing.
    Closed,
}

impl TunnelState {
    /// Returns true for `Establishing` and `Active`.
    pub fn is_running(self) -> bool {
        matches!(self, Self::Establishing | Self::Active)
    }
}

impl std::fmt::Display for TunnelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Establishing => "establishing",
            Self::Active => "active",
            Self::Draining => "draining",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Why a tunnel was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// No data moved in either direction for the idle window.
    IdleTimeout,
    /// The peer sent a close signal.
    PeerClosed,
    /// The local destination could not be reached.
    OpenFailed,
    /// Reading or writing the local socket failed.
    LocalIo,
    /// The local socket kept resetting.
    ResetRetriesExhausted,
    /// The radio refused a segment for the whole retry budget.
    SubmissionFailed,
    /// A segment exceeded the radio's maximum payload.
    PayloadTooLarge,
    /// The registry is shutting down.
    Shutdown,
}

impl CloseReason {
    /// Whether the peer should receive a close signal for this teardown.
    pub fn notifies_peer(self) -> bool {
        matches!(
            self,
            Self::OpenFailed | Self::LocalIo | Self::ResetRetriesExhausted
        )
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::IdleTimeout => "idle timeout",
            Self::PeerClosed => "closed by peer",
            Self::OpenFailed => "open failed",
            Self::LocalIo => "local I/O error",
            Self::ResetRetriesExhausted => "connection reset retries exhausted",
            Self::SubmissionFailed => "submission failed",
            Self::PayloadTooLarge => "payload too large",
            Self::Shutdown => "shutdown",
        };
        f.write_str(text)
    }
}

#[derive(Debug)]
struct LifecycleState {
    state: TunnelState,
    reason: Option<CloseReason>,
    closed_at: Option<Instant>,
}

/// State, close reason and stop signal of one tunnel.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    inner: Mutex<LifecycleState>,
    changed: Condvar,
    stop: StopSignal,
}

impl Lifecycle {
    pub(crate) fn new(initial: TunnelState) -> Self {
        Self {
            inner: Mutex::new(LifecycleState {
                state: initial,
                reason: None,
                closed_at: None,
            }),
            changed: Condvar::new(),
            stop: StopSignal::new(),
        }
    }

    pub(crate) fn state(&self) -> TunnelState {
        self.lock().state
    }

    pub(crate) fn reason(&self) -> Option<CloseReason> {
        self.lock().reason
    }

    pub(crate) fn closed_at(&self) -> Option<Instant> {
        self.lock().closed_at
    }

    pub(crate) fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    /// `Establishing -> Active`. Fails if a stop was requested meanwhile.
    pub(crate) fn activate(&self) -> bool {
        let mut inner = self.lock();
        if inner.state != TunnelState::Establishing {
            return false;
        }
        inner.state = TunnelState::Active;
        self.changed.notify_all();
        true
    }

    /// Request teardown. The first reason wins.
    ///
    /// Returns `true` if this call initiated the teardown.
    pub(crate) fn request_stop(&self, reason: CloseReason) -> bool {
        let first = {
            let mut inner = self.lock();
            if !inner.state.is_running() {
                false
            } else {
                inner.state = TunnelState::Draining;
                if inner.reason.is_none() {
                    inner.reason = Some(reason);
                }
                self.changed.notify_all();
                true
            }
        };
        self.stop.stop();
        first
    }

    /// Enter `Closed` and return the recorded reason.
    pub(crate) fn close(&self, fallback: CloseReason) -> CloseReason {
        let reason = {
            let mut inner = self.lock();
            inner.state = TunnelState::Closed;
            if inner.closed_at.is_none() {
                inner.closed_at = Some(Instant::now());
            }
            let reason = *inner.reason.get_or_insert(fallback);
            self.changed.notify_all();
            reason
        };
        self.stop.stop();
        reason
    }

    /// Wait until `Closed`. Returns `false` on timeout.
    pub(crate) fn wait_closed(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        loop {
            if inner.state == TunnelState::Closed {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            inner = match self.changed.wait_timeout(inner, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn lock(&self) -> MutexGuard<'_, LifecycleState> {
        // Handle poisoned mutex - recover by taking the inner value
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
