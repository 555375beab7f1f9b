//! Submission with bounded retries.
//!
//! A submission is retried when the radio refuses to accept it (busy, not
//! connected). Once the radio accepts a message its delivery outcome is only
//! reported, never retried: the tracker logs it and the next segment goes out.
//! The backoff between attempts is fixed.

use super::{CompletionHandler, CorrelationId, DeliveryTracker, LinkError, PeerId, RadioLink};
use crate::config::RetryPolicy;
use crate::signal::StopSignal;
use crate::stats::GatewayStats;
use log::{debug, error, warn};
use std::sync::Arc;

/// Submits messages over a [`RadioLink`], one at a time.
pub struct MeshSender {
    link: Arc<dyn RadioLink>,
    tracker: Arc<DeliveryTracker>,
    policy: RetryPolicy,
    stats: Arc<GatewayStats>,
}

impl MeshSender {
    /// Create a sender sharing `tracker` with every other sender of the process.
    pub fn new(
        link: Arc<dyn RadioLink>,
        tracker: Arc<DeliveryTracker>,
        policy: RetryPolicy,
        stats: Arc<GatewayStats>,
    ) -> Self {
        Self {
            link,
            tracker,
            policy,
            stats,
        }
    }

    /// The underlying link.
    pub fn link(&self) -> &Arc<dyn RadioLink> {
        &self.link
    }

    /// The shared delivery tracker.
    pub fn tracker(&self) -> &Arc<DeliveryTracker> {
        &self.tracker
    }

    /// Submit one message, blocking until the link accepted it.
    ///
    /// Waits for the tracker's send slot, then tries up to
    /// `policy.max_attempts` times with `policy.backoff` in between.
    /// `PayloadTooLarge` is returned immediately. Stopping `stop` abandons
    /// the submission with [`SubmitError::Cancelled`].
    pub fn submit(
        &self,
        dest: PeerId,
        payload: &[u8],
        description: &str,
        stop: &StopSignal,
    ) -> Result<CorrelationId, SubmitError> {
        let mut last = None;

        for attempt in 1..=self.policy.max_attempts {
            if attempt > 1 {
                GatewayStats::incr(&self.stats.submission_retries);
                if !stop.sleep(self.policy.backoff()) {
                    return Err(SubmitError::Cancelled);
                }
            }

            let slot = loop {
                if stop.is_stopped() {
                    return Err(SubmitError::Cancelled);
                }
                if let Some(slot) = self.tracker.acquire(self.policy.slot_poll()) {
                    break slot;
                }
            };

            let handler: Arc<dyn CompletionHandler> = self.tracker.clone();
            match self.link.send(dest, payload, handler) {
                Ok(correlation_id) => {
                    slot.commit(correlation_id, description.to_string());
                    GatewayStats::incr(&self.stats.segments_sent);
                    debug!(
                        "Submitted {} to {} as {} ({} bytes)",
                        description,
                        dest,
                        correlation_id,
                        payload.len()
                    );
                    return Ok(correlation_id);
                }
                Err(LinkError::PayloadTooLarge { len, max }) => {
                    error!("Cannot submit {}: {} bytes exceeds {}", description, len, max);
                    return Err(SubmitError::PayloadTooLarge { len, max });
                }
                Err(e) => {
                    warn!(
                        "Submission attempt {}/{} of {} failed: {}",
                        attempt, self.policy.max_attempts, description, e
                    );
                    last = Some(e);
                }
            }
        }

        GatewayStats::incr(&self.stats.submission_failures);
        error!(
            "Giving up on {} after {} attempts",
            description, self.policy.max_attempts
        );
        Err(SubmitError::Exhausted {
            attempts: self.policy.max_attempts,
            last,
        })
    }
}

impl std::fmt::Debug for MeshSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshSender")
            .field("policy", &self.policy)
            .field("tracker", &self.tracker)
            .finish()
    }
}

/// Submission errors.
#[derive(Debug)]
pub enum SubmitError {
    /// Payload exceeds the link's maximum; never retried.
    PayloadTooLarge { len: usize, max: usize },
    /// Every attempt was refused.
    Exhausted {
        attempts: u32,
        last: Option<LinkError>,
    },
    /// The stop signal fired before the link accepted the message.
    Cancelled,
}

impl std::fmt::Display for SubmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PayloadTooLarge { len, max } => {
                write!(f, "payload too large: {} bytes (max {})", len, max)
            }
            Self::Exhausted {
                attempts,
                last: Some(e),
            } => write!(f, "submission failed after {} attempts: {}", attempts, e),
            Self::Exhausted { attempts, last: None } => {
                write!(f, "submission failed after {} attempts", attempts)
            }
            Self::Cancelled => write!(f, "submission cancelled"),
        }
    }
}

impl std::error::Error for SubmitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Exhausted { last: Some(e), .. } => Some(e),
            _ => None,
        }
    }
}
