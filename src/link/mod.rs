//! Radio link boundary.
//!
//! The mesh radio accepts one message at a time and reports, some time later,
//! whether the peer confirmed it. This module defines that contract and the
//! pieces built on it:
//!
//! - [`RadioLink`]: "send one message, get one confirmation"
//! - [`tracker`]: the process-wide table enforcing a single send in flight
//! - [`submit`]: bounded submission retries on top of tracker and link
//! - [`memory`]: in-process paired link with fault injection
//! - [`backhaul`]: radio messages carried between two gateways over TCP

pub mod backhaul;
pub mod memory;
pub mod submit;
pub mod tracker;

pub use backhaul::{BackhaulLink, Frame, FrameDecoder, FrameError};
pub use memory::MemoryLink;
pub use submit::{MeshSender, SubmitError};
pub use tracker::{DeliveryTracker, SendSlot, TrackerError};

use std::io;
use std::sync::Arc;

/// Radio identity (GID) of a mesh node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one accepted send, used to match its completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(pub u64);

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Why an accepted send was not confirmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryFailure {
    /// The link went down while the message was in flight.
    LinkDisrupted,
    /// The peer never acknowledged the message.
    NoResponse,
    /// Any other driver-reported failure.
    Other(String),
}

impl std::fmt::Display for DeliveryFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LinkDisrupted => write!(f, "link disrupted"),
            Self::NoResponse => write!(f, "no response"),
            Self::Other(msg) => write!(f, "{}", msg),
        }
    }
}

/// Completion of one accepted send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    /// Send this outcome belongs to.
    pub correlation_id: CorrelationId,
    /// `Ok` when the peer confirmed delivery.
    pub result: Result<(), DeliveryFailure>,
}

impl SendOutcome {
    /// Confirmed delivery.
    pub fn confirmed(correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id,
            result: Ok(()),
        }
    }

    /// Unconfirmed delivery.
    pub fn failed(correlation_id: CorrelationId, failure: DeliveryFailure) -> Self {
        Self {
            correlation_id,
            result: Err(failure),
        }
    }
}

/// Receives the completion of accepted sends.
pub trait CompletionHandler: Send + Sync {
    /// Called exactly once per accepted send, from any thread.
    fn on_complete(&self, outcome: SendOutcome);
}

/// Receives messages arriving from the mesh.
pub trait InboundHandler: Send + Sync {
    /// Called once per received message.
    fn on_message(&self, sender: PeerId, payload: &[u8]);
}

/// A single-message-in-flight radio transport.
pub trait RadioLink: Send + Sync {
    /// Submit one message.
    ///
    /// On success the message is accepted and `on_complete` will be called
    /// exactly once with the returned correlation id. The call may happen
    /// before this method returns.
    fn send(
        &self,
        dest: PeerId,
        payload: &[u8],
        on_complete: Arc<dyn CompletionHandler>,
    ) -> Result<CorrelationId, LinkError>;

    /// Best-effort view of the link state.
    fn is_connected(&self) -> bool;

    /// Largest payload [`send`](Self::send) accepts.
    fn max_payload(&self) -> usize;
}

/// Synchronous submission failures.
#[derive(Debug)]
pub enum LinkError {
    /// Payload exceeds the link's maximum.
    PayloadTooLarge { len: usize, max: usize },
    /// The link is down.
    NotConnected,
    /// The driver refused the submission.
    Rejected(String),
    /// I/O error while handing the message to the driver.
    Io(io::Error),
}

impl std::fmt::Display for LinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PayloadTooLarge { len, max } => {
                write!(f, "payload too large: {} bytes (max {})", len, max)
            }
            Self::NotConnected => write!(f, "link not connected"),
            Self::Rejected(reason) => write!(f, "submission rejected: {}", reason),
            Self::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for LinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for LinkError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
