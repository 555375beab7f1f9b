//! In-process radio link.
//!
//! [`MemoryLink::pair`] returns two connected endpoints. Every accepted send
//! is handed to the other endpoint's [`InboundHandler`] on a delivery thread
//! and then completed, so completions arrive asynchronously as they do from a
//! real radio driver. Faults can be injected to exercise retry and teardown
//! paths:
//!
//! - [`reject_next`](MemoryLink::reject_next): refuse the next submissions
//! - [`set_connected`](MemoryLink::set_connected): fail submissions with `NotConnected`
//! - [`set_drop_deliveries`](MemoryLink::set_drop_deliveries): accept but never deliver

use super::{
    CompletionHandler, CorrelationId, DeliveryFailure, InboundHandler, LinkError, PeerId,
    RadioLink, SendOutcome,
};
use crate::config::DEFAULT_MAX_PAYLOAD;
use log::{debug, trace};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::thread;

#[derive(Default)]
struct Endpoint {
    inbound: Mutex<Option<Arc<dyn InboundHandler>>>,
}

impl Endpoint {
    fn handler(&self) -> Option<Arc<dyn InboundHandler>> {
        lock(&self.inbound).clone()
    }
}

struct Delivery {
    correlation_id: CorrelationId,
    dest: PeerId,
    payload: Vec<u8>,
    on_complete: Arc<dyn CompletionHandler>,
}

#[derive(Debug)]
struct Faults {
    connected: bool,
    reject_next: u32,
}

/// One endpoint of an in-process link pair.
pub struct MemoryLink {
    id: PeerId,
    peer: PeerId,
    local: Arc<Endpoint>,
    max_payload: usize,
    faults: Mutex<Faults>,
    drop_deliveries: Arc<AtomicBool>,
    next_id: AtomicU64,
    sent: Mutex<Vec<(PeerId, Vec<u8>)>>,
    queue: Mutex<mpsc::Sender<Delivery>>,
}

impl MemoryLink {
    /// Create two endpoints, `a` and `b`, connected to each other.
    pub fn pair(a: PeerId, b: PeerId) -> (Self, Self) {
        let endpoint_a = Arc::new(Endpoint::default());
        let endpoint_b = Arc::new(Endpoint::default());
        (
            Self::new(a, b, endpoint_a.clone(), endpoint_b.clone()),
            Self::new(b, a, endpoint_b, endpoint_a),
        )
    }

    fn new(id: PeerId, peer: PeerId, local: Arc<Endpoint>, remote: Arc<Endpoint>) -> Self {
        let (tx, rx) = mpsc::channel::<Delivery>();
        let drop_deliveries = Arc::new(AtomicBool::new(false));
        let dropping = drop_deliveries.clone();

        thread::spawn(move || {
            for delivery in rx {
                let result = if dropping.load(Ordering::Acquire) {
                    Err(DeliveryFailure::NoResponse)
                } else if delivery.dest != peer {
                    debug!("No node {} on this link", delivery.dest);
                    Err(DeliveryFailure::NoResponse)
                } else {
                    match remote.handler() {
                        Some(handler) => {
                            handler.on_message(id, &delivery.payload);
                            Ok(())
                        }
                        None => Err(DeliveryFailure::NoResponse),
                    }
                };
                delivery.on_complete.on_complete(SendOutcome {
                    correlation_id: delivery.correlation_id,
                    result,
                });
            }
            trace!("Memory link {} delivery thread exiting", id);
        });

        Self {
            id,
            peer,
            local,
            max_payload: DEFAULT_MAX_PAYLOAD,
            faults: Mutex::new(Faults {
                connected: true,
                reject_next: 0,
            }),
            drop_deliveries,
            next_id: AtomicU64::new(1),
            sent: Mutex::new(Vec::new()),
            queue: Mutex::new(tx),
        }
    }

    /// Use a different maximum payload.
    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    /// This endpoint's identity.
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// The other endpoint's identity.
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Hand messages sent by the peer to `handler`.
    pub fn attach_inbound(&self, handler: Arc<dyn InboundHandler>) {
        *lock(&self.local.inbound) = Some(handler);
    }

    /// Stop delivering messages to the attached handler.
    pub fn detach_inbound(&self) {
        *lock(&self.local.inbound) = None;
    }

    /// Refuse the next `count` submissions with `Rejected`.
    pub fn reject_next(&self, count: u32) {
        lock(&self.faults).reject_next = count;
    }

    /// Simulate the link going down or coming back.
    pub fn set_connected(&self, connected: bool) {
        lock(&self.faults).connected = connected;
    }

    /// Accept submissions but never deliver them.
    pub fn set_drop_deliveries(&self, drop: bool) {
        self.drop_deliveries.store(drop, Ordering::Release);
    }

    /// Every accepted send so far, in submission order.
    pub fn sent(&self) -> Vec<(PeerId, Vec<u8>)> {
        lock(&self.sent).clone()
    }
}

impl RadioLink for MemoryLink {
    fn send(
        &self,
        dest: PeerId,
        payload: &[u8],
        on_complete: Arc<dyn CompletionHandler>,
    ) -> Result<CorrelationId, LinkError> {
        if payload.len() > self.max_payload {
            return Err(LinkError::PayloadTooLarge {
                len: payload.len(),
                max: self.max_payload,
            });
        }

        {
            let mut faults = lock(&self.faults);
            if !faults.connected {
                return Err(LinkError::NotConnected);
            }
            if faults.reject_next > 0 {
                faults.reject_next -= 1;
                return Err(LinkError::Rejected("radio busy".into()));
            }
        }

        let correlation_id = CorrelationId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.sent).push((dest, payload.to_vec()));

        let delivery = Delivery {
            correlation_id,
            dest,
            payload: payload.to_vec(),
            on_complete,
        };
        lock(&self.queue)
            .send(delivery)
            .map_err(|_| LinkError::NotConnected)?;

        trace!(
            "Memory link {} queued {} for {} ({} bytes)",
            self.id,
            correlation_id,
            dest,
            payload.len()
        );
        Ok(correlation_id)
    }

    fn is_connected(&self) -> bool {
        lock(&self.faults).connected
    }

    fn max_payload(&self) -> usize {
        self.max_payload
    }
}

impl std::fmt::Debug for MemoryLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLink")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("max_payload", &self.max_payload)
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Handle poisoned mutex - recover by taking the inner value
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
