//! Tunnel registry.
//!
//! Maps tunnel ids to live tunnels and is the single entry point for inbound
//! tunnel segments. The map lock is held only to look up, insert or remove
//! entries; socket writes happen after it is released.
//!
//! # Routing
//!
//! | Tunnel for id            | Segment         | Outcome                          |
//! |--------------------------|-----------------|----------------------------------|
//! | none or not running      | setup           | new responder tunnel             |
//! | none or not running      | anything else   | dropped (`UnknownTunnel`)        |
//! | running, other peer      | any             | dropped (`PeerMismatch`)         |
//! | running                  | close signal    | tunnel torn down, entry removed  |
//! | running                  | data            | handed to the tunnel             |

use crate::codec::{Destination, Segment, TunnelId, TUNNEL_ID_LEN};
use crate::link::PeerId;
use crate::stats::GatewayStats;
use crate::tunnel::{Tunnel, TunnelContext, TunnelError};
use log::{debug, error, info, warn};
use rand_core::{OsRng, RngCore};
use std::collections::HashMap;
use std::net::TcpStream;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Why an inbound segment was not routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// No running tunnel and no destination to open one.
    UnknownTunnel,
    /// The tunnel belongs to another peer.
    PeerMismatch,
    /// A setup segment without payload for a tunnel that is already running.
    DuplicateSetup,
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownTunnel => write!(f, "unknown tunnel"),
            Self::PeerMismatch => write!(f, "peer mismatch"),
            Self::DuplicateSetup => write!(f, "duplicate setup"),
        }
    }
}

/// Result of routing one inbound segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// A responder tunnel was created.
    Established,
    /// The segment was handed to its tunnel.
    Delivered,
    /// The peer's close signal tore the tunnel down.
    PeerClosed,
    /// The segment was discarded.
    Dropped(DropReason),
    /// The tunnel failed locally and was removed.
    LocalFailure,
}

/// Tunnel id to tunnel map.
pub struct TunnelRegistry {
    tunnels: Mutex<HashMap<TunnelId, Arc<Tunnel>>>,
    context: TunnelContext,
}

impl TunnelRegistry {
    /// Create an empty registry.
    pub fn new(context: TunnelContext) -> Self {
        Self {
            tunnels: Mutex::new(HashMap::new()),
            context,
        }
    }

    /// Dependencies handed to every tunnel.
    pub fn context(&self) -> &TunnelContext {
        &self.context
    }

    /// Route one inbound segment from `sender`.
    pub fn route(&self, sender: PeerId, segment: Segment) -> RouteOutcome {
        let id = segment.tunnel_id.clone();
        let stats = &self.context.stats;

        let tunnel = {
            let mut tunnels = self.lock();
            let running = tunnels.get(&id).filter(|t| t.is_running()).cloned();
            match running {
                Some(tunnel) => tunnel,
                None => {
                    let Some(destination) = segment.setup.clone() else {
                        // A draining tunnel stays until closed so shutdown waits for it.
                        let closed = tunnels.get(&id).is_some_and(|t| t.closed_at().is_some());
                        if closed {
                            tunnels.remove(&id);
                            self.update_gauge(&tunnels);
                        }
                        debug!("Dropping segment for unknown tunnel {}", id);
                        GatewayStats::incr(&stats.dropped_messages);
                        return RouteOutcome::Dropped(DropReason::UnknownTunnel);
                    };

                    let tunnel = match Tunnel::open_responder(
                        id.clone(),
                        sender,
                        destination,
                        self.context.clone(),
                    ) {
                        Ok(tunnel) => tunnel,
                        Err(e) => {
                            error!("Tunnel {}: cannot create: {}", id, e);
                            return RouteOutcome::LocalFailure;
                        }
                    };
                    tunnels.retain(|_, t| t.closed_at().is_none());
                    tunnels.insert(id.clone(), tunnel.clone());
                    self.update_gauge(&tunnels);
                    drop(tunnels);

                    if !segment.payload.is_empty() {
                        if let Err(e) = tunnel.deliver(segment.index, segment.count, &segment.payload) {
                            warn!("Tunnel {}: setup payload not delivered: {}", id, e);
                        }
                    }
                    return RouteOutcome::Established;
                }
            }
        };

        if tunnel.peer() != sender {
            warn!(
                "Dropping segment for tunnel {} from {} (owned by {})",
                id,
                sender,
                tunnel.peer()
            );
            GatewayStats::incr(&stats.dropped_messages);
            return RouteOutcome::Dropped(DropReason::PeerMismatch);
        }

        if segment.is_close_signal() {
            tunnel.close_from_peer();
            self.remove(&tunnel);
            return RouteOutcome::PeerClosed;
        }

        if segment.is_setup() && segment.payload.is_empty() {
            debug!("Tunnel {}: ignoring repeated setup", id);
            GatewayStats::incr(&stats.dropped_messages);
            return RouteOutcome::Dropped(DropReason::DuplicateSetup);
        }

        match tunnel.deliver(segment.index, segment.count, &segment.payload) {
            Ok(()) => RouteOutcome::Delivered,
            Err(TunnelError::NotRunning) => {
                self.remove(&tunnel);
                GatewayStats::incr(&stats.dropped_messages);
                RouteOutcome::Dropped(DropReason::UnknownTunnel)
            }
            Err(e) => {
                warn!("Tunnel {}: {}", id, e);
                self.remove(&tunnel);
                RouteOutcome::LocalFailure
            }
        }
    }

    /// Open an initiator tunnel for an accepted local client.
    ///
    /// The tunnel gets a fresh random id.
    pub fn open_outbound(
        &self,
        peer: PeerId,
        stream: TcpStream,
        destination: Destination,
    ) -> Result<Arc<Tunnel>, TunnelError> {
        // Inserted under the lock so replies to the setup segment find it.
        let mut tunnels = self.lock();
        let id = loop {
            let id = random_tunnel_id();
            if !tunnels.contains_key(&id) {
                break id;
            }
        };

        let tunnel =
            Tunnel::open_initiator(id.clone(), peer, stream, destination, self.context.clone())?;
        tunnels.insert(id, tunnel.clone());
        self.update_gauge(&tunnels);
        Ok(tunnel)
    }

    /// Look up a tunnel.
    pub fn get(&self, id: &TunnelId) -> Option<Arc<Tunnel>> {
        self.lock().get(id).cloned()
    }

    /// Ids of every entry, running or not.
    pub fn ids(&self) -> Vec<TunnelId> {
        self.lock().keys().cloned().collect()
    }

    /// Number of entries, running or not.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if the registry holds no entries.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Number of running tunnels.
    pub fn active_count(&self) -> usize {
        self.lock().values().filter(|t| t.is_running()).count()
    }

    /// Remove every closed tunnel. Returns how many were removed.
    pub fn reap(&self) -> usize {
        let mut tunnels = self.lock();
        let before = tunnels.len();
        tunnels.retain(|_, t| t.closed_at().is_none());
        let removed = before - tunnels.len();
        if removed > 0 {
            self.update_gauge(&tunnels);
            debug!("Reaped {} closed tunnels", removed);
        }
        removed
    }

    /// Stop every tunnel and wait up to `timeout` for them to close.
    pub fn shutdown(&self, timeout: Duration) {
        let tunnels: Vec<Arc<Tunnel>> = {
            let mut map = self.lock();
            let drained = map.drain().map(|(_, t)| t).collect();
            self.update_gauge(&map);
            drained
        };
        if tunnels.is_empty() {
            return;
        }

        info!("Stopping {} tunnels", tunnels.len());
        for tunnel in &tunnels {
            tunnel.shutdown();
        }

        let deadline = Instant::now() + timeout;
        for tunnel in &tunnels {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !tunnel.wait_closed(remaining) {
                warn!("Tunnel {} did not close in time", tunnel.id());
            }
        }
    }

    fn remove(&self, tunnel: &Arc<Tunnel>) {
        let mut tunnels = self.lock();
        let same = tunnels
            .get(tunnel.id())
            .is_some_and(|t| Arc::ptr_eq(t, tunnel));
        if same {
            tunnels.remove(tunnel.id());
            self.update_gauge(&tunnels);
        }
    }

    fn update_gauge(&self, tunnels: &HashMap<TunnelId, Arc<Tunnel>>) {
        self.context
            .stats
            .active_tunnels
            .store(tunnels.len(), Ordering::Relaxed);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TunnelId, Arc<Tunnel>>> {
        // Handle poisoned mutex - recover by taking the inner value
        match self.tunnels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl std::fmt::Debug for TunnelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelRegistry")
            .field("tunnels", &self.len())
            .finish()
    }
}

/// Random id from the operating system RNG.
fn random_tunnel_id() -> TunnelId {
    let mut bytes = [0u8; TUNNEL_ID_LEN];
    OsRng.fill_bytes(&mut bytes);
    TunnelId::new(bytes.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RetryPolicy, TrackerConfig, TunnelConfig};
    use crate::link::{CorrelationId, DeliveryTracker, MemoryLink, MeshSender};
    use crate::tunnel::{CloseReason, TunnelState};
    use std::io::Read;
    use std::net::TcpListener;
    use std::thread;

    const WAIT: Duration = Duration::from_secs(5);

    fn registry() -> (TunnelRegistry, Arc<MemoryLink>) {
        let (registry, link, _) = registry_with_slot_poll(10);
        (registry, link)
    }

    fn registry_with_slot_poll(
        slot_poll_ms: u64,
    ) -> (TunnelRegistry, Arc<MemoryLink>, Arc<DeliveryTracker>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let (a, _b) = MemoryLink::pair(PeerId(1), PeerId(2));
        let link = Arc::new(a);
        let stats = Arc::new(GatewayStats::default());
        let tracker = Arc::new(DeliveryTracker::new(TrackerConfig::default(), stats.clone()));
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff_ms: 10,
            slot_poll_ms,
        };
        let sender = Arc::new(MeshSender::new(
            link.clone(),
            tracker.clone(),
            policy,
            stats.clone(),
        ));
        let config = TunnelConfig {
            poll_interval_ms: 20,
            connect_timeout_ms: 1_000,
            ..Default::default()
        };
        let registry = TunnelRegistry::new(TunnelContext {
            sender,
            config,
            stats,
        });
        (registry, link, tracker)
    }

    fn id(n: u8) -> TunnelId {
        TunnelId::new(vec![n; 8])
    }

    fn setup_for(id: TunnelId, listener: &TcpListener) -> Segment {
        let addr = listener.local_addr().unwrap();
        Segment::setup(id, Destination::new(addr.ip().to_string(), addr.port()))
    }

    fn refused_destination() -> Destination {
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        Destination::new("127.0.0.1", port)
    }

    #[test]
    fn test_data_for_unknown_tunnel_dropped() {
        let (registry, link) = registry();
        let outcome = registry.route(PeerId(2), Segment::data(id(1), 0, 1, b"x".to_vec()));

        assert_eq!(outcome, RouteOutcome::Dropped(DropReason::UnknownTunnel));
        assert!(registry.is_empty());
        assert_eq!(
            registry.context().stats.dropped_messages.load(Ordering::Relaxed),
            1
        );
        thread::sleep(Duration::from_millis(50));
        assert!(link.sent().is_empty());
    }

    #[test]
    fn test_setup_creates_tunnel_and_data_follows() {
        let (registry, _link) = registry();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();

        assert_eq!(
            registry.route(PeerId(2), setup_for(id(1), &listener)),
            RouteOutcome::Established
        );
        assert_eq!(registry.len(), 1);
        let (mut server, _) = listener.accept().unwrap();

        assert_eq!(
            registry.route(PeerId(2), Segment::data(id(1), 0, 1, b"hello".to_vec())),
            RouteOutcome::Delivered
        );

        server.set_read_timeout(Some(WAIT)).unwrap();
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        registry.shutdown(WAIT);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_setup_payload_delivered() {
        let (registry, _link) = registry();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();

        let mut setup = setup_for(id(1), &listener);
        setup.payload = b"GET /".to_vec();
        assert_eq!(registry.route(PeerId(2), setup), RouteOutcome::Established);

        let (mut server, _) = listener.accept().unwrap();
        server.set_read_timeout(Some(WAIT)).unwrap();
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"GET /");
        registry.shutdown(WAIT);
    }

    #[test]
    fn test_other_peer_dropped() {
        let (registry, _link) = registry();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        registry.route(PeerId(2), setup_for(id(1), &listener));

        assert_eq!(
            registry.route(PeerId(9), Segment::data(id(1), 0, 1, b"x".to_vec())),
            RouteOutcome::Dropped(DropReason::PeerMismatch)
        );
        assert_eq!(registry.len(), 1);
        registry.shutdown(WAIT);
    }

    #[test]
    fn test_repeated_setup_ignored() {
        let (registry, _link) = registry();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        registry.route(PeerId(2), setup_for(id(1), &listener));
        let first = registry.get(&id(1)).unwrap();

        assert_eq!(
            registry.route(PeerId(2), setup_for(id(1), &listener)),
            RouteOutcome::Dropped(DropReason::DuplicateSetup)
        );
        assert!(Arc::ptr_eq(&first, &registry.get(&id(1)).unwrap()));
        registry.shutdown(WAIT);
    }

    #[test]
    fn test_close_signal_tears_down() {
        let (registry, _link) = registry();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        registry.route(PeerId(2), setup_for(id(1), &listener));
        let tunnel = registry.get(&id(1)).unwrap();

        assert_eq!(
            registry.route(PeerId(2), Segment::open_failure(id(1))),
            RouteOutcome::PeerClosed
        );
        assert!(registry.get(&id(1)).is_none());
        assert!(tunnel.wait_closed(WAIT));
        assert_eq!(tunnel.close_reason(), Some(CloseReason::PeerClosed));
    }

    #[test]
    fn test_closed_tunnel_replaced_by_new_setup() {
        let (registry, _link) = registry();
        let setup = Segment::setup(id(1), refused_destination());
        assert_eq!(registry.route(PeerId(2), setup.clone()), RouteOutcome::Established);

        let first = registry.get(&id(1)).unwrap();
        assert!(first.wait_closed(WAIT));
        assert_eq!(first.state(), TunnelState::Closed);

        assert_eq!(registry.route(PeerId(2), setup), RouteOutcome::Established);
        let second = registry.get(&id(1)).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(second.wait_closed(WAIT));
    }

    #[test]
    fn test_draining_tunnel_kept_until_closed() {
        let (registry, _link, tracker) = registry_with_slot_poll(2_000);
        // Another send holds the radio, so the writer waits for the slot.
        tracker.reserve(CorrelationId(1), "other send".into()).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let _client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        let tunnel = registry
            .open_outbound(PeerId(2), accepted, Destination::new("example.org", 80))
            .unwrap();
        let id = tunnel.id().clone();

        // Writer took the setup segment and is waiting on the tracker.
        let start = Instant::now();
        while tunnel.queued_segments() > 0 && start.elapsed() < WAIT {
            thread::sleep(Duration::from_millis(5));
        }
        thread::sleep(Duration::from_millis(50));

        tunnel.shutdown();
        assert_eq!(tunnel.state(), TunnelState::Draining);
        let late = Segment::data(id.clone(), 0, 1, b"late".to_vec());
        assert_eq!(
            registry.route(PeerId(2), late.clone()),
            RouteOutcome::Dropped(DropReason::UnknownTunnel)
        );
        assert!(registry.get(&id).is_some());

        tracker.resolve(CorrelationId(1));
        assert!(tunnel.wait_closed(WAIT));
        assert_eq!(
            registry.route(PeerId(2), late),
            RouteOutcome::Dropped(DropReason::UnknownTunnel)
        );
        assert!(registry.get(&id).is_none());
    }

    #[test]
    fn test_reap_removes_closed() {
        let (registry, _link) = registry();
        registry.route(PeerId(2), Segment::setup(id(1), refused_destination()));
        let tunnel = registry.get(&id(1)).unwrap();
        assert!(tunnel.wait_closed(WAIT));

        assert_eq!(registry.active_count(), 0);
        assert_eq!(registry.reap(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_open_outbound_assigns_random_ids() {
        let (registry, _link) = registry();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let mut ids = Vec::new();
        let mut clients = Vec::new();
        for _ in 0..2 {
            clients.push(TcpStream::connect(addr).unwrap());
            let (accepted, _) = listener.accept().unwrap();
            let tunnel = registry
                .open_outbound(PeerId(2), accepted, Destination::new("example.org", 80))
                .unwrap();
            assert_eq!(tunnel.id().as_bytes().len(), TUNNEL_ID_LEN);
            ids.push(tunnel.id().clone());
        }

        assert_ne!(ids[0], ids[1]);
        assert_eq!(registry.active_count(), 2);
        registry.shutdown(WAIT);
        assert_eq!(registry.active_count(), 0);
    }
}
