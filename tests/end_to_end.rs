//! Two gateways relaying TCP connections to each other.

use mesh_tunnel::config::{BackhaulConfig, IngressRoute};
use mesh_tunnel::link::{BackhaulLink, MemoryLink};
use mesh_tunnel::tunnel::TunnelContext;
use mesh_tunnel::{
    CloseReason, DeliveryTracker, Dispatcher, GatewayStats, IngressListener, MeshSender, PeerId,
    RadioLink, RetryPolicy, Segment, StopSignal, TrackerConfig, TunnelConfig, TunnelId,
    TunnelRegistry,
};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(10);

struct Gateway {
    registry: Arc<TunnelRegistry>,
    sender: Arc<MeshSender>,
    stats: Arc<GatewayStats>,
}

impl Gateway {
    fn new(node: u64, link: Arc<dyn RadioLink>) -> Self {
        let stats = Arc::new(GatewayStats::new(node));
        let tracker = Arc::new(DeliveryTracker::new(TrackerConfig::default(), stats.clone()));
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff_ms: 20,
            slot_poll_ms: 20,
        };
        let sender = Arc::new(MeshSender::new(link, tracker, policy, stats.clone()));
        let registry = Arc::new(TunnelRegistry::new(TunnelContext {
            sender: sender.clone(),
            config: TunnelConfig {
                poll_interval_ms: 20,
                connect_timeout_ms: 2_000,
                write_timeout_ms: 2_000,
                ..Default::default()
            },
            stats: stats.clone(),
        }));
        Self {
            registry,
            sender,
            stats,
        }
    }

    fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(self.registry.clone()))
    }

    fn ingress(&self, peer: u64, target: SocketAddr) -> IngressListener {
        let route = IngressRoute {
            listen: "127.0.0.1:0".into(),
            peer,
            host: target.ip().to_string(),
            port: target.port(),
        };
        IngressListener::start(&route, self.registry.clone()).unwrap()
    }
}

/// Gateways 1 and 2 joined by an in-process link.
fn memory_pair() -> (Gateway, Gateway) {
    let _ = env_logger::builder().is_test(true).try_init();
    let (a, b) = MemoryLink::pair(PeerId(1), PeerId(2));
    let (a, b) = (Arc::new(a), Arc::new(b));
    let gw1 = Gateway::new(1, a.clone());
    let gw2 = Gateway::new(2, b.clone());
    a.attach_inbound(gw1.dispatcher());
    b.attach_inbound(gw2.dispatcher());
    (gw1, gw2)
}

/// Echo server accepting any number of connections.
fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            thread::spawn(move || {
                let mut buf = [0u8; 512];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

fn refused_addr() -> SocketAddr {
    TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap()
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < WAIT {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn test_echo_through_two_gateways() {
    let (gw1, gw2) = memory_pair();
    let echo = echo_server();
    let ingress = gw1.ingress(2, echo);

    let mut client = TcpStream::connect(ingress.local_addr()).unwrap();
    client.set_read_timeout(Some(WAIT)).unwrap();

    client.write_all(b"hello mesh").unwrap();
    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"hello mesh");

    // Larger than one segment in both directions.
    let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
    client.write_all(&data).unwrap();
    let mut reply = vec![0u8; data.len()];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(reply, data);

    assert_eq!(gw1.registry.active_count(), 1);
    assert_eq!(gw2.registry.active_count(), 1);
    assert!(gw1.stats.segments_sent.load(Ordering::Relaxed) >= 9);
    assert!(gw2.stats.bytes_to_local.load(Ordering::Relaxed) >= 1010);

    gw1.registry.shutdown(WAIT);
    gw2.registry.shutdown(WAIT);
}

#[test]
fn test_refused_destination_closes_client() {
    let (gw1, gw2) = memory_pair();
    let ingress = gw1.ingress(2, refused_addr());

    let mut client = TcpStream::connect(ingress.local_addr()).unwrap();
    client.set_read_timeout(Some(WAIT)).unwrap();

    // The responder fails to open, signals back, and the initiator closes.
    let mut buf = [0u8; 16];
    assert!(matches!(client.read(&mut buf), Ok(0) | Err(_)));

    assert!(wait_until(|| gw2.stats.open_failures.load(Ordering::Relaxed) == 1));
    assert!(wait_until(|| {
        gw1.registry.reap();
        gw1.registry.is_empty()
    }));
    assert_eq!(gw1.stats.tunnels_closed.load(Ordering::Relaxed), 1);
}

#[test]
fn test_data_for_unknown_tunnel_dropped_by_peer() {
    let (gw1, gw2) = memory_pair();

    let stray = Segment::data(TunnelId::new(vec![0xaa; 8]), 0, 1, b"stray".to_vec());
    let bytes = stray.encode().unwrap();
    gw1.sender
        .submit(PeerId(2), &bytes, "stray segment", &StopSignal::new())
        .unwrap();

    assert!(wait_until(|| gw2.stats.dropped_messages.load(Ordering::Relaxed) == 1));
    assert!(gw2.registry.is_empty());
    assert_eq!(gw2.stats.tunnels_opened.load(Ordering::Relaxed), 0);
}

#[test]
fn test_responder_shutdown_closes_destination() {
    let (gw1, gw2) = memory_pair();

    let server = TcpListener::bind("127.0.0.1:0").unwrap();
    let ingress = gw1.ingress(2, server.local_addr().unwrap());

    let mut client = TcpStream::connect(ingress.local_addr()).unwrap();
    client.write_all(b"ping").unwrap();
    let (mut accepted, _) = server.accept().unwrap();
    accepted.set_read_timeout(Some(WAIT)).unwrap();
    let mut buf = [0u8; 4];
    accepted.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"ping");

    let mut ids = Vec::new();
    assert!(wait_until(|| {
        ids = gw1.registry.ids();
        !ids.is_empty()
    }));
    let tunnel = gw2.registry.get(&ids[0]).unwrap();
    tunnel.shutdown();
    assert!(tunnel.wait_closed(WAIT));
    assert_eq!(tunnel.close_reason(), Some(CloseReason::Shutdown));
    assert!(matches!(accepted.read(&mut buf), Ok(0) | Err(_)));

    drop(client);
    gw1.registry.shutdown(WAIT);
}

#[test]
fn test_echo_over_backhaul() {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = BackhaulConfig {
        ack_timeout_ms: 5_000,
        ..Default::default()
    };

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let near = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (far, _) = listener.accept().unwrap();

    let link1 = Arc::new(BackhaulLink::from_stream(near, PeerId(1), &config).unwrap());
    let link2 = Arc::new(BackhaulLink::from_stream(far, PeerId(2), &config).unwrap());
    let gw1 = Gateway::new(1, link1.clone());
    let gw2 = Gateway::new(2, link2.clone());
    link1.start(gw1.dispatcher()).unwrap();
    link2.start(gw2.dispatcher()).unwrap();

    let ingress = gw1.ingress(2, echo_server());
    let mut client = TcpStream::connect(ingress.local_addr()).unwrap();
    client.set_read_timeout(Some(WAIT)).unwrap();

    let data: Vec<u8> = (0..400u32).map(|i| (i % 256) as u8).collect();
    client.write_all(&data).unwrap();
    let mut reply = vec![0u8; data.len()];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(reply, data);

    assert!(wait_until(
        || gw1.stats.deliveries_confirmed.load(Ordering::Relaxed) >= 4
    ));

    gw1.registry.shutdown(WAIT);
    gw2.registry.shutdown(WAIT);
    link1.close();
    link2.close();
}
