//! Gateway statistics and HTTP stats server.
//!
//! Counters are plain atomics updated from every tunnel thread. The
//! `/stats` endpoint returns a JSON snapshot:
//!
//! ```json
//! {
//!   "uptime_secs": 3600,
//!   "node_id": 555555555,
//!   "tunnels": { "opened": 12, "closed": 11, "open_failures": 1, "active": 1 },
//!   "segments": { "queued": 410, "sent": 409, "received": 388 },
//!   "bytes": { "from_local": 51200, "to_local": 48000 },
//!   "delivery": { "confirmed": 405, "unconfirmed": 4, "retries": 7, "submission_failures": 0 },
//!   "inbound": { "malformed": 0, "dropped": 2, "skipped": 5, "reassembly_gaps": 0 }
//! }
//! ```

use log::{error, info, warn};
use serde::Serialize;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tiny_http::{Header, Method, Request, Response, Server};

/// Default port for the stats server.
pub const DEFAULT_STATS_PORT: u16 = 8080;

/// Shared gateway counters.
///
/// All fields use atomic types for thread-safe access without locking.
#[derive(Debug)]
pub struct GatewayStats {
    start_time: Instant,
    node_id: u64,
    /// Tunnels created (either role).
    pub tunnels_opened: AtomicUsize,
    /// Tunnels that reached `Closed`.
    pub tunnels_closed: AtomicUsize,
    /// Responder tunnels whose local connection could not be opened.
    pub open_failures: AtomicUsize,
    /// Tunnels currently held by the registry.
    pub active_tunnels: AtomicUsize,
    /// Segments placed on outbound queues.
    pub segments_queued: AtomicUsize,
    /// Segments accepted by the radio link.
    pub segments_sent: AtomicUsize,
    /// Tunnel segments received from the mesh.
    pub segments_received: AtomicUsize,
    /// Bytes read from local sockets.
    pub bytes_from_local: AtomicUsize,
    /// Bytes written to local sockets.
    pub bytes_to_local: AtomicUsize,
    /// Sends confirmed by the peer.
    pub deliveries_confirmed: AtomicUsize,
    /// Sends never confirmed.
    pub deliveries_unconfirmed: AtomicUsize,
    /// Submission attempts after the first.
    pub submission_retries: AtomicUsize,
    /// Segments abandoned after the retry budget.
    pub submission_failures: AtomicUsize,
    /// Inbound messages that failed to decode.
    pub malformed_messages: AtomicUsize,
    /// Inbound segments the registry dropped.
    pub dropped_messages: AtomicUsize,
    /// Inbound messages of kinds handled elsewhere.
    pub skipped_messages: AtomicUsize,
    /// Out-of-order segments seen during reassembly.
    pub reassembly_gaps: AtomicUsize,
}

impl GatewayStats {
    /// Create zeroed statistics for a node.
    pub fn new(node_id: u64) -> Self {
        Self {
            start_time: Instant::now(),
            node_id,
            tunnels_opened: AtomicUsize::new(0),
            tunnels_closed: AtomicUsize::new(0),
            open_failures: AtomicUsize::new(0),
            active_tunnels: AtomicUsize::new(0),
            segments_queued: AtomicUsize::new(0),
            segments_sent: AtomicUsize::new(0),
            segments_received: AtomicUsize::new(0),
            bytes_from_local: AtomicUsize::new(0),
            bytes_to_local: AtomicUsize::new(0),
            deliveries_confirmed: AtomicUsize::new(0),
            deliveries_unconfirmed: AtomicUsize::new(0),
            submission_retries: AtomicUsize::new(0),
            submission_failures: AtomicUsize::new(0),
            malformed_messages: AtomicUsize::new(0),
            dropped_messages: AtomicUsize::new(0),
            skipped_messages: AtomicUsize::new(0),
            reassembly_gaps: AtomicUsize::new(0),
        }
    }

    /// Increment a counter by one.
    #[inline]
    pub fn incr(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Add `n` to a counter.
    #[inline]
    pub fn add(counter: &AtomicUsize, n: usize) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Get uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicUsize| c.load(Ordering::Relaxed);
        StatsSnapshot {
            uptime_secs: self.uptime_secs(),
            node_id: self.node_id,
            tunnels: TunnelCounts {
                opened: get(&self.tunnels_opened),
                closed: get(&self.tunnels_closed),
                open_failures: get(&self.open_failures),
                active: get(&self.active_tunnels),
            },
            segments: SegmentCounts {
                queued: get(&self.segments_queued),
                sent: get(&self.segments_sent),
                received: get(&self.segments_received),
            },
            bytes: ByteCounts {
                from_local: get(&self.bytes_from_local),
                to_local: get(&self.bytes_to_local),
            },
            delivery: DeliveryCounts {
                confirmed: get(&self.deliveries_confirmed),
                unconfirmed: get(&self.deliveries_unconfirmed),
                retries: get(&self.submission_retries),
                submission_failures: get(&self.submission_failures),
            },
            inbound: InboundCounts {
                malformed: get(&self.malformed_messages),
                dropped: get(&self.dropped_messages),
                skipped: get(&self.skipped_messages),
                reassembly_gaps: get(&self.reassembly_gaps),
            },
        }
    }

    /// Serialize all statistics to JSON.
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.snapshot()).unwrap_or_else(|_| "{}".to_string())
    }
}

impl Default for GatewayStats {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Serializable copy of [`GatewayStats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub uptime_secs: u64,
    pub node_id: u64,
    pub tunnels: TunnelCounts,
    pub segments: SegmentCounts,
    pub bytes: ByteCounts,
    pub delivery: DeliveryCounts,
    pub inbound: InboundCounts,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelCounts {
    pub opened: usize,
    pub closed: usize,
    pub open_failures: usize,
    pub active: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentCounts {
    pub queued: usize,
    pub sent: usize,
    pub received: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ByteCounts {
    pub from_local: usize,
    pub to_local: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryCounts {
    pub confirmed: usize,
    pub unconfirmed: usize,
    pub retries: usize,
    pub submission_failures: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InboundCounts {
    pub malformed: usize,
    pub dropped: usize,
    pub skipped: usize,
    pub reassembly_gaps: usize,
}

/// HTTP stats server.
///
/// Runs in a background thread and serves gateway statistics as JSON.
pub struct StatsServer {
    /// Server thread handle.
    handle: Option<thread::JoinHandle<()>>,
    /// Flag to signal shutdown.
    shutdown: Arc<AtomicBool>,
    /// Bound address, when it is an IP socket.
    local_addr: Option<SocketAddr>,
}

impl StatsServer {
    /// Start the stats server.
    ///
    /// # Arguments
    ///
    /// * `bind_addr` - IP address to bind to (use `None` for 0.0.0.0)
    /// * `port` - Port to listen on, 0 picks a free one
    /// * `stats` - Shared statistics to serve
    ///
    /// # Returns
    ///
    /// A handle to the running server. Drop it to stop the server.
    pub fn start(
        bind_addr: Option<IpAddr>,
        port: u16,
        stats: Arc<GatewayStats>,
    ) -> Result<Self, io::Error> {
        let addr = match bind_addr {
            Some(ip) => format!("{}:{}", ip, port),
            None => format!("0.0.0.0:{}", port),
        };

        let server = Server::http(&addr)
            .map_err(|e| io::Error::new(io::ErrorKind::AddrInUse, format!("{}", e)))?;
        let local_addr = server.server_addr().to_ip();

        info!(
            "Stats server listening on http://{}/stats",
            local_addr.map(|a| a.to_string()).unwrap_or(addr)
        );

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();

        let handle = thread::Builder::new()
            .name("stats-server".into())
            .spawn(move || Self::run_server(server, stats, shutdown_clone))?;

        Ok(Self {
            handle: Some(handle),
            shutdown,
            local_addr,
        })
    }

    /// Address the server is bound to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn run_server(server: Server, stats: Arc<GatewayStats>, shutdown: Arc<AtomicBool>) {
        loop {
            // Acquire pairs with the Release store in stop()
            if shutdown.load(Ordering::Acquire) {
                info!("Stats server shutting down");
                break;
            }

            match server.recv_timeout(Duration::from_millis(100)) {
                Ok(Some(request)) => Self::handle(request, &stats),
                Ok(None) => {}
                Err(e) => {
                    error!("Stats server error: {}", e);
                    break;
                }
            }
        }
    }

    fn handle(request: Request, stats: &GatewayStats) {
        if request.method() != &Method::Get {
            let response = with_header(
                Response::from_string("Method Not Allowed").with_status_code(405),
                "Allow",
                "GET",
            );
            if let Err(e) = request.respond(response) {
                warn!("Failed to send 405: {}", e);
            }
            return;
        }

        let response = match request.url() {
            "/stats" | "/stats/" => with_header(
                Response::from_string(stats.to_json()).with_status_code(200),
                "Content-Type",
                "application/json",
            ),
            "/" => with_header(
                Response::from_string("See /stats for gateway statistics").with_status_code(302),
                "Location",
                "/stats",
            ),
            _ => Response::from_string("Not Found").with_status_code(404),
        };

        if let Err(e) = request.respond(response) {
            warn!("Failed to send response: {}", e);
        }
    }

    /// Stop the server.
    ///
    /// May take up to 100ms due to the polling interval.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StatsServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn with_header<R: io::Read>(response: Response<R>, name: &str, value: &str) -> Response<R> {
    match Header::from_bytes(name.as_bytes(), value.as_bytes()) {
        Ok(header) => response.with_header(header),
        Err(()) => response,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{Ipv4Addr, TcpStream};

    #[test]
    fn test_counters_start_at_zero() {
        let stats = GatewayStats::new(7);
        let snap = stats.snapshot();
        assert_eq!(snap.node_id, 7);
        assert_eq!(snap.tunnels.opened, 0);
        assert_eq!(snap.delivery.confirmed, 0);
        assert_eq!(snap.inbound.malformed, 0);
    }

    #[test]
    fn test_incr_and_add() {
        let stats = GatewayStats::new(1);
        GatewayStats::incr(&stats.tunnels_opened);
        GatewayStats::incr(&stats.tunnels_opened);
        GatewayStats::add(&stats.bytes_from_local, 320);

        let snap = stats.snapshot();
        assert_eq!(snap.tunnels.opened, 2);
        assert_eq!(snap.bytes.from_local, 320);
    }

    #[test]
    fn test_json_layout() {
        let stats = GatewayStats::new(555);
        GatewayStats::incr(&stats.deliveries_unconfirmed);
        let json: serde_json::Value = serde_json::from_str(&stats.to_json()).unwrap();

        assert_eq!(json["node_id"], 555);
        assert_eq!(json["delivery"]["unconfirmed"], 1);
        assert!(json["uptime_secs"].is_u64());
        assert!(json["tunnels"].is_object());
        assert!(json["segments"].is_object());
        assert!(json["bytes"].is_object());
        assert!(json["inbound"].is_object());
    }

    fn http_get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        write!(
            stream,
            "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            path
        )
        .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        response
    }

    #[test]
    fn test_server_serves_stats() {
        let stats = Arc::new(GatewayStats::new(42));
        GatewayStats::incr(&stats.segments_sent);

        let mut server =
            StatsServer::start(Some(IpAddr::V4(Ipv4Addr::LOCALHOST)), 0, stats).unwrap();
        let addr = server.local_addr().unwrap();

        let response = http_get(addr, "/stats");
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("\"node_id\":42"));
        assert!(response.contains("\"sent\":1"));

        let response = http_get(addr, "/nope");
        assert!(response.starts_with("HTTP/1.1 404"));

        server.stop();
    }
}
