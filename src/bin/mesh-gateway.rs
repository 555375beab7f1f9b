//! Mesh tunnel gateway.
//!
//! Connects to the peer gateway over the configured backhaul, answers tunnel
//! setup requests from the mesh and accepts local clients on every configured
//! route.
//!
//! # Usage
//!
//! ```bash
//! RUST_LOG=debug mesh-gateway gateway.json
//! ```
//!
//! Example configuration:
//!
//! ```json
//! {
//!   "node_id": 1,
//!   "backhaul": { "listen": "0.0.0.0:7400" },
//!   "routes": [{ "listen": "127.0.0.1:8333", "peer": 2, "host": "10.0.0.5", "port": 8333 }],
//!   "stats_port": 8080
//! }
//! ```

use log::{error, info, warn};
use mesh_tunnel::link::BackhaulLink;
use mesh_tunnel::tunnel::TunnelContext;
use mesh_tunnel::{
    DeliveryTracker, Dispatcher, GatewayConfig, GatewayStats, IngressListener, MeshSender, PeerId,
    RadioLink,
    StatsServer, TunnelRegistry,
};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// How often closed tunnels are reaped and counters logged.
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(30);

/// How long shutdown waits for tunnels to close.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Some(path) = std::env::args_os().nth(1).map(PathBuf::from) else {
        error!("Usage: mesh-gateway <config.json>");
        std::process::exit(2);
    };

    let config = match GatewayConfig::load(&path) {
        Ok(config) => config,
        Err(e) => {
            error!("{}: {}", path.display(), e);
            std::process::exit(1);
        }
    };

    info!("=== Mesh gateway {} starting ===", config.node_id);

    let stats = Arc::new(GatewayStats::new(config.node_id));

    let link = match BackhaulLink::open(PeerId(config.node_id), &config.backhaul) {
        Ok(link) => Arc::new(link),
        Err(e) => {
            error!("Backhaul failed: {}", e);
            std::process::exit(1);
        }
    };

    let tracker = Arc::new(DeliveryTracker::new(config.tracker, stats.clone()));
    let sender = Arc::new(MeshSender::new(
        link.clone(),
        tracker,
        config.retry,
        stats.clone(),
    ));
    let registry = Arc::new(TunnelRegistry::new(TunnelContext {
        sender,
        config: config.tunnel.clone(),
        stats: stats.clone(),
    }));

    if let Err(e) = link.start(Arc::new(Dispatcher::new(registry.clone()))) {
        error!("Backhaul reader failed to start: {}", e);
        std::process::exit(1);
    }

    let mut listeners = Vec::new();
    for route in &config.routes {
        match IngressListener::start(route, registry.clone()) {
            Ok(listener) => listeners.push(listener),
            Err(e) => error!("Ingress on {} failed: {}", route.listen, e),
        }
    }

    // Keep server alive - variable intentionally unused except for Drop
    let _stats_server = config.stats_port.and_then(|port| {
        match StatsServer::start(None, port, stats.clone()) {
            Ok(server) => Some(server),
            Err(e) => {
                warn!("Failed to start stats server: {}", e);
                warn!("Continuing without stats server");
                None
            }
        }
    });

    info!("Gateway running (Ctrl+C to exit)");

    let mut housekeeping = tokio::time::interval(HOUSEKEEPING_INTERVAL);
    housekeeping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
            _ = housekeeping.tick() => {
                registry.reap();
                info!(
                    "Tunnels: {} active, {} opened, {} closed; segments {} sent, {} received",
                    registry.active_count(),
                    stats.tunnels_opened.load(Ordering::Relaxed),
                    stats.tunnels_closed.load(Ordering::Relaxed),
                    stats.segments_sent.load(Ordering::Relaxed),
                    stats.segments_received.load(Ordering::Relaxed),
                );
                if !link.is_connected() {
                    warn!("Backhaul to {} is down", link.peer_addr());
                }
            }
        }
    }

    for mut listener in listeners {
        listener.stop();
    }
    registry.shutdown(SHUTDOWN_TIMEOUT);
    link.close();

    info!("Shutdown complete");
}
