//! Local TCP ingress.
//!
//! An [`IngressListener`] accepts local clients on one configured route and
//! opens an initiator tunnel for each, asking the route's peer gateway to
//! connect to the route's destination.

use crate::codec::Destination;
use crate::config::IngressRoute;
use crate::link::PeerId;
use crate::registry::TunnelRegistry;
use log::{debug, error, info, warn};
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Accept loop polling interval.
const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// Background accept loop for one route.
pub struct IngressListener {
    handle: Option<thread::JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    local_addr: SocketAddr,
}

impl IngressListener {
    /// Bind `route.listen` and start accepting clients.
    pub fn start(route: &IngressRoute, registry: Arc<TunnelRegistry>) -> io::Result<Self> {
        let listener = TcpListener::bind(&route.listen)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let peer = PeerId(route.peer);
        let destination = Destination::new(route.host.clone(), route.port);
        info!(
            "Ingress on {} tunnelling to {} via {}",
            local_addr, destination, peer
        );

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();
        let handle = thread::Builder::new()
            .name(format!("ingress-{}", local_addr.port()))
            .spawn(move || {
                Self::run(listener, peer, destination, registry, shutdown_clone)
            })?;

        Ok(Self {
            handle: Some(handle),
            shutdown,
            local_addr,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn run(
        listener: TcpListener,
        peer: PeerId,
        destination: Destination,
        registry: Arc<TunnelRegistry>,
        shutdown: Arc<AtomicBool>,
    ) {
        // Acquire pairs with the Release store in stop()
        while !shutdown.load(Ordering::Acquire) {
            match listener.accept() {
                Ok((stream, addr)) => {
                    if let Err(e) = stream.set_nonblocking(false) {
                        warn!("Ingress: cannot configure client {}: {}", addr, e);
                        continue;
                    }
                    registry.reap();
                    match registry.open_outbound(peer, stream, destination.clone()) {
                        Ok(tunnel) => {
                            info!("Ingress: client {} on tunnel {}", addr, tunnel.id())
                        }
                        Err(e) => warn!("Ingress: client {} rejected: {}", addr, e),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    error!("Ingress accept failed: {}", e);
                    thread::sleep(ACCEPT_POLL);
                }
            }
        }
        debug!("Ingress on {} stopped", destination);
    }

    /// Stop accepting clients. Existing tunnels are unaffected.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for IngressListener {
    fn drop(&mut self) {
        self.stop();
    }
}
