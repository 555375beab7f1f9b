//! One relayed TCP connection.
//!
//! A [`Tunnel`] owns a local TCP socket and runs two contexts on plain
//! threads:
//!
//! - the **reader** reads the socket, splits every read into segments and
//!   queues them; it also watches the idle window
//! - the **writer** pops segments in FIFO order and submits them over the
//!   mesh, one at a time; it alone closes the socket when the tunnel stops
//!
//! Inbound segments arrive through [`Tunnel::deliver`] on the link's thread
//! and are written to the socket once their burst is complete.
//!
//! A responder tunnel starts `Establishing`: its worker thread opens the
//! destination, flushes anything that arrived meanwhile and then becomes the
//! writer. An initiator tunnel starts `Active` with an accepted client socket
//! and a setup segment at the head of its queue.

use super::queue::OutboundQueue;
use super::state::{CloseReason, Lifecycle, TunnelState};
use crate::codec::{segment_burst, Destination, InboundBuffer, Segment, TunnelId};
use crate::config::TunnelConfig;
use crate::link::{MeshSender, PeerId, SubmitError};
use crate::signal::StopSignal;
use crate::stats::GatewayStats;
use log::{debug, error, info, warn};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

/// Which side opened the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepted a local client and asked the peer to open the destination.
    Initiator,
    /// Opened the destination on the peer's request.
    Responder,
}

/// Dependencies shared by every tunnel of a gateway.
#[derive(Clone)]
pub struct TunnelContext {
    /// Submits segments over the mesh.
    pub sender: Arc<MeshSender>,
    /// Tunnel tuning.
    pub config: TunnelConfig,
    /// Gateway counters.
    pub stats: Arc<GatewayStats>,
}

impl std::fmt::Debug for TunnelContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelContext")
            .field("config", &self.config)
            .finish()
    }
}

/// Inbound path state, guarded by one lock.
#[derive(Debug, Default)]
struct InboundSide {
    buffer: InboundBuffer,
    /// Completed bursts received before the local connection was open.
    early: Vec<u8>,
    /// Write handle of the local socket once open.
    stream: Option<TcpStream>,
}

/// One logical TCP-over-mesh relay.
pub struct Tunnel {
    id: TunnelId,
    peer: PeerId,
    role: Role,
    destination: Destination,
    context: TunnelContext,
    lifecycle: Lifecycle,
    queue: OutboundQueue,
    inbound: Mutex<InboundSide>,
    /// Owning handle of the local socket; taken exactly once on close.
    socket: Mutex<Option<TcpStream>>,
    last_activity: Mutex<Instant>,
}

impl Tunnel {
    fn new(
        id: TunnelId,
        peer: PeerId,
        role: Role,
        destination: Destination,
        initial: TunnelState,
        context: TunnelContext,
    ) -> Self {
        GatewayStats::incr(&context.stats.tunnels_opened);
        Self {
            id,
            peer,
            role,
            destination,
            context,
            lifecycle: Lifecycle::new(initial),
            queue: OutboundQueue::new(),
            inbound: Mutex::new(InboundSide::default()),
            socket: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    /// Create a responder tunnel and start opening `destination`.
    ///
    /// Returns immediately in `Establishing`. If the destination cannot be
    /// reached the tunnel goes straight to `Closed` and sends the peer one
    /// zero-length segment.
    pub fn open_responder(
        id: TunnelId,
        peer: PeerId,
        destination: Destination,
        context: TunnelContext,
    ) -> Result<Arc<Self>, TunnelError> {
        let tunnel = Arc::new(Self::new(
            id,
            peer,
            Role::Responder,
            destination,
            TunnelState::Establishing,
            context,
        ));
        info!(
            "Tunnel {} from {}: opening {}",
            tunnel.id, tunnel.peer, tunnel.destination
        );

        let worker = tunnel.clone();
        thread::Builder::new()
            .name(tunnel.thread_name("tx"))
            .spawn(move || worker.establish())
            .map_err(|e| {
                tunnel.abort_start(&e);
                TunnelError::LocalIo(e)
            })?;

        Ok(tunnel)
    }

    /// Create an initiator tunnel around an accepted client socket.
    ///
    /// The first segment sent is a setup segment asking `peer` to open
    /// `destination`.
    pub fn open_initiator(
        id: TunnelId,
        peer: PeerId,
        stream: TcpStream,
        destination: Destination,
        context: TunnelContext,
    ) -> Result<Arc<Self>, TunnelError> {
        let tunnel = Arc::new(Self::new(
            id,
            peer,
            Role::Initiator,
            destination,
            TunnelState::Active,
            context,
        ));
        info!(
            "Tunnel {} to {}: requesting {}",
            tunnel.id, tunnel.peer, tunnel.destination
        );

        let setup = Segment::setup(tunnel.id.clone(), tunnel.destination.clone());
        let queued = tunnel.queue.push_all([setup]);
        GatewayStats::add(&tunnel.context.stats.segments_queued, queued);

        let started = tunnel
            .attach(stream)
            .and_then(|_| tunnel.spawn_reader())
            .and_then(|_| {
                let writer = tunnel.clone();
                thread::Builder::new()
                    .name(tunnel.thread_name("tx"))
                    .spawn(move || writer.run_writer())
                    .map(|_| ())
            });

        if let Err(e) = started {
            tunnel.abort_start(&e);
            return Err(TunnelError::LocalIo(e));
        }

        Ok(tunnel)
    }

    /// Close a tunnel whose threads could not be started.
    ///
    /// Callers hold the registry lock, so the peer is not signalled.
    fn abort_start(&self, e: &io::Error) {
        error!("Tunnel {}: cannot start: {}", self.id, e);
        self.queue.close();
        self.close_socket();
        self.lifecycle.close(CloseReason::LocalIo);
        GatewayStats::incr(&self.context.stats.tunnels_closed);
    }

    /// Tunnel id.
    pub fn id(&self) -> &TunnelId {
        &self.id
    }

    /// Peer gateway on the other end.
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Which side opened the tunnel.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Destination opened by the responder.
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TunnelState {
        self.lifecycle.state()
    }

    /// Why the tunnel stopped, once it has.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.lifecycle.reason()
    }

    /// When the tunnel reached `Closed`.
    pub fn closed_at(&self) -> Option<Instant> {
        self.lifecycle.closed_at()
    }

    /// Returns true while `Establishing` or `Active`.
    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    /// Segments waiting for the radio.
    pub fn queued_segments(&self) -> usize {
        self.queue.len()
    }

    /// Time since data last moved in either direction.
    pub fn idle_for(&self) -> Duration {
        lock(&self.last_activity).elapsed()
    }

    /// Wait until the tunnel is `Closed`. Returns `false` on timeout.
    pub fn wait_closed(&self, timeout: Duration) -> bool {
        self.lifecycle.wait_closed(timeout)
    }

    /// Accept one inbound segment's payload.
    ///
    /// Bursts are written to the local socket once their last segment
    /// arrives. Before the local connection is open they are held and flushed
    /// on connect. A failed write stops the tunnel.
    pub fn deliver(&self, index: u32, count: u32, payload: &[u8]) -> Result<(), TunnelError> {
        let mut inbound = self.lock_inbound();
        if !self.is_running() {
            return Err(TunnelError::NotRunning);
        }

        self.touch();
        let stats = &self.context.stats;
        GatewayStats::incr(&stats.segments_received);

        let gaps_before = inbound.buffer.gaps();
        let burst = inbound.buffer.accept(index, count, payload);
        let gaps = inbound.buffer.gaps() - gaps_before;
        if gaps > 0 {
            GatewayStats::add(&stats.reassembly_gaps, gaps);
        }

        let Some(bytes) = burst else {
            return Ok(());
        };
        if bytes.is_empty() {
            return Ok(());
        }

        let side = &mut *inbound;
        let written = match side.stream.as_mut() {
            None => {
                side.early.extend_from_slice(&bytes);
                debug!(
                    "Tunnel {}: holding {} bytes until connected",
                    self.id,
                    side.early.len()
                );
                return Ok(());
            }
            Some(stream) => stream.write_all(&bytes),
        };
        drop(inbound);

        match written {
            Ok(()) => {
                GatewayStats::add(&stats.bytes_to_local, bytes.len());
                debug!("Tunnel {}: wrote {} bytes to local socket", self.id, bytes.len());
                Ok(())
            }
            Err(e) => {
                error!("Tunnel {}: local write failed: {}", self.id, e);
                self.request_stop(CloseReason::LocalIo);
                Err(TunnelError::LocalIo(e))
            }
        }
    }

    /// Tear down on the peer's close signal.
    pub fn close_from_peer(&self) {
        if self.request_stop(CloseReason::PeerClosed) {
            info!("Tunnel {}: closed by peer {}", self.id, self.peer);
        }
    }

    /// Tear down because the gateway is stopping.
    pub fn shutdown(&self) {
        self.request_stop(CloseReason::Shutdown);
    }

    fn request_stop(&self, reason: CloseReason) -> bool {
        let first = self.lifecycle.request_stop(reason);
        self.queue.close();
        first
    }

    /// Responder worker: connect, then run as the writer.
    fn establish(self: Arc<Self>) {
        let stream = match self.connect() {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    "Tunnel {}: cannot open {}: {}",
                    self.id, self.destination, e
                );
                self.fail_open();
                return;
            }
        };

        if let Err(e) = self.attach(stream).and_then(|_| self.spawn_reader()) {
            error!("Tunnel {}: cannot start: {}", self.id, e);
            self.request_stop(CloseReason::LocalIo);
        } else if self.lifecycle.activate() {
            info!("Tunnel {}: connected to {}", self.id, self.destination);
        }

        self.run_writer();
    }

    fn connect(&self) -> io::Result<TcpStream> {
        let timeout = self.context.config.connect_timeout();
        let mut last_error = None;

        for addr in self.destination.address().to_socket_addrs()? {
            if self.lifecycle.stop_signal().is_stopped() {
                return Err(io::Error::new(io::ErrorKind::Interrupted, "tunnel stopped"));
            }
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!("Tunnel {}: connect to {} failed: {}", self.id, addr, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "no addresses for destination")
        }))
    }

    fn fail_open(&self) {
        let stats = &self.context.stats;
        let reason = self.lifecycle.close(CloseReason::OpenFailed);
        GatewayStats::incr(&stats.tunnels_closed);
        if reason == CloseReason::OpenFailed {
            GatewayStats::incr(&stats.open_failures);
        }
        info!("Tunnel {} closed: {}", self.id, reason);

        if reason.notifies_peer() {
            self.notify_peer();
        }
    }

    /// Configure the local socket and hand out its read and write handles.
    fn attach(&self, stream: TcpStream) -> io::Result<()> {
        let config = &self.context.config;
        stream.set_read_timeout(Some(config.poll_interval()))?;
        stream.set_write_timeout(Some(config.write_timeout()))?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Tunnel {}: failed to disable Nagle's algorithm: {}", self.id, e);
        }

        let mut writer = stream.try_clone()?;
        *lock(&self.socket) = Some(stream);

        let mut inbound = self.lock_inbound();
        if !inbound.early.is_empty() {
            let early = std::mem::take(&mut inbound.early);
            writer.write_all(&early)?;
            GatewayStats::add(&self.context.stats.bytes_to_local, early.len());
            debug!("Tunnel {}: flushed {} held bytes", self.id, early.len());
        }
        inbound.stream = Some(writer);
        Ok(())
    }

    fn spawn_reader(self: &Arc<Self>) -> io::Result<()> {
        let stream = match lock(&self.socket).as_ref() {
            Some(socket) => socket.try_clone()?,
            None => return Err(io::Error::from(io::ErrorKind::NotConnected)),
        };
        let tunnel = self.clone();
        thread::Builder::new()
            .name(self.thread_name("rx"))
            .spawn(move || tunnel.run_reader(stream))?;
        Ok(())
    }

    fn run_reader(&self, mut stream: TcpStream) {
        let config = &self.context.config;
        let stop = self.lifecycle.stop_signal();
        let mut buf = vec![0u8; config.read_buffer_size];
        let mut resets = 0u32;

        let reason = loop {
            if stop.is_stopped() {
                break None;
            }

            let reset = match stream.read(&mut buf) {
                // A reset socket reads as end-of-stream from then on.
                Ok(0) if resets > 0 => true,
                Ok(0) => {
                    // Half-closed by the local peer: poll until idle.
                    if self.idle_expired() {
                        break Some(CloseReason::IdleTimeout);
                    }
                    stop.sleep(config.poll_interval());
                    false
                }
                Ok(n) => {
                    resets = 0;
                    self.touch();
                    self.enqueue_burst(&buf[..n]);
                    false
                }
                Err(e)
                    if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
                {
                    if self.idle_expired() {
                        break Some(CloseReason::IdleTimeout);
                    }
                    false
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => false,
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => true,
                Err(e) => {
                    if stop.is_stopped() {
                        break None;
                    }
                    error!("Tunnel {}: local read failed: {}", self.id, e);
                    break Some(CloseReason::LocalIo);
                }
            };

            if reset {
                resets += 1;
                if resets > config.max_reset_retries {
                    warn!(
                        "Tunnel {}: local connection reset {} times",
                        self.id, resets
                    );
                    break Some(CloseReason::ResetRetriesExhausted);
                }
                debug!(
                    "Tunnel {}: connection reset ({}/{})",
                    self.id, resets, config.max_reset_retries
                );
                stop.sleep(config.poll_interval());
            }
        };

        if let Some(reason) = reason {
            if self.request_stop(reason) {
                info!("Tunnel {}: stopping ({})", self.id, reason);
            }
        }
        debug!("Tunnel {}: reader finished", self.id);
    }

    fn enqueue_burst(&self, data: &[u8]) {
        let stats = &self.context.stats;
        GatewayStats::add(&stats.bytes_from_local, data.len());

        let segments = segment_burst(&self.id, data, self.context.config.chunk_size);
        let queued = self.queue.push_all(segments);
        GatewayStats::add(&stats.segments_queued, queued);
        debug!(
            "Tunnel {}: read {} bytes, queued {} segments",
            self.id,
            data.len(),
            queued
        );
    }

    fn run_writer(&self) {
        let stop = self.lifecycle.stop_signal();

        while let Some(segment) = self.next_outbound() {
            let description = format!(
                "tunnel {} segment {}/{}",
                self.id,
                segment.index + 1,
                segment.count
            );
            let bytes = match segment.encode() {
                Ok(bytes) => bytes,
                Err(e) => {
                    error!("Tunnel {}: {}", self.id, e);
                    continue;
                }
            };

            match self
                .context
                .sender
                .submit(self.peer, &bytes, &description, stop)
            {
                Ok(_) => {}
                Err(SubmitError::Cancelled) => break,
                Err(SubmitError::PayloadTooLarge { len, max }) => {
                    error!(
                        "Tunnel {}: segment of {} bytes exceeds radio maximum {}",
                        self.id, len, max
                    );
                    self.request_stop(CloseReason::PayloadTooLarge);
                    break;
                }
                Err(e @ SubmitError::Exhausted { .. }) => {
                    error!("Tunnel {}: {}", self.id, e);
                    self.request_stop(CloseReason::SubmissionFailed);
                    break;
                }
            }
        }

        self.finish();
    }

    fn next_outbound(&self) -> Option<Segment> {
        let stop = self.lifecycle.stop_signal();
        let poll = self.context.config.poll_interval();
        while !stop.is_stopped() {
            if let Some(segment) = self.queue.pop_timeout(poll) {
                return Some(segment);
            }
        }
        None
    }

    /// Close the socket and enter `Closed`. Runs once, on the writer.
    fn finish(&self) {
        let discarded = self.queue.close();
        self.close_socket();
        {
            let mut inbound = self.lock_inbound();
            inbound.stream = None;
            inbound.early.clear();
            inbound.buffer.clear();
        }

        let reason = self.lifecycle.close(CloseReason::Shutdown);
        GatewayStats::incr(&self.context.stats.tunnels_closed);
        info!(
            "Tunnel {} closed: {} ({} queued segments discarded)",
            self.id, reason, discarded
        );

        if reason.notifies_peer() {
            self.notify_peer();
        }
    }

    fn close_socket(&self) {
        if let Some(socket) = lock(&self.socket).take() {
            if let Err(e) = socket.shutdown(Shutdown::Both) {
                debug!("Tunnel {}: socket shutdown: {}", self.id, e);
            }
            debug!("Tunnel {}: local socket closed", self.id);
        }
    }

    /// Send the zero-length close signal.
    fn notify_peer(&self) {
        let signal = Segment::open_failure(self.id.clone());
        let bytes = match signal.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Tunnel {}: {}", self.id, e);
                return;
            }
        };

        // The tunnel's own signal is already stopped.
        let stop = StopSignal::new();
        let description = format!("tunnel {} close signal", self.id);
        if let Err(e) = self
            .context
            .sender
            .submit(self.peer, &bytes, &description, &stop)
        {
            warn!("Tunnel {}: close signal not sent: {}", self.id, e);
        }
    }

    fn touch(&self) {
        *lock(&self.last_activity) = Instant::now();
    }

    fn idle_expired(&self) -> bool {
        self.idle_for() >= self.context.config.idle_timeout()
    }

    fn thread_name(&self, suffix: &str) -> String {
        format!("tunnel-{}-{}", self.id, suffix)
    }

    fn lock_inbound(&self) -> MutexGuard<'_, InboundSide> {
        lock(&self.inbound)
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("id", &self.id.to_hex())
            .field("peer", &self.peer)
            .field("role", &self.role)
            .field("destination", &self.destination.to_string())
            .field("state", &self.state())
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

/// Tunnel errors.
#[derive(Debug)]
pub enum TunnelError {
    /// The tunnel is draining or closed.
    NotRunning,
    /// The local socket failed.
    LocalIo(io::Error),
}

impl std::fmt::Display for TunnelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotRunning => write!(f, "tunnel not running"),
            Self::LocalIo(e) => write!(f, "local I/O error: {}", e),
        }
    }
}

impl std::error::Error for TunnelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::LocalIo(e) => Some(e),
            Self::NotRunning => None,
        }
    }
}

impl From<io::Error> for TunnelError {
    fn from(e: io::Error) -> Self {
        Self::LocalIo(e)
    }
}
