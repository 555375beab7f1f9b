//! Radio messages carried between two gateways over TCP.
//!
//! The backhaul stands in for the mesh radio when two gateways can reach each
//! other over IP. It keeps the radio's contract: one confirmation per
//! accepted message, delivered asynchronously. The receiving gateway answers
//! every DATA frame with an ACK frame once the message has been handed to its
//! inbound handler.
//!
//! # Frame Format
//!
//! ```text
//! [len: u16 BE][kind: u8][body]        len counts kind + body
//!
//! DATA (kind 1): [correlation u64 BE][source u64 BE][destination u64 BE][payload]
//! ACK  (kind 2): [correlation u64 BE]
//! ```
//!
//! # Platform Notes
//!
//! - Completion is `Ok` on ACK, `NoResponse` after the ACK timeout and
//!   `LinkDisrupted` for everything in flight when the socket fails.
//! - A failed socket is not reconnected; submissions fail with `NotConnected`.

use super::{
    CompletionHandler, CorrelationId, DeliveryFailure, InboundHandler, LinkError, PeerId,
    RadioLink, SendOutcome,
};
use crate::config::BackhaulConfig;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

const KIND_DATA: u8 = 1;
const KIND_ACK: u8 = 2;

/// Length prefix size.
const LEN_SIZE: usize = 2;
/// Correlation, source and destination ids.
const DATA_HEADER_SIZE: usize = 24;
const ACK_BODY_SIZE: usize = 8;

/// Read timeout of the reader thread; bounds shutdown and ACK-timeout latency.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// One backhaul frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A radio message.
    Data {
        correlation: u64,
        source: PeerId,
        dest: PeerId,
        payload: Vec<u8>,
    },
    /// Confirmation of a DATA frame.
    Ack { correlation: u64 },
}

impl Frame {
    /// Serialize including the length prefix.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let mut body = Vec::new();
        match self {
            Self::Data {
                correlation,
                source,
                dest,
                payload,
            } => {
                body.push(KIND_DATA);
                body.extend_from_slice(&correlation.to_be_bytes());
                body.extend_from_slice(&source.0.to_be_bytes());
                body.extend_from_slice(&dest.0.to_be_bytes());
                body.extend_from_slice(payload);
            }
            Self::Ack { correlation } => {
                body.push(KIND_ACK);
                body.extend_from_slice(&correlation.to_be_bytes());
            }
        }

        let len = u16::try_from(body.len()).map_err(|_| FrameError::TooLarge(body.len()))?;
        let mut frame = Vec::with_capacity(LEN_SIZE + body.len());
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    fn parse(body: &[u8]) -> Result<Self, FrameError> {
        let (&kind, rest) = body.split_first().ok_or(FrameError::Empty)?;
        match kind {
            KIND_DATA => {
                if rest.len() < DATA_HEADER_SIZE {
                    return Err(FrameError::Truncated);
                }
                Ok(Self::Data {
                    correlation: be_u64(&rest[0..8]),
                    source: PeerId(be_u64(&rest[8..16])),
                    dest: PeerId(be_u64(&rest[16..24])),
                    payload: rest[DATA_HEADER_SIZE..].to_vec(),
                })
            }
            KIND_ACK => {
                if rest.len() != ACK_BODY_SIZE {
                    return Err(FrameError::Truncated);
                }
                Ok(Self::Ack {
                    correlation: be_u64(rest),
                })
            }
            other => Err(FrameError::UnknownKind(other)),
        }
    }
}

fn be_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_be_bytes(buf)
}

/// Accumulates stream bytes and yields complete frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the stream.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Take the next complete frame, if any.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.buf.len() < LEN_SIZE {
            return Ok(None);
        }
        let len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
        if self.buf.len() < LEN_SIZE + len {
            return Ok(None);
        }
        let body: Vec<u8> = self.buf.drain(..LEN_SIZE + len).skip(LEN_SIZE).collect();
        Frame::parse(&body).map(Some)
    }

    /// Bytes held for an incomplete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

/// Frame errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Zero-length frame.
    Empty,
    /// Body shorter than its kind requires.
    Truncated,
    /// Unknown frame kind.
    UnknownKind(u8),
    /// Body does not fit the length prefix.
    TooLarge(usize),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "empty frame"),
            Self::Truncated => write!(f, "truncated frame"),
            Self::UnknownKind(kind) => write!(f, "unknown frame kind {}", kind),
            Self::TooLarge(len) => write!(f, "frame too large: {} bytes", len),
        }
    }
}

impl std::error::Error for FrameError {}

type InFlight = HashMap<u64, (Instant, Arc<dyn CompletionHandler>)>;

/// State shared between the link and its reader thread.
struct Shared {
    node: PeerId,
    writer: Mutex<TcpStream>,
    in_flight: Mutex<InFlight>,
    connected: AtomicBool,
    shutdown: AtomicBool,
    ack_timeout: Duration,
}

impl Shared {
    fn write_frame(&self, frame: &Frame) -> io::Result<()> {
        let bytes = frame
            .encode()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        let mut writer = lock(&self.writer);
        writer.write_all(&bytes)?;
        writer.flush()
    }

    fn complete(&self, correlation: u64, result: Result<(), DeliveryFailure>) {
        let entry = lock(&self.in_flight).remove(&correlation);
        match entry {
            Some((_, handler)) => handler.on_complete(SendOutcome {
                correlation_id: CorrelationId(correlation),
                result,
            }),
            None => debug!("Backhaul ACK for unknown message #{}", correlation),
        }
    }

    fn expire(&self) {
        let expired: Vec<(u64, Arc<dyn CompletionHandler>)> = {
            let mut in_flight = lock(&self.in_flight);
            let stale: Vec<u64> = in_flight
                .iter()
                .filter(|(_, (sent, _))| sent.elapsed() >= self.ack_timeout)
                .map(|(id, _)| *id)
                .collect();
            stale
                .into_iter()
                .filter_map(|id| in_flight.remove(&id).map(|(_, h)| (id, h)))
                .collect()
        };

        for (id, handler) in expired {
            handler.on_complete(SendOutcome::failed(
                CorrelationId(id),
                DeliveryFailure::NoResponse,
            ));
        }
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
        let _ = lock(&self.writer).shutdown(Shutdown::Both);

        let drained: Vec<(u64, Arc<dyn CompletionHandler>)> = lock(&self.in_flight)
            .drain()
            .map(|(id, (_, h))| (id, h))
            .collect();
        for (id, handler) in drained {
            handler.on_complete(SendOutcome::failed(
                CorrelationId(id),
                DeliveryFailure::LinkDisrupted,
            ));
        }
    }
}

/// Backhaul link to one peer gateway.
pub struct BackhaulLink {
    shared: Arc<Shared>,
    reader: Mutex<Option<TcpStream>>,
    reader_handle: Mutex<Option<thread::JoinHandle<()>>>,
    next_id: AtomicU64,
    max_payload: usize,
    peer_addr: String,
}

impl BackhaulLink {
    /// Open the backhaul described by `config`, listening or connecting.
    pub fn open(node: PeerId, config: &BackhaulConfig) -> Result<Self, LinkError> {
        match (&config.listen, &config.connect) {
            (Some(listen), _) => Self::accept(listen, node, config),
            (None, Some(connect)) => Self::connect(connect, node, config),
            (None, None) => Err(LinkError::NotConnected),
        }
    }

    /// Connect to a peer gateway.
    pub fn connect(addr: &str, node: PeerId, config: &BackhaulConfig) -> Result<Self, LinkError> {
        info!("Connecting backhaul to {}", addr);

        let addrs: Vec<_> = addr
            .to_socket_addrs()
            .map_err(|e| {
                error!("DNS resolution failed for {}: {}", addr, e);
                LinkError::Io(e)
            })?
            .collect();

        let mut last_error = None;
        for candidate in addrs {
            match TcpStream::connect_timeout(&candidate, config.connect_timeout()) {
                Ok(stream) => return Self::from_stream(stream, node, config),
                Err(e) => {
                    warn!("Backhaul connection to {} failed: {}", candidate, e);
                    last_error = Some(e);
                }
            }
        }

        Err(match last_error {
            Some(e) => LinkError::Io(e),
            None => LinkError::NotConnected,
        })
    }

    /// Wait for a peer gateway to connect.
    pub fn accept(addr: &str, node: PeerId, config: &BackhaulConfig) -> Result<Self, LinkError> {
        let listener = TcpListener::bind(addr)?;
        info!("Waiting for backhaul peer on {}", listener.local_addr()?);
        let (stream, peer) = listener.accept()?;
        info!("Backhaul peer connected from {}", peer);
        Self::from_stream(stream, node, config)
    }

    /// Wrap an established connection.
    pub fn from_stream(
        stream: TcpStream,
        node: PeerId,
        config: &BackhaulConfig,
    ) -> Result<Self, LinkError> {
        // Disable Nagle's algorithm for lower latency
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to disable Nagle's algorithm: {}", e);
        }
        stream.set_write_timeout(Some(config.connect_timeout()))?;
        stream.set_read_timeout(Some(POLL_INTERVAL))?;

        let peer_addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let reader = stream.try_clone()?;

        Ok(Self {
            shared: Arc::new(Shared {
                node,
                writer: Mutex::new(stream),
                in_flight: Mutex::new(HashMap::new()),
                connected: AtomicBool::new(true),
                shutdown: AtomicBool::new(false),
                ack_timeout: config.ack_timeout(),
            }),
            reader: Mutex::new(Some(reader)),
            reader_handle: Mutex::new(None),
            next_id: AtomicU64::new(1),
            max_payload: config.max_payload,
            peer_addr,
        })
    }

    /// Start the reader thread, handing DATA frames to `inbound`.
    ///
    /// Can only be called once.
    pub fn start(&self, inbound: Arc<dyn InboundHandler>) -> Result<(), LinkError> {
        let stream = lock(&self.reader).take().ok_or_else(|| {
            LinkError::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "backhaul reader already started",
            ))
        })?;
        let shared = self.shared.clone();

        let handle = thread::Builder::new()
            .name("backhaul-reader".into())
            .spawn(move || run_reader(stream, shared, inbound))?;
        *lock(&self.reader_handle) = Some(handle);
        Ok(())
    }

    /// Close the connection and stop the reader thread.
    pub fn close(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.disconnect();
        if let Some(handle) = lock(&self.reader_handle).take() {
            let _ = handle.join();
        }
    }

    /// Address of the peer gateway.
    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }
}

impl RadioLink for BackhaulLink {
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
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }

        let correlation = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::Data {
            correlation,
            source: self.shared.node,
            dest,
            payload: payload.to_vec(),
        };

        // Registered before writing: the ACK may arrive before write_frame returns.
        lock(&self.shared.in_flight).insert(correlation, (Instant::now(), on_complete));

        if let Err(e) = self.shared.write_frame(&frame) {
            lock(&self.shared.in_flight).remove(&correlation);
            error!("Backhaul write to {} failed: {}", self.peer_addr, e);
            self.shared.disconnect();
            return Err(LinkError::Io(e));
        }

        debug!(
            "Backhaul sent #{} to {} ({} bytes)",
            correlation,
            dest,
            payload.len()
        );
        Ok(CorrelationId(correlation))
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    fn max_payload(&self) -> usize {
        self.max_payload
    }
}

impl std::fmt::Debug for BackhaulLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackhaulLink")
            .field("node", &self.shared.node)
            .field("peer", &self.peer_addr)
            .field("connected", &self.is_connected())
            .finish()
    }
}

fn run_reader(mut stream: TcpStream, shared: Arc<Shared>, inbound: Arc<dyn InboundHandler>) {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 4096];

    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        shared.expire();

        match stream.read(&mut buf) {
            Ok(0) => {
                info!("Backhaul peer closed the connection");
                break;
            }
            Ok(n) => {
                decoder.push(&buf[..n]);
                if let Err(e) = drain_frames(&mut decoder, &shared, inbound.as_ref()) {
                    error!("Backhaul protocol error: {}", e);
                    break;
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) => {}
            Err(e) => {
                if !shared.shutdown.load(Ordering::Acquire) {
                    error!("Backhaul read failed: {}", e);
                }
                break;
            }
        }
    }

    shared.disconnect();
    debug!("Backhaul reader exiting");
}

fn drain_frames(
    decoder: &mut FrameDecoder,
    shared: &Shared,
    inbound: &dyn InboundHandler,
) -> io::Result<()> {
    loop {
        let frame = decoder
            .next_frame()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        let Some(frame) = frame else {
            return Ok(());
        };

        match frame {
            Frame::Data {
                correlation,
                source,
                dest,
                payload,
            } => {
                if dest == shared.node {
                    inbound.on_message(source, &payload);
                } else {
                    debug!("Backhaul message #{} for node {} ignored", correlation, dest);
                }
                shared.write_frame(&Frame::Ack { correlation })?;
            }
            Frame::Ack { correlation } => shared.complete(correlation, Ok(())),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Handle poisoned mutex - recover by taking the inner value
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
