//! Mesh socket tunnel.
//!
//! Bridges ordinary TCP connections across a bandwidth-constrained radio mesh
//! that accepts only one message in flight at a time. A tunnel reads its local
//! socket, splits each read into small segments, submits them one by one over
//! the radio link with delivery confirmation, and the peer gateway replays the
//! stream onto a TCP connection to the original destination.
//!
//! Components, leaf to root:
//! - [`codec`]: segment wire format, burst chunking and reassembly
//! - [`link`]: radio link boundary, delivery tracker, submission retries
//! - [`tunnel`]: one relayed TCP connection with reader and writer threads
//! - [`registry`]: tunnel id to tunnel map, the inbound routing entry point
//! - [`dispatch`]: classifies radio payloads and hands tunnel messages on
//! - [`ingress`]: accepts local clients and opens tunnels toward a peer
//! - [`config`], [`stats`]: gateway configuration and counters

pub mod codec;
pub mod config;
pub mod dispatch;
pub mod ingress;
pub mod link;
pub mod registry;
pub mod signal;
pub mod stats;
pub mod tunnel;

// Re-export commonly used items
pub use codec::{Destination, Segment, SegmentError, TunnelId};
pub use config::{
    BackhaulConfig, ConfigError, GatewayConfig, IngressRoute, RetryPolicy, TrackerConfig,
    TunnelConfig,
};
pub use dispatch::{Dispatcher, MessageKind};
pub use ingress::IngressListener;
pub use link::{
    CompletionHandler, CorrelationId, DeliveryFailure, DeliveryTracker, InboundHandler, LinkError,
    MeshSender, PeerId, RadioLink, SendOutcome,
};
pub use registry::{DropReason, RouteOutcome, TunnelRegistry};
pub use signal::StopSignal;
pub use stats::{GatewayStats, StatsServer, DEFAULT_STATS_PORT};
pub use tunnel::{CloseReason, Role, Tunnel, TunnelContext, TunnelError, TunnelState};
