//! Inbound message dispatch.
//!
//! The [`Dispatcher`] is the [`InboundHandler`] attached to a radio link. It
//! decodes each payload into a tagged map, classifies it by the tags present
//! and hands tunnel messages to the [`TunnelRegistry`]. SMS relay and TxTenna
//! messages belong to sibling handlers and are only counted here.

use crate::codec::{
    Segment, TaggedMap, TAG_PHONE_NUMBER, TAG_TRANSACTION_HASH, TAG_TUNNEL_ID, TAG_TXTENNA_ID,
};
use crate::link::{InboundHandler, PeerId};
use crate::registry::{RouteOutcome, TunnelRegistry};
use crate::stats::GatewayStats;
use log::{debug, info, warn};
use std::sync::Arc;

/// Kind of an inbound radio message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Tunnel segment (socket id present).
    Tunnel,
    /// SMS relay request (phone number present).
    SmsRelay,
    /// TxTenna transaction broadcast.
    TxTenna,
    /// No recognised tag.
    Unknown,
}

impl MessageKind {
    /// Classify a decoded message.
    ///
    /// Checked in order: phone number, TxTenna tags, tunnel id. A message
    /// carrying several of them belongs to the first match.
    pub fn classify(map: &TaggedMap) -> Self {
        if map.contains(TAG_PHONE_NUMBER) {
            Self::SmsRelay
        } else if map.contains(TAG_TXTENNA_ID) || map.contains(TAG_TRANSACTION_HASH) {
            Self::TxTenna
        } else if map.contains(TAG_TUNNEL_ID) {
            Self::Tunnel
        } else {
            Self::Unknown
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tunnel => write!(f, "tunnel"),
            Self::SmsRelay => write!(f, "sms relay"),
            Self::TxTenna => write!(f, "txtenna"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Routes inbound radio messages.
pub struct Dispatcher {
    registry: Arc<TunnelRegistry>,
    stats: Arc<GatewayStats>,
}

impl Dispatcher {
    /// Create a dispatcher feeding `registry`.
    pub fn new(registry: Arc<TunnelRegistry>) -> Self {
        let stats = registry.context().stats.clone();
        Self { registry, stats }
    }

    /// Registry receiving tunnel segments.
    pub fn registry(&self) -> &Arc<TunnelRegistry> {
        &self.registry
    }

    /// Decode, classify and route one message.
    ///
    /// Returns the routing outcome for tunnel messages, `None` for anything
    /// skipped or malformed.
    pub fn dispatch(&self, sender: PeerId, payload: &[u8]) -> Option<RouteOutcome> {
        let map = match TaggedMap::decode(payload) {
            Ok(map) => map,
            Err(e) => {
                warn!("Dropping {} byte message from {}: {}", payload.len(), sender, e);
                GatewayStats::incr(&self.stats.malformed_messages);
                return None;
            }
        };

        match MessageKind::classify(&map) {
            MessageKind::Tunnel => {}
            kind => {
                info!("Skipping {} message from {}", kind, sender);
                GatewayStats::incr(&self.stats.skipped_messages);
                return None;
            }
        }

        let segment = match Segment::from_tagged(&map) {
            Ok(segment) => segment,
            Err(e) => {
                warn!("Malformed tunnel segment from {}: {}", sender, e);
                GatewayStats::incr(&self.stats.malformed_messages);
                return None;
            }
        };

        debug!(
            "Segment {}/{} for tunnel {} from {} ({} bytes{})",
            segment.index + 1,
            segment.count,
            segment.tunnel_id,
            sender,
            segment.payload.len(),
            if segment.is_setup() { ", setup" } else { "" }
        );
        Some(self.registry.route(sender, segment))
    }
}

impl InboundHandler for Dispatcher {
    fn on_message(&self, sender: PeerId, payload: &[u8]) {
        self.dispatch(sender, payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{TunnelId, TAG_MESSAGE_TEXT, TAG_PAYLOAD};
    use crate::config::{RetryPolicy, TrackerConfig, TunnelConfig};
    use crate::link::{DeliveryTracker, MemoryLink, MeshSender};
    use crate::registry::DropReason;
    use crate::tunnel::TunnelContext;
    use ciborium::value::Value;
    use std::sync::atomic::Ordering;

    fn dispatcher() -> Dispatcher {
        let _ = env_logger::builder().is_test(true).try_init();
        let (a, _b) = MemoryLink::pair(PeerId(1), PeerId(2));
        let link = Arc::new(a);
        let stats = Arc::new(GatewayStats::default());
        let tracker = Arc::new(DeliveryTracker::new(TrackerConfig::default(), stats.clone()));
        let sender = Arc::new(MeshSender::new(
            link,
            tracker,
            RetryPolicy::default(),
            stats.clone(),
        ));
        let registry = Arc::new(TunnelRegistry::new(TunnelContext {
            sender,
            config: TunnelConfig::default(),
            stats,
        }));
        Dispatcher::new(registry)
    }

    fn encode(map: TaggedMap) -> Vec<u8> {
        map.encode().unwrap()
    }

    #[test]
    fn test_classify() {
        let mut map = TaggedMap::new();
        assert_eq!(MessageKind::classify(&map), MessageKind::Unknown);

        map.insert(TAG_TUNNEL_ID, Value::Bytes(vec![1]));
        assert_eq!(MessageKind::classify(&map), MessageKind::Tunnel);

        map.insert(TAG_TXTENNA_ID, Value::Text("abc".into()));
        assert_eq!(MessageKind::classify(&map), MessageKind::TxTenna);

        map.insert(TAG_PHONE_NUMBER, Value::Text("+15550100".into()));
        assert_eq!(MessageKind::classify(&map), MessageKind::SmsRelay);
    }

    #[test]
    fn test_garbage_counted_as_malformed() {
        let dispatcher = dispatcher();
        assert_eq!(dispatcher.dispatch(PeerId(2), &[0xff, 0x00, 0x13]), None);
        assert_eq!(dispatcher.stats.malformed_messages.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_incomplete_segment_counted_as_malformed() {
        let dispatcher = dispatcher();
        let mut map = TaggedMap::new();
        map.insert(TAG_TUNNEL_ID, Value::Bytes(vec![1, 2]));
        map.insert(TAG_PAYLOAD, Value::Bytes(b"x".to_vec()));

        assert_eq!(dispatcher.dispatch(PeerId(2), &encode(map)), None);
        assert_eq!(dispatcher.stats.malformed_messages.load(Ordering::Relaxed), 1);
        assert!(dispatcher.registry().is_empty());
    }

    #[test]
    fn test_sms_relay_skipped() {
        let dispatcher = dispatcher();
        let mut map = TaggedMap::new();
        map.insert(TAG_PHONE_NUMBER, Value::Text("+15550100".into()));
        map.insert(TAG_MESSAGE_TEXT, Value::Text("hi".into()));

        dispatcher.on_message(PeerId(2), &encode(map));
        assert_eq!(dispatcher.stats.skipped_messages.load(Ordering::Relaxed), 1);
        assert_eq!(dispatcher.stats.malformed_messages.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_data_for_unknown_tunnel_routed_and_dropped() {
        let dispatcher = dispatcher();
        let segment = Segment::data(TunnelId::new(vec![9; 8]), 0, 1, b"data".to_vec());

        let outcome = dispatcher.dispatch(PeerId(2), &segment.encode().unwrap());
        assert_eq!(
            outcome,
            Some(RouteOutcome::Dropped(DropReason::UnknownTunnel))
        );
        assert!(dispatcher.registry().is_empty());
        assert_eq!(dispatcher.stats.dropped_messages.load(Ordering::Relaxed), 1);
    }
}
