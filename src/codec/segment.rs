//! Tunnel segment wire format.
//!
//! A segment travels over the mesh as a CBOR map keyed by small unsigned
//! integer tags. The tags are shared with the other payload kinds the gateway
//! understands (SMS relay, TxTenna), which is why the dispatcher works on a
//! decoded [`TaggedMap`] before deciding what a message is.
//!
//! # Wire Format
//!
//! ```text
//! { 34: bytes   tunnel id
//!   28: uint    segment index
//!   29: uint    segment count
//!   24: bytes   payload            (data segments)
//!   32: text    destination host   (setup segments only)
//!   33: uint    destination port   (setup segments only) }
//! ```
//!
//! # Example
//!
//! ```
//! use mesh_tunnel::codec::{Segment, TunnelId};
//!
//! let id = TunnelId::new(vec![0xab, 0xcd]);
//! let segment = Segment::data(id, 0, 1, b"hello".to_vec());
//! let bytes = segment.encode().unwrap();
//! assert_eq!(Segment::decode(&bytes).unwrap(), segment);
//! ```

use ciborium::value::{Integer, Value};
use std::collections::BTreeMap;

/// Payload byte string.
pub const TAG_PAYLOAD: u64 = 24;
/// Phone number of an SMS relay message.
pub const TAG_PHONE_NUMBER: u64 = 25;
/// Text of an SMS relay message.
pub const TAG_MESSAGE_TEXT: u64 = 26;
/// Segment index within a burst.
pub const TAG_SEGMENT_INDEX: u64 = 28;
/// Number of segments in a burst.
pub const TAG_SEGMENT_COUNT: u64 = 29;
/// TxTenna message id.
pub const TAG_TXTENNA_ID: u64 = 30;
/// TxTenna transaction hash.
pub const TAG_TRANSACTION_HASH: u64 = 31;
/// Destination host (setup segments).
pub const TAG_HOST: u64 = 32;
/// Destination port (setup segments).
pub const TAG_PORT: u64 = 33;
/// Tunnel (socket) id.
pub const TAG_TUNNEL_ID: u64 = 34;

/// Length of tunnel ids generated by this gateway.
pub const TUNNEL_ID_LEN: usize = 8;

/// Opaque identifier of one tunnel, chosen by the initiating peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TunnelId(Vec<u8>);

impl TunnelId {
    /// Wrap raw id bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Raw id bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Lowercase hex rendering, used in logs.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl std::fmt::Display for TunnelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl From<&[u8]> for TunnelId {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

/// Destination carried by a setup segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    /// Hostname or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Destination {
    /// Create a destination.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Address string for connection (host:port).
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A decoded CBOR map with unsigned integer keys.
///
/// Entries whose keys are not unsigned integers are discarded on decode.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaggedMap(BTreeMap<u64, Value>);

impl TaggedMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a CBOR map from raw bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, SegmentError> {
        let value: Value = ciborium::from_reader(bytes)
            .map_err(|e| SegmentError::InvalidCbor(format!("{:?}", e)))?;

        let Value::Map(entries) = value else {
            return Err(SegmentError::NotAMap);
        };

        let mut map = BTreeMap::new();
        for (key, value) in entries {
            if let Some(tag) = key.as_integer().and_then(|i| u64::try_from(i).ok()) {
                map.insert(tag, value);
            }
        }
        Ok(Self(map))
    }

    /// Encode the map as CBOR.
    pub fn encode(&self) -> Result<Vec<u8>, SegmentError> {
        let entries = self
            .0
            .iter()
            .map(|(tag, value)| (Value::Integer(Integer::from(*tag)), value.clone()))
            .collect();
        let mut bytes = Vec::new();
        ciborium::into_writer(&Value::Map(entries), &mut bytes)
            .map_err(|e| SegmentError::Encode(format!("{:?}", e)))?;
        Ok(bytes)
    }

    /// Check whether a tag is present.
    pub fn contains(&self, tag: u64) -> bool {
        self.0.contains_key(&tag)
    }

    /// Look up a raw value.
    pub fn get(&self, tag: u64) -> Option<&Value> {
        self.0.get(&tag)
    }

    /// Insert or replace a value.
    pub fn insert(&mut self, tag: u64, value: Value) {
        self.0.insert(tag, value);
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the map has no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn bytes(&self, tag: u64, field: &'static str) -> Result<Option<Vec<u8>>, SegmentError> {
        match self.0.get(&tag) {
            None => Ok(None),
            Some(Value::Bytes(b)) => Ok(Some(b.clone())),
            Some(_) => Err(SegmentError::InvalidField(field)),
        }
    }

    fn text(&self, tag: u64, field: &'static str) -> Result<Option<String>, SegmentError> {
        match self.0.get(&tag) {
            None => Ok(None),
            Some(Value::Text(s)) => Ok(Some(s.clone())),
            Some(_) => Err(SegmentError::InvalidField(field)),
        }
    }

    fn uint(&self, tag: u64, field: &'static str) -> Result<Option<u64>, SegmentError> {
        match self.0.get(&tag) {
            None => Ok(None),
            Some(Value::Integer(i)) => u64::try_from(*i)
                .map(Some)
                .map_err(|_| SegmentError::InvalidField(field)),
            Some(_) => Err(SegmentError::InvalidField(field)),
        }
    }
}

/// One fragment of a tunnel's data burst.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Tunnel this segment belongs to.
    pub tunnel_id: TunnelId,
    /// Position within the burst (0-based).
    pub index: u32,
    /// Number of segments in the burst.
    pub count: u32,
    /// Data bytes (may be empty).
    pub payload: Vec<u8>,
    /// Destination, present only on setup segments.
    pub setup: Option<Destination>,
}

impl Segment {
    /// Create a data segment.
    pub fn data(tunnel_id: TunnelId, index: u32, count: u32, payload: Vec<u8>) -> Self {
        Self {
            tunnel_id,
            index,
            count,
            payload,
            setup: None,
        }
    }

    /// Create a setup segment with an empty payload.
    pub fn setup(tunnel_id: TunnelId, destination: Destination) -> Self {
        Self {
            tunnel_id,
            index: 0,
            count: 1,
            payload: Vec::new(),
            setup: Some(destination),
        }
    }

    /// Create the zero-length signal telling the peer its tunnel is gone.
    pub fn open_failure(tunnel_id: TunnelId) -> Self {
        Self::data(tunnel_id, 0, 1, Vec::new())
    }

    /// Check if this segment establishes a tunnel.
    #[inline]
    pub fn is_setup(&self) -> bool {
        self.setup.is_some()
    }

    /// Check if this is a failure/close signal (empty payload, no setup).
    #[inline]
    pub fn is_close_signal(&self) -> bool {
        self.setup.is_none() && self.payload.is_empty()
    }

    /// Convert to a tagged map.
    pub fn to_tagged(&self) -> TaggedMap {
        let mut map = TaggedMap::new();
        map.insert(TAG_TUNNEL_ID, Value::Bytes(self.tunnel_id.as_bytes().to_vec()));
        map.insert(TAG_SEGMENT_INDEX, Value::Integer(Integer::from(self.index)));
        map.insert(TAG_SEGMENT_COUNT, Value::Integer(Integer::from(self.count)));
        map.insert(TAG_PAYLOAD, Value::Bytes(self.payload.clone()));
        if let Some(dest) = &self.setup {
            map.insert(TAG_HOST, Value::Text(dest.host.clone()));
            map.insert(TAG_PORT, Value::Integer(Integer::from(dest.port)));
        }
        map
    }

    /// Parse a segment out of a tagged map.
    ///
    /// A map carrying either `host` or `port` is a setup segment and must carry
    /// both; `payload`, `index` and `count` are optional on it. Every other
    /// segment requires id, index, count and payload.
    pub fn from_tagged(map: &TaggedMap) -> Result<Self, SegmentError> {
        let tunnel_id = map
            .bytes(TAG_TUNNEL_ID, "tunnel_id")?
            .ok_or(SegmentError::MissingField("tunnel_id"))?;

        let host = map.text(TAG_HOST, "host")?;
        let port = map.uint(TAG_PORT, "port")?;
        let index = map.uint(TAG_SEGMENT_INDEX, "index")?;
        let count = map.uint(TAG_SEGMENT_COUNT, "count")?;
        let payload = map.bytes(TAG_PAYLOAD, "payload")?;

        let setup = match (host, port) {
            (None, None) => None,
            (Some(host), Some(port)) => {
                let port = u16::try_from(port).map_err(|_| SegmentError::InvalidField("port"))?;
                Some(Destination { host, port })
            }
            (None, Some(_)) => return Err(SegmentError::MissingField("host")),
            (Some(_), None) => return Err(SegmentError::MissingField("port")),
        };

        let (index, count, payload) = if setup.is_some() {
            (
                index.unwrap_or(0),
                count.unwrap_or(1),
                payload.unwrap_or_default(),
            )
        } else {
            (
                index.ok_or(SegmentError::MissingField("index"))?,
                count.ok_or(SegmentError::MissingField("count"))?,
                payload.ok_or(SegmentError::MissingField("payload"))?,
            )
        };

        Ok(Self {
            tunnel_id: TunnelId(tunnel_id),
            index: u32::try_from(index).map_err(|_| SegmentError::InvalidField("index"))?,
            count: u32::try_from(count).map_err(|_| SegmentError::InvalidField("count"))?,
            payload,
            setup,
        })
    }

    /// Serialize to CBOR bytes.
    pub fn encode(&self) -> Result<Vec<u8>, SegmentError> {
        self.to_tagged().encode()
    }

    /// Deserialize from CBOR bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, SegmentError> {
        Self::from_tagged(&TaggedMap::decode(bytes)?)
    }
}

/// Reasons a message is not a valid tunnel segment.
///
/// Every variant is a malformed segment: the message is dropped and logged,
/// never retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentError {
    /// Bytes are not valid CBOR.
    InvalidCbor(String),
    /// Top-level CBOR value is not a map.
    NotAMap,
    /// A required tag is absent.
    MissingField(&'static str),
    /// A tag holds a value of the wrong type or range.
    InvalidField(&'static str),
    /// CBOR serialization failed.
    Encode(String),
}

impl std::fmt::Display for SegmentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidCbor(e) => write!(f, "malformed segment: invalid CBOR: {}", e),
            Self::NotAMap => write!(f, "malformed segment: not a tagged map"),
            Self::MissingField(name) => write!(f, "malformed segment: missing {}", name),
            Self::InvalidField(name) => write!(f, "malformed segment: invalid {}", name),
            Self::Encode(e) => write!(f, "segment encoding failed: {}", e),
        }
    }
}

impl std::error::Error for SegmentError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> TunnelId {
        TunnelId::new(vec![0xde, 0xad, 0xbe, 0xef])
    }

    #[test]
    fn test_data_segment_roundtrip() {
        let segment = Segment::data(id(), 2, 3, vec![1, 2, 3]);
        let decoded = Segment::decode(&segment.encode().unwrap()).unwrap();
        assert_eq!(decoded, segment);
        assert!(!decoded.is_setup());
        assert!(!decoded.is_close_signal());
    }

    #[test]
    fn test_setup_segment_roundtrip() {
        let segment = Segment::setup(id(), Destination::new("example.org", 8333));
        let decoded = Segment::decode(&segment.encode().unwrap()).unwrap();
        assert_eq!(decoded.setup, Some(Destination::new("example.org", 8333)));
        assert_eq!((decoded.index, decoded.count), (0, 1));
        assert!(decoded.payload.is_empty());
        assert!(!decoded.is_close_signal());
    }

    #[test]
    fn test_open_failure_is_close_signal() {
        let segment = Segment::open_failure(id());
        let decoded = Segment::decode(&segment.encode().unwrap()).unwrap();
        assert!(decoded.is_close_signal());
        assert_eq!(decoded.tunnel_id, id());
    }

    #[test]
    fn test_wire_uses_integer_tags() {
        let map = TaggedMap::decode(&Segment::data(id(), 0, 1, vec![9]).encode().unwrap()).unwrap();
        assert_eq!(map.len(), 4);
        assert!(map.contains(TAG_TUNNEL_ID));
        assert!(map.contains(TAG_SEGMENT_INDEX));
        assert!(map.contains(TAG_SEGMENT_COUNT));
        assert!(map.contains(TAG_PAYLOAD));
        assert!(!map.contains(TAG_HOST));
    }

    #[test]
    fn test_setup_without_index_defaults() {
        // Setup messages from older gateways carry no index.
        let mut map = TaggedMap::new();
        map.insert(TAG_TUNNEL_ID, Value::Bytes(vec![1]));
        map.insert(TAG_HOST, Value::Text("localhost".into()));
        map.insert(TAG_PORT, Value::Integer(Integer::from(80u16)));
        map.insert(TAG_SEGMENT_COUNT, Value::Integer(Integer::from(1u8)));
        map.insert(TAG_PAYLOAD, Value::Bytes(b"GET /".to_vec()));

        let segment = Segment::from_tagged(&map).unwrap();
        assert_eq!(segment.index, 0);
        assert_eq!(segment.payload, b"GET /".to_vec());
    }

    #[test]
    fn test_missing_required_fields() {
        let full = Segment::data(id(), 0, 1, vec![1]).to_tagged();

        for (tag, name) in [
            (TAG_TUNNEL_ID, "tunnel_id"),
            (TAG_SEGMENT_INDEX, "index"),
            (TAG_SEGMENT_COUNT, "count"),
            (TAG_PAYLOAD, "payload"),
        ] {
            let mut map = TaggedMap::new();
            for t in [TAG_TUNNEL_ID, TAG_SEGMENT_INDEX, TAG_SEGMENT_COUNT, TAG_PAYLOAD] {
                if t != tag {
                    map.insert(t, full.get(t).unwrap().clone());
                }
            }
            assert_eq!(
                Segment::from_tagged(&map),
                Err(SegmentError::MissingField(name))
            );
        }
    }

    #[test]
    fn test_setup_requires_host_and_port() {
        let mut map = TaggedMap::new();
        map.insert(TAG_TUNNEL_ID, Value::Bytes(vec![1]));
        map.insert(TAG_HOST, Value::Text("localhost".into()));
        assert_eq!(
            Segment::from_tagged(&map),
            Err(SegmentError::MissingField("port"))
        );

        let mut map = TaggedMap::new();
        map.insert(TAG_TUNNEL_ID, Value::Bytes(vec![1]));
        map.insert(TAG_PORT, Value::Integer(Integer::from(80u16)));
        assert_eq!(
            Segment::from_tagged(&map),
            Err(SegmentError::MissingField("host"))
        );
    }

    #[test]
    fn test_wrong_types_are_malformed() {
        let mut map = Segment::data(id(), 0, 1, vec![1]).to_tagged();
        map.insert(TAG_PAYLOAD, Value::Text("not bytes".into()));
        assert_eq!(
            Segment::from_tagged(&map),
            Err(SegmentError::InvalidField("payload"))
        );

        let mut map = Segment::setup(id(), Destination::new("h", 1)).to_tagged();
        map.insert(TAG_PORT, Value::Integer(Integer::from(70_000u32)));
        assert_eq!(
            Segment::from_tagged(&map),
            Err(SegmentError::InvalidField("port"))
        );
    }

    #[test]
    fn test_decode_rejects_non_map() {
        let mut bytes = Vec::new();
        ciborium::into_writer(&Value::Bytes(vec![1, 2]), &mut bytes).unwrap();
        assert_eq!(TaggedMap::decode(&bytes), Err(SegmentError::NotAMap));
        assert!(matches!(
            TaggedMap::decode(&[0xff, 0x00]),
            Err(SegmentError::InvalidCbor(_))
        ));
    }

    #[test]
    fn test_tunnel_id_hex() {
        assert_eq!(id().to_hex(), "deadbeef");
        assert_eq!(id().to_string(), "deadbeef");
    }
}
