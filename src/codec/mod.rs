//! Segment codec.
//!
//! This module contains:
//! - [`segment`]: the tagged-field wire format of a tunnel segment
//! - [`burst`]: splitting a read-burst into segments and reassembling it

mod burst;
mod segment;

pub use burst::{max_segment_len, segment_burst, InboundBuffer, DEFAULT_CHUNK_SIZE};
pub use segment::{
    Destination, Segment, SegmentError, TaggedMap, TunnelId, TAG_HOST, TAG_MESSAGE_TEXT,
    TAG_PAYLOAD, TAG_PHONE_NUMBER, TAG_PORT, TAG_SEGMENT_COUNT, TAG_SEGMENT_INDEX,
    TAG_TRANSACTION_HASH, TAG_TUNNEL_ID, TAG_TXTENNA_ID, TUNNEL_ID_LEN,
};
