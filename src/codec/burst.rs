//! Burst segmentation and reassembly.
//!
//! Every read from a local socket is one burst. A burst is split into
//! fixed-size chunks, each chunk travelling as its own segment with
//! `index`/`count` relative to that burst. The peer accumulates a burst and
//! forwards it in one write once the last index has arrived.
//!
//! # Example
//!
//! ```
//! use mesh_tunnel::codec::{segment_burst, InboundBuffer, TunnelId};
//!
//! let data: Vec<u8> = (0..=255).cycle().take(320).collect();
//! let segments = segment_burst(&TunnelId::new(vec![1]), &data, 150);
//! assert_eq!(segments.len(), 3);
//!
//! let mut buffer = InboundBuffer::new();
//! let mut result = None;
//! for s in segments {
//!     result = buffer.accept(s.index, s.count, &s.payload);
//! }
//! assert_eq!(result, Some(data));
//! ```

use super::segment::{Segment, SegmentError, TunnelId, TUNNEL_ID_LEN};
use log::warn;

/// Default chunk size in bytes, well under the radio payload ceiling.
pub const DEFAULT_CHUNK_SIZE: usize = 150;

/// Split one read-burst into segments of at most `chunk_size` payload bytes.
///
/// Returns `ceil(data.len() / chunk_size)` segments numbered from 0. An empty
/// burst produces no segments.
///
/// # Panics
///
/// Panics if `chunk_size` is zero.
pub fn segment_burst(tunnel_id: &TunnelId, data: &[u8], chunk_size: usize) -> Vec<Segment> {
    assert!(chunk_size > 0, "chunk size must be greater than zero");

    let count = data.len().div_ceil(chunk_size) as u32;
    data.chunks(chunk_size)
        .enumerate()
        .map(|(index, chunk)| Segment::data(tunnel_id.clone(), index as u32, count, chunk.to_vec()))
        .collect()
}

/// Encoded size of the largest segment [`segment_burst`] can produce for
/// `chunk_size`: a full chunk with a gateway-length tunnel id and the widest
/// index and count.
pub fn max_segment_len(chunk_size: usize) -> Result<usize, SegmentError> {
    let id = TunnelId::new(vec![0xff; TUNNEL_ID_LEN]);
    let segment = Segment::data(id, u32::MAX - 1, u32::MAX, vec![0xff; chunk_size]);
    Ok(segment.encode()?.len())
}

/// Accumulates inbound segments of one tunnel until a burst is complete.
///
/// Segments are expected in FIFO order: index 0 first, then consecutive
/// indices up to `count - 1`. When the order breaks (a gap, or a new burst
/// starting before the previous one finished) the bytes already held are
/// not discarded; they stay ahead of the new data so the stream is forwarded
/// in arrival order. Such irregularities are counted in [`gaps`](Self::gaps).
#[derive(Debug, Default)]
pub struct InboundBuffer {
    /// Bytes of the burst in progress.
    pending: Vec<u8>,
    /// Next index expected for the burst in progress.
    next_index: u32,
    /// Ordering irregularities observed so far.
    gaps: usize,
}

impl InboundBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one segment.
    ///
    /// Returns the accumulated bytes when `index` is the last of its burst,
    /// `None` while more segments are expected.
    pub fn accept(&mut self, index: u32, count: u32, payload: &[u8]) -> Option<Vec<u8>> {
        if index != self.next_index {
            warn!(
                "Segment {} of {} arrived, expected {} ({} bytes held)",
                index,
                count,
                self.next_index,
                self.pending.len()
            );
            self.gaps += 1;
        }

        self.pending.extend_from_slice(payload);

        if index.saturating_add(1) >= count {
            self.next_index = 0;
            Some(std::mem::take(&mut self.pending))
        } else {
            self.next_index = index + 1;
            None
        }
    }

    /// Bytes currently held for an incomplete burst.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Number of ordering irregularities observed.
    pub fn gaps(&self) -> usize {
        self.gaps
    }

    /// Drop any incomplete burst.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.next_index = 0;
    }
}
