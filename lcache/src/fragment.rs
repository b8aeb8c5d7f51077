//! Accumulates the fragments of one frame until all of them have arrived.

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};

/// Transient per-sequence-number accumulator.
///
/// Fragments may arrive in any order; a frame is complete when the number
/// of distinct fragment indices equals the expected total, and only then
/// can the whole frame be assembled. Duplicate indices are ignored, so a
/// retransmitting middlebox cannot corrupt a frame.
#[derive(Debug)]
pub struct FragmentBuffer {
    sequence: u64,
    total: u32,
    slots: BTreeMap<u32, Bytes>,
}

impl FragmentBuffer {
    pub fn new(sequence: u64, total: u32) -> Self {
        Self {
            sequence,
            total,
            slots: BTreeMap::new(),
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    /// Store one fragment. Returns `false` for a duplicate index, which
    /// leaves the buffer unchanged.
    pub fn insert(&mut self, index: u32, payload: Bytes) -> bool {
        if self.slots.contains_key(&index) {
            return false;
        }
        self.slots.insert(index, payload);
        true
    }

    pub fn is_complete(&self) -> bool {
        self.slots.len() as u32 == self.total
    }

    /// Concatenate the fragments by ascending index into the whole frame.
    pub fn assemble(self) -> Bytes {
        let mut frame = BytesMut::with_capacity(self.slots.values().map(Bytes::len).sum());
        for (_, fragment) in self.slots {
            frame.extend_from_slice(&fragment);
        }
        frame.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembles_in_index_order_regardless_of_arrival_order() {
        let mut buffer = FragmentBuffer::new(7, 3);
        assert!(buffer.insert(2, Bytes::from_static(b"cc")));
        assert!(buffer.insert(0, Bytes::from_static(b"aa")));
        assert!(!buffer.is_complete());
        assert!(buffer.insert(1, Bytes::from_static(b"bb")));
        assert!(buffer.is_complete());
        assert_eq!(buffer.assemble().as_ref(), b"aabbcc");
    }

    #[test]
    fn duplicate_fragments_do_not_complete_a_frame() {
        let mut buffer = FragmentBuffer::new(0, 2);
        assert!(buffer.insert(0, Bytes::from_static(b"aa")));
        assert!(!buffer.insert(0, Bytes::from_static(b"xx")));
        assert!(!buffer.is_complete());

        buffer.insert(1, Bytes::from_static(b"bb"));
        // The first payload for an index wins.
        assert_eq!(buffer.assemble().as_ref(), b"aabb");
    }

    #[test]
    fn single_fragment_frame() {
        let mut buffer = FragmentBuffer::new(3, 1);
        buffer.insert(0, Bytes::from_static(b"whole"));
        assert!(buffer.is_complete());
        assert_eq!(buffer.assemble().as_ref(), b"whole");
    }
}
