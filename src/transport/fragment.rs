//! Fragmentation of oversized packets.
//!
//! A serialized packet larger than the connection MTU is cut into chunks of
//! `mtu - fragment_overhead` bytes. Each chunk travels as its own
//! [`PacketType::FRAGMENT`](super::header::PacketType::FRAGMENT) packet with
//! this envelope in front of the chunk bytes:
//!
//! ```text
//! +--------------------+--------------------+-------+-------+-------------+
//! | Original PacketId  | Fragment Sequence  | Index | Count | Chunk bytes |
//! | LE32               | LE32               | u8    | u8    | ...         |
//! +--------------------+--------------------+-------+-------+-------------+
//! ```
//!
//! The receiver groups chunks by fragment sequence and, once every index has
//! arrived, concatenates them back into the original serialized packet.

use std::collections::{BTreeMap, VecDeque};

use super::window::PacketId;
use crate::core::{FRAGMENT_ENVELOPE_SIZE, FragmentError, MAX_FRAGMENT_CHUNKS};

/// One chunk of a fragmented packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentedPacket {
    /// Packet id of the packet that was split.
    pub original_packet_id: PacketId,
    /// Per-connection id of the split operation.
    pub fragment_sequence: u32,
    /// Position of this chunk.
    pub chunk_index: u8,
    /// Total number of chunks.
    pub chunk_count: u8,
    /// Slice of the original serialized packet.
    pub chunk: Vec<u8>,
}

impl FragmentedPacket {
    /// Serialize the envelope and chunk.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FRAGMENT_ENVELOPE_SIZE + self.chunk.len());
        buf.extend_from_slice(&self.original_packet_id.to_le_bytes());
        buf.extend_from_slice(&self.fragment_sequence.to_le_bytes());
        buf.push(self.chunk_index);
        buf.push(self.chunk_count);
        buf.extend_from_slice(&self.chunk);
        buf
    }

    /// Parse an envelope and chunk.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FragmentError> {
        if bytes.len() < FRAGMENT_ENVELOPE_SIZE {
            return Err(FragmentError::TooShort {
                expected: FRAGMENT_ENVELOPE_SIZE,
                actual: bytes.len(),
            });
        }

        let original_packet_id = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let fragment_sequence = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let chunk_index = bytes[8];
        let chunk_count = bytes[9];
        if chunk_index >= chunk_count {
            return Err(FragmentError::InvalidIndex {
                index: chunk_index,
                count: chunk_count,
            });
        }

        Ok(Self {
            original_packet_id,
            fragment_sequence,
            chunk_index,
            chunk_count,
            chunk: bytes[FRAGMENT_ENVELOPE_SIZE..].to_vec(),
        })
    }
}

/// Split `bytes` into chunks of at most `chunk_size` bytes.
pub fn split(
    original_packet_id: PacketId,
    fragment_sequence: u32,
    bytes: &[u8],
    chunk_size: usize,
) -> Result<Vec<FragmentedPacket>, FragmentError> {
    if chunk_size == 0 {
        return Err(FragmentError::ZeroChunkSize);
    }
    let max = chunk_size * MAX_FRAGMENT_CHUNKS;
    if bytes.len() > max {
        return Err(FragmentError::TooLarge {
            size: bytes.len(),
            max,
        });
    }

    let chunk_count = bytes.len().div_ceil(chunk_size) as u8;
    Ok(bytes
        .chunks(chunk_size)
        .enumerate()
        .map(|(index, chunk)| FragmentedPacket {
            original_packet_id,
            fragment_sequence,
            chunk_index: index as u8,
            chunk_count,
            chunk: chunk.to_vec(),
        })
        .collect())
}

#[derive(Debug)]
struct PartialPacket {
    chunk_count: u8,
    chunks: BTreeMap<u8, Vec<u8>>,
}

/// Result of feeding a chunk to a [`FragmentQueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reassembly {
    /// More chunks are needed.
    Incomplete,
    /// Chunk was already received or inconsistent with its group; ignored.
    Rejected,
    /// All chunks arrived; the original serialized packet.
    Complete(Vec<u8>),
}

/// Per-connection reassembly state.
///
/// Holds at most `max_groups` partial packets; starting a new group beyond
/// that evicts the oldest one.
#[derive(Debug)]
pub struct FragmentQueue {
    max_groups: usize,
    groups: BTreeMap<u32, PartialPacket>,
    order: VecDeque<u32>,
}

impl FragmentQueue {
    /// Create a queue holding at most `max_groups` partial packets.
    pub fn new(max_groups: usize) -> Self {
        Self {
            max_groups: max_groups.max(1),
            groups: BTreeMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Number of partially reassembled packets.
    pub fn pending_groups(&self) -> usize {
        self.groups.len()
    }

    /// Feed one chunk.
    pub fn insert(&mut self, fragment: FragmentedPacket) -> Reassembly {
        let sequence = fragment.fragment_sequence;

        if !self.groups.contains_key(&sequence) {
            if fragment.chunk_count == 1 {
                return Reassembly::Complete(fragment.chunk);
            }
            while self.groups.len() >= self.max_groups {
                let Some(oldest) = self.order.pop_front() else {
                    break;
                };
                self.groups.remove(&oldest);
            }
            self.groups.insert(
                sequence,
                PartialPacket {
                    chunk_count: fragment.chunk_count,
                    chunks: BTreeMap::new(),
                },
            );
            self.order.push_back(sequence);
        }

        let Some(group) = self.groups.get_mut(&sequence) else {
            return Reassembly::Rejected;
        };
        if group.chunk_count != fragment.chunk_count {
            // Conflicting metadata: the whole group is untrustworthy.
            self.remove_group(sequence);
            return Reassembly::Rejected;
        }
        if group.chunks.contains_key(&fragment.chunk_index) {
            return Reassembly::Rejected;
        }
        group.chunks.insert(fragment.chunk_index, fragment.chunk);

        if group.chunks.len() < group.chunk_count as usize {
            return Reassembly::Incomplete;
        }

        let Some(group) = self.remove_group(sequence) else {
            return Reassembly::Rejected;
        };
        // BTreeMap iterates in index order.
        Reassembly::Complete(group.chunks.into_values().flatten().collect())
    }

    fn remove_group(&mut self, sequence: u32) -> Option<PartialPacket> {
        self.order.retain(|s| *s != sequence);
        self.groups.remove(&sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn test_envelope_roundtrip() {
        let fragment = FragmentedPacket {
            original_packet_id: 0x01020304,
            fragment_sequence: 9,
            chunk_index: 2,
            chunk_count: 3,
            chunk: vec![0xAA, 0xBB],
        };
        let bytes = fragment.to_bytes();
        assert_eq!(hex::encode(&bytes), "04030201090000000203aabb");
        assert_eq!(FragmentedPacket::from_bytes(&bytes).unwrap(), fragment);
    }

    #[test]
    fn test_envelope_rejects_bad_input() {
        assert!(matches!(
            FragmentedPacket::from_bytes(&[0u8; 5]),
            Err(FragmentError::TooShort { .. })
        ));

        let mut bytes = vec![0u8; FRAGMENT_ENVELOPE_SIZE];
        bytes[8] = 3;
        bytes[9] = 3;
        assert_eq!(
            FragmentedPacket::from_bytes(&bytes),
            Err(FragmentError::InvalidIndex { index: 3, count: 3 })
        );

        // Zero chunk count is never valid
        bytes[8] = 0;
        bytes[9] = 0;
        assert!(FragmentedPacket::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_split_sizes() {
        let data = payload(2500);
        let chunks = split(7, 1, &data, 1000).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].chunk.len(), 1000);
        assert_eq!(chunks[2].chunk.len(), 500);
        assert!(chunks.iter().all(|c| c.chunk_count == 3 && c.original_packet_id == 7));

        let exact = split(7, 1, &payload(3000), 1000).unwrap();
        assert_eq!(exact.len(), 3);
    }

    #[test]
    fn test_split_limits() {
        assert_eq!(split(0, 0, &[1, 2, 3], 0), Err(FragmentError::ZeroChunkSize));
        let too_big = payload(10 * MAX_FRAGMENT_CHUNKS + 1);
        assert!(matches!(
            split(0, 0, &too_big, 10),
            Err(FragmentError::TooLarge { .. })
        ));
        assert_eq!(split(0, 0, &payload(10 * MAX_FRAGMENT_CHUNKS), 10).unwrap().len(), 255);
    }

    #[test]
    fn test_reassembly_any_order() {
        let data = payload(4321);
        let chunks = split(1, 5, &data, 400).unwrap();
        let count = chunks.len();

        // Reverse, then interleave odd/even indices
        let mut orders: Vec<Vec<FragmentedPacket>> = vec![chunks.clone()];
        orders.push(chunks.iter().rev().cloned().collect());
        let mut interleaved: Vec<_> = chunks.iter().skip(1).step_by(2).cloned().collect();
        interleaved.extend(chunks.iter().step_by(2).cloned());
        orders.push(interleaved);

        for order in orders {
            let mut queue = FragmentQueue::new(4);
            let mut result = None;
            for (i, fragment) in order.into_iter().enumerate() {
                match queue.insert(fragment) {
                    Reassembly::Incomplete => assert!(i + 1 < count),
                    Reassembly::Complete(bytes) => result = Some(bytes),
                    Reassembly::Rejected => panic!("unexpected rejection"),
                }
            }
            assert_eq!(result.as_deref(), Some(data.as_slice()));
            assert_eq!(queue.pending_groups(), 0);
        }
    }

    #[test]
    fn test_reassembly_duplicates_and_conflicts() {
        let data = payload(300);
        let chunks = split(1, 5, &data, 100).unwrap();
        let mut queue = FragmentQueue::new(4);

        assert_eq!(queue.insert(chunks[0].clone()), Reassembly::Incomplete);
        assert_eq!(queue.insert(chunks[0].clone()), Reassembly::Rejected);

        let mut conflicting = chunks[1].clone();
        conflicting.chunk_count = 9;
        assert_eq!(queue.insert(conflicting), Reassembly::Rejected);
        assert_eq!(queue.pending_groups(), 0);
    }

    #[test]
    fn test_reassembly_evicts_oldest_group() {
        let mut queue = FragmentQueue::new(2);
        for sequence in 0..3u32 {
            let chunks = split(sequence, sequence, &payload(200), 100).unwrap();
            assert_eq!(queue.insert(chunks[0].clone()), Reassembly::Incomplete);
        }
        assert_eq!(queue.pending_groups(), 2);

        // Group 0 was evicted; its second chunk starts a fresh group
        let chunks = split(0, 0, &payload(200), 100).unwrap();
        assert_eq!(queue.insert(chunks[1].clone()), Reassembly::Incomplete);

        // Group 2 is intact
        let chunks = split(2, 2, &payload(200), 100).unwrap();
        assert_eq!(
            queue.insert(chunks[1].clone()),
            Reassembly::Complete(payload(200))
        );
    }

    #[test]
    fn test_single_chunk_completes_immediately() {
        let chunks = split(4, 4, &payload(50), 100).unwrap();
        let mut queue = FragmentQueue::new(1);
        assert_eq!(
            queue.insert(chunks[0].clone()),
            Reassembly::Complete(payload(50))
        );
    }
}
