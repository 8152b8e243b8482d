//! Sliding windows over sequence numbers and ids.
//!
//! - [`ReceivedWindow`]: which remote sequences we have seen, encoded as the
//!   ack base plus a 32-bit bitfield.
//! - [`SentWindow`]: which local sequence carried which [`PacketId`], so an
//!   incoming ack can be matched back to a packet.
//! - [`IdWindow`]: replay window over increasing `u32` ids, wrapping.

use super::header::{AckHeader, SequenceId};
use crate::core::{ACK_BITFIELD_SIZE, ID_WINDOW_SIZE, SENT_WINDOW_SIZE};

/// Per-connection identifier of one logical outgoing packet.
pub type PacketId = u32;

/// Returns `true` if `a` is newer than `b` under 16-bit wraparound.
pub fn seq_greater_than(a: SequenceId, b: SequenceId) -> bool {
    a != b && a.wrapping_sub(b) < 0x8000
}

/// Returns `true` if `a` is newer than `b` under 32-bit wraparound.
pub fn id_greater_than(a: u32, b: u32) -> bool {
    a != b && a.wrapping_sub(b) < 0x8000_0000
}

/// Remote sequences observed on a connection.
#[derive(Debug, Clone, Default)]
pub struct ReceivedWindow {
    /// Newest remote sequence, `None` before the first datagram.
    latest: Option<SequenceId>,
    /// Bit *i* set if `latest - 1 - i` was received.
    bits: u32,
}

impl ReceivedWindow {
    /// Create an empty window.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a received sequence.
    ///
    /// Returns `false` for duplicates and for sequences older than the
    /// bitfield covers.
    pub fn record(&mut self, sequence: SequenceId) -> bool {
        let Some(latest) = self.latest else {
            self.latest = Some(sequence);
            self.bits = 0;
            return true;
        };

        if seq_greater_than(sequence, latest) {
            let shift = sequence.wrapping_sub(latest);
            self.bits = if shift > ACK_BITFIELD_SIZE {
                0
            } else {
                // The previous latest moves into the bitfield at offset shift - 1.
                let shifted = if shift == ACK_BITFIELD_SIZE {
                    0
                } else {
                    self.bits << shift
                };
                shifted | (1u32 << (shift - 1))
            };
            self.latest = Some(sequence);
            return true;
        }

        if sequence == latest {
            return false;
        }

        let offset = latest.wrapping_sub(sequence);
        if offset > ACK_BITFIELD_SIZE {
            return false;
        }
        let mask = 1u32 << (offset - 1);
        if self.bits & mask != 0 {
            return false;
        }
        self.bits |= mask;
        true
    }

    /// Ack information to piggyback on the next outgoing header.
    pub fn ack_header(&self) -> Option<AckHeader> {
        self.latest.map(|base| AckHeader {
            base,
            bits: self.bits,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct SentSlot {
    sequence: SequenceId,
    packet_id: PacketId,
}

/// Recently sent local sequences and the packet each one carried.
#[derive(Debug, Clone)]
pub struct SentWindow {
    slots: Vec<Option<SentSlot>>,
    /// Newest sequence sent, `None` before the first send.
    newest: Option<SequenceId>,
}

impl Default for SentWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl SentWindow {
    /// Create an empty window.
    pub fn new() -> Self {
        Self {
            slots: vec![None; SENT_WINDOW_SIZE],
            newest: None,
        }
    }

    fn index(sequence: SequenceId) -> usize {
        sequence as usize % SENT_WINDOW_SIZE
    }

    /// Remember that `sequence` carried `packet_id`.
    pub fn insert(&mut self, sequence: SequenceId, packet_id: PacketId) {
        self.slots[Self::index(sequence)] = Some(SentSlot {
            sequence,
            packet_id,
        });
        self.newest = Some(sequence);
    }

    /// Apply an incoming ack header; returns newly acked packet ids.
    ///
    /// An ack base newer than anything we sent is ignored outright. Each
    /// sequence is acked at most once.
    pub fn apply_ack(&mut self, ack: &AckHeader) -> Vec<PacketId> {
        let Some(newest) = self.newest else {
            return Vec::new();
        };
        if seq_greater_than(ack.base, newest) {
            return Vec::new();
        }

        ack.acked_sequences()
            .filter_map(|sequence| {
                let slot = &mut self.slots[Self::index(sequence)];
                if matches!(slot, Some(entry) if entry.sequence == sequence) {
                    slot.take().map(|entry| entry.packet_id)
                } else {
                    None
                }
            })
            .collect()
    }
}

/// Replay window over increasing `u32` ids.
///
/// Adapted from an anti-replay nonce window: ids newer than the highest seen
/// slide the window forward, ids within it are checked against a bitfield,
/// and ids older than the window are treated as already seen. Newer and
/// older are judged under wraparound.
#[derive(Debug, Clone)]
pub struct IdWindow {
    /// The highest id we've seen.
    highest: Option<u32>,
    /// Bit i set if `highest - 1 - i` was seen.
    window: [u64; ID_WINDOW_SIZE / 64],
}

impl Default for IdWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl IdWindow {
    /// Window size in ids.
    pub const WINDOW_SIZE: usize = ID_WINDOW_SIZE;

    /// Create an empty window.
    pub fn new() -> Self {
        Self {
            highest: None,
            window: [0; ID_WINDOW_SIZE / 64],
        }
    }

    /// Mark an id as seen.
    ///
    /// Returns `true` if the id is new, `false` if it was already seen or is
    /// too old to tell.
    pub fn check_and_mark(&mut self, id: u32) -> bool {
        let Some(highest) = self.highest else {
            self.highest = Some(id);
            return true;
        };

        if id_greater_than(id, highest) {
            self.shift_window(id.wrapping_sub(highest) as usize);
            self.highest = Some(id);
            true
        } else if id == highest {
            false
        } else {
            let offset = highest.wrapping_sub(id) as usize;
            if offset > Self::WINDOW_SIZE {
                return false;
            }
            let (word, mask) = Self::locate(offset - 1);
            if self.window[word] & mask != 0 {
                false
            } else {
                self.window[word] |= mask;
                true
            }
        }
    }

    /// Check whether an id has been marked, without marking it.
    pub fn contains(&self, id: u32) -> bool {
        let Some(highest) = self.highest else {
            return false;
        };
        if id == highest {
            return true;
        }
        if id_greater_than(id, highest) {
            return false;
        }
        let offset = highest.wrapping_sub(id) as usize;
        if offset > Self::WINDOW_SIZE {
            return false;
        }
        let (word, mask) = Self::locate(offset - 1);
        self.window[word] & mask != 0
    }

    fn locate(offset: usize) -> (usize, u64) {
        (offset / 64, 1u64 << (offset % 64))
    }

    fn shift_window(&mut self, shift: usize) {
        let words = self.window.len();
        if shift > Self::WINDOW_SIZE {
            self.window = [0; ID_WINDOW_SIZE / 64];
            return;
        }

        let word_shift = shift / 64;
        let bit_shift = shift % 64;

        if word_shift > 0 {
            for i in (0..words).rev() {
                self.window[i] = if i >= word_shift {
                    self.window[i - word_shift]
                } else {
                    0
                };
            }
        }

        if bit_shift > 0 {
            let mut carry = 0u64;
            for i in 0..words {
                let new_carry = self.window[i] >> (64 - bit_shift);
                self.window[i] = (self.window[i] << bit_shift) | carry;
                carry = new_carry;
            }
        }

        // The old highest now sits at offset shift - 1.
        let (word, mask) = Self::locate(shift - 1);
        self.window[word] |= mask;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seq_greater_than_wraps() {
        assert!(seq_greater_than(1, 0));
        assert!(!seq_greater_than(0, 1));
        assert!(!seq_greater_than(5, 5));
        assert!(seq_greater_than(0, u16::MAX));
        assert!(seq_greater_than(10, u16::MAX - 10));
        assert!(!seq_greater_than(u16::MAX - 10, 10));
    }

    #[test]
    fn test_received_window_in_order() {
        let mut window = ReceivedWindow::new();
        assert_eq!(window.ack_header(), None);

        assert!(window.record(0));
        assert!(window.record(1));
        assert!(window.record(2));

        let ack = window.ack_header().unwrap();
        assert_eq!(ack.base, 2);
        assert_eq!(ack.bits, 0b11);
    }

    #[test]
    fn test_received_window_out_of_order_and_duplicates() {
        let mut window = ReceivedWindow::new();
        assert!(window.record(10));
        assert!(window.record(13));
        assert!(window.record(11));
        assert!(!window.record(11));
        assert!(!window.record(13));

        let ack = window.ack_header().unwrap();
        assert_eq!(ack.base, 13);
        // 12 missing (bit 0), 11 (bit 1) and 10 (bit 2) present
        assert_eq!(ack.bits, 0b110);
    }

    #[test]
    fn test_received_window_rejects_too_old() {
        let mut window = ReceivedWindow::new();
        assert!(window.record(100));
        assert!(window.record(140));
        assert!(!window.record(100));
        assert!(!window.record(107));
        assert!(window.record(108));
    }

    #[test]
    fn test_received_window_large_jump_clears_bits() {
        let mut window = ReceivedWindow::new();
        assert!(window.record(1));
        assert!(window.record(2));
        assert!(window.record(200));
        assert_eq!(window.ack_header().unwrap().bits, 0);

        let mut window = ReceivedWindow::new();
        assert!(window.record(0));
        assert!(window.record(32));
        assert_eq!(window.ack_header().unwrap().bits, 1 << 31);
    }

    #[test]
    fn test_received_window_wraparound() {
        let mut window = ReceivedWindow::new();
        assert!(window.record(u16::MAX));
        assert!(window.record(0));
        let ack = window.ack_header().unwrap();
        assert_eq!(ack.base, 0);
        assert_eq!(ack.bits, 1);
    }

    #[test]
    fn test_sent_window_ack_idempotent() {
        let mut window = SentWindow::new();
        window.insert(0, 100);
        window.insert(1, 101);
        window.insert(2, 102);

        let ack = AckHeader { base: 2, bits: 0b10 };
        let mut acked = window.apply_ack(&ack);
        acked.sort();
        assert_eq!(acked, vec![100, 102]);

        // Same ack again: nothing new
        assert!(window.apply_ack(&ack).is_empty());
    }

    #[test]
    fn test_sent_window_ignores_future_ack() {
        let mut window = SentWindow::new();
        window.insert(5, 1);
        let ack = AckHeader { base: 9, bits: 0xFFFF_FFFF };
        assert!(window.apply_ack(&ack).is_empty());

        let mut empty = SentWindow::new();
        assert!(empty.apply_ack(&AckHeader { base: 0, bits: 0 }).is_empty());
    }

    #[test]
    fn test_sent_window_overwritten_slot() {
        let mut window = SentWindow::new();
        window.insert(3, 1);
        window.insert(3 + SENT_WINDOW_SIZE as u16, 2);
        let acked = window.apply_ack(&AckHeader { base: 3, bits: 0 });
        assert!(acked.is_empty());
    }

    #[test]
    fn test_id_window_basic() {
        let mut window = IdWindow::new();
        assert!(!window.contains(0));

        assert!(window.check_and_mark(0));
        assert!(!window.check_and_mark(0));
        assert!(window.check_and_mark(1));
        assert!(window.contains(0));
        assert!(window.contains(1));
        assert!(!window.contains(2));
    }

    #[test]
    fn test_id_window_gap() {
        let mut window = IdWindow::new();
        assert!(window.check_and_mark(1));
        assert!(window.check_and_mark(100));
        assert!(!window.contains(50));
        assert!(window.check_and_mark(50));
        assert!(window.check_and_mark(75));
        assert!(!window.check_and_mark(50));
        assert!(!window.check_and_mark(100));
        assert!(window.contains(1));
    }

    #[test]
    fn test_id_window_word_shift() {
        let mut window = IdWindow::new();
        assert!(window.check_and_mark(10));
        assert!(window.check_and_mark(10 + 130));
        assert!(window.contains(10));
        assert!(!window.contains(11));
        assert!(window.check_and_mark(11));
    }

    #[test]
    fn test_id_window_too_old() {
        let mut window = IdWindow::new();
        assert!(window.check_and_mark(3000));
        assert!(!window.check_and_mark(1));
        assert!(!window.contains(1));
        assert!(window.check_and_mark(3000 - IdWindow::WINDOW_SIZE as u32));
    }

    #[test]
    fn test_id_greater_than_wraps() {
        assert!(id_greater_than(1, 0));
        assert!(!id_greater_than(0, 1));
        assert!(id_greater_than(0, u32::MAX));
        assert!(id_greater_than(5, u32::MAX - 5));
        assert!(!id_greater_than(u32::MAX - 5, 5));
    }

    #[test]
    fn test_id_window_wraparound() {
        let mut window = IdWindow::new();
        assert!(window.check_and_mark(u32::MAX - 1));
        assert!(window.check_and_mark(u32::MAX));
        assert!(window.check_and_mark(0));
        assert!(window.check_and_mark(2));

        assert!(window.contains(u32::MAX - 1));
        assert!(window.contains(u32::MAX));
        assert!(window.contains(0));
        assert!(!window.contains(1));
        assert!(window.check_and_mark(1));
        assert!(!window.check_and_mark(u32::MAX));
        // Far behind the wrapped highest
        assert!(!window.check_and_mark(u32::MAX - 5000));
    }
}
