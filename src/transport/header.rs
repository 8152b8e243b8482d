//! Packet envelope encoding and decoding.
//!
//! Every datagram body starts with a cleartext [`PacketFlags`] byte followed
//! by a [`PacketHeader`] and the payload:
//!
//! ```text
//! +-------+--------+--------+----------+----------+----------+-------------+
//! | Flags | Type   | HFlags | LocalSeq | AckBase  | AckBits  | [RelSeq]    |
//! | 1 B   | LE16   | 1 B    | LE16     | LE16     | LE32     | LE32        |
//! +-------+--------+--------+----------+----------+----------+-------------+
//! ```
//!
//! `HFlags` bit 0 marks a reliable packet (the reliable sequence follows),
//! bit 1 marks the ack fields as valid. `AckBits` bit *i* acknowledges
//! sequence `AckBase - 1 - i`.

use super::connection::DisconnectReason;
use crate::core::{FLAGS_SIZE, HeaderError, RELIABLE_HEADER_SIZE, UNRELIABLE_HEADER_SIZE};

/// 16-bit wrapping sequence number carried in every header.
pub type SequenceId = u16;

/// Flags byte that precedes the header.
///
/// Always readable before the codec pipeline runs, since it selects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketFlags(u8);

impl PacketFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);
    /// Body after the flags byte is compressed.
    pub const COMPRESSED: Self = Self(0x01);

    /// Create flags from a raw byte.
    pub fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    /// Get the raw byte value.
    pub fn as_byte(self) -> u8 {
        self.0
    }

    /// Check if COMPRESSED flag is set.
    pub fn is_compressed(self) -> bool {
        self.0 & 0x01 != 0
    }

    /// Set COMPRESSED flag.
    pub fn with_compressed(self) -> Self {
        Self(self.0 | 0x01)
    }

    /// Check if reserved bits are valid (must be zero).
    pub fn is_valid(self) -> bool {
        self.0 & 0xFE == 0
    }
}

/// Packet type identifier.
///
/// Values below [`PacketType::FIRST_APPLICATION`] are reserved for the
/// transport's own control packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PacketType(pub u16);

impl PacketType {
    /// Connector's first packet; carries the protocol version.
    pub const INITIATE_CONNECTION: Self = Self(0x0000);
    /// Acceptor's reply to an accepted connection.
    pub const CONNECTION_ACK: Self = Self(0x0001);
    /// Keep-alive, also used as an ack-only reply.
    pub const HEARTBEAT: Self = Self(0x0002);
    /// Graceful termination notice.
    pub const TERMINATE: Self = Self(0x0003);
    /// One chunk of a fragmented packet.
    pub const FRAGMENT: Self = Self(0x0004);
    /// First type value available to applications.
    pub const FIRST_APPLICATION: Self = Self(0x0010);

    /// Whether this type is handled by the transport itself.
    pub fn is_core(self) -> bool {
        self < Self::FIRST_APPLICATION
    }
}

/// Delivery class of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reliability {
    /// Fire and forget.
    Unreliable,
    /// Retransmitted until acked; carries its reliable sequence id.
    Reliable(u32),
}

impl Reliability {
    /// Whether the packet is reliable.
    pub fn is_reliable(self) -> bool {
        matches!(self, Reliability::Reliable(_))
    }
}

/// Acknowledgment window piggybacked on a header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckHeader {
    /// Most recent remote sequence received.
    pub base: SequenceId,
    /// Bit *i* acknowledges `base - 1 - i`.
    pub bits: u32,
}

impl AckHeader {
    /// Iterate over every sequence this header acknowledges, newest first.
    pub fn acked_sequences(&self) -> impl Iterator<Item = SequenceId> + '_ {
        std::iter::once(self.base).chain(
            (0..32u16)
                .filter(|i| self.bits & (1u32 << i) != 0)
                .map(|i| self.base.wrapping_sub(1).wrapping_sub(i)),
        )
    }
}

const HEADER_FLAG_RELIABLE: u8 = 0x01;
const HEADER_FLAG_HAS_ACK: u8 = 0x02;

/// Transport header that follows the flags byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Packet type.
    pub packet_type: PacketType,
    /// Sender's sequence number for this datagram.
    pub local_sequence: SequenceId,
    /// Sender's view of what it has received from us.
    pub ack: Option<AckHeader>,
    /// Delivery class.
    pub reliability: Reliability,
}

impl PacketHeader {
    /// Create a header with no ack information.
    pub fn new(packet_type: PacketType, local_sequence: SequenceId, reliability: Reliability) -> Self {
        Self {
            packet_type,
            local_sequence,
            ack: None,
            reliability,
        }
    }

    /// Serialized size of a header with the given reliability.
    pub fn size_for(reliable: bool) -> usize {
        if reliable {
            RELIABLE_HEADER_SIZE
        } else {
            UNRELIABLE_HEADER_SIZE
        }
    }

    /// Serialized size of this header.
    pub fn size(&self) -> usize {
        Self::size_for(self.reliability.is_reliable())
    }

    /// Append the serialized header to `buf`.
    pub fn write(&self, buf: &mut Vec<u8>) {
        let mut header_flags = 0u8;
        if self.reliability.is_reliable() {
            header_flags |= HEADER_FLAG_RELIABLE;
        }
        if self.ack.is_some() {
            header_flags |= HEADER_FLAG_HAS_ACK;
        }
        let ack = self.ack.unwrap_or(AckHeader { base: 0, bits: 0 });

        buf.extend_from_slice(&self.packet_type.0.to_le_bytes());
        buf.push(header_flags);
        buf.extend_from_slice(&self.local_sequence.to_le_bytes());
        buf.extend_from_slice(&ack.base.to_le_bytes());
        buf.extend_from_slice(&ack.bits.to_le_bytes());
        if let Reliability::Reliable(sequence) = self.reliability {
            buf.extend_from_slice(&sequence.to_le_bytes());
        }
    }

    /// Parse a header, returning it and the number of bytes consumed.
    pub fn read(bytes: &[u8]) -> Result<(Self, usize), HeaderError> {
        if bytes.len() < UNRELIABLE_HEADER_SIZE {
            return Err(HeaderError::TooShort {
                expected: UNRELIABLE_HEADER_SIZE,
                actual: bytes.len(),
            });
        }

        let packet_type = PacketType(u16::from_le_bytes([bytes[0], bytes[1]]));
        let header_flags = bytes[2];
        if header_flags & !(HEADER_FLAG_RELIABLE | HEADER_FLAG_HAS_ACK) != 0 {
            return Err(HeaderError::InvalidHeaderFlags(header_flags));
        }
        let local_sequence = u16::from_le_bytes([bytes[3], bytes[4]]);
        let ack_base = u16::from_le_bytes([bytes[5], bytes[6]]);
        let ack_bits = u32::from_le_bytes([bytes[7], bytes[8], bytes[9], bytes[10]]);

        let ack = (header_flags & HEADER_FLAG_HAS_ACK != 0).then_some(AckHeader {
            base: ack_base,
            bits: ack_bits,
        });

        let (reliability, consumed) = if header_flags & HEADER_FLAG_RELIABLE != 0 {
            if bytes.len() < RELIABLE_HEADER_SIZE {
                return Err(HeaderError::TooShort {
                    expected: RELIABLE_HEADER_SIZE,
                    actual: bytes.len(),
                });
            }
            let sequence = u32::from_le_bytes([bytes[11], bytes[12], bytes[13], bytes[14]]);
            (Reliability::Reliable(sequence), RELIABLE_HEADER_SIZE)
        } else {
            (Reliability::Unreliable, UNRELIABLE_HEADER_SIZE)
        };

        Ok((
            Self {
                packet_type,
                local_sequence,
                ack,
                reliability,
            },
            consumed,
        ))
    }
}

/// A packet as handed to the transport by the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet type.
    pub packet_type: PacketType,
    /// Opaque payload.
    pub payload: Vec<u8>,
}

impl Packet {
    /// Create a packet.
    pub fn new(packet_type: PacketType, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            packet_type,
            payload: payload.into(),
        }
    }
}

/// Serialize flags, header and payload into one body buffer.
pub fn encode_body(flags: PacketFlags, header: &PacketHeader, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FLAGS_SIZE + header.size() + payload.len());
    buf.push(flags.as_byte());
    header.write(&mut buf);
    buf.extend_from_slice(payload);
    buf
}

/// Split a body into its flags byte and the remainder.
pub fn read_flags(body: &[u8]) -> Result<(PacketFlags, &[u8]), HeaderError> {
    let Some((&first, rest)) = body.split_first() else {
        return Err(HeaderError::TooShort {
            expected: FLAGS_SIZE,
            actual: 0,
        });
    };
    let flags = PacketFlags::from_byte(first);
    if !flags.is_valid() {
        return Err(HeaderError::InvalidFlags(first));
    }
    Ok((flags, rest))
}

/// Transport-internal control packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorePacket {
    /// Connector's handshake-initiating packet.
    InitiateConnection {
        /// Sender's protocol version.
        protocol_version: u16,
    },
    /// Acceptor's confirmation.
    ConnectionAck,
    /// Keep-alive; replies carry acks and are never answered.
    Heartbeat {
        /// Whether this heartbeat answers another one.
        is_reply: bool,
    },
    /// Peer is closing the connection.
    Terminate {
        /// Reason given by the peer.
        reason: DisconnectReason,
    },
    /// One chunk of a fragmented packet; payload parsed by the fragment codec.
    Fragment,
}

impl CorePacket {
    /// Packet type for this control packet.
    pub fn packet_type(&self) -> PacketType {
        match self {
            CorePacket::InitiateConnection { .. } => PacketType::INITIATE_CONNECTION,
            CorePacket::ConnectionAck => PacketType::CONNECTION_ACK,
            CorePacket::Heartbeat { .. } => PacketType::HEARTBEAT,
            CorePacket::Terminate { .. } => PacketType::TERMINATE,
            CorePacket::Fragment => PacketType::FRAGMENT,
        }
    }

    /// Encode as a [`Packet`]. Fragments are built by the fragment codec.
    pub fn to_packet(&self) -> Packet {
        let payload = match self {
            CorePacket::InitiateConnection { protocol_version } => {
                protocol_version.to_le_bytes().to_vec()
            }
            CorePacket::ConnectionAck | CorePacket::Fragment => Vec::new(),
            CorePacket::Heartbeat { is_reply } => vec![u8::from(*is_reply)],
            CorePacket::Terminate { reason } => vec![reason.as_byte()],
        };
        Packet::new(self.packet_type(), payload)
    }

    /// Parse a control packet of the given type.
    ///
    /// Returns `Ok(None)` for application types.
    pub fn parse(packet_type: PacketType, payload: &[u8]) -> Result<Option<Self>, HeaderError> {
        let malformed = || HeaderError::MalformedCorePacket(packet_type.0);
        let packet = match packet_type {
            PacketType::INITIATE_CONNECTION => {
                let bytes: [u8; 2] = payload
                    .get(..2)
                    .and_then(|b| b.try_into().ok())
                    .ok_or_else(malformed)?;
                CorePacket::InitiateConnection {
                    protocol_version: u16::from_le_bytes(bytes),
                }
            }
            PacketType::CONNECTION_ACK => CorePacket::ConnectionAck,
            PacketType::HEARTBEAT => CorePacket::Heartbeat {
                is_reply: payload.first().copied().unwrap_or(0) != 0,
            },
            PacketType::TERMINATE => {
                let byte = *payload.first().ok_or_else(malformed)?;
                CorePacket::Terminate {
                    reason: DisconnectReason::from_byte(byte),
                }
            }
            PacketType::FRAGMENT => CorePacket::Fragment,
            t if t.is_core() => return Err(malformed()),
            _ => return Ok(None),
        };
        Ok(Some(packet))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_flags() {
        let flags = PacketFlags::NONE;
        assert!(!flags.is_compressed());
        assert!(flags.is_valid());

        let flags = flags.with_compressed();
        assert!(flags.is_compressed());
        assert_eq!(flags, PacketFlags::COMPRESSED);
        assert!(flags.is_valid());

        assert!(!PacketFlags::from_byte(0x02).is_valid());
    }

    #[test]
    fn test_header_sizes() {
        let unreliable = PacketHeader::new(PacketType(0x20), 7, Reliability::Unreliable);
        let mut buf = Vec::new();
        unreliable.write(&mut buf);
        assert_eq!(buf.len(), UNRELIABLE_HEADER_SIZE);

        let reliable = PacketHeader::new(PacketType(0x20), 7, Reliability::Reliable(3));
        let mut buf = Vec::new();
        reliable.write(&mut buf);
        assert_eq!(buf.len(), RELIABLE_HEADER_SIZE);
    }

    #[test]
    fn test_header_wire_layout() {
        let header = PacketHeader {
            packet_type: PacketType(0x1234),
            local_sequence: 0x0102,
            ack: Some(AckHeader {
                base: 0x0304,
                bits: 0x0A0B0C0D,
            }),
            reliability: Reliability::Reliable(0x11223344),
        };
        let mut buf = Vec::new();
        header.write(&mut buf);
        assert_eq!(
            hex::encode(&buf),
            "341203020104030d0c0b0a44332211"
        );

        let (parsed, consumed) = PacketHeader::read(&buf).unwrap();
        assert_eq!(consumed, RELIABLE_HEADER_SIZE);
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_header_without_ack() {
        let header = PacketHeader::new(PacketType::HEARTBEAT, 9, Reliability::Unreliable);
        let mut buf = Vec::new();
        header.write(&mut buf);
        let (parsed, _) = PacketHeader::read(&buf).unwrap();
        assert_eq!(parsed.ack, None);
    }

    #[test]
    fn test_header_too_short() {
        assert!(matches!(
            PacketHeader::read(&[0u8; 4]),
            Err(HeaderError::TooShort { .. })
        ));

        // Reliable bit set but sequence missing
        let mut buf = vec![0u8; UNRELIABLE_HEADER_SIZE];
        buf[2] = 0x01;
        assert!(matches!(
            PacketHeader::read(&buf),
            Err(HeaderError::TooShort {
                expected: RELIABLE_HEADER_SIZE,
                ..
            })
        ));
    }

    #[test]
    fn test_header_reserved_bits() {
        let mut buf = vec![0u8; UNRELIABLE_HEADER_SIZE];
        buf[2] = 0x80;
        assert_eq!(
            PacketHeader::read(&buf),
            Err(HeaderError::InvalidHeaderFlags(0x80))
        );
    }

    #[test]
    fn test_encode_body_and_flags() {
        let header = PacketHeader::new(PacketType(0x42), 1, Reliability::Unreliable);
        let body = encode_body(PacketFlags::NONE, &header, b"abc");
        assert_eq!(body.len(), FLAGS_SIZE + UNRELIABLE_HEADER_SIZE + 3);

        let (flags, rest) = read_flags(&body).unwrap();
        assert_eq!(flags, PacketFlags::NONE);
        let (parsed, consumed) = PacketHeader::read(rest).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(&rest[consumed..], b"abc");

        assert!(read_flags(&[]).is_err());
        assert_eq!(read_flags(&[0x04]), Err(HeaderError::InvalidFlags(0x04)));
    }

    #[test]
    fn test_acked_sequences_wrap() {
        let ack = AckHeader {
            base: 1,
            bits: 0b101,
        };
        let seqs: Vec<_> = ack.acked_sequences().collect();
        assert_eq!(seqs, vec![1, 0, u16::MAX - 1]);
    }

    #[test]
    fn test_core_packet_parse() {
        let packet = CorePacket::InitiateConnection {
            protocol_version: 7,
        }
        .to_packet();
        assert_eq!(packet.packet_type, PacketType::INITIATE_CONNECTION);
        assert_eq!(
            CorePacket::parse(packet.packet_type, &packet.payload).unwrap(),
            Some(CorePacket::InitiateConnection {
                protocol_version: 7
            })
        );

        assert!(CorePacket::parse(PacketType::INITIATE_CONNECTION, &[1]).is_err());
        assert!(CorePacket::parse(PacketType::TERMINATE, &[]).is_err());
        assert!(CorePacket::parse(PacketType(0x000F), &[]).is_err());
        assert_eq!(CorePacket::parse(PacketType(0x0100), &[1, 2]).unwrap(), None);

        let terminate = CorePacket::Terminate {
            reason: DisconnectReason::TerminatedByUser,
        }
        .to_packet();
        assert_eq!(
            CorePacket::parse(terminate.packet_type, &terminate.payload).unwrap(),
            Some(CorePacket::Terminate {
                reason: DisconnectReason::TerminatedByUser
            })
        );
    }

    #[test]
    fn test_packet_type_ranges() {
        assert!(PacketType::INITIATE_CONNECTION.is_core());
        assert!(PacketType::FRAGMENT.is_core());
        assert!(!PacketType::FIRST_APPLICATION.is_core());
    }
}
