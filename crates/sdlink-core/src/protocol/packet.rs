//! Three-wire packet encoding/decoding
//!
//! Implements the packet format carried inside each SLIP frame:
//! - 4 bytes: header (sequence, ack, flags, packet type, length, checksum)
//! - N bytes: payload (at most 4095)
//! - 2 bytes: CRC-16/CCITT of header+payload, big-endian (when the
//!   data-integrity flag is set)
//!
//! Header layout:
//!
//! ```plain
//! byte 0: | reliable:1 | crc:1 | ack:3 | seq:3 |
//! byte 1: | len[3:0]:4 | type:4 |
//! byte 2: | len[11:4]:8 |
//! byte 3: | !(byte0 + byte1 + byte2) |
//! ```

use byteorder::{BigEndian, ByteOrder};
use crc::{Crc, CRC_16_IBM_3740};

use super::ProtocolError;

/// Header length in bytes
pub const HEADER_SIZE: usize = 4;

/// Length of the trailing CRC in bytes
pub const CRC_SIZE: usize = 2;

/// Largest payload the 12-bit length field can describe
pub const MAX_PAYLOAD_SIZE: usize = 0x0FFF;

/// Largest unescaped frame
pub const MAX_FRAME_SIZE: usize = HEADER_SIZE + MAX_PAYLOAD_SIZE + CRC_SIZE;

/// Sequence and acknowledgment numbers count modulo 8
pub const SEQ_MODULO: u8 = 8;

/// Configuration field exchanged in CONFIG/CONFIG RESPONSE:
/// window size 1, CRC data integrity
pub const LINK_CONFIG_FIELD: u8 = 0x11;

/// Packet type carried in the header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// Pure acknowledgment
    Ack,
    /// Vendor protocol payload
    VendorSpecific,
    /// Link establishment messages
    LinkControl,
}

impl PacketType {
    /// Wire value of the packet type
    pub fn to_wire(self) -> u8 {
        match self {
            PacketType::Ack => 0,
            PacketType::VendorSpecific => 14,
            PacketType::LinkControl => 15,
        }
    }

    /// Parse the 4-bit packet type field
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(PacketType::Ack),
            14 => Some(PacketType::VendorSpecific),
            15 => Some(PacketType::LinkControl),
            _ => None,
        }
    }
}

/// Link establishment messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkControl {
    /// Start of the handshake
    Sync,
    /// Answer to SYNC
    SyncResponse,
    /// Link parameters proposed by the sender
    Config(u8),
    /// Link parameters accepted by the receiver
    ConfigResponse(u8),
}

impl LinkControl {
    const SYNC: [u8; 2] = [0x01, 0x7E];
    const SYNC_RESPONSE: [u8; 2] = [0x02, 0x7D];
    const CONFIG: [u8; 2] = [0x03, 0xFC];
    const CONFIG_RESPONSE: [u8; 2] = [0x04, 0x7B];

    /// Encode the message payload
    pub fn to_bytes(self) -> Vec<u8> {
        match self {
            LinkControl::Sync => Self::SYNC.to_vec(),
            LinkControl::SyncResponse => Self::SYNC_RESPONSE.to_vec(),
            LinkControl::Config(field) => vec![Self::CONFIG[0], Self::CONFIG[1], field],
            LinkControl::ConfigResponse(field) => {
                vec![Self::CONFIG_RESPONSE[0], Self::CONFIG_RESPONSE[1], field]
            }
        }
    }

    /// Decode a link-control payload; unknown messages yield `None`
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 2 {
            return None;
        }
        let opcode = [payload[0], payload[1]];
        let field = payload.get(2).copied().unwrap_or(LINK_CONFIG_FIELD);
        match opcode {
            Self::SYNC => Some(LinkControl::Sync),
            Self::SYNC_RESPONSE => Some(LinkControl::SyncResponse),
            Self::CONFIG => Some(LinkControl::Config(field)),
            Self::CONFIG_RESPONSE => Some(LinkControl::ConfigResponse(field)),
            _ => None,
        }
    }
}

/// A three-wire packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Sequence number (0-7), meaningful for reliable packets only
    pub seq: u8,
    /// Next sequence number the sender expects to receive (0-7)
    pub ack: u8,
    /// Reliable packets are acknowledged and retransmitted
    pub reliable: bool,
    /// Whether a CRC trails the payload
    pub crc_present: bool,
    /// Packet type
    pub packet_type: PacketType,
    /// Packet payload
    pub payload: Vec<u8>,
}

impl Packet {
    /// Reliable vendor payload with the given sequence number
    pub fn data(seq: u8, ack: u8, payload: Vec<u8>) -> Self {
        Self {
            seq: seq % SEQ_MODULO,
            ack: ack % SEQ_MODULO,
            reliable: true,
            crc_present: true,
            packet_type: PacketType::VendorSpecific,
            payload,
        }
    }

    /// Unreliable vendor payload
    pub fn unreliable(ack: u8, payload: Vec<u8>) -> Self {
        Self {
            reliable: false,
            ..Self::data(0, ack, payload)
        }
    }

    /// Pure acknowledgment
    pub fn ack(ack: u8) -> Self {
        Self {
            seq: 0,
            ack: ack % SEQ_MODULO,
            reliable: false,
            crc_present: true,
            packet_type: PacketType::Ack,
            payload: Vec::new(),
        }
    }

    /// Link establishment message
    pub fn link_control(message: LinkControl) -> Self {
        Self {
            seq: 0,
            ack: 0,
            reliable: false,
            crc_present: true,
            packet_type: PacketType::LinkControl,
            payload: message.to_bytes(),
        }
    }

    /// Decode a packet from unescaped frame contents
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::Framing(format!(
                "frame of {} bytes is shorter than a header",
                data.len()
            )));
        }

        let expected_checksum = header_checksum(&data[..3]);
        if data[3] != expected_checksum {
            return Err(ProtocolError::HeaderChecksumMismatch {
                expected: expected_checksum,
                actual: data[3],
            });
        }

        let seq = data[0] & 0x07;
        let ack = (data[0] >> 3) & 0x07;
        let crc_present = data[0] & 0x40 != 0;
        let reliable = data[0] & 0x80 != 0;
        let packet_type = PacketType::from_wire(data[1] & 0x0F).ok_or_else(|| {
            ProtocolError::Framing(format!("unsupported packet type {}", data[1] & 0x0F))
        })?;
        let length = ((data[1] >> 4) as usize) | ((data[2] as usize) << 4);

        let trailer = if crc_present { CRC_SIZE } else { 0 };
        if data.len() != HEADER_SIZE + length + trailer {
            return Err(ProtocolError::Framing(format!(
                "length field says {} payload bytes, frame holds {}",
                length,
                data.len().saturating_sub(HEADER_SIZE + trailer)
            )));
        }

        if crc_present {
            let covered = HEADER_SIZE + length;
            let received = BigEndian::read_u16(&data[covered..]);
            let expected = crc16(&data[..covered]);
            if received != expected {
                return Err(ProtocolError::CrcMismatch {
                    expected,
                    actual: received,
                });
            }
        }

        Ok(Self {
            seq,
            ack,
            reliable,
            crc_present,
            packet_type,
            payload: data[HEADER_SIZE..HEADER_SIZE + length].to_vec(),
        })
    }

    /// Encode the packet to unescaped frame contents
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let length = self.payload.len();
        if length > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::BufferOverflow(length));
        }

        let mut bytes = Vec::with_capacity(self.encoded_size());
        let mut flags = (self.seq & 0x07) | ((self.ack & 0x07) << 3);
        if self.crc_present {
            flags |= 0x40;
        }
        if self.reliable {
            flags |= 0x80;
        }
        bytes.push(flags);
        bytes.push(self.packet_type.to_wire() | (((length & 0x0F) as u8) << 4));
        bytes.push((length >> 4) as u8);
        bytes.push(header_checksum(&bytes[..3]));
        bytes.extend_from_slice(&self.payload);

        if self.crc_present {
            let mut crc_bytes = [0u8; 2];
            BigEndian::write_u16(&mut crc_bytes, crc16(&bytes));
            bytes.extend_from_slice(&crc_bytes);
        }

        Ok(bytes)
    }

    /// Get the total encoded size (before SLIP escaping)
    pub fn encoded_size(&self) -> usize {
        HEADER_SIZE + self.payload.len() + if self.crc_present { CRC_SIZE } else { 0 }
    }
}

/// Two's-complement style header checksum: the four header bytes sum to 0xFF
pub fn header_checksum(header: &[u8]) -> u8 {
    !header.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// CRC-16/CCITT-FALSE: polynomial 0x1021, initial value 0xFFFF, no reflection
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Frame CRC over header and payload
pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// Successor of a sequence number
pub fn next_seq(seq: u8) -> u8 {
    (seq + 1) % SEQ_MODULO
}

/// Predecessor of a sequence number
pub fn prev_seq(seq: u8) -> u8 {
    (seq + SEQ_MODULO - 1) % SEQ_MODULO
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_check_value() {
        // CRC-16/CCITT-FALSE check value
        assert_eq!(crc16(b"123456789"), 0x29B1);
    }

    #[test]
    fn test_packet_roundtrip() {
        let original = Packet::data(5, 3, vec![0x01, 0x02, 0xC0, 0xDB]);
        let encoded = original.to_bytes().expect("encode");
        assert_eq!(encoded.len(), original.encoded_size());
        let decoded = Packet::from_bytes(&encoded).expect("Should decode successfully");
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_header_layout() {
        let encoded = Packet::data(1, 2, vec![0xAA; 0x123]).to_bytes().unwrap();
        assert_eq!(encoded[0], 0x80 | 0x40 | (2 << 3) | 1);
        assert_eq!(encoded[1], 14 | (0x3 << 4));
        assert_eq!(encoded[2], 0x12);
        let sum = encoded[..4].iter().fold(0u8, |a, b| a.wrapping_add(*b));
        assert_eq!(sum, 0xFF);
    }

    #[test]
    fn test_crc_verification() {
        let mut encoded = Packet::data(0, 0, vec![1, 2, 3, 4, 5]).to_bytes().unwrap();
        encoded[6] ^= 0xFF;
        assert!(matches!(
            Packet::from_bytes(&encoded),
            Err(ProtocolError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn test_header_corruption_detected() {
        let mut encoded = Packet::ack(3).to_bytes().unwrap();
        encoded[0] ^= 0x01;
        assert!(Packet::from_bytes(&encoded).is_err());
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let packet = Packet::data(0, 0, vec![0; MAX_PAYLOAD_SIZE + 1]);
        assert!(matches!(
            packet.to_bytes(),
            Err(ProtocolError::BufferOverflow(_))
        ));
    }

    #[test]
    fn test_link_control_messages() {
        for message in [
            LinkControl::Sync,
            LinkControl::SyncResponse,
            LinkControl::Config(LINK_CONFIG_FIELD),
            LinkControl::ConfigResponse(LINK_CONFIG_FIELD),
        ] {
            assert_eq!(LinkControl::parse(&message.to_bytes()), Some(message));
        }
        assert_eq!(LinkControl::parse(&[0x09, 0x09]), None);
    }

    #[test]
    fn test_sequence_wraparound() {
        assert_eq!(next_seq(7), 0);
        assert_eq!(prev_seq(0), 7);
        assert_eq!(next_seq(3), 4);
    }
}
