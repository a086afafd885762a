//! Tunnel segment and its binary wire form
//!
//! A segment is the unit the transmission control exchanges with its peer.
//! Exactly one segment rides in every DNS query name and every CNAME answer.
//!
//! ## Wire Format
//!
//! ```text
//!  0      2     3          7          11         15
//!  +------+-----+----------+----------+----------+---------...
//!  | id   |flags|   seq    |   ack    |  crc32   | payload
//!  +------+-----+----------+----------+----------+---------...
//! ```
//!
//! All integers are big-endian. The CRC-32 covers every other header byte
//! and the payload, computed with the checksum field zeroed.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Binary header length (id + flags + seq + ack + crc32)
pub const SEGMENT_HEADER_LEN: usize = 15;

/// Offset of the checksum inside the header
const CRC_OFFSET: usize = 11;

/// Segment flag bit set
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Flags(u8);

impl Flags {
    pub const NONE: Flags = Flags(0);
    /// Opens a connection
    pub const SYN: Flags = Flags(0x01);
    /// The ack field is meaningful
    pub const ACK: Flags = Flags(0x02);
    /// Sender has no more data
    pub const FIN: Flags = Flags(0x04);
    /// Abort the connection
    pub const RST: Flags = Flags(0x08);
    /// No new application data, sent to keep the channel polled
    pub const KEEP_ALIVE: Flags = Flags(0x10);
    /// Travelling from responder to initiator, inside a CNAME target
    pub const RESPONSE: Flags = Flags(0x20);
    /// Local marker for segments that failed to decode; never valid on the wire
    pub const MALFORMED: Flags = Flags(0x80);

    const WIRE_MASK: u8 = 0x3f;

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn insert(&mut self, other: Flags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Flags) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Flags, &str); 7] = [
            (Flags::SYN, "SYN"),
            (Flags::ACK, "ACK"),
            (Flags::FIN, "FIN"),
            (Flags::RST, "RST"),
            (Flags::KEEP_ALIVE, "KEEP_ALIVE"),
            (Flags::RESPONSE, "RESPONSE"),
            (Flags::MALFORMED, "MALFORMED"),
        ];

        if self.is_empty() {
            return write!(f, "NONE");
        }
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// One unit of the tunneled protocol
#[derive(Clone, PartialEq, Eq)]
pub struct Segment {
    /// Connection identifier
    pub id: u16,
    pub flags: Flags,
    /// Sequence number of the first payload byte (or of SYN/FIN)
    pub seq: u32,
    /// Next sequence number expected from the peer, valid with `ACK`
    pub ack: u32,
    pub payload: Bytes,
}

impl Segment {
    pub fn new(id: u16, flags: Flags, seq: u32, ack: u32, payload: Bytes) -> Self {
        Self {
            id,
            flags,
            seq,
            ack,
            payload,
        }
    }

    /// Placeholder produced whenever decoding fails
    pub fn malformed() -> Self {
        Self {
            id: 0,
            flags: Flags::MALFORMED,
            seq: 0,
            ack: 0,
            payload: Bytes::new(),
        }
    }

    pub fn is_malformed(&self) -> bool {
        self.flags.contains(Flags::MALFORMED)
    }

    pub fn is_keep_alive(&self) -> bool {
        self.flags.contains(Flags::KEEP_ALIVE)
    }

    /// Sequence space consumed by this segment (payload plus SYN/FIN)
    pub fn seq_len(&self) -> u32 {
        let mut len = self.payload.len() as u32;
        if self.flags.contains(Flags::SYN) {
            len += 1;
        }
        if self.flags.contains(Flags::FIN) {
            len += 1;
        }
        len
    }

    /// Serialize to the binary wire form
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(SEGMENT_HEADER_LEN + self.payload.len());
        buf.put_u16(self.id);
        buf.put_u8(self.flags.bits() & Flags::WIRE_MASK);
        buf.put_u32(self.seq);
        buf.put_u32(self.ack);
        buf.put_u32(0);
        buf.put_slice(&self.payload);

        let crc = crc32(&buf);
        buf[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&crc.to_be_bytes());
        buf.freeze()
    }

    /// Parse the binary wire form, verifying length, flags and checksum
    ///
    /// Never panics; any violation yields a segment with `MALFORMED` set.
    pub fn from_bytes(data: &[u8]) -> Self {
        if data.len() < SEGMENT_HEADER_LEN {
            return Self::malformed();
        }

        let mut unchecked = data.to_vec();
        let claimed = u32::from_be_bytes([
            data[CRC_OFFSET],
            data[CRC_OFFSET + 1],
            data[CRC_OFFSET + 2],
            data[CRC_OFFSET + 3],
        ]);
        unchecked[CRC_OFFSET..CRC_OFFSET + 4].fill(0);
        if crc32(&unchecked) != claimed {
            return Self::malformed();
        }

        let mut cursor = data;
        let id = cursor.get_u16();
        let flags = cursor.get_u8();
        if flags & !Flags::WIRE_MASK != 0 {
            return Self::malformed();
        }
        let seq = cursor.get_u32();
        let ack = cursor.get_u32();
        cursor.advance(4);

        Self {
            id,
            flags: Flags(flags),
            seq,
            ack,
            payload: Bytes::copy_from_slice(cursor),
        }
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("id", &format_args!("{:04x}", self.id))
            .field("flags", &self.flags)
            .field("seq", &self.seq)
            .field("ack", &self.ack)
            .field("len", &self.payload.len())
            .finish()
    }
}

/// CRC-32 (ISO-HDLC, reflected polynomial 0xedb88320)
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xffff_ffffu32;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xedb8_8320;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_check_value() {
        assert_eq!(crc32(b"123456789"), 0xcbf4_3926);
    }

    #[test]
    fn test_segment_wire_roundtrip() {
        let seg = Segment::new(
            0xabcd,
            Flags::ACK | Flags::FIN,
            7,
            42,
            Bytes::from_static(b"hello"),
        );
        let wire = seg.to_bytes();
        assert_eq!(wire.len(), SEGMENT_HEADER_LEN + 5);
        assert_eq!(Segment::from_bytes(&wire), seg);
    }

    #[test]
    fn test_malformed_flag_not_serialized() {
        let mut seg = Segment::new(1, Flags::ACK, 0, 0, Bytes::new());
        seg.flags.insert(Flags::MALFORMED);
        let decoded = Segment::from_bytes(&seg.to_bytes());
        assert!(!decoded.is_malformed());
        assert_eq!(decoded.flags, Flags::ACK);
    }

    #[test]
    fn test_corrupted_segment_is_malformed() {
        let seg = Segment::new(3, Flags::ACK, 1, 1, Bytes::from_static(b"data"));
        let mut wire = seg.to_bytes().to_vec();
        wire[SEGMENT_HEADER_LEN] ^= 0x01;
        assert!(Segment::from_bytes(&wire).is_malformed());

        assert!(Segment::from_bytes(&[]).is_malformed());
        assert!(Segment::from_bytes(&wire[..SEGMENT_HEADER_LEN - 1]).is_malformed());
    }

    #[test]
    fn test_unknown_flag_bits_are_malformed() {
        let seg = Segment::new(3, Flags::ACK, 1, 1, Bytes::new());
        let mut wire = seg.to_bytes().to_vec();
        wire[2] |= 0x40;
        wire[CRC_OFFSET..CRC_OFFSET + 4].fill(0);
        let crc = crc32(&wire);
        wire[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&crc.to_be_bytes());
        assert!(Segment::from_bytes(&wire).is_malformed());
    }

    #[test]
    fn test_seq_len_counts_control_flags() {
        let syn = Segment::new(1, Flags::SYN, 0, 0, Bytes::new());
        assert_eq!(syn.seq_len(), 1);
        let fin = Segment::new(1, Flags::FIN | Flags::ACK, 10, 0, Bytes::from_static(b"ab"));
        assert_eq!(fin.seq_len(), 3);
    }

    #[test]
    fn test_flags_debug() {
        assert_eq!(format!("{:?}", Flags::SYN | Flags::ACK), "SYN|ACK");
        assert_eq!(format!("{:?}", Flags::NONE), "NONE");
    }
}
