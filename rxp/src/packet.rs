//! Wire-format definitions for RXP segments.
//!
//! Every datagram exchanged between peers is a [`Packet`].  This module is
//! responsible for:
//! - Defining the on-wire binary layout (header fields, flags, payload).
//! - Serialising a [`Packet`] into a fixed 512-byte buffer ready for
//!   transmission.
//! - Deserialising a raw datagram back into a [`Packet`], returning errors
//!   for malformed, truncated or corrupted input.
//!
//! No I/O happens here: this is pure data transformation.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |          Source Port          |       Destination Port        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |        Sequence Number        |     Acknowledgment Number     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |        Segment Length         |     Flags     |   Reserved    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     Checksum (CRC32 of payload)               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                 Payload ... (segment_length bytes)            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Total header size: [`HEADER_LEN`] = 16 bytes.  A datagram is always
//! [`PACKET_SIZE`] bytes; bytes past `segment_length` are zero on encode and
//! ignored on decode.

/// Bit-flag constants for the `flags` header field (MSB first).
pub mod flags {
    /// Acknowledgement field is valid.
    pub const ACK: u8 = 0b1000_0000;
    /// Connection request (handshake initiation).
    pub const SYN: u8 = 0b0100_0000;
    /// Finish: sender wants to close the connection.
    pub const FIN: u8 = 0b0010_0000;
    /// Download request / download control.
    pub const GET: u8 = 0b0001_0000;
    /// Upload request / upload control.
    pub const POST: u8 = 0b0000_1000;
    /// Final segment of a file transfer.
    pub const LAST: u8 = 0b0000_0100;
    /// Negative reply to a request; payload carries a UTF-8 reason.
    pub const NACK: u8 = 0b0000_0010;
}

/// Byte length of the fixed-size header on the wire.
pub const HEADER_LEN: usize = 16;

/// Byte length of every datagram on the wire.
pub const PACKET_SIZE: usize = 512;

/// Largest payload a single packet may carry.
pub const MAX_PAYLOAD: usize = PACKET_SIZE - HEADER_LEN;

// Byte offsets of each field within the serialised header.
const OFF_SRC: usize = 0;
const OFF_DST: usize = 2;
const OFF_SEQ: usize = 4;
const OFF_ACK: usize = 6;
const OFF_SEGLEN: usize = 8;
const OFF_FLAGS: usize = 10;
const OFF_CHECKSUM: usize = 12;

/// Fixed-size RXP header.
///
/// Fields are in host byte order; [`Header::encode`] converts to big-endian
/// on the wire and [`Header::decode`] converts back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    /// RXP port of the sender (logical peer id, not the UDP port).
    pub source_port: u16,
    /// RXP port of the receiver.
    pub destination_port: u16,
    /// Sequence number, modulo 65536.
    pub seq: u16,
    /// Acknowledgement number, modulo 65536.
    pub ack: u16,
    /// Number of meaningful payload bytes following the header.
    ///
    /// Recomputed from the payload by [`Packet::encode`].
    pub segment_length: u16,
    /// Bitmask of [`flags`] constants.
    pub flags: u8,
    /// CRC32 of the payload bytes (header excluded).
    ///
    /// Recomputed from the payload by [`Packet::encode`].
    pub checksum: u32,
}

impl Header {
    /// Header with ports and counters set and every other field zero.
    pub fn new(source_port: u16, destination_port: u16, seq: u16, ack: u16, flags: u8) -> Self {
        Self {
            source_port,
            destination_port,
            seq,
            ack,
            segment_length: 0,
            flags,
            checksum: 0,
        }
    }

    /// `true` when every bit of `mask` is set.
    #[inline]
    pub fn has(&self, mask: u8) -> bool {
        self.flags & mask == mask
    }

    /// `true` when none of the bits of `mask` are set.
    #[inline]
    pub fn lacks(&self, mask: u8) -> bool {
        self.flags & mask == 0
    }

    /// Serialise the header exactly as it appears on the wire.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[OFF_SRC..OFF_SRC + 2].copy_from_slice(&self.source_port.to_be_bytes());
        buf[OFF_DST..OFF_DST + 2].copy_from_slice(&self.destination_port.to_be_bytes());
        buf[OFF_SEQ..OFF_SEQ + 2].copy_from_slice(&self.seq.to_be_bytes());
        buf[OFF_ACK..OFF_ACK + 2].copy_from_slice(&self.ack.to_be_bytes());
        buf[OFF_SEGLEN..OFF_SEGLEN + 2].copy_from_slice(&self.segment_length.to_be_bytes());
        buf[OFF_FLAGS] = self.flags;
        buf[OFF_CHECKSUM..OFF_CHECKSUM + 4].copy_from_slice(&self.checksum.to_be_bytes());
        buf
    }

    /// Parse the 16 header bytes.  No validation happens here.
    pub fn decode(buf: &[u8; HEADER_LEN]) -> Self {
        let u16_at = |off: usize| u16::from_be_bytes([buf[off], buf[off + 1]]);
        Self {
            source_port: u16_at(OFF_SRC),
            destination_port: u16_at(OFF_DST),
            seq: u16_at(OFF_SEQ),
            ack: u16_at(OFF_ACK),
            segment_length: u16_at(OFF_SEGLEN),
            flags: buf[OFF_FLAGS],
            checksum: u32::from_be_bytes([
                buf[OFF_CHECKSUM],
                buf[OFF_CHECKSUM + 1],
                buf[OFF_CHECKSUM + 2],
                buf[OFF_CHECKSUM + 3],
            ]),
        }
    }
}

/// A complete RXP datagram: header + payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(header: Header, payload: Vec<u8>) -> Self {
        Self { header, payload }
    }

    /// Serialise this packet into a newly allocated [`PACKET_SIZE`] buffer.
    ///
    /// `header.segment_length` and `header.checksum` are computed from the
    /// actual payload; any values already stored in those fields are ignored.
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let len = self.payload.len();
        if len > MAX_PAYLOAD {
            return Err(PacketError::SegmentTooLong(len));
        }

        let header = Header {
            segment_length: len as u16,
            checksum: compute_checksum(&self.payload),
            ..self.header
        };

        let mut buf = vec![0u8; PACKET_SIZE];
        buf[..HEADER_LEN].copy_from_slice(&header.encode());
        buf[HEADER_LEN..HEADER_LEN + len].copy_from_slice(&self.payload);
        Ok(buf)
    }

    /// Parse a [`Packet`] from a raw datagram.
    ///
    /// Returns [`Err`] if:
    /// - `buf` is shorter than [`HEADER_LEN`],
    /// - `segment_length` exceeds [`MAX_PAYLOAD`],
    /// - `buf` ends before the declared payload does, or
    /// - the payload checksum does not verify.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        let header_bytes: &[u8; HEADER_LEN] = buf
            .get(..HEADER_LEN)
            .and_then(|b| b.try_into().ok())
            .ok_or(PacketError::BufferTooShort)?;
        let header = Header::decode(header_bytes);

        let len = header.segment_length as usize;
        if len > MAX_PAYLOAD {
            return Err(PacketError::SegmentTooLong(len));
        }
        let payload = buf
            .get(HEADER_LEN..HEADER_LEN + len)
            .ok_or(PacketError::Truncated)?;

        if compute_checksum(payload) != header.checksum {
            return Err(PacketError::ChecksumMismatch);
        }

        Ok(Packet {
            header,
            payload: payload.to_vec(),
        })
    }
}

/// Errors that can arise when parsing a raw datagram.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    /// Buffer shorter than the fixed header size.
    #[error("buffer too short to contain a header")]
    BufferTooShort,
    /// `segment_length` (or an outbound payload) exceeds [`MAX_PAYLOAD`].
    #[error("segment length {0} exceeds {MAX_PAYLOAD} bytes")]
    SegmentTooLong(usize),
    /// Datagram ends before the declared payload does.
    #[error("datagram shorter than its declared segment length")]
    Truncated,
    /// Payload checksum did not match the header.
    #[error("checksum verification failed")]
    ChecksumMismatch,
}

/// CRC32 over `payload`.  The header never contributes.
pub fn compute_checksum(payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

/// Recompute the payload checksum of a raw datagram and compare it with the
/// header.  Datagrams with an out-of-range `segment_length` never verify.
pub fn verify(buf: &[u8]) -> bool {
    Packet::decode(buf).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_packet(seq: u16, ack: u16, flags: u8, payload: &[u8]) -> Packet {
        Packet::new(Header::new(4000, 3250, seq, ack, flags), payload.to_vec())
    }

    #[test]
    fn encode_decode_roundtrip() {
        let pkt = make_packet(42, 7, flags::ACK | flags::LAST, b"hello");
        let decoded = Packet::decode(&pkt.encode().unwrap()).unwrap();
        assert_eq!(decoded.header.source_port, 4000);
        assert_eq!(decoded.header.destination_port, 3250);
        assert_eq!(decoded.header.seq, 42);
        assert_eq!(decoded.header.ack, 7);
        assert_eq!(decoded.header.flags, flags::ACK | flags::LAST);
        assert_eq!(decoded.header.segment_length, 5);
        assert_eq!(decoded.payload, b"hello");
    }

    #[test]
    fn encoded_datagram_is_always_512_bytes() {
        assert_eq!(make_packet(0, 0, 0, b"").encode().unwrap().len(), PACKET_SIZE);
        let full = vec![0xAB; MAX_PAYLOAD];
        assert_eq!(make_packet(0, 0, 0, &full).encode().unwrap().len(), PACKET_SIZE);
    }

    #[test]
    fn padding_is_zeroed() {
        let bytes = make_packet(1, 1, 0, b"abc").encode().unwrap();
        assert!(bytes[HEADER_LEN + 3..].iter().all(|&b| b == 0));
        assert_eq!(bytes[11], 0, "reserved header byte");
    }

    #[test]
    fn oversize_payload_is_rejected_on_encode() {
        let pkt = make_packet(0, 0, 0, &vec![0; MAX_PAYLOAD + 1]);
        assert_eq!(pkt.encode(), Err(PacketError::SegmentTooLong(MAX_PAYLOAD + 1)));
    }

    #[test]
    fn header_field_offsets_are_big_endian() {
        let h = Header {
            source_port: 0x0102,
            destination_port: 0x0304,
            seq: 0x0506,
            ack: 0x0708,
            segment_length: 0x0009,
            flags: flags::SYN,
            checksum: 0x0A0B_0C0D,
        };
        assert_eq!(
            h.encode(),
            [1, 2, 3, 4, 5, 6, 7, 8, 0, 9, flags::SYN, 0, 0x0A, 0x0B, 0x0C, 0x0D]
        );
        assert_eq!(Header::decode(&h.encode()), h);
    }

    #[test]
    fn flag_bits_follow_msb_order() {
        assert_eq!(flags::ACK, 1 << 7);
        assert_eq!(flags::SYN, 1 << 6);
        assert_eq!(flags::FIN, 1 << 5);
        assert_eq!(flags::GET, 1 << 4);
        assert_eq!(flags::POST, 1 << 3);
        assert_eq!(flags::LAST, 1 << 2);
    }

    #[test]
    fn has_and_lacks() {
        let h = Header::new(0, 0, 0, 0, flags::ACK | flags::FIN);
        assert!(h.has(flags::ACK | flags::FIN));
        assert!(!h.has(flags::ACK | flags::SYN));
        assert!(h.lacks(flags::SYN | flags::GET));
        assert!(!h.lacks(flags::FIN));
    }

    #[test]
    fn checksum_covers_payload_only() {
        let a = make_packet(1, 2, flags::ACK, b"same").encode().unwrap();
        let b = make_packet(9, 9, flags::SYN, b"same").encode().unwrap();
        assert_eq!(a[OFF_CHECKSUM..HEADER_LEN], b[OFF_CHECKSUM..HEADER_LEN]);
        assert_eq!(
            Header::decode(a[..HEADER_LEN].try_into().unwrap()).checksum,
            compute_checksum(b"same")
        );
    }

    #[test]
    fn verify_accepts_clean_packet() {
        let bytes = make_packet(3, 4, 0, b"payload").encode().unwrap();
        assert!(verify(&bytes));
    }

    #[test]
    fn flipped_payload_byte_fails_verification() {
        let mut bytes = make_packet(3, 4, 0, b"payload").encode().unwrap();
        bytes[HEADER_LEN + 2] ^= 0xff;
        assert!(!verify(&bytes));
        assert_eq!(Packet::decode(&bytes), Err(PacketError::ChecksumMismatch));
    }

    #[test]
    fn padding_bytes_are_never_parsed() {
        let mut bytes = make_packet(3, 4, 0, b"xy").encode().unwrap();
        bytes[PACKET_SIZE - 1] = 0x55;
        assert_eq!(Packet::decode(&bytes).unwrap().payload, b"xy");
    }

    #[test]
    fn decode_empty_buffer_returns_error() {
        assert_eq!(Packet::decode(&[]), Err(PacketError::BufferTooShort));
    }

    #[test]
    fn decode_out_of_range_length_returns_error() {
        let mut bytes = make_packet(0, 0, 0, b"").encode().unwrap();
        bytes[OFF_SEGLEN..OFF_SEGLEN + 2].copy_from_slice(&497u16.to_be_bytes());
        assert_eq!(Packet::decode(&bytes), Err(PacketError::SegmentTooLong(497)));
    }

    #[test]
    fn decode_truncated_datagram_returns_error() {
        let bytes = make_packet(0, 0, 0, b"data").encode().unwrap();
        assert_eq!(
            Packet::decode(&bytes[..HEADER_LEN + 2]),
            Err(PacketError::Truncated)
        );
    }

    #[test]
    fn segment_length_matches_payload_for_all_sizes() {
        for len in [0usize, 1, 4, 16, 255, 495, MAX_PAYLOAD] {
            let payload = vec![0x5A; len];
            let decoded = Packet::decode(&make_packet(0, 0, 0, &payload).encode().unwrap()).unwrap();
            assert_eq!(decoded.header.segment_length as usize, len);
        }
    }
}
