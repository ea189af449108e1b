//! Inbound segment acceptance and file reassembly.
//!
//! The [`Receiver`] is responsible for everything that happens *after* a raw
//! datagram is decoded into a [`crate::packet::Packet`] and *before* the
//! finished file is handed to the application:
//! - Accepting only the segment whose `seq` equals the expected `ack`.
//! - Storing accepted payloads in order ([`crate::assembler::Reassembly`]).
//! - Building the ACK (or ACK+LAST) reply for each accepted segment.
//! - Recognising a duplicate LAST after completion, which means our final
//!   ACK was lost.
//!
//! The [`Receiver`] does **not** send ACKs itself; it returns them to
//! [`crate::connection::Connection`], which owns the socket.

use crate::assembler::Reassembly;
use crate::packet::{flags, Header, Packet};

/// Flags that mark a packet as something other than file data.
const CONTROL: u8 = flags::SYN | flags::FIN | flags::GET | flags::POST | flags::NACK;

/// What an inbound data packet meant to the receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentOutcome {
    /// In-order segment stored; send this ACK.
    Accepted { reply: Packet, last: bool },
    /// LAST arrived again after completion; resend this final ACK.
    DuplicateLast(Packet),
    /// Out-of-order, duplicate or non-data packet; no reply.
    Dropped,
}

/// Stop-and-wait receive-side state for one file.
#[derive(Debug)]
pub struct Receiver {
    seq: u16,
    ack: u16,
    local_port: u16,
    peer_port: u16,
    chunks: Reassembly,
    /// Most recent ACK sent, resent on timeout.
    last_reply: Option<Packet>,
    /// `seq` of the accepted LAST segment.
    last_seq: Option<u16>,
}

impl Receiver {
    /// Start receiving with the connection's counters; `ack` is the `seq`
    /// expected on the first segment.
    pub fn new(seq: u16, ack: u16, local_port: u16, peer_port: u16) -> Self {
        Self {
            seq,
            ack,
            local_port,
            peer_port,
            chunks: Reassembly::new(),
            last_reply: None,
            last_seq: None,
        }
    }

    /// Current `(seq, ack)` counters.
    pub fn counters(&self) -> (u16, u16) {
        (self.seq, self.ack)
    }

    /// Sequence number the next segment must carry.
    pub fn expected(&self) -> u16 {
        self.ack
    }

    /// Number of segments accepted so far.
    pub fn accepted(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_complete(&self) -> bool {
        self.chunks.is_complete()
    }

    /// Process one decoded, port-checked packet.
    pub fn on_segment(&mut self, packet: &Packet) -> SegmentOutcome {
        let h = &packet.header;
        if h.has(flags::ACK) || !h.lacks(CONTROL) {
            return SegmentOutcome::Dropped;
        }

        if self.chunks.is_complete() {
            return match (&self.last_reply, self.last_seq) {
                (Some(reply), Some(seq)) if h.has(flags::LAST) && h.seq == seq => {
                    SegmentOutcome::DuplicateLast(reply.clone())
                }
                _ => SegmentOutcome::Dropped,
            };
        }

        if h.seq != self.ack {
            return SegmentOutcome::Dropped;
        }

        let last = h.has(flags::LAST);
        self.chunks.push(&packet.payload, last);
        self.ack = h.seq.wrapping_add(1);
        self.seq = h.ack;
        if last {
            self.last_seq = Some(h.seq);
        }

        let mut reply_flags = flags::ACK;
        if last {
            reply_flags |= flags::LAST;
        }
        let next_index = self.chunks.len() as u32;
        let reply = Packet::new(
            Header::new(self.local_port, self.peer_port, self.seq, self.ack, reply_flags),
            next_index.to_be_bytes().to_vec(),
        );
        self.last_reply = Some(reply.clone());
        SegmentOutcome::Accepted { reply, last }
    }

    /// Reassembled file, once LAST has been accepted.
    pub fn finish(self) -> Option<Vec<u8>> {
        self.chunks.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(seq: u16, ack: u16, payload: &[u8], last: bool) -> Packet {
        let f = if last { flags::LAST } else { 0 };
        Packet::new(Header::new(4000, 3250, seq, ack, f), payload.to_vec())
    }

    #[test]
    fn in_order_segments_are_acked_and_reassembled() {
        let mut r = Receiver::new(0, 0, 3250, 4000);

        let SegmentOutcome::Accepted { reply, last } = r.on_segment(&data(0, 1, &[1; 496], false))
        else {
            panic!("first segment rejected");
        };
        assert!(!last);
        assert_eq!(reply.header.flags, flags::ACK);
        assert_eq!((reply.header.seq, reply.header.ack), (1, 1));
        assert_eq!(reply.payload, 1u32.to_be_bytes());

        let SegmentOutcome::Accepted { reply, last } = r.on_segment(&data(1, 2, b"tail", true))
        else {
            panic!("last segment rejected");
        };
        assert!(last);
        assert_eq!(reply.header.flags, flags::ACK | flags::LAST);
        assert_eq!(reply.payload, 2u32.to_be_bytes());

        let mut expected = vec![1u8; 496];
        expected.extend_from_slice(b"tail");
        assert_eq!(r.finish().unwrap(), expected);
    }

    #[test]
    fn out_of_order_segment_is_dropped() {
        let mut r = Receiver::new(0, 7, 3250, 4000);
        assert_eq!(r.on_segment(&data(8, 1, b"x", false)), SegmentOutcome::Dropped);
        assert_eq!(r.on_segment(&data(6, 1, b"x", false)), SegmentOutcome::Dropped);
        assert_eq!(r.accepted(), 0);
        assert_eq!(r.expected(), 7);
    }

    #[test]
    fn ack_packets_are_not_data() {
        let mut r = Receiver::new(0, 0, 3250, 4000);
        let mut p = data(0, 1, b"x", false);
        p.header.flags = flags::ACK;
        assert_eq!(r.on_segment(&p), SegmentOutcome::Dropped);
    }

    #[test]
    fn requests_are_never_taken_as_segments() {
        let mut r = Receiver::new(1, 1, 3250, 4000);
        for bits in [flags::GET, flags::POST, flags::FIN, flags::SYN, flags::NACK] {
            let request = Packet::new(Header::new(4000, 3250, 1, 1, bits), b"f.txt".to_vec());
            assert_eq!(r.on_segment(&request), SegmentOutcome::Dropped, "{bits:#010b}");
        }
        assert_eq!(r.accepted(), 0);
        assert!(matches!(
            r.on_segment(&data(1, 2, b"f", true)),
            SegmentOutcome::Accepted { last: true, .. }
        ));
    }

    #[test]
    fn duplicate_last_after_completion_returns_final_ack() {
        let mut r = Receiver::new(0, 0, 3250, 4000);
        let last = data(0, 1, b"only", true);
        let SegmentOutcome::Accepted { reply, .. } = r.on_segment(&last) else {
            panic!("rejected");
        };
        assert_eq!(r.on_segment(&last), SegmentOutcome::DuplicateLast(reply));
        assert_eq!(r.on_segment(&data(1, 2, b"more", false)), SegmentOutcome::Dropped);
        assert_eq!(r.accepted(), 1);
    }

    #[test]
    fn expected_sequence_wraps() {
        let mut r = Receiver::new(0, u16::MAX, 3250, 4000);
        assert!(matches!(
            r.on_segment(&data(u16::MAX, 0, b"a", false)),
            SegmentOutcome::Accepted { .. }
        ));
        assert_eq!(r.expected(), 0);
        assert!(matches!(
            r.on_segment(&data(0, 1, b"b", true)),
            SegmentOutcome::Accepted { last: true, .. }
        ));
    }
}
