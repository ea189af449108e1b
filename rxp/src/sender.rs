//! Outbound segment state for stop-and-wait file transfer.
//!
//! [`Sender`] walks a file's segments in order and tracks the single
//! in-flight one.  It does **not** touch the socket;
//! [`crate::connection::Connection`] calls these methods and owns the actual
//! send/receive loop.
//!
//! # Stop-and-Wait contract
//! - At most **one** segment is in flight at any moment.
//! - The in-flight segment carries `seq` and `ack + 1` (mod 65536).
//! - A response with `ack == seq + 1` acknowledges it: `seq` advances by one,
//!   `ack` adopts the response's `seq`, and the next segment becomes current.
//! - A response with `ack == seq` re-acknowledges the previous segment and is
//!   ignored.
//! - ACK+LAST under the same rule finishes the transfer on the final segment;
//!   a plain ACK never does.
//! - On timeout the caller resends [`Sender::current_packet`] unchanged.

use std::time::Instant;

use crate::assembler::{split, Segment};
use crate::packet::{flags, Header, Packet};

/// What a response meant to the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The in-flight segment was acknowledged; the next one is current.
    Advanced,
    /// The final segment was acknowledged with ACK+LAST.
    Finished,
    /// Re-acknowledgement of the previous segment.
    Duplicate,
    /// Not an acknowledgement of anything in flight.
    Ignored,
}

/// Stop-and-wait send-side state for one file.
#[derive(Debug)]
pub struct Sender {
    segments: Vec<Segment>,
    cursor: usize,
    seq: u16,
    ack: u16,
    local_port: u16,
    peer_port: u16,
    /// Transmissions of the current segment (0 until first sent).
    tx_count: u32,
    /// Time of the most recent transmission of the current segment.
    sent_at: Option<Instant>,
}

impl Sender {
    /// Prepare `data` for sending, starting from the connection's counters.
    pub fn new(data: &[u8], seq: u16, ack: u16, local_port: u16, peer_port: u16) -> Self {
        Self {
            segments: split(data),
            cursor: 0,
            seq,
            ack,
            local_port,
            peer_port,
            tx_count: 0,
            sent_at: None,
        }
    }

    /// Number of segments the file was cut into.
    pub fn total(&self) -> usize {
        self.segments.len()
    }

    /// Index of the segment currently in flight (== `total()` once finished).
    pub fn position(&self) -> usize {
        self.cursor
    }

    pub fn is_finished(&self) -> bool {
        self.cursor >= self.segments.len()
    }

    /// Current `(seq, ack)` counters.
    pub fn counters(&self) -> (u16, u16) {
        (self.seq, self.ack)
    }

    /// Build the packet for the in-flight segment, or `None` once finished.
    pub fn current_packet(&self) -> Option<Packet> {
        let segment = self.segments.get(self.cursor)?;
        let mut header = Header::new(
            self.local_port,
            self.peer_port,
            self.seq,
            self.ack.wrapping_add(1),
            0,
        );
        if segment.last {
            header.flags |= flags::LAST;
        }
        Some(Packet::new(header, segment.payload.clone()))
    }

    /// Note one transmission of the current segment.
    pub fn record_sent(&mut self) {
        self.tx_count += 1;
        self.sent_at = Some(Instant::now());
    }

    /// How many times the current segment has been transmitted.
    pub fn retransmit_count(&self) -> u32 {
        self.tx_count
    }

    /// Process a response header from the peer.
    pub fn on_response(&mut self, header: &Header) -> AckOutcome {
        let Some(segment) = self.segments.get(self.cursor) else {
            return AckOutcome::Ignored;
        };
        if !header.has(flags::ACK) {
            return AckOutcome::Ignored;
        }
        if header.ack == self.seq {
            return AckOutcome::Duplicate;
        }
        // ACK+LAST must answer the final segment and a plain ACK any other.
        let last = segment.last;
        if header.ack != self.seq.wrapping_add(1) || header.has(flags::LAST) != last {
            return AckOutcome::Ignored;
        }

        self.advance(header);
        if last {
            AckOutcome::Finished
        } else {
            AckOutcome::Advanced
        }
    }

    fn advance(&mut self, header: &Header) {
        if let Some(sent_at) = self.sent_at {
            log::trace!(
                "[xfer] segment {} acked after {:?} ({} tx)",
                self.cursor,
                sent_at.elapsed(),
                self.tx_count
            );
        }
        self.seq = self.seq.wrapping_add(1);
        self.ack = header.seq;
        self.cursor += 1;
        self.tx_count = 0;
        self.sent_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ack(seq: u16, ack: u16, extra: u8) -> Header {
        Header::new(3250, 4000, seq, ack, flags::ACK | extra)
    }

    #[test]
    fn segments_carry_seq_and_next_ack() {
        let s = Sender::new(&[1; 1000], 10, 20, 4000, 3250);
        let pkt = s.current_packet().unwrap();
        assert_eq!(pkt.header.seq, 10);
        assert_eq!(pkt.header.ack, 21);
        assert_eq!(pkt.header.source_port, 4000);
        assert_eq!(pkt.header.destination_port, 3250);
        assert!(pkt.header.lacks(flags::LAST));
    }

    #[test]
    fn upload_of_thousand_bytes_walks_three_segments() {
        let mut s = Sender::new(&[9; 1000], 0, 0, 1, 2);
        assert_eq!(s.total(), 3);

        assert_eq!(s.on_response(&ack(1, 1, 0)), AckOutcome::Advanced);
        assert_eq!(s.counters(), (1, 1));
        assert_eq!(s.on_response(&ack(2, 2, 0)), AckOutcome::Advanced);

        let last = s.current_packet().unwrap();
        assert_eq!(last.payload.len(), 8);
        assert!(last.header.has(flags::LAST));

        // A plain ACK does not finish the transfer; ACK+LAST does.
        assert_eq!(s.on_response(&ack(3, 3, 0)), AckOutcome::Ignored);
        assert_eq!(s.on_response(&ack(3, 3, flags::LAST)), AckOutcome::Finished);
        assert!(s.is_finished());
        assert_eq!(s.current_packet(), None);
    }

    #[test]
    fn duplicate_ack_is_ignored() {
        let mut s = Sender::new(&[0; 600], 5, 5, 1, 2);
        assert_eq!(s.on_response(&ack(5, 5, 0)), AckOutcome::Duplicate);
        assert_eq!(s.position(), 0);
        assert_eq!(s.counters(), (5, 5));
    }

    #[test]
    fn stale_or_unrelated_responses_are_ignored() {
        let mut s = Sender::new(&[0; 600], 5, 5, 1, 2);
        assert_eq!(s.on_response(&ack(0, 9, 0)), AckOutcome::Ignored);
        let no_ack = Header::new(2, 1, 6, 6, flags::GET);
        assert_eq!(s.on_response(&no_ack), AckOutcome::Ignored);
        assert_eq!(s.on_response(&ack(6, 6, flags::LAST)), AckOutcome::Ignored);
    }

    #[test]
    fn last_ack_with_wrong_ack_number_does_not_finish() {
        let mut s = Sender::new(b"x", 5, 5, 1, 2);
        assert_eq!(s.on_response(&ack(77, 999, flags::LAST)), AckOutcome::Ignored);
        // A final ACK left over from the previous transfer re-acks `seq`.
        assert_eq!(s.on_response(&ack(5, 5, flags::LAST)), AckOutcome::Duplicate);
        assert!(!s.is_finished());
        assert_eq!(s.counters(), (5, 5));

        assert_eq!(s.on_response(&ack(9, 6, flags::LAST)), AckOutcome::Finished);
        assert_eq!(s.counters(), (6, 9));
    }

    #[test]
    fn sequence_numbers_wrap_at_u16() {
        let mut s = Sender::new(&[0; 600], u16::MAX, u16::MAX, 1, 2);
        assert_eq!(s.current_packet().unwrap().header.ack, 0);
        assert_eq!(s.on_response(&ack(0, 0, 0)), AckOutcome::Advanced);
        assert_eq!(s.counters(), (0, 0));
    }

    #[test]
    fn empty_file_sends_one_last_segment() {
        let mut s = Sender::new(&[], 0, 0, 1, 2);
        let pkt = s.current_packet().unwrap();
        assert!(pkt.payload.is_empty());
        assert!(pkt.header.has(flags::LAST));
        assert_eq!(s.on_response(&ack(1, 1, flags::LAST)), AckOutcome::Finished);
    }

    #[test]
    fn retransmit_count_resets_on_advance() {
        let mut s = Sender::new(&[0; 600], 0, 0, 1, 2);
        s.record_sent();
        s.record_sent();
        assert_eq!(s.retransmit_count(), 2);
        s.on_response(&ack(1, 1, 0));
        assert_eq!(s.retransmit_count(), 0);
    }
}
