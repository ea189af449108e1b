//! GET and POST file transfer over an established connection.
//!
//! Both directions run the same two loops:
//! - [`Connection::send_file`] drives a [`Sender`]: one segment in flight,
//!   resent on every timeout until acknowledged.
//! - [`Connection::receive_file`] drives a [`Receiver`]: in-order segments are
//!   acknowledged, everything else is dropped, and the latest outbound packet
//!   is resent on timeout.  After LAST it lingers for one read timeout to
//!   answer a repeated LAST.
//!
//! A client POST sends the filename and then runs `send_file`; the server
//! answers with ACK+POST and runs `receive_file`.  A client GET runs
//! `receive_file` with the GET request as its first outbound packet; the
//! server runs `send_file`, or replies GET+NACK when the file is missing.

use std::io;

use crate::connection::{Connection, Inbound};
use crate::error::{Operation, Result, RxpError};
use crate::packet::{flags, Header, Packet, MAX_PAYLOAD};
use crate::receiver::{Receiver, SegmentOutcome};
use crate::sender::{AckOutcome, Sender};
use crate::socket::Transport;
use crate::store::FileStore;

/// Prefix given to every file written after a transfer.
pub const DOWNLOAD_PREFIX: &str = "downloaded_";

fn name_payload(name: &str) -> Result<Vec<u8>> {
    let bytes = name.as_bytes();
    if bytes.len() > MAX_PAYLOAD {
        return Err(RxpError::NameTooLong(bytes.len()));
    }
    Ok(bytes.to_vec())
}

/// A GET or POST request, as opposed to its acknowledgement.
fn is_request(h: &Header) -> bool {
    h.lacks(flags::ACK | flags::NACK) && !h.lacks(flags::GET | flags::POST)
}

/// `packet` is a retransmission of `request`.
fn is_repeat(request: &Packet, packet: &Packet) -> bool {
    packet.header.flags == request.header.flags && packet.payload == request.payload
}

impl<T: Transport> Connection<T> {
    /// Client side: POST `data` to the peer under `name`.
    pub async fn upload(&mut self, name: &str, data: &[u8]) -> Result<()> {
        let payload = name_payload(name)?;
        self.require_established()?;
        log::info!("[xfer] POST {name:?} ({} bytes)", data.len());

        let request = Packet::new(
            Header::new(self.local_port, self.peer_port, 0, 0, flags::POST),
            payload,
        );
        let accepted = self
            .exchange(&request, true, |p| {
                p.header.has(flags::ACK | flags::POST) && p.header.lacks(flags::FIN)
            })
            .await?;
        if accepted.is_none() {
            return Err(RxpError::transfer(
                Operation::Post,
                "upload request not acknowledged",
            ));
        }

        self.send_file(Operation::Post, data).await?;
        log::info!("[xfer] POST {name:?} complete");
        Ok(())
    }

    /// Client side: GET `name` from the peer and return its bytes.
    pub async fn download(&mut self, name: &str) -> Result<Vec<u8>> {
        let payload = name_payload(name)?;
        self.require_established()?;
        log::info!("[xfer] GET {name:?}");

        let request = Packet::new(self.header(flags::GET), payload);
        let data = self.receive_file(Operation::Get, request, None).await?;
        log::info!("[xfer] GET {name:?} complete ({} bytes)", data.len());
        Ok(data)
    }

    /// Server side: answer a GET request from `store`.
    ///
    /// A missing file is answered with GET+NACK and reported as
    /// [`RxpError::FileNotFound`]; the connection stays established.
    pub async fn serve_get(&mut self, request: &Packet, store: &dyn FileStore) -> Result<()> {
        self.require_established()?;
        let name = String::from_utf8_lossy(&request.payload).into_owned();
        log::info!("[xfer] serving GET {name:?}");

        match store.read(&name) {
            Ok(data) => self.send_file(Operation::Get, &data).await,
            Err(e) => {
                let mut reason = format!("{name}: {e}").into_bytes();
                reason.truncate(MAX_PAYLOAD);
                let nack = Packet::new(self.header(flags::GET | flags::NACK), reason);
                self.send(&nack).await?;
                if e.kind() == io::ErrorKind::NotFound {
                    Err(RxpError::FileNotFound(name))
                } else {
                    Err(e.into())
                }
            }
        }
    }

    /// Server side: accept a POST request and store the upload as
    /// `downloaded_<name>`.  Returns the stored name and byte count.
    pub async fn receive_post(
        &mut self,
        request: &Packet,
        store: &dyn FileStore,
    ) -> Result<(String, usize)> {
        self.require_established()?;
        let name = String::from_utf8_lossy(&request.payload).into_owned();
        log::info!("[xfer] receiving POST {name:?}");

        let accept = Packet::new(self.header(flags::ACK | flags::POST), Vec::new());
        let data = self
            .receive_file(Operation::Post, accept, Some(request))
            .await?;

        let stored = format!("{DOWNLOAD_PREFIX}{name}");
        store.write(&stored, &data)?;
        log::info!("[xfer] stored {stored:?} ({} bytes)", data.len());
        Ok((stored, data.len()))
    }

    /// Stop-and-wait send loop.
    pub(crate) async fn send_file(&mut self, op: Operation, data: &[u8]) -> Result<()> {
        let mut sender = Sender::new(data, self.seq, self.ack, self.local_port, self.peer_port);
        let mut budget = self.timers.budget();
        log::debug!("[xfer] {op}: {} segments", sender.total());

        while let Some(packet) = sender.current_packet() {
            self.send(&packet).await?;
            sender.record_sent();

            loop {
                match self.recv_within(true).await? {
                    Inbound::Timeout => {
                        if !budget.on_timeout() {
                            return Err(RxpError::transfer(
                                op,
                                format!("segment {} never acknowledged", sender.position()),
                            ));
                        }
                        log::debug!(
                            "[xfer] timeout on segment {} after {} tx, resending ({}/{})",
                            sender.position(),
                            sender.retransmit_count(),
                            budget.used(),
                            budget.limit()
                        );
                        break;
                    }
                    Inbound::Dropped => {}
                    Inbound::Packet(reply) => {
                        if self.defer_if_fin(&reply) {
                            continue;
                        }
                        match sender.on_response(&reply.header) {
                            AckOutcome::Advanced | AckOutcome::Finished => {
                                budget.reset();
                                break;
                            }
                            AckOutcome::Duplicate => {
                                log::trace!("[xfer] duplicate ACK for segment {}", sender.position());
                            }
                            AckOutcome::Ignored => {}
                        }
                    }
                }
            }
        }

        (self.seq, self.ack) = sender.counters();
        Ok(())
    }

    /// Stop-and-wait receive loop.  `first` is sent before anything arrives
    /// and resent on timeout until a segment is accepted.  A repeat of
    /// `request` is answered with `first` again.
    ///
    /// Before the first segment, a new request means the peer is not running
    /// this transfer: the receive is abandoned and the request stashed for
    /// the idle loop.  The requesting side (`request` is `None`) also
    /// abandons on a FIN, recording it as a deferred close.
    pub(crate) async fn receive_file(
        &mut self,
        op: Operation,
        first: Packet,
        request: Option<&Packet>,
    ) -> Result<Vec<u8>> {
        let mut receiver = Receiver::new(self.seq, self.ack, self.local_port, self.peer_port);
        let mut budget = self.timers.budget();
        let mut outbound = first;
        self.send(&outbound).await?;

        loop {
            let packet = match self.recv_within(true).await? {
                Inbound::Timeout if receiver.is_complete() => break,
                Inbound::Timeout => {
                    if !budget.on_timeout() {
                        return Err(RxpError::transfer(
                            op,
                            format!("no segment {} from peer", receiver.accepted()),
                        ));
                    }
                    log::debug!(
                        "[xfer] timeout awaiting segment {}, resending ({}/{})",
                        receiver.accepted(),
                        budget.used(),
                        budget.limit()
                    );
                    self.send(&outbound).await?;
                    continue;
                }
                Inbound::Dropped => continue,
                Inbound::Packet(packet) => packet,
            };

            let h = &packet.header;
            if receiver.is_complete() && h.lacks(flags::LAST) {
                // Peer has moved on: a FIN or its next request ends the linger.
                if !self.defer_if_fin(&packet) {
                    self.stash(packet);
                }
                break;
            }

            if receiver.accepted() == 0 {
                if request.is_some_and(|r| is_repeat(r, &packet)) {
                    log::debug!("[xfer] repeated request; resending acceptance");
                    self.send(&outbound).await?;
                    continue;
                }
                // Serving peers close only from idle, so a FIN here means our
                // request was never picked up.
                if request.is_none() && self.defer_if_fin(&packet) {
                    return Err(RxpError::transfer(op, "peer closed before the first segment"));
                }
                if op == Operation::Get && h.has(flags::NACK) {
                    let reason = String::from_utf8_lossy(&packet.payload).into_owned();
                    log::warn!("[xfer] peer refused GET: {reason}");
                    return Err(RxpError::FileNotFound(reason));
                }
                if is_request(h) {
                    log::debug!("[xfer] new request before the first segment; abandoning {op}");
                    self.stash(packet);
                    return Err(RxpError::transfer(op, "superseded by a new request"));
                }
            }
            if self.defer_if_fin(&packet) {
                continue;
            }

            match receiver.on_segment(&packet) {
                SegmentOutcome::Accepted { reply, last } => {
                    self.send(&reply).await?;
                    outbound = reply;
                    budget.reset();
                    if last {
                        log::debug!("[xfer] LAST accepted; lingering");
                    }
                }
                SegmentOutcome::DuplicateLast(reply) => {
                    log::debug!("[xfer] repeated LAST; resending final ACK");
                    self.send(&reply).await?;
                }
                SegmentOutcome::Dropped => {
                    log::trace!(
                        "[xfer] dropping seq={} (expecting {})",
                        h.seq,
                        receiver.expected()
                    );
                }
            }
        }

        (self.seq, self.ack) = receiver.counters();
        receiver
            .finish()
            .ok_or_else(|| RxpError::transfer(op, "transfer ended before LAST"))
    }
}
