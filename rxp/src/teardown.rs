//! Connection teardown.
//!
//! ```text
//!  initiator                                responder
//!    │ ── FIN ────────────────────────────────▶ │  CLOSE_WAIT
//!  CLOSE_REQ                                    │
//!    │ ◀──────────────────────────── ACK+FIN ── │
//!  CLOSED                                       │  (quiet for one timeout)
//!                                             CLOSED
//! ```
//!
//! The initiator resends FIN on timeout.  The responder answers every FIN it
//! sees with ACK+FIN and closes once the initiator goes quiet.

use std::time::Duration;

use tokio::time::timeout;

use crate::connection::{Connection, Inbound};
use crate::error::{Result, RxpError};
use crate::packet::{flags, Packet, MAX_PAYLOAD};
use crate::socket::{SocketError, Transport};
use crate::state::Event;

fn is_bare_fin(packet: &Packet) -> bool {
    packet.header.has(flags::FIN) && packet.header.lacks(flags::ACK)
}

impl<T: Transport> Connection<T> {
    /// Initiate a close and wait for ACK+FIN.
    ///
    /// If the budget runs out the connection is closed anyway and
    /// [`RxpError::CloseFailed`] is returned.
    pub async fn close(&mut self) -> Result<()> {
        self.fsm.transition(Event::LocalClose)?;
        log::info!("[fin] closing connection to port {}", self.peer_port);

        let fin = Packet::new(self.header(flags::FIN), vec![0; MAX_PAYLOAD]);
        let mut budget = self.timers.budget();
        self.send(&fin).await?;

        loop {
            match self.recv_within(true).await? {
                Inbound::Timeout => {
                    if !budget.on_timeout() {
                        log::warn!("[fin] no ACK+FIN from port {}; closing anyway", self.peer_port);
                        self.fsm.force_closed();
                        return Err(RxpError::CloseFailed(budget.limit()));
                    }
                    log::debug!("[fin] resending FIN ({}/{})", budget.used(), budget.limit());
                    self.send(&fin).await?;
                }
                Inbound::Dropped => {}
                Inbound::Packet(packet) if packet.header.has(flags::ACK | flags::FIN) => {
                    self.fsm.transition(Event::FinAcked)?;
                    log::info!("[fin] CLOSED");
                    return Ok(());
                }
                Inbound::Packet(packet) if is_bare_fin(&packet) => {
                    // Both sides closing at once.
                    let reply = Packet::new(self.header(flags::ACK | flags::FIN), vec![0; MAX_PAYLOAD]);
                    self.send(&reply).await?;
                }
                Inbound::Packet(_) => {}
            }
        }
    }

    /// Answer the peer's FIN and stay until it goes quiet.
    pub async fn respond_to_close(&mut self) -> Result<()> {
        self.close_requested = false;
        self.fsm.transition(Event::PeerFin)?;
        log::info!("[fin] peer port {} is closing", self.peer_port);

        let reply = Packet::new(self.header(flags::ACK | flags::FIN), vec![0; MAX_PAYLOAD]);
        self.send(&reply).await?;

        loop {
            match self.recv_within(true).await? {
                Inbound::Timeout => break,
                Inbound::Dropped => {}
                Inbound::Packet(packet) if is_bare_fin(&packet) => {
                    self.fsm.transition(Event::PeerFin)?;
                    log::debug!("[fin] repeated FIN; resending ACK+FIN");
                    self.send(&reply).await?;
                }
                Inbound::Packet(_) => {}
            }
        }

        self.fsm.transition(Event::CloseQuiet)?;
        log::info!("[fin] CLOSED");
        Ok(())
    }

    /// Answer a close that was deferred during a transfer, if any.
    pub async fn finish_deferred_close(&mut self) -> Result<bool> {
        if !self.close_requested {
            return Ok(false);
        }
        self.respond_to_close().await?;
        Ok(true)
    }

    /// While idle, wait up to `wait` for the peer to close.
    ///
    /// Returns `true` if a FIN arrived and the close was answered.  Anything
    /// else received in the meantime is dropped.
    pub async fn poll_peer_close(&mut self, wait: Duration) -> Result<bool> {
        if !self.close_requested {
            self.await_peer_fin(wait).await?;
        }
        self.finish_deferred_close().await
    }

    /// While idle, wait up to `wait` for a FIN and record it as a deferred
    /// close without answering it.
    ///
    /// Cancel-safe: dropping the future loses no protocol state.  Returns
    /// [`Connection::close_requested`].
    pub async fn await_peer_fin(&mut self, wait: Duration) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + wait;
        while !self.close_requested {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let packet = match timeout(remaining, self.transport.recv()).await {
                Err(_elapsed) => break,
                Ok(Err(SocketError::Packet(e))) => {
                    log::debug!("[fin] dropping corrupt datagram: {e}");
                    continue;
                }
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok(packet)) => packet,
            };
            let h = &packet.header;
            if h.source_port != self.peer_port || h.destination_port != self.local_port {
                continue;
            }
            if !self.defer_if_fin(&packet) {
                log::trace!("[fin] ignoring flags={:#010b} while idle", h.flags);
            }
        }
        Ok(self.close_requested)
    }
}
