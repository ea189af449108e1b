//! Per-connection lifecycle manager.
//!
//! A [`Connection`] owns the complete state for one logical RXP session:
//! RXP ports, the `seq`/`ack` counters, the FSM, the timer configuration and
//! the [`Transport`] to the peer.  Its protocol phases live in sibling
//! modules as further `impl` blocks:
//! - [`crate::handshake`]: `connect` / `accept`.
//! - [`crate::transfer`] : `upload` / `download` and their server mirrors.
//! - [`crate::teardown`] : `close` / `respond_to_close`.
//!
//! This module holds the plumbing they share: building headers, sending,
//! and the bounded receive that classifies every inbound datagram as a usable
//! packet, a silent drop, or a timeout.

use thiserror::Error;
use tokio::time::timeout;

use crate::error::{Result, RxpError};
use crate::packet::{flags, Header, Packet};
use crate::socket::{SocketError, Transport};
use crate::state::{ConnectionState, Role, StateMachine};
use crate::timer::{RetryBudget, TimerConfig};

/// Why a well-formed packet was discarded without a reply.
#[derive(Debug, Error)]
pub enum Discard {
    #[error("port mismatch: got {from_port}->{to_port}, expected {expected_from}->{expected_to}")]
    PortMismatch {
        from_port: u16,
        to_port: u16,
        expected_from: u16,
        expected_to: u16,
    },
}

/// Result of one bounded receive.
#[derive(Debug)]
pub(crate) enum Inbound {
    Packet(Packet),
    Dropped,
    Timeout,
}

/// A single RXP connection over transport `T`.
pub struct Connection<T: Transport> {
    pub(crate) fsm: StateMachine,
    pub(crate) transport: T,
    pub(crate) local_port: u16,
    /// Peer RXP port.  A hint until the handshake completes.
    pub(crate) peer_port: u16,
    pub(crate) seq: u16,
    pub(crate) ack: u16,
    pub(crate) timers: TimerConfig,
    /// Peer asked to close while a transfer was running.
    pub(crate) close_requested: bool,
    /// Packet read ahead by a lingering loop, handed to the next receive.
    stash: Option<Packet>,
    /// Server: final handshake ACK and the hash it answered.
    pub(crate) handshake_ack: Option<(Vec<u8>, Packet)>,
}

impl<T: Transport> Connection<T> {
    /// Create a connection in the initial [`ConnectionState::Closed`] state.
    pub fn new(transport: T, role: Role, local_port: u16, peer_port: u16, timers: TimerConfig) -> Self {
        Self {
            fsm: StateMachine::new(role),
            transport,
            local_port,
            peer_port,
            seq: 0,
            ack: 0,
            timers,
            close_requested: false,
            stash: None,
            handshake_ack: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.fsm.current_state()
    }

    pub fn role(&self) -> Role {
        self.fsm.role()
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn peer_port(&self) -> u16 {
        self.peer_port
    }

    /// Current `(seq, ack)` counters.
    pub fn counters(&self) -> (u16, u16) {
        (self.seq, self.ack)
    }

    pub fn timers(&self) -> TimerConfig {
        self.timers
    }

    /// `true` while a peer FIN seen mid-transfer is still unanswered.
    pub fn close_requested(&self) -> bool {
        self.close_requested
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    // -----------------------------------------------------------------------
    // Shared plumbing
    // -----------------------------------------------------------------------

    /// Header addressed to the peer carrying the current counters.
    pub(crate) fn header(&self, flags: u8) -> Header {
        Header::new(self.local_port, self.peer_port, self.seq, self.ack, flags)
    }

    pub(crate) async fn send(&self, packet: &Packet) -> Result<()> {
        log::trace!(
            "[conn] → flags={:#010b} seq={} ack={} len={}",
            packet.header.flags,
            packet.header.seq,
            packet.header.ack,
            packet.payload.len()
        );
        self.transport.send(packet).await?;
        Ok(())
    }

    fn ports_match(&self, h: &Header) -> std::result::Result<(), Discard> {
        if h.source_port == self.peer_port && h.destination_port == self.local_port {
            Ok(())
        } else {
            Err(Discard::PortMismatch {
                from_port: h.source_port,
                to_port: h.destination_port,
                expected_from: self.peer_port,
                expected_to: self.local_port,
            })
        }
    }

    /// One receive bounded by the read timeout.
    ///
    /// Once established (`check_ports`), packets not addressed from the peer's
    /// RXP port to ours are dropped.
    pub(crate) async fn recv_within(&mut self, check_ports: bool) -> Result<Inbound> {
        if let Some(packet) = self.stash.take() {
            return Ok(Inbound::Packet(packet));
        }

        let packet = match timeout(self.timers.read_timeout, self.transport.recv()).await {
            Err(_elapsed) => return Ok(Inbound::Timeout),
            Ok(Err(SocketError::Packet(e))) => {
                log::debug!("[conn] dropping corrupt datagram: {e}");
                return Ok(Inbound::Dropped);
            }
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(packet)) => packet,
        };

        if check_ports {
            if let Err(discard) = self.ports_match(&packet.header) {
                log::debug!("[conn] dropping packet: {discard}");
                return Ok(Inbound::Dropped);
            }
        }
        Ok(Inbound::Packet(packet))
    }

    /// Wait without a deadline for the next well-formed packet from the peer.
    pub(crate) async fn recv_idle(&mut self) -> Result<Packet> {
        if let Some(packet) = self.stash.take() {
            return Ok(packet);
        }
        loop {
            match self.transport.recv().await {
                Ok(packet) => match self.ports_match(&packet.header) {
                    Ok(()) => return Ok(packet),
                    Err(discard) => log::debug!("[conn] dropping packet: {discard}"),
                },
                Err(SocketError::Packet(e)) => log::debug!("[conn] dropping corrupt datagram: {e}"),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Hand `packet` to the next receive call.
    pub(crate) fn stash(&mut self, packet: Packet) {
        self.stash = Some(packet);
    }

    /// A bare FIN from the peer during a transfer is remembered, not answered.
    pub(crate) fn defer_if_fin(&mut self, packet: &Packet) -> bool {
        let h = &packet.header;
        if h.has(flags::FIN) && h.lacks(flags::ACK) {
            if !self.close_requested {
                log::info!("[fin] peer port {} requested close", self.peer_port);
            }
            self.close_requested = true;
            return true;
        }
        false
    }

    /// Send `request` and wait for a packet `accept` approves, resending on
    /// every timeout until the retry budget runs out (`Ok(None)`).
    pub(crate) async fn exchange<F>(
        &mut self,
        request: &Packet,
        check_ports: bool,
        accept: F,
    ) -> Result<Option<Packet>>
    where
        F: Fn(&Packet) -> bool,
    {
        let mut budget: RetryBudget = self.timers.budget();
        self.send(request).await?;
        loop {
            match self.recv_within(check_ports).await? {
                Inbound::Timeout => {
                    if !budget.on_timeout() {
                        return Ok(None);
                    }
                    log::debug!(
                        "[conn] timeout, resending ({}/{})",
                        budget.used(),
                        budget.limit()
                    );
                    self.send(request).await?;
                }
                Inbound::Dropped => {}
                Inbound::Packet(packet) => {
                    if check_ports && self.defer_if_fin(&packet) {
                        continue;
                    }
                    if accept(&packet) {
                        return Ok(Some(packet));
                    }
                    log::trace!(
                        "[conn] ignoring flags={:#010b} while awaiting reply",
                        packet.header.flags
                    );
                }
            }
        }
    }

    pub(crate) fn require_established(&mut self) -> Result<()> {
        self.fsm
            .transition(crate::state::Event::Data)
            .map(|_| ())
            .map_err(RxpError::from)
    }
}
