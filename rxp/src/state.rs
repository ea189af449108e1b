//! Connection finite-state machine (FSM).
//!
//! Both roles share one [`ConnectionState`] enum; each role only ever visits
//! its own subset of it:
//!
//! ```text
//!  client:  CLOSED ──SYN──▶ SYN_SENT ──SYN+ACK──▶ HASH_SENT ──ACK──▶ ESTABLISHED
//!  server:  CLOSED ──SYN──▶ CHALLENGE_SENT ──hash ok──────────────▶ ESTABLISHED
//!
//!  ESTABLISHED ──local close──▶ CLOSE_REQ  ──ACK+FIN──▶ CLOSED
//!  ESTABLISHED ──peer FIN────▶ CLOSE_WAIT ──quiet────▶ CLOSED
//! ```
//!
//! [`StateMachine::transition`] is the only way to move between states, so an
//! illegal move is reported as an [`InvalidTransition`] instead of silently
//! corrupting the connection.

use std::fmt;

/// All possible states of the connection FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No connection exists; initial and final state.
    #[default]
    Closed,
    /// Client sent SYN; waiting for the challenge.
    SynSent,
    /// Server issued a challenge; waiting for its hash.
    ChallengeSent,
    /// Client sent the challenge hash; waiting for the final ACK.
    HashSent,
    /// Handshake complete; GET/POST allowed.
    Established,
    /// Local side sent FIN; waiting for ACK+FIN.
    CloseReq,
    /// Peer's FIN answered with ACK+FIN; waiting for the peer to go quiet.
    CloseWait,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "CLOSED",
            Self::SynSent => "SYN_SENT",
            Self::ChallengeSent => "CHALLENGE_SENT",
            Self::HashSent => "HASH_SENT",
            Self::Established => "ESTABLISHED",
            Self::CloseReq => "CLOSE_REQ",
            Self::CloseWait => "CLOSE_WAIT",
        };
        f.write_str(name)
    }
}

/// Which side of the handshake this connection plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Inputs that drive the FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Client: send the SYN.
    SendSyn,
    /// Client: challenge received, hash sent.
    SendHash,
    /// Client: final handshake ACK received.
    HandshakeAcked,
    /// Server: SYN received, challenge sent (or resent).
    SendChallenge,
    /// Server: hash verified, final ACK sent.
    HashVerified,
    /// Either role: handshake retry budget exhausted.
    HandshakeAborted,
    /// Either role: a GET or POST packet is sent or processed.
    Data,
    /// Local close requested; FIN sent.
    LocalClose,
    /// ACK+FIN received for our FIN.
    FinAcked,
    /// Peer's FIN answered with ACK+FIN.
    PeerFin,
    /// Responder saw no further FINs.
    CloseQuiet,
}

impl Event {
    fn is_handshake(self) -> bool {
        matches!(
            self,
            Self::SendSyn
                | Self::SendHash
                | Self::HandshakeAcked
                | Self::SendChallenge
                | Self::HashVerified
                | Self::HandshakeAborted
        )
    }

    fn is_close(self) -> bool {
        matches!(
            self,
            Self::LocalClose | Self::FinAcked | Self::PeerFin | Self::CloseQuiet
        )
    }
}

/// Rejected move from `from` on `event`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal {role:?} transition from {from} on {event:?}")]
pub struct InvalidTransition {
    pub role: Role,
    pub from: ConnectionState,
    pub event: Event,
}

/// Role-aware FSM holder.
#[derive(Debug, Clone)]
pub struct StateMachine {
    role: Role,
    state: ConnectionState,
}

impl StateMachine {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            state: ConnectionState::Closed,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn current_state(&self) -> ConnectionState {
        self.state
    }

    /// Apply `event`, returning the new state.
    ///
    /// Handshake events are only legal from the handshake states, data events
    /// only from `Established`, close events only from `Established`,
    /// `CloseReq` or `CloseWait`.  The state is unchanged on error.
    pub fn transition(&mut self, event: Event) -> Result<ConnectionState, InvalidTransition> {
        use ConnectionState::*;

        let invalid = InvalidTransition {
            role: self.role,
            from: self.state,
            event,
        };

        let handshake_phase = matches!(self.state, Closed | SynSent | ChallengeSent | HashSent);
        let close_phase = matches!(self.state, Established | CloseReq | CloseWait);
        if (event.is_handshake() && !handshake_phase)
            || (event == Event::Data && self.state != Established)
            || (event.is_close() && !close_phase)
        {
            return Err(invalid);
        }

        let next = match (self.role, self.state, event) {
            (Role::Client, Closed, Event::SendSyn) => SynSent,
            (Role::Client, SynSent, Event::SendHash) => HashSent,
            (Role::Client, HashSent, Event::HandshakeAcked) => Established,

            (Role::Server, Closed | ChallengeSent, Event::SendChallenge) => ChallengeSent,
            (Role::Server, ChallengeSent, Event::HashVerified) => Established,

            (_, _, Event::HandshakeAborted) => Closed,

            (_, Established, Event::Data) => Established,

            (_, Established, Event::LocalClose) => CloseReq,
            (_, CloseReq, Event::FinAcked) => Closed,
            (_, Established, Event::PeerFin) => CloseWait,
            (_, CloseWait, Event::PeerFin) => CloseWait,
            (_, CloseWait, Event::CloseQuiet) => Closed,

            _ => return Err(invalid),
        };

        log::trace!("[fsm] {:?} {} --{:?}--> {}", self.role, self.state, event, next);
        self.state = next;
        Ok(next)
    }

    /// Unconditionally mark the connection closed (used after a failed close).
    pub fn force_closed(&mut self) {
        self.state = ConnectionState::Closed;
    }
}
