//! Four-way challenge/response handshake.
//!
//! ```text
//!  client                                   server
//!    │ ── SYN (seq 0, ack 0) ─────────────────▶ │  issue challenge
//!    │ ◀──────────────── SYN+ACK [challenge] ── │
//!    │ ── ACK [md5(challenge)] ───────────────▶ │  verify hash
//!    │ ◀───────────────────────────────── ACK ── │
//!  ESTABLISHED                             ESTABLISHED
//! ```
//!
//! The client resends its last packet on every timeout.  The server never
//! resends on its own; it answers each duplicate SYN with the same challenge
//! and each duplicate hash with the same final ACK.

use md5::{Digest, Md5};
use uuid::Uuid;

use crate::connection::{Connection, Inbound};
use crate::error::{Result, RxpError};
use crate::packet::{flags, Header, Packet};
use crate::socket::Transport;
use crate::state::Event;

/// MD5 digest of a challenge, as raw bytes.
pub fn challenge_digest(challenge: &[u8]) -> Vec<u8> {
    Md5::digest(challenge).to_vec()
}

/// Random challenge: two simple-format UUIDs back to back (64 hex chars).
pub fn random_challenge() -> String {
    format!(
        "{}{}",
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    )
}

/// Challenge issued to one peer port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeRecord {
    pub peer_port: u16,
    pub challenge: String,
}

impl ChallengeRecord {
    pub fn new(peer_port: u16, challenge: impl Into<String>) -> Self {
        Self {
            peer_port,
            challenge: challenge.into(),
        }
    }

    /// `true` when `hash` came from the port this challenge was issued to and
    /// equals the challenge's MD5.
    pub fn verify(&self, source_port: u16, hash: &[u8]) -> bool {
        source_port == self.peer_port && challenge_digest(self.challenge.as_bytes()) == hash
    }
}

impl<T: Transport> Connection<T> {
    /// Client side: run the handshake to `Established`.
    pub async fn connect(&mut self) -> Result<()> {
        let attempts = self.timers.max_retries;
        self.fsm.transition(Event::SendSyn)?;
        log::info!("[hs] SYN → port {}", self.peer_port);

        let syn = Packet::new(
            Header::new(self.local_port, self.peer_port, 0, 0, flags::SYN),
            Vec::new(),
        );
        let Some(syn_ack) = self
            .exchange(&syn, false, |p| {
                p.header.has(flags::SYN | flags::ACK) && p.header.lacks(flags::FIN)
            })
            .await?
        else {
            return self.abort_handshake(attempts);
        };

        let hash = challenge_digest(&syn_ack.payload);
        self.fsm.transition(Event::SendHash)?;
        log::debug!(
            "[hs] challenge {:?}; sending hash",
            String::from_utf8_lossy(&syn_ack.payload)
        );

        let response = Packet::new(
            Header::new(self.local_port, self.peer_port, 0, 0, flags::ACK),
            hash,
        );
        let Some(final_ack) = self
            .exchange(&response, false, |p| {
                p.header.has(flags::ACK) && p.header.lacks(flags::SYN | flags::FIN)
            })
            .await?
        else {
            return self.abort_handshake(attempts);
        };

        self.peer_port = final_ack.header.source_port;
        self.fsm.transition(Event::HandshakeAcked)?;
        log::info!(
            "[hs] ESTABLISHED with port {} (local {})",
            self.peer_port,
            self.local_port
        );
        Ok(())
    }

    /// Server side: drive the handshake opened by `syn` using random
    /// challenges.
    pub async fn accept(&mut self, syn: Packet) -> Result<()> {
        self.accept_with(syn, random_challenge).await
    }

    /// Server side with a caller-supplied challenge generator.
    pub async fn accept_with<G>(&mut self, syn: Packet, mut challenge: G) -> Result<()>
    where
        G: FnMut() -> String,
    {
        let attempts = self.timers.max_retries;
        let mut record = ChallengeRecord::new(syn.header.source_port, challenge());
        self.send_challenge(&record).await?;

        let mut budget = self.timers.budget();
        loop {
            let packet = match self.recv_within(false).await? {
                Inbound::Timeout => {
                    if !budget.on_timeout() {
                        log::warn!("[hs] no hash from port {}; abandoning", record.peer_port);
                        return self.abort_handshake(attempts);
                    }
                    continue;
                }
                Inbound::Dropped => continue,
                Inbound::Packet(packet) => packet,
            };
            let h = &packet.header;

            if h.has(flags::SYN) && h.lacks(flags::ACK) {
                if h.source_port != record.peer_port {
                    record = ChallengeRecord::new(h.source_port, challenge());
                }
                budget.reset();
                self.send_challenge(&record).await?;
                continue;
            }

            if h.has(flags::ACK) && h.lacks(flags::SYN) {
                if !record.verify(h.source_port, &packet.payload) {
                    log::warn!(
                        "[hs] hash from port {} does not match challenge; ignoring",
                        h.source_port
                    );
                    continue;
                }
                self.peer_port = record.peer_port;
                let reply = Packet::new(self.header(flags::ACK), Vec::new());
                self.send(&reply).await?;
                self.fsm.transition(Event::HashVerified)?;
                self.handshake_ack = Some((packet.payload.clone(), reply));
                log::info!(
                    "[hs] ESTABLISHED with port {} (local {})",
                    self.peer_port,
                    self.local_port
                );
                return Ok(());
            }

            log::trace!("[hs] ignoring flags={:#010b} during handshake", h.flags);
        }
    }

    /// Server side, once established: a repeated hash means our final ACK was
    /// lost.  Returns `true` if `packet` was such a repeat and was answered.
    pub async fn answer_handshake_retry(&self, packet: &Packet) -> Result<bool> {
        let h = &packet.header;
        let bare_ack = h.flags == flags::ACK;
        match &self.handshake_ack {
            Some((hash, reply)) if bare_ack && *hash == packet.payload => {
                log::debug!("[hs] repeated hash; resending final ACK");
                self.send(reply).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn send_challenge(&mut self, record: &ChallengeRecord) -> Result<()> {
        self.fsm.transition(Event::SendChallenge)?;
        self.peer_port = record.peer_port;
        log::debug!("[hs] challenge → port {}", record.peer_port);
        let packet = Packet::new(
            self.header(flags::SYN | flags::ACK),
            record.challenge.as_bytes().to_vec(),
        );
        self.send(&packet).await
    }

    fn abort_handshake(&mut self, attempts: u32) -> Result<()> {
        self.fsm.transition(Event::HandshakeAborted)?;
        Err(RxpError::ConnectTimeout(attempts))
    }
}
