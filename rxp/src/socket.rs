//! Async UDP socket abstraction.
//!
//! [`Socket`] is a thin wrapper around `tokio::net::UdpSocket` that speaks
//! [`crate::packet::Packet`] instead of raw bytes.  [`Transport`] is the seam
//! the protocol engine is written against: a point-to-point packet pipe to one
//! peer.  [`PeerSocket`] implements it for the client; the server's per-peer
//! sessions use [`crate::server::SessionLink`].  All protocol logic lives
//! elsewhere; this module owns only byte I/O.

use std::future::Future;
use std::net::SocketAddr;

use thiserror::Error;
use tokio::net::UdpSocket;

use crate::packet::{Packet, PacketError, PACKET_SIZE};

/// Errors that can arise from socket operations.
#[derive(Debug, Error)]
pub enum SocketError {
    /// Underlying I/O error from the OS.
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The datagram could not be encoded, or a received one failed to decode.
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),
    /// The other end of an in-process link went away.
    #[error("transport closed")]
    Closed,
}

// ---------------------------------------------------------------------------
// Socket
// ---------------------------------------------------------------------------

/// An async, packet-oriented UDP socket.
///
/// All methods are `&self` so the socket can be shared across tasks.
#[derive(Debug)]
pub struct Socket {
    /// Address this socket is bound to (filled in after OS assigns ephemeral port).
    pub local_addr: SocketAddr,
    inner: UdpSocket,
}

impl Socket {
    /// Bind a new socket to `local_addr`.
    ///
    /// Passing `0.0.0.0:0` lets the OS choose an ephemeral port.
    pub async fn bind(local_addr: SocketAddr) -> Result<Self, SocketError> {
        let inner = UdpSocket::bind(local_addr).await?;
        let local_addr = inner.local_addr()?;
        Ok(Self { local_addr, inner })
    }

    /// Encode `packet` and send it as a single 512-byte datagram to `dest`.
    pub async fn send_to(&self, packet: &Packet, dest: SocketAddr) -> Result<(), SocketError> {
        let bytes = packet.encode()?;
        self.inner.send_to(&bytes, dest).await?;
        Ok(())
    }

    /// Receive the next datagram without decoding it.
    pub async fn recv_raw(&self) -> Result<(Vec<u8>, SocketAddr), SocketError> {
        let mut buf = vec![0u8; PACKET_SIZE];
        let (n, addr) = self.inner.recv_from(&mut buf).await?;
        buf.truncate(n);
        Ok((buf, addr))
    }

    /// Receive the next datagram and decode it into a [`Packet`].
    ///
    /// Returns `(packet, sender_address)`.  Datagrams that fail to decode are
    /// returned as `Err`; the caller decides whether to retry.
    pub async fn recv_from(&self) -> Result<(Packet, SocketAddr), SocketError> {
        let (buf, addr) = self.recv_raw().await?;
        let packet = Packet::decode(&buf)?;
        Ok((packet, addr))
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// A packet pipe to a single peer.
///
/// `recv` must be cancel-safe: the engine bounds every call with
/// `tokio::time::timeout` and drops the future on expiry.  A datagram that
/// fails to decode is reported as `Err(SocketError::Packet(_))`.
pub trait Transport: Send + Sync {
    fn send(&self, packet: &Packet) -> impl Future<Output = Result<(), SocketError>> + Send;

    fn recv(&mut self) -> impl Future<Output = Result<Packet, SocketError>> + Send;
}

/// Client-side transport: a socket plus the one address it talks to.
#[derive(Debug)]
pub struct PeerSocket {
    socket: Socket,
    peer: SocketAddr,
}

impl PeerSocket {
    pub fn new(socket: Socket, peer: SocketAddr) -> Self {
        Self { socket, peer }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl Transport for PeerSocket {
    async fn send(&self, packet: &Packet) -> Result<(), SocketError> {
        self.socket.send_to(packet, self.peer).await
    }

    async fn recv(&mut self) -> Result<Packet, SocketError> {
        loop {
            let (buf, addr) = self.socket.recv_raw().await?;
            if addr != self.peer {
                log::debug!("[sock] dropping datagram from stranger {addr}");
                continue;
            }
            return Ok(Packet::decode(&buf)?);
        }
    }
}
