//! Multi-client RXP server.
//!
//! One UDP socket is shared by every connection:
//!
//! ```text
//!                    ┌──────────────┐  mpsc   ┌──────────────┐
//!   UDP datagrams ──▶│  dispatcher  │────────▶│ session 1    │──┐
//!                    │ (owns recv)  │────────▶│ session 2    │──┤ send_to
//!                    └──────┬───────┘         └──────────────┘  │
//!                           │ ◀──── completion reports ─────────┘
//! ```
//!
//! The dispatcher decodes each datagram and routes it by sender address to
//! that peer's session task; a SYN from an unknown address spawns a new
//! session.  [`ServerHandle::terminate`] flips a shutdown flag: idle sessions
//! close at once, busy ones after their current transfer, and the dispatcher
//! stops accepting SYNs and returns when the last session has finished.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::connection::Connection;
use crate::error::{Result, RxpError};
use crate::packet::{flags, Packet};
use crate::socket::{Socket, SocketError, Transport};
use crate::state::Role;
use crate::store::FileStore;
use crate::timer::TimerConfig;

/// Per-session inbox depth; datagrams beyond it are dropped.
const SESSION_QUEUE: usize = 64;

#[derive(Debug, Clone, Copy)]
pub struct ServerConfig {
    /// RXP port this server answers on.
    pub rxp_port: u16,
    pub timers: TimerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            rxp_port: 3251,
            timers: TimerConfig::default(),
        }
    }
}

/// Which side ended a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosedBy {
    Client,
    Server,
}

/// Summary of a session that ended cleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub peer: SocketAddr,
    pub peer_port: u16,
    pub gets: usize,
    pub posts: usize,
    pub closed_by: ClosedBy,
}

// ---------------------------------------------------------------------------
// SessionLink
// ---------------------------------------------------------------------------

/// Server-side transport for one peer: shared socket out, dispatcher queue in.
pub struct SessionLink {
    socket: Arc<Socket>,
    peer: SocketAddr,
    inbox: mpsc::Receiver<Packet>,
}

impl SessionLink {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl Transport for SessionLink {
    async fn send(&self, packet: &Packet) -> std::result::Result<(), SocketError> {
        self.socket.send_to(packet, self.peer).await
    }

    async fn recv(&mut self) -> std::result::Result<Packet, SocketError> {
        self.inbox.recv().await.ok_or(SocketError::Closed)
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

pub struct Server {
    socket: Arc<Socket>,
    config: ServerConfig,
    store: Arc<dyn FileStore>,
}

impl Server {
    pub async fn bind(
        addr: SocketAddr,
        config: ServerConfig,
        store: Arc<dyn FileStore>,
    ) -> Result<Self> {
        let socket = Socket::bind(addr).await?;
        log::info!(
            "[srv] listening on {} (rxp port {})",
            socket.local_addr,
            config.rxp_port
        );
        Ok(Self {
            socket: Arc::new(socket),
            config,
            store,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr
    }

    /// Run the dispatcher on a background task.
    pub fn spawn(self) -> ServerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let local_addr = self.local_addr();
        let join = tokio::spawn(self.run(shutdown_rx));
        ServerHandle {
            local_addr,
            shutdown_tx,
            join,
        }
    }

    /// Dispatch datagrams until `shutdown` is set and every session is done.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<Vec<SessionReport>> {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<(SocketAddr, Result<SessionReport>)>();
        let mut sessions: HashMap<SocketAddr, mpsc::Sender<Packet>> = HashMap::new();
        let mut reports = Vec::new();
        let mut shutting_down = *shutdown.borrow();

        loop {
            if shutting_down && sessions.is_empty() {
                break;
            }

            tokio::select! {
                received = self.socket.recv_raw() => {
                    let (bytes, addr) = received?;
                    let packet = match Packet::decode(&bytes) {
                        Ok(packet) => packet,
                        Err(e) => {
                            log::debug!("[srv] dropping datagram from {addr}: {e}");
                            continue;
                        }
                    };

                    if let Some(inbox) = sessions.get(&addr) {
                        if inbox.try_send(packet).is_err() {
                            log::debug!("[srv] session {addr} not keeping up; datagram dropped");
                        }
                        continue;
                    }

                    let h = &packet.header;
                    if shutting_down || !(h.has(flags::SYN) && h.lacks(flags::ACK)) {
                        log::debug!("[srv] ignoring flags={:#010b} from unknown peer {addr}", h.flags);
                        continue;
                    }

                    log::info!("[srv] SYN from {addr}; starting session");
                    let (inbox_tx, inbox_rx) = mpsc::channel(SESSION_QUEUE);
                    sessions.insert(addr, inbox_tx);
                    let link = SessionLink {
                        socket: Arc::clone(&self.socket),
                        peer: addr,
                        inbox: inbox_rx,
                    };
                    let store = Arc::clone(&self.store);
                    let config = self.config;
                    let done = done_tx.clone();
                    let stop = shutdown.clone();
                    tokio::spawn(async move {
                        let result = run_session(link, packet, config, store, stop).await;
                        let _ = done.send((addr, result));
                    });
                }

                Some((addr, result)) = done_rx.recv() => {
                    sessions.remove(&addr);
                    match result {
                        Ok(report) => {
                            log::info!(
                                "[srv] session {addr} ended ({} GET, {} POST, closed by {:?})",
                                report.gets, report.posts, report.closed_by
                            );
                            reports.push(report);
                        }
                        Err(e) => log::warn!("[srv] session {addr} failed: {e}"),
                    }
                }

                changed = shutdown.changed(), if !shutting_down => {
                    if changed.is_err() || *shutdown.borrow() {
                        log::info!("[srv] terminating; {} session(s) open", sessions.len());
                        shutting_down = true;
                    }
                }
            }
        }

        log::info!("[srv] stopped");
        Ok(reports)
    }
}

/// Handle to a server running on a background task.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<Result<Vec<SessionReport>>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Request shutdown without waiting.
    pub fn request_terminate(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Close every session and wait for the server to stop.
    pub async fn terminate(self) -> Result<Vec<SessionReport>> {
        self.request_terminate();
        self.join.await?
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

fn shutdown_requested(stop: &watch::Receiver<bool>) -> bool {
    *stop.borrow()
}

async fn run_session(
    link: SessionLink,
    syn: Packet,
    config: ServerConfig,
    store: Arc<dyn FileStore>,
    mut stop: watch::Receiver<bool>,
) -> Result<SessionReport> {
    let peer = link.peer_addr();
    let mut conn = Connection::new(
        link,
        Role::Server,
        config.rxp_port,
        syn.header.source_port,
        config.timers,
    );
    conn.accept(syn).await?;

    let mut report = SessionReport {
        peer,
        peer_port: conn.peer_port(),
        gets: 0,
        posts: 0,
        closed_by: ClosedBy::Client,
    };

    loop {
        if conn.finish_deferred_close().await? {
            return Ok(report);
        }
        if shutdown_requested(&stop) {
            report.closed_by = ClosedBy::Server;
            conn.close().await?;
            return Ok(report);
        }

        let packet = tokio::select! {
            packet = conn.recv_idle() => packet?,
            changed = stop.changed() => {
                if changed.is_err() {
                    // Server dropped without terminating; treat as shutdown.
                    report.closed_by = ClosedBy::Server;
                    conn.close().await?;
                    return Ok(report);
                }
                continue;
            }
        };

        let h = packet.header;
        let (seq, ack) = conn.counters();
        let outcome = if h.has(flags::FIN) && h.lacks(flags::ACK) {
            conn.respond_to_close().await?;
            return Ok(report);
        } else if h.has(flags::GET) && h.lacks(flags::ACK) {
            if h.seq != ack || h.ack != seq {
                log::debug!("[srv] stale GET from {peer} (seq={} ack={}); ignoring", h.seq, h.ack);
                continue;
            }
            report.gets += 1;
            conn.serve_get(&packet, store.as_ref()).await
        } else if h.has(flags::POST) && h.lacks(flags::ACK) {
            // A late duplicate of a finished POST starts a receive that the
            // client's next request or FIN abandons; only stored uploads count.
            let stored = conn.receive_post(&packet, store.as_ref()).await;
            if stored.is_ok() {
                report.posts += 1;
            }
            stored.map(|_| ())
        } else {
            if !conn.answer_handshake_retry(&packet).await? {
                log::trace!("[srv] ignoring flags={:#010b} from {peer} while idle", h.flags);
            }
            continue;
        };

        match outcome {
            Ok(()) => {}
            Err(e @ (RxpError::FileNotFound(_) | RxpError::TransferFailed { .. })) => {
                log::warn!("[srv] {peer}: {e}");
            }
            Err(e) => return Err(e),
        }
    }
}
