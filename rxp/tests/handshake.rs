//! Integration tests for the challenge/response handshake.
//!
//! Each test runs a real server (or a raw socket playing one side) on
//! loopback and verifies the state both sides end up in.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rxp::{
    handshake::challenge_digest,
    packet::{flags, Header, Packet},
    simulator::{Direction, Fault, Simulator, SimulatorConfig},
    socket::{PeerSocket, Socket},
    state::{ConnectionState, Role},
    timer::TimerConfig,
    Client, ClientConfig, Connection, MemoryStore, RxpError, Server, ServerConfig, ServerHandle,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn timers() -> TimerConfig {
    TimerConfig::default()
        .with_read_timeout(Duration::from_millis(100))
        .with_max_retries(4)
}

async fn start_server() -> ServerHandle {
    let config = ServerConfig {
        rxp_port: 3251,
        timers: timers(),
    };
    Server::bind(loopback(), config, Arc::new(MemoryStore::new()))
        .await
        .expect("bind server")
        .spawn()
}

fn client_config() -> ClientConfig {
    ClientConfig {
        rxp_port: 4000,
        server_port: 3251,
        timers: timers(),
    }
}

async fn recv(socket: &Socket, within: Duration) -> Option<Packet> {
    tokio::time::timeout(within, socket.recv_from())
        .await
        .ok()
        .map(|r| r.expect("decode").0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// Both sides reach `Established` and the client learns the server's port.
#[tokio::test]
async fn handshake_both_sides_reach_established() {
    let server = start_server().await;
    let mut client = Client::bind(
        loopback(),
        server.local_addr(),
        client_config(),
        Arc::new(MemoryStore::new()),
    )
    .await
    .unwrap();

    tokio::time::timeout(Duration::from_secs(5), client.connect())
        .await
        .expect("connect timed out")
        .expect("connect failed");

    assert_eq!(client.state(), ConnectionState::Established);
    assert_eq!(client.connection().peer_port(), 3251);
    assert_eq!(client.connection().counters(), (0, 0));

    client.disconnect().await.unwrap();
    let reports = server.terminate().await.unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].peer_port, 4000);
}

/// A server that never answers exhausts the retry budget.
#[tokio::test]
async fn connect_to_silent_peer_times_out() {
    let silent = Socket::bind(loopback()).await.unwrap();
    let mut client = Client::bind(
        loopback(),
        silent.local_addr,
        client_config(),
        Arc::new(MemoryStore::new()),
    )
    .await
    .unwrap();

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, RxpError::ConnectTimeout(4)), "{err}");
    assert_eq!(client.state(), ConnectionState::Closed);

    // SYN plus one resend per timeout.
    let mut syns = 0;
    while let Some(p) = recv(&silent, Duration::from_millis(20)).await {
        assert_eq!(p.header.flags, flags::SYN);
        syns += 1;
    }
    assert_eq!(syns, 5);
}

/// A corrupted SYN+ACK is dropped; the resent SYN gets the same challenge.
#[tokio::test]
async fn corrupted_challenge_is_recovered_by_resend() {
    let server = start_server().await;
    let socket = Socket::bind(loopback()).await.unwrap();
    let transport = Simulator::new(
        PeerSocket::new(socket, server.local_addr()),
        SimulatorConfig::scripted(vec![(Direction::Inbound, 0, Fault::Corrupt)]),
    );
    let mut client = Client::with_transport(transport, client_config(), Arc::new(MemoryStore::new()));

    client.connect().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Established);
    assert_eq!(client.connection().transport().stats().corrupted, 1);

    client.disconnect().await.unwrap();
    server.terminate().await.unwrap();
}

/// A lost final ACK is recovered: the resent hash is answered again.
#[tokio::test]
async fn lost_final_ack_is_resent() {
    let server = start_server().await;
    let socket = Socket::bind(loopback()).await.unwrap();
    let transport = Simulator::new(
        PeerSocket::new(socket, server.local_addr()),
        SimulatorConfig::scripted(vec![(Direction::Inbound, 1, Fault::Drop)]),
    );
    let mut client = Client::with_transport(transport, client_config(), Arc::new(MemoryStore::new()));

    client.connect().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Established);
    assert_eq!(client.connection().transport().stats().dropped, 1);

    client.disconnect().await.unwrap();
    server.terminate().await.unwrap();
}

/// A wrong hash is ignored; the right one completes the handshake.
#[tokio::test]
async fn wrong_hash_is_refused() {
    let server_socket = Socket::bind(loopback()).await.unwrap();
    let server_addr = server_socket.local_addr;
    let raw = Socket::bind(loopback()).await.unwrap();

    let server_task = tokio::spawn(async move {
        let (syn, peer) = server_socket.recv_from().await.unwrap();
        let timers = TimerConfig::default()
            .with_read_timeout(Duration::from_millis(200))
            .with_max_retries(5);
        let mut conn = Connection::new(
            PeerSocket::new(server_socket, peer),
            Role::Server,
            3251,
            0,
            timers,
        );
        conn.accept_with(syn, || "abc123".to_owned()).await.map(|()| conn.state())
    });

    let syn = Packet::new(Header::new(4000, 3251, 0, 0, flags::SYN), Vec::new());
    raw.send_to(&syn, server_addr).await.unwrap();
    let challenge = recv(&raw, Duration::from_secs(1)).await.expect("challenge");
    assert!(challenge.header.has(flags::SYN | flags::ACK));
    assert_eq!(challenge.payload, b"abc123");
    assert_eq!(challenge.header.destination_port, 4000);

    let wrong = Packet::new(
        Header::new(4000, 3251, 0, 0, flags::ACK),
        challenge_digest(b"abc124"),
    );
    raw.send_to(&wrong, server_addr).await.unwrap();
    assert!(recv(&raw, Duration::from_millis(100)).await.is_none());

    let right = Packet::new(
        Header::new(4000, 3251, 0, 0, flags::ACK),
        challenge_digest(b"abc123"),
    );
    raw.send_to(&right, server_addr).await.unwrap();
    let ack = recv(&raw, Duration::from_secs(1)).await.expect("final ACK");
    assert_eq!(ack.header.flags, flags::ACK);
    assert_eq!(ack.header.source_port, 3251);

    let state = server_task.await.unwrap().unwrap();
    assert_eq!(state, ConnectionState::Established);
}
