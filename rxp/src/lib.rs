//! `rxp` — a reliable, connection-oriented file-transfer protocol over UDP.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────┐   segments   ┌──────────┐
//!  │  Sender  │─────────────▶│ Receiver │
//!  └────┬─────┘              └─────┬────┘
//!       │        ACKs              │
//!       │◀─────────────────────────┘
//!       │
//!  ┌────▼──────────────────────────────┐
//!  │           Connection              │   handshake / transfer / teardown
//!  │  (owns state machine + transport) │
//!  └────┬──────────────────────────────┘
//!       │ packets
//!  ┌────▼──────┐  PeerSocket (client) · SessionLink (server) · Simulator
//!  │ Transport │
//!  └────┬──────┘
//!  ┌────▼──────┐
//!  │  Socket   │  (thin async wrapper around tokio UdpSocket)
//!  └───────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`packet`]      — wire format (serialise / deserialise, CRC32)
//! - [`assembler`]   — file segmentation and reassembly
//! - [`state`]       — finite-state-machine types
//! - [`timer`]       — read timeout and retry budgets
//! - [`sender`]      — stop-and-wait outbound segment state
//! - [`receiver`]    — stop-and-wait inbound segment state
//! - [`connection`]  — per-connection lifecycle and shared plumbing
//! - [`handshake`]   — challenge/response connection setup
//! - [`transfer`]    — GET and POST
//! - [`teardown`]    — FIN exchange
//! - [`store`]       — file sources and sinks
//! - [`client`]      — client facade
//! - [`server`]      — multi-session server
//! - [`simulator`]   — fault-injecting transport for testing
//! - [`socket`]      — async UDP socket and the transport seam
//! - [`error`]       — caller-facing errors

pub mod assembler;
pub mod client;
pub mod connection;
pub mod error;
pub mod handshake;
pub mod packet;
pub mod receiver;
pub mod sender;
pub mod server;
pub mod simulator;
pub mod socket;
pub mod state;
pub mod store;
pub mod teardown;
pub mod timer;
pub mod transfer;

pub use client::{Client, ClientConfig};
pub use connection::Connection;
pub use error::{Operation, Result, RxpError};
pub use server::{Server, ServerConfig, ServerHandle};
pub use store::{DirStore, FileStore, MemoryStore};
