//! Error types surfaced to RXP callers.
//!
//! Network anomalies (corrupt checksum, wrong port, out-of-order segment) are
//! never reported here: they are dropped where they are detected and only
//! become visible once a retry budget runs out.

use thiserror::Error;

use crate::socket::SocketError;
use crate::state::InvalidTransition;

/// Which transfer operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Get,
    Post,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Get => "GET",
            Self::Post => "POST",
        })
    }
}

#[derive(Error, Debug)]
pub enum RxpError {
    /// Handshake retry budget exhausted.
    #[error("connect timed out after {0} attempts")]
    ConnectTimeout(u32),
    /// A GET or POST loop ran out of retries.
    #[error("{op} transfer failed: {reason}")]
    TransferFailed { op: Operation, reason: String },
    /// No ACK+FIN arrived for our FIN.
    #[error("close not acknowledged after {0} attempts")]
    CloseFailed(u32),
    /// The named file does not exist (locally for POST, on the peer for GET).
    #[error("file not found: {0}")]
    FileNotFound(String),
    /// A filename that does not fit in one packet payload.
    #[error("filename of {0} bytes does not fit in one segment")]
    NameTooLong(usize),
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
    #[error(transparent)]
    Socket(#[from] SocketError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("server task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl RxpError {
    pub(crate) fn transfer(op: Operation, reason: impl Into<String>) -> Self {
        Self::TransferFailed {
            op,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RxpError>;
