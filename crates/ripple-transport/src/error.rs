use std::io;
use thiserror::Error;

// ── Errors ──────────────────────────────────────────────────────────

/// Errors returned to the local caller. Remote misbehaviour never shows up
/// here; it is logged and dropped (or ends in a Disconnect/Timeout event).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("unknown connection")]
    UnknownConnection,
    #[error("connection is not connected")]
    NotConnected,
    #[error("already connected to {0}")]
    AlreadyConnected(std::net::SocketAddr),
    #[error("connection limit reached")]
    ConnectionLimit,
    #[error("no channel with id {0}")]
    InvalidChannel(u8),
    #[error("payload of {size} bytes exceeds the channel limit of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("socket is not running")]
    NotRunning,
    #[error("socket is already running")]
    AlreadyRunning,
    #[error("no socket bound for the address family of {0}")]
    NoSocketForFamily(std::net::SocketAddr),
    #[error("failed to bind socket: {0}")]
    Bind(#[source] io::Error),
    #[error("socket I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("unconnected messages are disabled")]
    UnconnectedDisabled,
    #[error("broadcasts are disabled")]
    BroadcastDisabled,
}

pub type Result<T, E = TransportError> = std::result::Result<T, E>;
