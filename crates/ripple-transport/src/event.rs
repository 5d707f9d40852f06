//! Events handed to the application through `RippleSocket::poll`.

use std::fmt;
use std::net::SocketAddr;

use serde::Serialize;

use crate::memory::HeapMemory;

/// Stable reference to a connection slot. A reused slot gets a new
/// generation, so stale handles never reach the new occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionHandle {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl ConnectionHandle {
    pub fn new(index: usize, generation: u32) -> Self {
        ConnectionHandle {
            index: index as u32,
            generation,
        }
    }

    pub fn index(&self) -> usize {
        self.index as usize
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// Something the application should know about.
///
/// Payloads are pooled blocks; dropping the event returns them to the arena.
#[derive(Debug)]
pub enum NetworkEvent {
    /// Handshake completed; the connection accepts `send`.
    Connect {
        handle: ConnectionHandle,
        endpoint: SocketAddr,
    },
    /// The peer disconnected, or the connection was closed locally.
    Disconnect {
        handle: ConnectionHandle,
        endpoint: SocketAddr,
    },
    /// Handshake, resend or inactivity limits were exceeded.
    Timeout {
        handle: ConnectionHandle,
        endpoint: SocketAddr,
    },
    /// A message arrived on `channel_id`.
    Data {
        handle: ConnectionHandle,
        channel_id: u8,
        data: HeapMemory,
    },
    /// The peer acknowledged the message sent with `notification_key`.
    AckNotification {
        handle: ConnectionHandle,
        notification_key: u64,
    },
    UnconnectedData {
        endpoint: SocketAddr,
        data: HeapMemory,
    },
    BroadcastData {
        endpoint: SocketAddr,
        data: HeapMemory,
    },
}

impl NetworkEvent {
    /// Connection the event belongs to, if any.
    pub fn handle(&self) -> Option<ConnectionHandle> {
        match self {
            NetworkEvent::Connect { handle, .. }
            | NetworkEvent::Disconnect { handle, .. }
            | NetworkEvent::Timeout { handle, .. }
            | NetworkEvent::Data { handle, .. }
            | NetworkEvent::AckNotification { handle, .. } => Some(*handle),
            NetworkEvent::UnconnectedData { .. } | NetworkEvent::BroadcastData { .. } => None,
        }
    }

    /// Payload bytes for data-carrying events.
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            NetworkEvent::Data { data, .. }
            | NetworkEvent::UnconnectedData { data, .. }
            | NetworkEvent::BroadcastData { data, .. } => Some(&data[..]),
            _ => None,
        }
    }
}
