//! # ripple-transport
//!
//! Reliable-UDP transport with a proof-of-work handshake.
//!
//! Peers connect through a challenge/response handshake, then exchange
//! messages over a fixed set of channels, each with its own delivery
//! guarantee (unreliable, ordered, sequenced, reliable, fragmented). Small
//! datagrams are batched, the path MTU is probed upwards, and every payload
//! lives in a pooled memory arena shared by all threads of a socket.
//!
//! ## Crate structure
//!
//! - [`socket`] - UDP sockets, dispatcher threads, connection table, event queue
//! - [`connection`] - Handshake, heartbeats, MTU probing, RTT, timeouts
//! - [`channels`] - The seven delivery channels
//! - [`merger`] - Small-datagram batching
//! - [`wire`] - Message headers and handshake encodings
//! - [`memory`] - Pooled buffers and pointer sets
//! - [`sequence`] - Wrapping 16-bit sequence arithmetic and windows
//! - [`hashcash`] - Proof-of-work puzzles and replay protection
//! - [`rtt`] - Round-trip estimation
//! - [`config`] - Socket configuration and TOML loading
//! - [`stats`] - Serializable counters

pub mod channels;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod hashcash;
pub mod memory;
pub mod merger;
pub mod rtt;
pub mod sequence;
pub mod socket;
pub mod stats;
pub mod wire;

pub use config::SocketConfig;
pub use connection::ConnectionState;
pub use error::{Result, TransportError};
pub use event::{ConnectionHandle, NetworkEvent};
pub use memory::{HeapMemory, MemoryManager};
pub use socket::{RippleSocket, SendOptions};
pub use wire::ChannelType;
