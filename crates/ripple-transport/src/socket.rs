//! # Socket
//!
//! [`RippleSocket`] owns the UDP sockets (one per address family), the
//! connection table and the event queue, and runs three kinds of threads:
//!
//! ```text
//!  socket threads ──raw datagram──▶ [raw queue] ──▶ processing threads ─┐
//!        │ (inline when processing_threads = 0)                         │
//!        └──────────────────────────────────────────────────────────────┤
//!  logic threads ── update() every logic_interval ──────────────────────┤
//!                                                                       ▼
//!                                                              [event queue] ──▶ poll()
//! ```
//!
//! Both queues are bounded; a full queue blocks its producer until the
//! consumer catches up or the socket stops. Work done on the caller's own
//! thread (`disconnect`, manual pumping) never waits on the event queue: the
//! caller is its consumer, so a full queue drops the event with a warning.
//! With every thread count at zero
//! the caller drives the socket through [`RippleSocket::run_receive_once`]
//! and [`RippleSocket::run_logic_once`].
//!
//! Connections are found by endpoint through a hash map behind a read/write
//! lock, and by [`ConnectionHandle`] through a slab whose slots carry a
//! generation.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};
use quanta::Instant;
use rand::RngExt as _;
use slab::Slab;
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread;
use std::time::Duration;

use crate::config::SocketConfig;
use crate::connection::{lock, Connection, ConnectionState, Outcome, Transmit};
use crate::error::{Result, TransportError};
use crate::event::{ConnectionHandle, NetworkEvent};
use crate::hashcash::{self, ReplaySet};
use crate::memory::{HeapMemory, MemoryManager};
use crate::stats::{ConnectionStats, SocketStats};
use crate::wire::{ConnectionRequest, MergedDatagrams, MessageType};

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

/// Per-message send flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Send immediately instead of batching through the merger.
    pub no_merge: bool,
    /// Reported back through [`NetworkEvent::AckNotification`] once a
    /// reliable channel has the whole message acknowledged.
    pub notification_key: Option<u64>,
}

/// How a producer behaves when the event queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backpressure {
    /// Socket and logic threads: wait for the caller to poll.
    Block,
    /// The caller's own thread: it is the consumer, so never wait.
    Drop,
}

#[derive(Debug, Clone, Copy)]
enum Family {
    V4,
    V6,
}

// ─── Shared state ───────────────────────────────────────────────────────────

struct Shared {
    config: Arc<SocketConfig>,
    memory: MemoryManager,
    ipv4: Option<UdpSocket>,
    ipv6: Option<UdpSocket>,
    local_addrs: Vec<SocketAddr>,
    /// Lock order: `endpoints` before `connections`.
    endpoints: RwLock<HashMap<SocketAddr, ConnectionHandle>>,
    connections: RwLock<Slab<Arc<Connection>>>,
    next_generation: AtomicU32,
    replay: Mutex<ReplaySet>,
    counters: crate::stats::SocketCounters,
    events_tx: Sender<NetworkEvent>,
    events_rx: Receiver<NetworkEvent>,
    raw_tx: Sender<(SocketAddr, HeapMemory)>,
    raw_rx: Receiver<(SocketAddr, HeapMemory)>,
    running: AtomicBool,
}

impl Transmit for Shared {
    fn transmit(&self, endpoint: SocketAddr, datagram: &[u8]) {
        let Some(socket) = self.socket_for(endpoint) else {
            tracing::debug!(%endpoint, "no socket for address family");
            return;
        };
        match socket.send_to(datagram, endpoint) {
            Ok(_) => self.counters.record_out(datagram.len()),
            Err(e) => tracing::debug!(%endpoint, error = %e, "send failed"),
        }
    }
}

impl Shared {
    fn socket_for(&self, endpoint: SocketAddr) -> Option<&UdpSocket> {
        match endpoint {
            SocketAddr::V4(_) => self.ipv4.as_ref(),
            SocketAddr::V6(_) => self.ipv6.as_ref(),
        }
    }

    fn socket(&self, family: Family) -> Option<&UdpSocket> {
        match family {
            Family::V4 => self.ipv4.as_ref(),
            Family::V6 => self.ipv6.as_ref(),
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    // ── Connection table ────────────────────────────────────────────────

    fn lookup(&self, endpoint: SocketAddr) -> Option<Arc<Connection>> {
        let handle = *read(&self.endpoints).get(&endpoint)?;
        self.get(handle)
    }

    fn get(&self, handle: ConnectionHandle) -> Option<Arc<Connection>> {
        read(&self.connections)
            .get(handle.index())
            .filter(|conn| conn.handle() == handle)
            .cloned()
    }

    fn register(
        &self,
        endpoint: SocketAddr,
        build: impl FnOnce(ConnectionHandle) -> Connection,
    ) -> Result<Arc<Connection>> {
        let mut endpoints = write(&self.endpoints);
        if endpoints.contains_key(&endpoint) {
            return Err(TransportError::AlreadyConnected(endpoint));
        }
        let mut connections = write(&self.connections);
        if connections.len() >= self.config.max_connections {
            return Err(TransportError::ConnectionLimit);
        }
        let entry = connections.vacant_entry();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let handle = ConnectionHandle::new(entry.key(), generation);
        let conn = Arc::new(build(handle));
        entry.insert(conn.clone());
        endpoints.insert(endpoint, handle);
        Ok(conn)
    }

    /// Take a connection out of both tables and return its buffers to the
    /// arena.
    fn remove(&self, handle: ConnectionHandle) -> Option<Arc<Connection>> {
        let conn = {
            let mut endpoints = write(&self.endpoints);
            let mut connections = write(&self.connections);
            match connections.get(handle.index()) {
                Some(conn) if conn.handle() == handle => {}
                _ => return None,
            }
            let conn = connections.remove(handle.index());
            if endpoints.get(&conn.endpoint()) == Some(&handle) {
                endpoints.remove(&conn.endpoint());
            }
            conn
        };
        conn.release();
        tracing::debug!(handle = %handle, endpoint = %conn.endpoint(), "connection removed");
        Some(conn)
    }

    fn snapshot(&self) -> Vec<Arc<Connection>> {
        read(&self.connections)
            .iter()
            .map(|(_, conn)| conn.clone())
            .collect()
    }

    // ── Queues ──────────────────────────────────────────────────────────

    fn push_event(&self, event: NetworkEvent, mode: Backpressure) {
        if mode == Backpressure::Drop || !self.is_running() {
            if let Err(TrySendError::Full(event)) = self.events_tx.try_send(event) {
                tracing::warn!(?event, "event queue full, event dropped");
            }
            return;
        }
        let mut event = event;
        loop {
            match self.events_tx.send_timeout(event, self.config.socket_poll_timeout) {
                Ok(()) => return,
                Err(SendTimeoutError::Timeout(back)) if self.is_running() => event = back,
                Err(SendTimeoutError::Timeout(back)) | Err(SendTimeoutError::Disconnected(back)) => {
                    tracing::debug!(event = ?back, "socket stopping, event dropped");
                    return;
                }
            }
        }
    }

    fn push_events(&self, events: Vec<NetworkEvent>, mode: Backpressure) {
        for event in events {
            if matches!(event, NetworkEvent::Timeout { .. }) {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
            }
            self.push_event(event, mode);
        }
    }

    fn enqueue_raw(&self, from: SocketAddr, block: HeapMemory) {
        let mut item = (from, block);
        loop {
            match self.raw_tx.send_timeout(item, self.config.socket_poll_timeout) {
                Ok(()) => return,
                Err(SendTimeoutError::Timeout(back)) if self.is_running() => item = back,
                Err(_) => return,
            }
        }
    }

    // ── Receive path ────────────────────────────────────────────────────

    /// Read one datagram. `Ok(false)` when the read timed out.
    fn receive(&self, socket: &UdpSocket, offload: bool, mode: Backpressure) -> io::Result<bool> {
        let mut block = self.memory.alloc(self.config.max_mtu as usize);
        match socket.recv_from(&mut block) {
            Ok((len, from)) => {
                block.truncate(len);
                if offload {
                    self.enqueue_raw(from, block);
                } else {
                    self.dispatch(from, &block, Instant::now(), mode);
                }
                Ok(true)
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(false)
            }
            // ICMP port unreachable surfaces here on some platforms.
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Route one datagram by its header byte.
    fn dispatch(&self, from: SocketAddr, datagram: &[u8], now: Instant, mode: Backpressure) {
        self.counters.record_in(datagram.len());
        let Some((&first, body)) = datagram.split_first() else {
            self.counters.dropped();
            return;
        };
        let Some(kind) = MessageType::from_byte(first) else {
            tracing::debug!(%from, header = first, "unknown message type");
            self.counters.dropped();
            return;
        };

        let mut events = Vec::new();
        match kind {
            MessageType::ConnectionRequest => {
                self.on_connection_request(from, body, datagram.len(), now);
            }
            MessageType::UnconnectedData => {
                if self.config.allow_unconnected_messages {
                    events.push(NetworkEvent::UnconnectedData {
                        endpoint: from,
                        data: self.memory.alloc_copy(body),
                    });
                } else {
                    tracing::debug!(%from, "unconnected message while disabled");
                    self.counters.dropped();
                }
            }
            MessageType::Broadcast => {
                if self.config.allow_broadcasts {
                    events.push(NetworkEvent::BroadcastData {
                        endpoint: from,
                        data: self.memory.alloc_copy(body),
                    });
                } else {
                    tracing::debug!(%from, "broadcast while disabled");
                    self.counters.dropped();
                }
            }
            _ => {
                let Some(conn) = self.lookup(from) else {
                    tracing::trace!(%from, ?kind, "datagram from unknown endpoint");
                    self.counters.dropped();
                    return;
                };
                conn.record_datagram_in(datagram.len());
                let outcome = if kind == MessageType::Merge {
                    self.dispatch_merged(&conn, body, now, &mut events)
                } else {
                    conn.handle_datagram(kind, body, datagram.len(), now, self, &mut events)
                };
                if outcome == Outcome::Closed {
                    self.remove(conn.handle());
                }
            }
        }
        self.push_events(events, mode);
    }

    /// Unpack one level of a `Merge` batch.
    fn dispatch_merged(
        &self,
        conn: &Connection,
        body: &[u8],
        now: Instant,
        events: &mut Vec<NetworkEvent>,
    ) -> Outcome {
        let mut merged = MergedDatagrams::new(body);
        for sub in merged.by_ref() {
            let kind = sub.first().and_then(|&b| MessageType::from_byte(b));
            let Some(kind) = kind.filter(|k| {
                !matches!(
                    k,
                    MessageType::Merge
                        | MessageType::ConnectionRequest
                        | MessageType::UnconnectedData
                        | MessageType::Broadcast
                )
            }) else {
                tracing::debug!(endpoint = %conn.endpoint(), "invalid message inside merge");
                self.counters.dropped();
                continue;
            };
            if conn.handle_datagram(kind, &sub[1..], sub.len(), now, self, events) == Outcome::Closed {
                return Outcome::Closed;
            }
        }
        if merged.is_malformed() {
            tracing::debug!(endpoint = %conn.endpoint(), "malformed merge batch");
            self.counters.dropped();
        }
        Outcome::Alive
    }

    fn reject(&self, from: SocketAddr, reason: &str) {
        tracing::debug!(%from, reason, "connection request rejected");
        self.counters.rejected();
    }

    fn on_connection_request(&self, from: SocketAddr, body: &[u8], datagram_len: usize, now: Instant) {
        let config = &self.config;
        if datagram_len < config.amplification_prevention_padding {
            return self.reject(from, "request below amplification padding");
        }
        let mut buf = body;
        let Some(request) = ConnectionRequest::decode(&mut buf, config.time_based_connection_challenge)
        else {
            return self.reject(from, "malformed request or protocol mismatch");
        };

        if let Some(existing) = self.lookup(from) {
            existing.resend_challenge_request(now, self);
            return;
        }

        if config.time_based_connection_challenge {
            let Some(pre_solve) = request.pre_solve else {
                return self.reject(from, "missing pre-solve");
            };
            if !pre_solve.is_fresh(hashcash::unix_timestamp(), config.connection_challenge_window) {
                return self.reject(from, "stale pre-solve");
            }
            if !pre_solve.is_solved(config.connection_challenge_difficulty) {
                return self.reject(from, "pre-solve does not validate");
            }
            if !lock(&self.replay).insert(pre_solve.iv) {
                return self.reject(from, "replayed pre-solve");
            }
        }

        let challenge = rand::rng().random::<u64>();
        let registered = self.register(from, |handle| {
            Connection::incoming(
                handle,
                from,
                self.config.clone(),
                self.memory.clone(),
                challenge,
                now,
            )
        });
        match registered {
            Ok(conn) => {
                tracing::debug!(%from, handle = %conn.handle(), "challenge issued");
                conn.start(now, self);
            }
            Err(TransportError::AlreadyConnected(_)) => {}
            Err(_) => self.reject(from, "connection limit reached"),
        }
    }

    // ── Logic ───────────────────────────────────────────────────────────

    /// Tick connections whose slot index falls in partition `part` of
    /// `parts`.
    fn tick(&self, part: usize, parts: usize, now: Instant, mode: Backpressure) {
        let mut events = Vec::new();
        for conn in self.snapshot() {
            if conn.handle().index() % parts != part {
                continue;
            }
            if conn.update(now, self, &mut events) == Outcome::Closed {
                self.remove(conn.handle());
            }
        }
        self.push_events(events, mode);
    }

    fn drain_raw(&self) {
        for (_, block) in self.raw_rx.try_iter() {
            drop(block);
        }
    }
}

// ─── Threads ────────────────────────────────────────────────────────────────

fn socket_loop(shared: Arc<Shared>, family: Family) {
    let offload = shared.config.processing_threads > 0;
    while shared.is_running() {
        let Some(socket) = shared.socket(family) else {
            return;
        };
        if let Err(e) = shared.receive(socket, offload, Backpressure::Block) {
            tracing::warn!(error = %e, ?family, "socket receive failed");
            thread::sleep(shared.config.socket_poll_timeout);
        }
    }
}

fn processing_loop(shared: Arc<Shared>) {
    while shared.is_running() {
        match shared.raw_rx.recv_timeout(shared.config.socket_poll_timeout) {
            Ok((from, block)) => shared.dispatch(from, &block, Instant::now(), Backpressure::Block),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

fn logic_loop(shared: Arc<Shared>, part: usize, parts: usize) {
    let interval = shared.config.logic_interval;
    let mut next = Instant::now();
    while shared.is_running() {
        let now = Instant::now();
        shared.tick(part, parts, now, Backpressure::Block);
        next = next + interval;
        let after = Instant::now();
        if next > after {
            thread::sleep(next.saturating_duration_since(after));
        } else {
            next = after;
        }
    }
}

// ─── RippleSocket ───────────────────────────────────────────────────────────

/// A bound transport endpoint: accepts and initiates connections, sends on
/// channels, and queues events for [`RippleSocket::poll`].
///
/// Dropping the socket stops its threads; [`RippleSocket::shutdown`] also
/// tells every peer goodbye.
pub struct RippleSocket {
    shared: Arc<Shared>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl std::fmt::Debug for RippleSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RippleSocket")
            .field("local_addrs", &self.shared.local_addrs)
            .field("running", &self.shared.is_running())
            .finish()
    }
}

impl RippleSocket {
    /// Validate `config` and bind the configured sockets. Threads start with
    /// [`RippleSocket::start`].
    pub fn new(config: SocketConfig) -> Result<Self> {
        config.validate()?;

        let bind = |addr: SocketAddr| -> Result<UdpSocket> {
            let socket = UdpSocket::bind(addr).map_err(TransportError::Bind)?;
            if config.socket_poll_timeout.is_zero() {
                socket.set_nonblocking(true)?;
            } else {
                socket.set_read_timeout(Some(config.socket_poll_timeout))?;
            }
            Ok(socket)
        };
        let ipv4 = config.ipv4_bind.map(bind).transpose()?;
        let ipv6 = config.ipv6_bind.map(bind).transpose()?;
        if config.allow_broadcasts {
            if let Some(socket) = &ipv4 {
                socket.set_broadcast(true)?;
            }
        }

        let local_addrs = ipv4
            .iter()
            .chain(ipv6.iter())
            .map(UdpSocket::local_addr)
            .collect::<io::Result<Vec<_>>>()?;
        tracing::info!(?local_addrs, "socket bound");

        let (events_tx, events_rx) = bounded(config.event_queue_size);
        let (raw_tx, raw_rx) = bounded(config.processing_queue_size);
        let memory = MemoryManager::new(config.memory);
        let replay = ReplaySet::new(config.connection_challenge_history);

        Ok(RippleSocket {
            shared: Arc::new(Shared {
                config: Arc::new(config),
                memory,
                ipv4,
                ipv6,
                local_addrs,
                endpoints: RwLock::new(HashMap::new()),
                connections: RwLock::new(Slab::new()),
                next_generation: AtomicU32::new(0),
                replay: Mutex::new(replay),
                counters: Default::default(),
                events_tx,
                events_rx,
                raw_tx,
                raw_rx,
                running: AtomicBool::new(false),
            }),
            threads: Mutex::new(Vec::new()),
        })
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Spawn the socket, processing and logic threads.
    pub fn start(&self) -> Result<()> {
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return Err(TransportError::AlreadyRunning);
        }
        let config = &self.shared.config;
        let mut threads = lock(&self.threads);

        let spawn = |name: String, body: Box<dyn FnOnce() + Send>| {
            thread::Builder::new().name(name).spawn(body)
        };

        let mut spawned: io::Result<()> = Ok(());
        for family in [Family::V4, Family::V6] {
            if self.shared.socket(family).is_none() {
                continue;
            }
            for i in 0..config.socket_threads {
                let shared = self.shared.clone();
                let name = format!("ripple-socket-{family:?}-{i}").to_lowercase();
                match spawn(name, Box::new(move || socket_loop(shared, family))) {
                    Ok(handle) => threads.push(handle),
                    Err(e) => spawned = Err(e),
                }
            }
        }
        for i in 0..config.processing_threads {
            let shared = self.shared.clone();
            match spawn(format!("ripple-proc-{i}"), Box::new(move || processing_loop(shared))) {
                Ok(handle) => threads.push(handle),
                Err(e) => spawned = Err(e),
            }
        }
        let parts = config.logic_threads;
        for part in 0..parts {
            let shared = self.shared.clone();
            match spawn(
                format!("ripple-logic-{part}"),
                Box::new(move || logic_loop(shared, part, parts)),
            ) {
                Ok(handle) => threads.push(handle),
                Err(e) => spawned = Err(e),
            }
        }
        drop(threads);

        if let Err(e) = spawned {
            self.stop();
            return Err(TransportError::Io(e));
        }
        tracing::info!(
            socket_threads = config.socket_threads,
            processing_threads = config.processing_threads,
            logic_threads = config.logic_threads,
            "socket started"
        );
        Ok(())
    }

    /// Signal every thread to stop and wait for them. Datagrams still in the
    /// raw queue are released. Idempotent.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        let handles: Vec<_> = lock(&self.threads).drain(..).collect();
        let joined = !handles.is_empty();
        for handle in handles {
            if handle.join().is_err() {
                tracing::warn!("socket thread panicked");
            }
        }
        self.shared.drain_raw();
        if joined {
            tracing::info!("socket stopped");
        }
    }

    /// Stop, disconnect every peer and release all buffered memory.
    pub fn shutdown(self) {
        self.stop();
        let now = Instant::now();
        let mut events = Vec::new();
        for conn in self.shared.snapshot() {
            conn.disconnect(true, now, &*self.shared, &mut events);
            self.shared.remove(conn.handle());
        }
        drop(events);
        for event in self.shared.events_rx.try_iter() {
            drop(event);
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    // ── Connections ─────────────────────────────────────────────────────

    /// Start a handshake with `endpoint`. A `Connect` event follows once it
    /// completes, a `Timeout` if it does not.
    pub fn connect(&self, endpoint: SocketAddr) -> Result<ConnectionHandle> {
        if self.shared.socket_for(endpoint).is_none() {
            return Err(TransportError::NoSocketForFamily(endpoint));
        }
        let now = Instant::now();
        let shared = &self.shared;
        let pre_solve = Connection::pre_solve(&shared.config, rand::rng().random::<u64>());
        let conn = shared.register(endpoint, |handle| {
            Connection::outgoing(
                handle,
                endpoint,
                shared.config.clone(),
                shared.memory.clone(),
                pre_solve,
                now,
            )
        })?;
        tracing::debug!(%endpoint, handle = %conn.handle(), "connecting");
        conn.start(now, &**shared);
        Ok(conn.handle())
    }

    /// Send `payload` on `channel_id` with default options.
    pub fn send(&self, handle: ConnectionHandle, channel_id: u8, payload: &[u8]) -> Result<()> {
        self.send_with(handle, channel_id, payload, SendOptions::default())
    }

    pub fn send_with(
        &self,
        handle: ConnectionHandle,
        channel_id: u8,
        payload: &[u8],
        options: SendOptions,
    ) -> Result<()> {
        let conn = self.connection(handle)?;
        conn.send(
            channel_id,
            payload,
            options.no_merge,
            options.notification_key,
            Instant::now(),
            &*self.shared,
        )
    }

    /// Close a connection, optionally notifying the peer. A `Disconnect`
    /// event is queued.
    pub fn disconnect(&self, handle: ConnectionHandle, send_message: bool) -> Result<()> {
        let conn = self.connection(handle)?;
        let mut events = Vec::new();
        conn.disconnect(send_message, Instant::now(), &*self.shared, &mut events);
        self.shared.remove(handle);
        self.shared.push_events(events, Backpressure::Drop);
        Ok(())
    }

    /// Send a connectionless datagram.
    pub fn send_unconnected(&self, endpoint: SocketAddr, payload: &[u8]) -> Result<()> {
        if !self.shared.config.allow_unconnected_messages {
            return Err(TransportError::UnconnectedDisabled);
        }
        self.send_raw(MessageType::UnconnectedData, endpoint, payload)
    }

    /// Send a datagram to the IPv4 broadcast address on `port`.
    pub fn send_broadcast(&self, port: u16, payload: &[u8]) -> Result<()> {
        if !self.shared.config.allow_broadcasts {
            return Err(TransportError::BroadcastDisabled);
        }
        let endpoint = SocketAddr::from((Ipv4Addr::BROADCAST, port));
        self.send_raw(MessageType::Broadcast, endpoint, payload)
    }

    fn send_raw(&self, kind: MessageType, endpoint: SocketAddr, payload: &[u8]) -> Result<()> {
        let socket = self
            .shared
            .socket_for(endpoint)
            .ok_or(TransportError::NoSocketForFamily(endpoint))?;
        let max = self.shared.config.min_mtu as usize - 1;
        if payload.len() > max {
            return Err(TransportError::PayloadTooLarge {
                size: payload.len(),
                max,
            });
        }
        let mut datagram = self.shared.memory.alloc(payload.len() + 1);
        datagram[0] = kind as u8;
        datagram[1..].copy_from_slice(payload);
        socket.send_to(&datagram, endpoint)?;
        self.shared.counters.record_out(datagram.len());
        Ok(())
    }

    // ── Events ──────────────────────────────────────────────────────────

    /// Next queued event, if any.
    pub fn poll(&self) -> Option<NetworkEvent> {
        self.shared.events_rx.try_recv().ok()
    }

    /// Wait up to `timeout` for the next event.
    pub fn poll_timeout(&self, timeout: Duration) -> Option<NetworkEvent> {
        self.shared.events_rx.recv_timeout(timeout).ok()
    }

    // ── Manual pumping ──────────────────────────────────────────────────

    /// Read and process at most one datagram per bound socket, waiting up to
    /// `socket_poll_timeout` on each. Returns how many were processed.
    pub fn run_receive_once(&self) -> Result<usize> {
        let mut processed = 0;
        for family in [Family::V4, Family::V6] {
            if let Some(socket) = self.shared.socket(family) {
                if self.shared.receive(socket, false, Backpressure::Drop)? {
                    processed += 1;
                }
            }
        }
        Ok(processed)
    }

    /// Tick every connection once.
    pub fn run_logic_once(&self) {
        self.shared.tick(0, 1, Instant::now(), Backpressure::Drop);
    }

    // ── Introspection ───────────────────────────────────────────────────

    fn connection(&self, handle: ConnectionHandle) -> Result<Arc<Connection>> {
        self.shared
            .get(handle)
            .ok_or(TransportError::UnknownConnection)
    }

    pub fn connection_state(&self, handle: ConnectionHandle) -> Option<ConnectionState> {
        self.shared.get(handle).map(|c| c.state())
    }

    pub fn connection_rtt(&self, handle: ConnectionHandle) -> Option<Duration> {
        self.shared.get(handle).map(|c| c.rtt())
    }

    pub fn connection_mtu(&self, handle: ConnectionHandle) -> Option<u16> {
        self.shared.get(handle).map(|c| c.mtu())
    }

    pub fn connection_stats(&self, handle: ConnectionHandle) -> Option<ConnectionStats> {
        self.shared.get(handle).map(|c| c.stats())
    }

    /// Every live connection, pending handshakes included.
    pub fn connections(&self) -> Vec<(ConnectionHandle, SocketAddr)> {
        read(&self.shared.connections)
            .iter()
            .map(|(_, c)| (c.handle(), c.endpoint()))
            .collect()
    }

    pub fn stats(&self) -> SocketStats {
        let connections = read(&self.shared.connections).len();
        self.shared
            .counters
            .snapshot(connections, self.shared.memory.stats())
    }

    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.shared.local_addrs
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.shared.memory
    }

    pub fn config(&self) -> &SocketConfig {
        &self.shared.config
    }
}

impl Drop for RippleSocket {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manual_config() -> SocketConfig {
        SocketConfig {
            ipv4_bind: Some("127.0.0.1:0".parse().unwrap()),
            socket_threads: 0,
            logic_threads: 0,
            socket_poll_timeout: Duration::from_millis(5),
            ..SocketConfig::default()
        }
    }

    #[test]
    fn binds_and_reports_address() {
        let socket = RippleSocket::new(manual_config()).unwrap();
        let addrs = socket.local_addrs();
        assert_eq!(addrs.len(), 1);
        assert_ne!(addrs[0].port(), 0);
        assert!(!socket.is_running());
    }

    #[test]
    fn start_twice_fails() {
        let socket = RippleSocket::new(manual_config()).unwrap();
        socket.start().unwrap();
        assert!(matches!(socket.start(), Err(TransportError::AlreadyRunning)));
        socket.stop();
        assert!(!socket.is_running());
    }

    #[test]
    fn connect_requires_matching_family() {
        let socket = RippleSocket::new(manual_config()).unwrap();
        let err = socket.connect("[::1]:9000".parse().unwrap()).unwrap_err();
        assert!(matches!(err, TransportError::NoSocketForFamily(_)));
    }

    #[test]
    fn duplicate_connect_rejected() {
        let socket = RippleSocket::new(manual_config()).unwrap();
        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let handle = socket.connect(peer).unwrap();
        assert_eq!(
            socket.connection_state(handle),
            Some(ConnectionState::RequestingConnection)
        );
        assert!(matches!(
            socket.connect(peer),
            Err(TransportError::AlreadyConnected(_))
        ));
        assert_eq!(socket.connections(), vec![(handle, peer)]);
    }

    #[test]
    fn stale_handle_is_unknown() {
        let socket = RippleSocket::new(manual_config()).unwrap();
        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let first = socket.connect(peer).unwrap();
        socket.disconnect(first, false).unwrap();
        let second = socket.connect(peer).unwrap();
        assert_eq!(first.index(), second.index());
        assert_ne!(first, second);
        assert!(matches!(
            socket.send(first, 0, b"x"),
            Err(TransportError::UnknownConnection)
        ));
        assert!(matches!(
            socket.send(second, 0, b"x"),
            Err(TransportError::NotConnected)
        ));
    }

    #[test]
    fn unconnected_messages_gated() {
        let socket = RippleSocket::new(manual_config()).unwrap();
        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
        assert!(matches!(
            socket.send_unconnected(peer, b"hi"),
            Err(TransportError::UnconnectedDisabled)
        ));
        assert!(matches!(
            socket.send_broadcast(9, b"hi"),
            Err(TransportError::BroadcastDisabled)
        ));
    }

    #[test]
    fn small_connection_request_rejected() {
        let socket = RippleSocket::new(manual_config()).unwrap();
        let from: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        socket
            .shared
            .dispatch(
                from,
                &[MessageType::ConnectionRequest as u8; 16],
                Instant::now(),
                Backpressure::Drop,
            );
        let stats = socket.stats();
        assert_eq!(stats.rejected_handshakes, 1);
        assert_eq!(stats.connections, 0);
    }

    #[test]
    fn unknown_endpoint_data_dropped() {
        let socket = RippleSocket::new(manual_config()).unwrap();
        let from: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        socket
            .shared
            .dispatch(from, &[MessageType::Data as u8, 0, 0, 1], Instant::now(), Backpressure::Drop);
        socket
            .shared
            .dispatch(from, &[0xEE], Instant::now(), Backpressure::Drop);
        assert_eq!(socket.stats().dropped_datagrams, 2);
        assert!(socket.poll().is_none());
    }
}
