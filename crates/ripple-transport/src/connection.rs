//! # Connection
//!
//! Per-peer state machine: handshake, channel set, path-MTU probing,
//! heartbeats, RTT estimation and timeouts.
//!
//! ```text
//!  client  RequestingConnection ──ChallengeRequest──▶ SolvingChallenge ──Hail──▶ Connected
//!  server  RequestingChallenge ──ChallengeResponse (valid)──────────────────────▶ Connected
//!                                                                                    │
//!                                          Disconnect / timeout ◀────────────────────┘
//! ```
//!
//! Both sides resend their current handshake message every
//! `handshake_resend_delay` until the next step arrives; after
//! `max_handshake_resends` sends the connection times out.
//!
//! Locking: `inner` holds handshake and timing state, each channel has its
//! own lock, and the merger has one more. Acquisition order is
//! `inner → channel → merger`, and `inner` is never taken while a channel is
//! held, so receive paths on different channels proceed independently.

use bytes::BytesMut;
use quanta::Instant;
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use crate::channels::{Acked, Channel, ChannelSink};
use crate::config::SocketConfig;
use crate::error::{Result, TransportError};
use crate::event::{ConnectionHandle, NetworkEvent};
use crate::hashcash::{self, PreSolve};
use crate::memory::MemoryManager;
use crate::merger::PacketMerger;
use crate::rtt::RttTracker;
use crate::stats::{ConnectionCounters, ConnectionStats};
use crate::wire::{
    encode_bare, ChallengeRequest, ChallengeResponse, ChannelType, ConnectionRequest, Hail,
    Heartbeat, MessageType, MtuProbe,
};

/// Where a connection writes its datagrams.
pub trait Transmit: Send + Sync {
    fn transmit(&self, endpoint: SocketAddr, datagram: &[u8]);
}

#[inline]
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ─── State ──────────────────────────────────────────────────────────────────

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionState {
    /// Client: `ConnectionRequest` sent, waiting for a challenge.
    RequestingConnection,
    /// Server: challenge issued, waiting for the answer.
    RequestingChallenge,
    /// Client: answer sent, waiting for `Hail`.
    SolvingChallenge,
    Connected,
    Disconnected,
}

/// Whether the connection survived the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Alive,
    Closed,
}

/// Send budget of a message repeated until answered.
#[derive(Debug, Default)]
struct Retry {
    attempts: u32,
    last_sent: Option<Instant>,
}

impl Retry {
    fn is_due(&self, now: Instant, delay: Duration) -> bool {
        self.last_sent
            .is_none_or(|last| now.saturating_duration_since(last) >= delay)
    }

    fn sent(&mut self, now: Instant) {
        self.attempts += 1;
        self.last_sent = Some(now);
    }

    fn reset(&mut self) {
        *self = Retry::default();
    }
}

#[derive(Debug)]
struct Inner {
    state: ConnectionState,
    challenge: u64,
    difficulty: u8,
    answer: Option<u64>,
    pre_solve: Option<PreSolve>,
    handshake: Retry,
    hail_confirmed: bool,
    /// A `Connect` event was emitted for this connection.
    announced: bool,
    heartbeat_sequence: u16,
    rtt: RttTracker,
    mtu: u16,
    mtu_probe: Retry,
    mtu_settled: bool,
}

// ─── Connection ─────────────────────────────────────────────────────────────

pub struct Connection {
    handle: ConnectionHandle,
    endpoint: SocketAddr,
    initiator: bool,
    config: Arc<SocketConfig>,
    memory: MemoryManager,
    epoch: Instant,
    /// Nanoseconds since `epoch` of the last datagram in / out.
    last_in: AtomicU64,
    last_out: AtomicU64,
    inner: Mutex<Inner>,
    channels: OnceLock<Box<[Mutex<Channel>]>>,
    merger: Mutex<PacketMerger>,
    counters: ConnectionCounters,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("handle", &self.handle)
            .field("endpoint", &self.endpoint)
            .field("initiator", &self.initiator)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    fn with_state(
        handle: ConnectionHandle,
        endpoint: SocketAddr,
        initiator: bool,
        state: ConnectionState,
        config: Arc<SocketConfig>,
        memory: MemoryManager,
        now: Instant,
    ) -> Self {
        let mtu = config.min_mtu;
        Connection {
            handle,
            endpoint,
            initiator,
            memory,
            epoch: now,
            last_in: AtomicU64::new(0),
            last_out: AtomicU64::new(0),
            inner: Mutex::new(Inner {
                state,
                challenge: 0,
                difficulty: 0,
                answer: None,
                pre_solve: None,
                handshake: Retry::default(),
                hail_confirmed: false,
                announced: false,
                heartbeat_sequence: 0,
                rtt: RttTracker::new(config.initial_rtt),
                mtu,
                mtu_probe: Retry::default(),
                mtu_settled: !config.enable_mtu_expansion,
            }),
            channels: OnceLock::new(),
            merger: Mutex::new(PacketMerger::new(mtu as usize, config.max_merge_delay)),
            counters: ConnectionCounters::default(),
            config,
        }
    }

    /// Time-based pre-solve for a new outgoing connection, when the
    /// configuration asks for one. Runs the proof of work, so call it before
    /// taking any shared lock.
    pub fn pre_solve(config: &SocketConfig, iv: u64) -> Option<PreSolve> {
        if !config.time_based_connection_challenge {
            return None;
        }
        let solved = PreSolve::compute(
            hashcash::unix_timestamp(),
            iv,
            config.connection_challenge_difficulty,
            config.max_solve_iterations,
        );
        if solved.is_none() {
            tracing::warn!(iv, "connection pre-solve not found within iteration budget");
        }
        solved
    }

    /// Client side.
    pub fn outgoing(
        handle: ConnectionHandle,
        endpoint: SocketAddr,
        config: Arc<SocketConfig>,
        memory: MemoryManager,
        pre_solve: Option<PreSolve>,
        now: Instant,
    ) -> Self {
        let conn = Self::with_state(
            handle,
            endpoint,
            true,
            ConnectionState::RequestingConnection,
            config,
            memory,
            now,
        );
        lock(&conn.inner).pre_solve = pre_solve;
        conn
    }

    /// Server side, after the `ConnectionRequest` passed validation.
    pub fn incoming(
        handle: ConnectionHandle,
        endpoint: SocketAddr,
        config: Arc<SocketConfig>,
        memory: MemoryManager,
        challenge: u64,
        now: Instant,
    ) -> Self {
        let difficulty = config.challenge_difficulty;
        let conn = Self::with_state(
            handle,
            endpoint,
            false,
            ConnectionState::RequestingChallenge,
            config,
            memory,
            now,
        );
        {
            let mut inner = lock(&conn.inner);
            inner.challenge = challenge;
            inner.difficulty = difficulty;
        }
        conn
    }

    // ── Accessors ───────────────────────────────────────────────────────

    pub fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    /// Whether this side initiated the connection.
    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner).state
    }

    pub fn mtu(&self) -> u16 {
        lock(&self.inner).mtu
    }

    /// Smoothed round-trip time.
    pub fn rtt(&self) -> Duration {
        lock(&self.inner).rtt.srtt()
    }

    /// Channel layout, empty until the handshake completes.
    pub fn channel_types(&self) -> Vec<ChannelType> {
        self.channels
            .get()
            .map(|channels| channels.iter().map(|c| lock(c).channel_type()).collect())
            .unwrap_or_default()
    }

    /// Messages awaiting acknowledgement across all channels.
    pub fn pending_outgoing(&self) -> usize {
        self.channels
            .get()
            .map(|channels| channels.iter().map(|c| lock(c).pending_outgoing()).sum())
            .unwrap_or(0)
    }

    pub fn stats(&self) -> ConnectionStats {
        let mut stats = ConnectionStats::default();
        self.counters.fill(&mut stats);
        let inner = lock(&self.inner);
        stats.srtt_us = inner.rtt.srtt().as_micros() as u64;
        stats.rttvar_us = inner.rtt.rttvar().as_micros() as u64;
        stats.min_rtt_us = inner.rtt.min_rtt().map_or(0, |d| d.as_micros() as u64);
        stats.max_rttvar_us = inner.rtt.max_rttvar().as_micros() as u64;
        stats.mtu = inner.mtu;
        stats
    }

    pub(crate) fn record_datagram_in(&self, len: usize) {
        self.counters.record_in(len);
    }

    // ── Timing ──────────────────────────────────────────────────────────

    fn stamp(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_nanos() as u64
    }

    fn since(&self, stamp: &AtomicU64, now: Instant) -> Duration {
        let then = Duration::from_nanos(stamp.load(Ordering::Relaxed));
        now.saturating_duration_since(self.epoch).saturating_sub(then)
    }

    // ── Output ──────────────────────────────────────────────────────────

    fn send_direct(&self, tx: &dyn Transmit, datagram: &[u8], now: Instant) {
        self.counters.record_out(datagram.len());
        self.last_out.store(self.stamp(now), Ordering::Relaxed);
        tx.transmit(self.endpoint, datagram);
    }

    fn send_encoded(&self, tx: &dyn Transmit, now: Instant, encode: impl FnOnce(&mut BytesMut)) {
        let mut buf = BytesMut::with_capacity(64);
        encode(&mut buf);
        self.send_direct(tx, &buf, now);
    }

    fn outbound<'a>(&'a self, tx: &'a dyn Transmit, now: Instant) -> Outbound<'a> {
        Outbound {
            conn: self,
            tx,
            now,
        }
    }

    /// Send whatever handshake message the current state repeats.
    fn send_handshake(&self, inner: &mut Inner, now: Instant, tx: &dyn Transmit) {
        match inner.state {
            ConnectionState::RequestingConnection => {
                let request = ConnectionRequest {
                    pre_solve: inner.pre_solve,
                };
                let padding = self.config.amplification_prevention_padding;
                self.send_encoded(tx, now, |buf| request.encode(padding, buf));
            }
            ConnectionState::RequestingChallenge => {
                let request = ChallengeRequest {
                    challenge: inner.challenge,
                    difficulty: inner.difficulty,
                };
                self.send_encoded(tx, now, |buf| request.encode(buf));
            }
            ConnectionState::SolvingChallenge => {
                let Some(answer) = inner.answer else {
                    return;
                };
                self.send_encoded(tx, now, |buf| ChallengeResponse { answer }.encode(buf));
            }
            ConnectionState::Connected if !self.initiator => {
                let hail = Hail {
                    channel_types: self.config.channel_types.clone(),
                };
                self.send_encoded(tx, now, |buf| hail.encode(buf));
            }
            ConnectionState::Connected => {
                self.send_encoded(tx, now, |buf| encode_bare(MessageType::HailConfirmed, buf));
            }
            ConnectionState::Disconnected => return,
        }
        inner.handshake.sent(now);
    }

    /// Send the opening handshake message.
    pub fn start(&self, now: Instant, tx: &dyn Transmit) {
        self.last_in.store(self.stamp(now), Ordering::Relaxed);
        let mut inner = lock(&self.inner);
        self.send_handshake(&mut inner, now, tx);
    }

    /// A repeated `ConnectionRequest` for a pending connection: repeat the
    /// challenge instead of allocating again.
    pub fn resend_challenge_request(&self, now: Instant, tx: &dyn Transmit) {
        let mut inner = lock(&self.inner);
        if inner.state == ConnectionState::RequestingChallenge {
            self.send_handshake(&mut inner, now, tx);
        }
    }

    fn channel(&self, channel_id: u8) -> Option<&Mutex<Channel>> {
        self.channels.get()?.get(usize::from(channel_id))
    }

    fn init_channels(&self, types: &[ChannelType]) {
        let channels: Box<[Mutex<Channel>]> = types
            .iter()
            .enumerate()
            .map(|(id, &kind)| {
                Mutex::new(Channel::new(
                    kind,
                    id as u8,
                    self.config.channels,
                    self.memory.clone(),
                ))
            })
            .collect();
        if self.channels.set(channels).is_err() {
            tracing::warn!(endpoint = %self.endpoint, "channel set already initialised");
        }
    }

    // ── Input ───────────────────────────────────────────────────────────

    /// Process one datagram (type byte already split off). Events produced
    /// are appended to `events`.
    pub fn handle_datagram(
        &self,
        kind: MessageType,
        body: &[u8],
        datagram_len: usize,
        now: Instant,
        tx: &dyn Transmit,
        events: &mut Vec<NetworkEvent>,
    ) -> Outcome {
        self.last_in.store(self.stamp(now), Ordering::Relaxed);

        match kind {
            MessageType::ChallengeRequest => self.on_challenge_request(body, now, tx),
            MessageType::ChallengeResponse => self.on_challenge_response(body, now, tx, events),
            MessageType::Hail => self.on_hail(body, now, tx, events),
            MessageType::HailConfirmed => {
                let mut inner = lock(&self.inner);
                if inner.state == ConnectionState::Connected && !self.initiator {
                    inner.hail_confirmed = true;
                }
            }
            MessageType::Heartbeat => {
                let mut buf = body;
                if Heartbeat::decode(&mut buf).is_none() {
                    tracing::debug!(endpoint = %self.endpoint, "malformed heartbeat");
                }
            }
            MessageType::Data => self.on_data(body, now, tx, events),
            MessageType::Ack => self.on_ack(body, now, tx, events),
            MessageType::Disconnect => {
                tracing::debug!(endpoint = %self.endpoint, "peer disconnected");
                self.mark_closed(events, false);
                return Outcome::Closed;
            }
            MessageType::MtuRequest => self.on_mtu_request(body, datagram_len, now, tx),
            MessageType::MtuResponse => self.on_mtu_response(body, datagram_len, now, tx),
            MessageType::ConnectionRequest
            | MessageType::Merge
            | MessageType::UnconnectedData
            | MessageType::Broadcast => {
                tracing::debug!(endpoint = %self.endpoint, ?kind, "unexpected message for connection");
            }
        }
        Outcome::Alive
    }

    fn on_challenge_request(&self, body: &[u8], now: Instant, tx: &dyn Transmit) {
        let mut buf = body;
        let Some(request) = ChallengeRequest::decode(&mut buf) else {
            tracing::debug!(endpoint = %self.endpoint, "malformed challenge request");
            return;
        };

        if request.difficulty > self.config.max_accepted_difficulty {
            tracing::warn!(
                endpoint = %self.endpoint,
                difficulty = request.difficulty,
                max = self.config.max_accepted_difficulty,
                "challenge difficulty above accepted maximum, ignored"
            );
            return;
        }

        // Solve without holding `inner`; the state is rechecked before committing.
        let state = lock(&self.inner).state;
        match state {
            ConnectionState::RequestingConnection => {
                let Some(answer) = hashcash::solve(
                    request.challenge,
                    request.difficulty,
                    self.config.max_solve_iterations,
                ) else {
                    tracing::warn!(
                        endpoint = %self.endpoint,
                        difficulty = request.difficulty,
                        "challenge not solvable within iteration budget"
                    );
                    return;
                };

                let mut inner = lock(&self.inner);
                if inner.state != ConnectionState::RequestingConnection {
                    return;
                }
                tracing::debug!(
                    endpoint = %self.endpoint,
                    difficulty = request.difficulty,
                    "challenge solved"
                );
                inner.challenge = request.challenge;
                inner.difficulty = request.difficulty;
                inner.answer = Some(answer);
                inner.state = ConnectionState::SolvingChallenge;
                inner.handshake.reset();
                self.send_handshake(&mut inner, now, tx);
            }
            ConnectionState::SolvingChallenge => {
                let mut inner = lock(&self.inner);
                if inner.state == ConnectionState::SolvingChallenge
                    && inner.challenge == request.challenge
                {
                    self.send_handshake(&mut inner, now, tx);
                }
            }
            state => {
                tracing::trace!(endpoint = %self.endpoint, ?state, "challenge request ignored");
            }
        }
    }

    fn on_challenge_response(
        &self,
        body: &[u8],
        now: Instant,
        tx: &dyn Transmit,
        events: &mut Vec<NetworkEvent>,
    ) {
        let mut buf = body;
        let Some(response) = ChallengeResponse::decode(&mut buf) else {
            tracing::debug!(endpoint = %self.endpoint, "malformed challenge response");
            return;
        };

        let mut inner = lock(&self.inner);
        let valid = hashcash::validate(inner.challenge, response.answer, inner.difficulty);
        match inner.state {
            ConnectionState::RequestingChallenge if valid => {
                self.init_channels(&self.config.channel_types);
                inner.state = ConnectionState::Connected;
                inner.hail_confirmed = false;
                inner.announced = true;
                inner.handshake.reset();
                self.send_handshake(&mut inner, now, tx);
                tracing::info!(endpoint = %self.endpoint, handle = %self.handle, "connection accepted");
                events.push(NetworkEvent::Connect {
                    handle: self.handle,
                    endpoint: self.endpoint,
                });
            }
            ConnectionState::RequestingChallenge => {
                tracing::debug!(endpoint = %self.endpoint, "wrong challenge answer");
            }
            // Our Hail was lost.
            ConnectionState::Connected if valid && !inner.hail_confirmed => {
                self.send_handshake(&mut inner, now, tx);
            }
            _ => {}
        }
    }

    fn on_hail(&self, body: &[u8], now: Instant, tx: &dyn Transmit, events: &mut Vec<NetworkEvent>) {
        let mut buf = body;
        let Some(hail) = Hail::decode(&mut buf) else {
            tracing::debug!(endpoint = %self.endpoint, "malformed hail");
            return;
        };

        let mut inner = lock(&self.inner);
        match inner.state {
            ConnectionState::SolvingChallenge => {
                if hail.channel_types.is_empty() {
                    tracing::debug!(endpoint = %self.endpoint, "hail without channels");
                    return;
                }
                self.init_channels(&hail.channel_types);
                inner.state = ConnectionState::Connected;
                inner.announced = true;
                inner.handshake.reset();
                self.send_handshake(&mut inner, now, tx);
                tracing::info!(
                    endpoint = %self.endpoint,
                    handle = %self.handle,
                    channels = hail.channel_types.len(),
                    "connected"
                );
                events.push(NetworkEvent::Connect {
                    handle: self.handle,
                    endpoint: self.endpoint,
                });
            }
            // Our HailConfirmed was lost.
            ConnectionState::Connected if self.initiator => {
                self.send_handshake(&mut inner, now, tx);
            }
            _ => {}
        }
    }

    /// Check the connection is up; on the accepting side any traffic on a
    /// channel also proves the peer got our `Hail`.
    fn accept_channel_traffic(&self) -> bool {
        let mut inner = lock(&self.inner);
        if inner.state != ConnectionState::Connected {
            return false;
        }
        inner.hail_confirmed = true;
        true
    }

    fn on_data(&self, body: &[u8], now: Instant, tx: &dyn Transmit, events: &mut Vec<NetworkEvent>) {
        if !self.accept_channel_traffic() {
            tracing::debug!(endpoint = %self.endpoint, "data before handshake completed");
            return;
        }
        let Some((&channel_id, rest)) = body.split_first() else {
            return;
        };
        let Some(channel) = self.channel(channel_id) else {
            tracing::debug!(endpoint = %self.endpoint, channel_id, "data for unknown channel");
            return;
        };

        let mut sink = self.outbound(tx, now);
        let delivered = lock(channel).handle_incoming(rest, &mut sink);
        let Some(set) = delivered else {
            return;
        };

        let mut blocks = Vec::with_capacity(set.len());
        set.flatten_into(&mut blocks);
        self.counters
            .messages_delivered
            .fetch_add(blocks.len() as u64, Ordering::Relaxed);
        events.extend(blocks.into_iter().map(|data| NetworkEvent::Data {
            handle: self.handle,
            channel_id,
            data,
        }));
    }

    fn on_ack(&self, body: &[u8], now: Instant, tx: &dyn Transmit, events: &mut Vec<NetworkEvent>) {
        if !self.accept_channel_traffic() {
            return;
        }
        let Some((&channel_id, rest)) = body.split_first() else {
            return;
        };
        let Some(channel) = self.channel(channel_id) else {
            tracing::debug!(endpoint = %self.endpoint, channel_id, "ack for unknown channel");
            return;
        };

        let mut acked: Vec<Acked> = Vec::new();
        let mut sink = self.outbound(tx, now);
        lock(channel).handle_ack(rest, now, &mut sink, &mut acked);
        if acked.is_empty() {
            return;
        }

        self.counters
            .messages_acked
            .fetch_add(acked.len() as u64, Ordering::Relaxed);
        let mut inner = lock(&self.inner);
        for ack in &acked {
            if let Some(sample) = ack.rtt_sample {
                inner.rtt.update(sample);
            }
        }
        drop(inner);

        events.extend(acked.iter().filter_map(|ack| {
            ack.notification_key
                .map(|notification_key| NetworkEvent::AckNotification {
                    handle: self.handle,
                    notification_key,
                })
        }));
    }

    fn on_mtu_request(&self, body: &[u8], datagram_len: usize, now: Instant, tx: &dyn Transmit) {
        if self.state() != ConnectionState::Connected {
            return;
        }
        let mut buf = body;
        let Some(probe) = MtuProbe::decode(&mut buf, datagram_len) else {
            tracing::debug!(endpoint = %self.endpoint, datagram_len, "malformed MTU probe");
            return;
        };
        self.send_encoded(tx, now, |buf| probe.encode(MessageType::MtuResponse, buf));
    }

    fn on_mtu_response(&self, body: &[u8], datagram_len: usize, now: Instant, tx: &dyn Transmit) {
        let mut buf = body;
        let Some(probe) = MtuProbe::decode(&mut buf, datagram_len) else {
            tracing::debug!(endpoint = %self.endpoint, datagram_len, "malformed MTU response");
            return;
        };

        let mut inner = lock(&self.inner);
        if probe.size <= inner.mtu || probe.size > self.config.max_mtu {
            return;
        }
        tracing::debug!(
            endpoint = %self.endpoint,
            from = inner.mtu,
            to = probe.size,
            "path MTU raised"
        );
        inner.mtu = probe.size;
        inner.mtu_probe.reset();
        inner.mtu_settled = probe.size >= self.config.max_mtu;
        lock(&self.merger).set_max_size(probe.size as usize, &mut |out: &[u8]| {
            self.send_direct(tx, out, now)
        });
    }

    // ── Tick ────────────────────────────────────────────────────────────

    /// Periodic work: handshake resends, timeouts, MTU probing, heartbeats,
    /// channel resends and merger flushing.
    pub fn update(&self, now: Instant, tx: &dyn Transmit, events: &mut Vec<NetworkEvent>) -> Outcome {
        let config = &self.config;
        let resend_delay = {
            let mut inner = lock(&self.inner);
            match inner.state {
                ConnectionState::Disconnected => return Outcome::Closed,
                ConnectionState::Connected => {}
                _ => {
                    if inner.handshake.is_due(now, config.handshake_resend_delay) {
                        if inner.handshake.attempts >= config.max_handshake_resends {
                            return self.time_out(&mut inner, events, "handshake not answered");
                        }
                        self.send_handshake(&mut inner, now, tx);
                    }
                    return Outcome::Alive;
                }
            }

            if self.since(&self.last_in, now) > config.connection_timeout {
                return self.time_out(&mut inner, events, "no traffic from peer");
            }

            if !self.initiator
                && !inner.hail_confirmed
                && inner.handshake.is_due(now, config.handshake_resend_delay)
            {
                if inner.handshake.attempts >= config.max_handshake_resends {
                    return self.time_out(&mut inner, events, "hail not confirmed");
                }
                self.send_handshake(&mut inner, now, tx);
            }

            self.probe_mtu(&mut inner, now, tx);

            if self.since(&self.last_out, now) >= config.heartbeat_delay {
                let heartbeat = Heartbeat {
                    sequence: inner.heartbeat_sequence,
                };
                inner.heartbeat_sequence = inner.heartbeat_sequence.wrapping_add(1);
                self.send_encoded(tx, now, |buf| heartbeat.encode(buf));
            }

            inner
                .rtt
                .resend_delay(config.resend_rtt_multiplier, config.min_resend_delay)
        };

        if let Some(channels) = self.channels.get() {
            let mut sink = self.outbound(tx, now);
            for (channel_id, channel) in channels.iter().enumerate() {
                if lock(channel).tick(now, resend_delay, &mut sink) {
                    tracing::warn!(
                        endpoint = %self.endpoint,
                        channel_id,
                        "message exceeded resend attempts"
                    );
                    let mut inner = lock(&self.inner);
                    return self.time_out(&mut inner, events, "resend attempts exhausted");
                }
            }
        }

        let mut merger = lock(&self.merger);
        if merger.is_due(now) {
            merger.flush(&mut |out: &[u8]| self.send_direct(tx, out, now));
        }
        Outcome::Alive
    }

    fn probe_mtu(&self, inner: &mut Inner, now: Instant, tx: &dyn Transmit) {
        if inner.mtu_settled || !inner.mtu_probe.is_due(now, self.config.mtu_attempt_delay) {
            return;
        }
        if inner.mtu_probe.attempts >= self.config.max_mtu_attempts {
            tracing::debug!(endpoint = %self.endpoint, mtu = inner.mtu, "MTU probing settled");
            inner.mtu_settled = true;
            return;
        }
        let grown = (f64::from(inner.mtu) * self.config.mtu_growth_factor).ceil() as u64;
        let candidate = grown.min(u64::from(self.config.max_mtu)) as u16;
        if candidate <= inner.mtu {
            inner.mtu_settled = true;
            return;
        }
        inner.mtu_probe.sent(now);
        let probe = MtuProbe { size: candidate };
        self.send_encoded(tx, now, |buf| probe.encode(MessageType::MtuRequest, buf));
    }

    fn time_out(&self, inner: &mut Inner, events: &mut Vec<NetworkEvent>, reason: &str) -> Outcome {
        tracing::info!(endpoint = %self.endpoint, handle = %self.handle, reason, "connection timed out");
        inner.state = ConnectionState::Disconnected;
        if self.initiator || inner.announced {
            events.push(NetworkEvent::Timeout {
                handle: self.handle,
                endpoint: self.endpoint,
            });
        }
        Outcome::Closed
    }

    fn mark_closed(&self, events: &mut Vec<NetworkEvent>, local: bool) {
        let mut inner = lock(&self.inner);
        if inner.state == ConnectionState::Disconnected {
            return;
        }
        inner.state = ConnectionState::Disconnected;
        if self.initiator || inner.announced || local {
            events.push(NetworkEvent::Disconnect {
                handle: self.handle,
                endpoint: self.endpoint,
            });
        }
    }

    // ── Output API ──────────────────────────────────────────────────────

    /// Queue `payload` on `channel_id`.
    pub fn send(
        &self,
        channel_id: u8,
        payload: &[u8],
        no_merge: bool,
        notification_key: Option<u64>,
        now: Instant,
        tx: &dyn Transmit,
    ) -> Result<()> {
        let mtu = {
            let inner = lock(&self.inner);
            if inner.state != ConnectionState::Connected {
                return Err(TransportError::NotConnected);
            }
            inner.mtu
        };
        let channel = self
            .channel(channel_id)
            .ok_or(TransportError::InvalidChannel(channel_id))?;
        let mut sink = self.outbound(tx, now);
        lock(channel).create_outgoing(payload, mtu as usize, no_merge, notification_key, now, &mut sink)
    }

    /// Largest payload `channel_id` accepts at the current MTU.
    pub fn max_payload(&self, channel_id: u8) -> Option<usize> {
        let mtu = self.mtu() as usize;
        self.channel(channel_id).map(|c| lock(c).max_payload(mtu))
    }

    /// Flush pending batches, optionally tell the peer, and close.
    pub fn disconnect(
        &self,
        send_message: bool,
        now: Instant,
        tx: &dyn Transmit,
        events: &mut Vec<NetworkEvent>,
    ) {
        self.flush(now, tx);
        if send_message && self.state() != ConnectionState::Disconnected {
            self.send_encoded(tx, now, |buf| encode_bare(MessageType::Disconnect, buf));
        }
        self.mark_closed(events, true);
    }

    /// Send everything the merger holds.
    pub fn flush(&self, now: Instant, tx: &dyn Transmit) {
        lock(&self.merger).flush(&mut |out: &[u8]| self.send_direct(tx, out, now));
    }

    /// Drop all buffered channel and merger state, returning it to the arena.
    pub fn release(&self) {
        lock(&self.merger).clear();
        if let Some(channels) = self.channels.get() {
            for channel in channels.iter() {
                lock(channel).release();
            }
        }
    }
}

// ─── Outbound sink ──────────────────────────────────────────────────────────

/// Routes channel output through the merger unless merging is off or the
/// message asks to bypass it.
struct Outbound<'a> {
    conn: &'a Connection,
    tx: &'a dyn Transmit,
    now: Instant,
}

impl ChannelSink for Outbound<'_> {
    fn send(&mut self, datagram: &[u8], no_merge: bool) {
        let (conn, tx, now) = (self.conn, self.tx, self.now);
        if no_merge || !conn.config.enable_merging {
            conn.send_direct(tx, datagram, now);
            return;
        }
        lock(&conn.merger).push(datagram, now, &mut |out: &[u8]| {
            conn.send_direct(tx, out, now)
        });
    }
}
