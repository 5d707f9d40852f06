//! # Socket Configuration
//!
//! [`SocketConfig`] is plain data with sensible defaults. Files are read
//! through [`SocketConfigInput`], whose every field is optional; `resolve()`
//! fills the gaps from the defaults and validates the result.
//!
//! ```toml
//! version = 1
//! ipv4_bind = "0.0.0.0:7777"
//! channel_types = ["Reliable", "Unreliable", "ReliableSequencedFragmented"]
//!
//! [handshake]
//! challenge_difficulty = 16
//!
//! [mtu]
//! max_mtu = 1400
//!
//! [threads]
//! processing_threads = 1
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;

use crate::channels::ChannelConfig;
use crate::error::{Result, TransportError};
use crate::memory::MemoryConfig;
use crate::wire::{ChannelType, ConnectionRequest, MAX_CHANNELS};

pub const CONFIG_VERSION: u32 = 1;

// ─── Resolved configuration ─────────────────────────────────────────────────

/// Everything a socket needs to run.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    pub version: u32,

    /// IPv4 bind address; `None` disables IPv4.
    pub ipv4_bind: Option<SocketAddr>,
    /// IPv6 bind address; `None` disables IPv6.
    pub ipv6_bind: Option<SocketAddr>,
    pub max_connections: usize,

    /// Channel layout announced to every peer; the index is the channel id.
    pub channel_types: Vec<ChannelType>,
    pub channels: ChannelConfig,

    // Handshake
    pub challenge_difficulty: u8,
    /// Hardest challenge this side agrees to solve; harder ones are ignored.
    pub max_accepted_difficulty: u8,
    /// Upper bound on counters tried while solving a challenge.
    pub max_solve_iterations: u64,
    pub handshake_resend_delay: Duration,
    pub max_handshake_resends: u32,
    /// Require a time-windowed pre-solve in every `ConnectionRequest`.
    pub time_based_connection_challenge: bool,
    pub connection_challenge_difficulty: u8,
    pub connection_challenge_window: Duration,
    /// IVs remembered for replay detection.
    pub connection_challenge_history: usize,
    /// Minimum `ConnectionRequest` size; requests below it are dropped.
    pub amplification_prevention_padding: usize,

    // Timing
    pub initial_rtt: Duration,
    pub resend_rtt_multiplier: f64,
    pub min_resend_delay: Duration,
    pub heartbeat_delay: Duration,
    pub connection_timeout: Duration,

    // MTU
    pub min_mtu: u16,
    pub max_mtu: u16,
    pub enable_mtu_expansion: bool,
    pub mtu_growth_factor: f64,
    pub max_mtu_attempts: u32,
    pub mtu_attempt_delay: Duration,

    // Merging
    pub enable_merging: bool,
    pub max_merge_delay: Duration,

    // Threads and queues
    /// `0` leaves receiving to [`crate::RippleSocket::run_receive_once`].
    pub socket_threads: usize,
    /// `0` decodes inline on the socket threads.
    pub processing_threads: usize,
    /// `0` leaves ticking to [`crate::RippleSocket::run_logic_once`].
    pub logic_threads: usize,
    pub logic_interval: Duration,
    pub event_queue_size: usize,
    pub processing_queue_size: usize,
    /// Read timeout of the socket threads; bounds shutdown latency.
    pub socket_poll_timeout: Duration,

    pub memory: MemoryConfig,

    pub allow_unconnected_messages: bool,
    pub allow_broadcasts: bool,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            ipv4_bind: Some(SocketAddr::from(([0, 0, 0, 0], 0))),
            ipv6_bind: None,
            max_connections: 1024,
            channel_types: vec![
                ChannelType::Reliable,
                ChannelType::Unreliable,
                ChannelType::UnreliableOrdered,
                ChannelType::ReliableSequenced,
                ChannelType::UnreliableRaw,
                ChannelType::ReliableSequencedFragmented,
                ChannelType::ReliableOrdered,
            ],
            channels: ChannelConfig::default(),
            challenge_difficulty: 12,
            max_accepted_difficulty: 24,
            max_solve_iterations: 1 << 26,
            handshake_resend_delay: Duration::from_millis(500),
            max_handshake_resends: 20,
            time_based_connection_challenge: true,
            connection_challenge_difficulty: 8,
            connection_challenge_window: Duration::from_secs(60),
            connection_challenge_history: 2048,
            amplification_prevention_padding: 512,
            initial_rtt: Duration::from_millis(100),
            resend_rtt_multiplier: 1.2,
            min_resend_delay: Duration::from_millis(50),
            heartbeat_delay: Duration::from_secs(5),
            connection_timeout: Duration::from_secs(30),
            min_mtu: 512,
            max_mtu: 1450,
            enable_mtu_expansion: true,
            mtu_growth_factor: 1.25,
            max_mtu_attempts: 5,
            mtu_attempt_delay: Duration::from_secs(1),
            enable_merging: true,
            max_merge_delay: Duration::from_millis(15),
            socket_threads: 1,
            processing_threads: 0,
            logic_threads: 1,
            logic_interval: Duration::from_millis(10),
            event_queue_size: 1024,
            processing_queue_size: 1024,
            socket_poll_timeout: Duration::from_millis(50),
            memory: MemoryConfig::default(),
            allow_unconnected_messages: false,
            allow_broadcasts: false,
        }
    }
}

impl SocketConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        if input.trim().is_empty() {
            return Ok(SocketConfig::default());
        }
        let parsed: SocketConfigInput = toml::from_str(input)
            .map_err(|e| TransportError::Config(format!("invalid config TOML: {e}")))?;
        parsed.resolve()
    }

    /// Reject combinations the transport cannot run with.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(TransportError::Config(msg));

        if self.version != CONFIG_VERSION {
            return fail(format!("unsupported config version {}", self.version));
        }
        if self.ipv4_bind.is_none() && self.ipv6_bind.is_none() {
            return fail("no bind address configured".into());
        }
        if self.ipv4_bind.is_some_and(|a| !a.is_ipv4()) {
            return fail("ipv4_bind is not an IPv4 address".into());
        }
        if self.ipv6_bind.is_some_and(|a| !a.is_ipv6()) {
            return fail("ipv6_bind is not an IPv6 address".into());
        }
        if self.channel_types.is_empty() || self.channel_types.len() > MAX_CHANNELS {
            return fail(format!(
                "between 1 and {MAX_CHANNELS} channels required, got {}",
                self.channel_types.len()
            ));
        }
        if self.min_mtu as usize <= ConnectionRequest::BASE_LEN + ConnectionRequest::PRE_SOLVE_LEN {
            return fail(format!("min_mtu {} is too small", self.min_mtu));
        }
        if self.min_mtu > self.max_mtu {
            return fail(format!(
                "min_mtu {} exceeds max_mtu {}",
                self.min_mtu, self.max_mtu
            ));
        }
        if self.mtu_growth_factor <= 1.0 {
            return fail("mtu_growth_factor must be greater than 1".into());
        }
        if self.max_accepted_difficulty > 64 || self.connection_challenge_difficulty > 64 {
            return fail("challenge difficulty must be at most 64".into());
        }
        if self.challenge_difficulty > self.max_accepted_difficulty {
            return fail(format!(
                "challenge_difficulty {} exceeds max_accepted_difficulty {}",
                self.challenge_difficulty, self.max_accepted_difficulty
            ));
        }
        if self.max_solve_iterations == 0 {
            return fail("max_solve_iterations must be non-zero".into());
        }
        if self.amplification_prevention_padding > self.min_mtu as usize {
            return fail("amplification_prevention_padding exceeds min_mtu".into());
        }
        if self.event_queue_size == 0 || self.processing_queue_size == 0 {
            return fail("queue sizes must be non-zero".into());
        }
        let c = &self.channels;
        if c.reliability_window_size == 0
            || c.sequenced_window_size == 0
            || c.fragment_window_size == 0
            || c.duplicate_window_size == 0
            || c.max_fragments == 0
        {
            return fail("channel windows must be non-zero".into());
        }
        if c.max_resend_attempts == 0 || self.max_handshake_resends == 0 {
            return fail("resend attempt limits must be non-zero".into());
        }
        Ok(())
    }
}

// ─── File input ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SocketConfigInput {
    pub version: u32,
    pub ipv4_bind: Option<String>,
    pub ipv6_bind: Option<String>,
    pub max_connections: Option<usize>,
    pub channel_types: Option<Vec<ChannelType>>,
    pub allow_unconnected_messages: Option<bool>,
    pub allow_broadcasts: Option<bool>,
    pub handshake: HandshakeConfigInput,
    pub timing: TimingConfigInput,
    pub mtu: MtuConfigInput,
    pub channels: ChannelConfigInput,
    pub threads: ThreadConfigInput,
    pub memory: MemoryConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HandshakeConfigInput {
    pub challenge_difficulty: Option<u8>,
    pub max_accepted_difficulty: Option<u8>,
    pub max_solve_iterations: Option<u64>,
    pub resend_delay_ms: Option<u64>,
    pub max_resends: Option<u32>,
    pub time_based_challenge: Option<bool>,
    pub time_based_difficulty: Option<u8>,
    pub time_based_window_secs: Option<u64>,
    pub iv_history: Option<usize>,
    pub amplification_padding: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TimingConfigInput {
    pub initial_rtt_ms: Option<u64>,
    pub resend_rtt_multiplier: Option<f64>,
    pub min_resend_delay_ms: Option<u64>,
    pub heartbeat_delay_ms: Option<u64>,
    pub connection_timeout_ms: Option<u64>,
    pub enable_merging: Option<bool>,
    pub max_merge_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MtuConfigInput {
    pub min_mtu: Option<u16>,
    pub max_mtu: Option<u16>,
    pub enable_expansion: Option<bool>,
    pub growth_factor: Option<f64>,
    pub max_attempts: Option<u32>,
    pub attempt_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ChannelConfigInput {
    pub reliability_window_size: Option<usize>,
    pub sequenced_window_size: Option<usize>,
    pub fragment_window_size: Option<usize>,
    pub max_fragments: Option<usize>,
    pub duplicate_window_size: Option<usize>,
    pub max_resend_attempts: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ThreadConfigInput {
    pub socket_threads: Option<usize>,
    pub processing_threads: Option<usize>,
    pub logic_threads: Option<usize>,
    pub logic_interval_ms: Option<u64>,
    pub event_queue_size: Option<usize>,
    pub processing_queue_size: Option<usize>,
    pub socket_poll_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MemoryConfigInput {
    pub min_block_size: Option<usize>,
    pub max_block_size: Option<usize>,
    pub max_pooled_per_class: Option<usize>,
    pub max_pooled_pointer_sets: Option<usize>,
}

fn millis(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_millis).unwrap_or(default)
}

fn parse_addr(field: &str, value: Option<String>, default: Option<SocketAddr>) -> Result<Option<SocketAddr>> {
    match value.as_deref().map(str::trim) {
        None => Ok(default),
        Some("") | Some("off") => Ok(None),
        Some(s) => s
            .parse()
            .map(Some)
            .map_err(|e| TransportError::Config(format!("{field}: invalid address {s:?}: {e}"))),
    }
}

impl SocketConfigInput {
    pub fn resolve(self) -> Result<SocketConfig> {
        let d = SocketConfig::default();
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };

        let h = self.handshake;
        let t = self.timing;
        let m = self.mtu;
        let c = self.channels;
        let th = self.threads;
        let mem = self.memory;

        let config = SocketConfig {
            version,
            ipv4_bind: parse_addr("ipv4_bind", self.ipv4_bind, d.ipv4_bind)?,
            ipv6_bind: parse_addr("ipv6_bind", self.ipv6_bind, d.ipv6_bind)?,
            max_connections: self.max_connections.unwrap_or(d.max_connections).max(1),
            channel_types: self.channel_types.unwrap_or(d.channel_types),
            channels: ChannelConfig {
                reliability_window_size: c
                    .reliability_window_size
                    .unwrap_or(d.channels.reliability_window_size),
                sequenced_window_size: c
                    .sequenced_window_size
                    .unwrap_or(d.channels.sequenced_window_size),
                fragment_window_size: c
                    .fragment_window_size
                    .unwrap_or(d.channels.fragment_window_size),
                max_fragments: c.max_fragments.unwrap_or(d.channels.max_fragments),
                duplicate_window_size: c
                    .duplicate_window_size
                    .unwrap_or(d.channels.duplicate_window_size),
                max_resend_attempts: c
                    .max_resend_attempts
                    .unwrap_or(d.channels.max_resend_attempts),
            },
            challenge_difficulty: h.challenge_difficulty.unwrap_or(d.challenge_difficulty),
            max_accepted_difficulty: h
                .max_accepted_difficulty
                .unwrap_or(d.max_accepted_difficulty),
            max_solve_iterations: h.max_solve_iterations.unwrap_or(d.max_solve_iterations),
            handshake_resend_delay: millis(h.resend_delay_ms, d.handshake_resend_delay),
            max_handshake_resends: h.max_resends.unwrap_or(d.max_handshake_resends),
            time_based_connection_challenge: h
                .time_based_challenge
                .unwrap_or(d.time_based_connection_challenge),
            connection_challenge_difficulty: h
                .time_based_difficulty
                .unwrap_or(d.connection_challenge_difficulty),
            connection_challenge_window: h
                .time_based_window_secs
                .map(Duration::from_secs)
                .unwrap_or(d.connection_challenge_window),
            connection_challenge_history: h
                .iv_history
                .unwrap_or(d.connection_challenge_history)
                .max(1),
            amplification_prevention_padding: h
                .amplification_padding
                .unwrap_or(d.amplification_prevention_padding),
            initial_rtt: millis(t.initial_rtt_ms, d.initial_rtt),
            resend_rtt_multiplier: t.resend_rtt_multiplier.unwrap_or(d.resend_rtt_multiplier),
            min_resend_delay: millis(t.min_resend_delay_ms, d.min_resend_delay),
            heartbeat_delay: millis(t.heartbeat_delay_ms, d.heartbeat_delay),
            connection_timeout: millis(t.connection_timeout_ms, d.connection_timeout),
            min_mtu: m.min_mtu.unwrap_or(d.min_mtu),
            max_mtu: m.max_mtu.unwrap_or(d.max_mtu),
            enable_mtu_expansion: m.enable_expansion.unwrap_or(d.enable_mtu_expansion),
            mtu_growth_factor: m.growth_factor.unwrap_or(d.mtu_growth_factor),
            max_mtu_attempts: m.max_attempts.unwrap_or(d.max_mtu_attempts),
            mtu_attempt_delay: millis(m.attempt_delay_ms, d.mtu_attempt_delay),
            enable_merging: t.enable_merging.unwrap_or(d.enable_merging),
            max_merge_delay: millis(t.max_merge_delay_ms, d.max_merge_delay),
            socket_threads: th.socket_threads.unwrap_or(d.socket_threads),
            processing_threads: th.processing_threads.unwrap_or(d.processing_threads),
            logic_threads: th.logic_threads.unwrap_or(d.logic_threads),
            logic_interval: millis(th.logic_interval_ms, d.logic_interval),
            event_queue_size: th.event_queue_size.unwrap_or(d.event_queue_size),
            processing_queue_size: th.processing_queue_size.unwrap_or(d.processing_queue_size),
            socket_poll_timeout: millis(th.socket_poll_timeout_ms, d.socket_poll_timeout),
            memory: MemoryConfig {
                min_block_size: mem.min_block_size.unwrap_or(d.memory.min_block_size),
                max_block_size: mem.max_block_size.unwrap_or(d.memory.max_block_size),
                max_pooled_per_class: mem
                    .max_pooled_per_class
                    .unwrap_or(d.memory.max_pooled_per_class),
                max_pooled_pointer_sets: mem
                    .max_pooled_pointer_sets
                    .unwrap_or(d.memory.max_pooled_pointer_sets),
            },
            allow_unconnected_messages: self
                .allow_unconnected_messages
                .unwrap_or(d.allow_unconnected_messages),
            allow_broadcasts: self.allow_broadcasts.unwrap_or(d.allow_broadcasts),
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        SocketConfig::default().validate().unwrap();
        let empty = SocketConfig::from_toml_str("  ").unwrap();
        assert_eq!(empty.max_mtu, SocketConfig::default().max_mtu);
    }

    #[test]
    fn parse_toml_config_sections() {
        let toml = r#"
            version = 1
            ipv4_bind = "127.0.0.1:9000"
            ipv6_bind = "[::1]:9001"
            channel_types = ["Reliable", "UnreliableRaw"]
            allow_unconnected_messages = true

            [handshake]
            challenge_difficulty = 10
            time_based_challenge = false

            [timing]
            heartbeat_delay_ms = 250
            connection_timeout_ms = 4000

            [mtu]
            min_mtu = 600
            max_mtu = 1200

            [channels]
            max_fragments = 64

            [threads]
            processing_threads = 2
            logic_interval_ms = 5
        "#;

        let cfg = SocketConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.ipv4_bind, Some("127.0.0.1:9000".parse().unwrap()));
        assert_eq!(cfg.ipv6_bind, Some("[::1]:9001".parse().unwrap()));
        assert_eq!(
            cfg.channel_types,
            vec![ChannelType::Reliable, ChannelType::UnreliableRaw]
        );
        assert!(cfg.allow_unconnected_messages);
        assert_eq!(cfg.challenge_difficulty, 10);
        assert!(!cfg.time_based_connection_challenge);
        assert_eq!(cfg.heartbeat_delay, Duration::from_millis(250));
        assert_eq!(cfg.connection_timeout, Duration::from_secs(4));
        assert_eq!((cfg.min_mtu, cfg.max_mtu), (600, 1200));
        assert_eq!(cfg.channels.max_fragments, 64);
        assert_eq!(
            cfg.channels.reliability_window_size,
            ChannelConfig::default().reliability_window_size
        );
        assert_eq!(cfg.processing_threads, 2);
        assert_eq!(cfg.logic_interval, Duration::from_millis(5));
    }

    #[test]
    fn rejects_inverted_mtu_bounds() {
        let toml = r#"
            [mtu]
            min_mtu = 1400
            max_mtu = 1000
        "#;
        let err = SocketConfig::from_toml_str(toml).unwrap_err();
        assert!(matches!(err, TransportError::Config(_)));
    }

    #[test]
    fn rejects_unknown_version_and_bad_address() {
        assert!(SocketConfig::from_toml_str("version = 7").is_err());
        assert!(SocketConfig::from_toml_str("ipv4_bind = \"nope\"").is_err());
        assert!(SocketConfig::from_toml_str("ipv4_bind = \"[::1]:5\"").is_err());
    }

    #[test]
    fn accepted_difficulty_bounds_local_difficulty() {
        let cfg = SocketConfig::from_toml_str("[handshake]\nmax_accepted_difficulty = 16").unwrap();
        assert_eq!(cfg.max_accepted_difficulty, 16);

        let toml = "[handshake]\nchallenge_difficulty = 20\nmax_accepted_difficulty = 16";
        let err = SocketConfig::from_toml_str(toml).unwrap_err();
        assert!(matches!(err, TransportError::Config(_)));
        assert!(SocketConfig::from_toml_str("[handshake]\nmax_accepted_difficulty = 65").is_err());
    }

    #[test]
    fn bind_can_be_disabled() {
        let cfg = SocketConfig::from_toml_str("ipv4_bind = \"off\"\nipv6_bind = \"[::]:0\"").unwrap();
        assert!(cfg.ipv4_bind.is_none());
        assert!(cfg.ipv6_bind.is_some());
    }
}
