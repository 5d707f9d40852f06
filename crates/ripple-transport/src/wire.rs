//! # Ripple Wire Format
//!
//! Every datagram starts with a one-byte [`MessageType`]. Integers are
//! big-endian.
//!
//! ```text
//!  ConnectionRequest   | 0 | protocol id (8) | [timestamp (8) counter (8) iv (8)] | zero padding
//!  ChallengeRequest    | 1 | challenge (8) | difficulty (1) |
//!  ChallengeResponse   | 2 | answer (8) |
//!  Hail                | 3 | count (1) | channel type (1) × count |
//!  HailConfirmed       | 4 |
//!  Heartbeat           | 5 | sequence (2) |
//!  Data                | 6 | channel (1) | channel-specific header | payload
//!  Disconnect          | 7 |
//!  Ack                 | 8 | channel (1) | sequence (2) | [mask (8) | fragment (2)]
//!  Merge               | 9 | (length (2) | datagram) × n |
//!  UnconnectedData     | 10 | payload
//!  MtuRequest          | 11 | size (2) | padding up to size
//!  MtuResponse         | 12 | size (2) | padding up to size
//!  Broadcast           | 13 | payload
//! ```
//!
//! Decoders take the bytes *after* the type byte and return `None` on any
//! malformed input.

use bytes::{Buf, BufMut, BytesMut};
use std::fmt;

use crate::hashcash::PreSolve;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Protocol identification carried by every `ConnectionRequest`.
pub const PROTOCOL_ID: [u8; 8] = *b"RIPPLE01";

/// Maximum number of channels per connection.
pub const MAX_CHANNELS: usize = u8::MAX as usize;

/// Largest fragment index representable in the 15-bit fragment field.
pub const MAX_FRAGMENT_INDEX: u16 = 0x7FFF;

// ─── Message Type ────────────────────────────────────────────────────────────

/// First byte of every datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    ConnectionRequest = 0,
    ChallengeRequest = 1,
    ChallengeResponse = 2,
    Hail = 3,
    HailConfirmed = 4,
    Heartbeat = 5,
    Data = 6,
    Disconnect = 7,
    Ack = 8,
    Merge = 9,
    UnconnectedData = 10,
    MtuRequest = 11,
    MtuResponse = 12,
    Broadcast = 13,
}

impl MessageType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(MessageType::ConnectionRequest),
            1 => Some(MessageType::ChallengeRequest),
            2 => Some(MessageType::ChallengeResponse),
            3 => Some(MessageType::Hail),
            4 => Some(MessageType::HailConfirmed),
            5 => Some(MessageType::Heartbeat),
            6 => Some(MessageType::Data),
            7 => Some(MessageType::Disconnect),
            8 => Some(MessageType::Ack),
            9 => Some(MessageType::Merge),
            10 => Some(MessageType::UnconnectedData),
            11 => Some(MessageType::MtuRequest),
            12 => Some(MessageType::MtuResponse),
            13 => Some(MessageType::Broadcast),
            _ => None,
        }
    }
}

// ─── Channel Type ────────────────────────────────────────────────────────────

/// Delivery guarantee of a channel, as exchanged in `Hail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Deserialize, serde::Serialize)]
#[repr(u8)]
pub enum ChannelType {
    Reliable = 0,
    Unreliable = 1,
    UnreliableOrdered = 2,
    ReliableSequenced = 3,
    UnreliableRaw = 4,
    ReliableSequencedFragmented = 5,
    ReliableOrdered = 6,
}

impl ChannelType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(ChannelType::Reliable),
            1 => Some(ChannelType::Unreliable),
            2 => Some(ChannelType::UnreliableOrdered),
            3 => Some(ChannelType::ReliableSequenced),
            4 => Some(ChannelType::UnreliableRaw),
            5 => Some(ChannelType::ReliableSequencedFragmented),
            6 => Some(ChannelType::ReliableOrdered),
            _ => None,
        }
    }

    /// Whether the channel acknowledges and resends.
    pub fn is_reliable(self) -> bool {
        matches!(
            self,
            ChannelType::Reliable
                | ChannelType::ReliableSequenced
                | ChannelType::ReliableSequencedFragmented
                | ChannelType::ReliableOrdered
        )
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ─── Fragment Field ──────────────────────────────────────────────────────────

/// 15-bit fragment index plus a "final fragment" flag in the high bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentField {
    pub index: u16,
    pub is_final: bool,
}

impl FragmentField {
    pub fn new(index: u16, is_final: bool) -> Self {
        debug_assert!(index <= MAX_FRAGMENT_INDEX);
        FragmentField {
            index: index & MAX_FRAGMENT_INDEX,
            is_final,
        }
    }

    #[inline]
    pub fn to_bits(self) -> u16 {
        (self.index & MAX_FRAGMENT_INDEX) | ((self.is_final as u16) << 15)
    }

    #[inline]
    pub fn from_bits(bits: u16) -> Self {
        FragmentField {
            index: bits & MAX_FRAGMENT_INDEX,
            is_final: bits & 0x8000 != 0,
        }
    }
}

// ─── Handshake Messages ──────────────────────────────────────────────────────

/// Client → server connection request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub pre_solve: Option<PreSolve>,
}

impl ConnectionRequest {
    /// Type byte plus protocol id.
    pub const BASE_LEN: usize = 1 + PROTOCOL_ID.len();
    /// Timestamp, counter and IV.
    pub const PRE_SOLVE_LEN: usize = 24;

    /// Encode, zero-padding up to `min_size` bytes so the request is never
    /// smaller than what the server answers with.
    pub fn encode(&self, min_size: usize, buf: &mut BytesMut) {
        let start = buf.len();
        buf.put_u8(MessageType::ConnectionRequest as u8);
        buf.put_slice(&PROTOCOL_ID);
        if let Some(pre) = &self.pre_solve {
            buf.put_u64(pre.timestamp);
            buf.put_u64(pre.counter);
            buf.put_u64(pre.iv);
        }
        let written = buf.len() - start;
        if written < min_size {
            buf.put_bytes(0, min_size - written);
        }
    }

    /// Decode. `with_pre_solve` says whether the receiver requires the
    /// time-based pre-solve fields.
    pub fn decode(buf: &mut impl Buf, with_pre_solve: bool) -> Option<Self> {
        if buf.remaining() < PROTOCOL_ID.len() {
            return None;
        }
        let mut id = [0u8; 8];
        buf.copy_to_slice(&mut id);
        if id != PROTOCOL_ID {
            return None;
        }

        let pre_solve = if with_pre_solve {
            if buf.remaining() < Self::PRE_SOLVE_LEN {
                return None;
            }
            Some(PreSolve {
                timestamp: buf.get_u64(),
                counter: buf.get_u64(),
                iv: buf.get_u64(),
            })
        } else {
            None
        };

        Some(ConnectionRequest { pre_solve })
    }
}

/// Server → client proof-of-work challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChallengeRequest {
    pub challenge: u64,
    pub difficulty: u8,
}

impl ChallengeRequest {
    pub const ENCODED_LEN: usize = 1 + 8 + 1;

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(MessageType::ChallengeRequest as u8);
        buf.put_u64(self.challenge);
        buf.put_u8(self.difficulty);
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < 9 {
            return None;
        }
        Some(ChallengeRequest {
            challenge: buf.get_u64(),
            difficulty: buf.get_u8(),
        })
    }
}

/// Client → server challenge solution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChallengeResponse {
    pub answer: u64,
}

impl ChallengeResponse {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(MessageType::ChallengeResponse as u8);
        buf.put_u64(self.answer);
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < 8 {
            return None;
        }
        Some(ChallengeResponse {
            answer: buf.get_u64(),
        })
    }
}

/// Server → client channel layout announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hail {
    pub channel_types: Vec<ChannelType>,
}

impl Hail {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(MessageType::Hail as u8);
        buf.put_u8(self.channel_types.len().min(MAX_CHANNELS) as u8);
        for kind in self.channel_types.iter().take(MAX_CHANNELS) {
            buf.put_u8(*kind as u8);
        }
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if !buf.has_remaining() {
            return None;
        }
        let count = buf.get_u8() as usize;
        if buf.remaining() < count {
            return None;
        }
        let channel_types = (0..count)
            .map(|_| ChannelType::from_byte(buf.get_u8()))
            .collect::<Option<Vec<_>>>()?;
        Some(Hail { channel_types })
    }
}

/// Keep-alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    pub sequence: u16,
}

impl Heartbeat {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(MessageType::Heartbeat as u8);
        buf.put_u16(self.sequence);
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < 2 {
            return None;
        }
        Some(Heartbeat {
            sequence: buf.get_u16(),
        })
    }
}

/// Path-MTU probe and its echo. The datagram is padded to exactly `size`
/// bytes, so a probe only makes it through when the path carries that size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MtuProbe {
    pub size: u16,
}

impl MtuProbe {
    pub const HEADER_LEN: usize = 3;

    pub fn encode(&self, kind: MessageType, buf: &mut BytesMut) {
        debug_assert!(matches!(
            kind,
            MessageType::MtuRequest | MessageType::MtuResponse
        ));
        let start = buf.len();
        buf.put_u8(kind as u8);
        buf.put_u16(self.size);
        let written = buf.len() - start;
        let size = self.size as usize;
        if written < size {
            buf.put_bytes(0, size - written);
        }
    }

    /// Decode a probe whose whole datagram (type byte included) was
    /// `datagram_len` bytes. Probes whose length disagrees with their size
    /// field are rejected.
    pub fn decode(buf: &mut impl Buf, datagram_len: usize) -> Option<Self> {
        if buf.remaining() < 2 {
            return None;
        }
        let size = buf.get_u16();
        if size as usize != datagram_len || datagram_len < Self::HEADER_LEN {
            return None;
        }
        Some(MtuProbe { size })
    }
}

/// Encode a header-only message (`HailConfirmed`, `Disconnect`).
pub fn encode_bare(kind: MessageType, buf: &mut BytesMut) {
    buf.put_u8(kind as u8);
}

// ─── Merge ───────────────────────────────────────────────────────────────────

/// Iterator over the sub-datagrams of a `Merge` body.
///
/// Stops at the first malformed length prefix; [`MergedDatagrams::is_malformed`]
/// reports whether that happened.
pub struct MergedDatagrams<'a> {
    rest: &'a [u8],
    malformed: bool,
}

impl<'a> MergedDatagrams<'a> {
    pub fn new(body: &'a [u8]) -> Self {
        MergedDatagrams {
            rest: body,
            malformed: false,
        }
    }

    pub fn is_malformed(&self) -> bool {
        self.malformed
    }
}

impl<'a> Iterator for MergedDatagrams<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        if self.rest.is_empty() || self.malformed {
            return None;
        }
        if self.rest.len() < 2 {
            self.malformed = true;
            return None;
        }
        let len = u16::from_be_bytes([self.rest[0], self.rest[1]]) as usize;
        if len == 0 || self.rest.len() < 2 + len {
            self.malformed = true;
            return None;
        }
        let datagram = &self.rest[2..2 + len];
        self.rest = &self.rest[2 + len..];
        Some(datagram)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_roundtrip_bytes() {
        for b in 0u8..=13 {
            let kind = MessageType::from_byte(b).unwrap();
            assert_eq!(kind as u8, b);
        }
        assert!(MessageType::from_byte(14).is_none());
    }

    #[test]
    fn channel_type_bytes() {
        for b in 0u8..=6 {
            assert_eq!(ChannelType::from_byte(b).unwrap() as u8, b);
        }
        assert!(ChannelType::from_byte(7).is_none());
        assert!(ChannelType::Reliable.is_reliable());
        assert!(!ChannelType::UnreliableRaw.is_reliable());
    }

    #[test]
    fn fragment_field_packing() {
        let field = FragmentField::new(0x1234, true);
        assert_eq!(field.to_bits(), 0x9234);
        assert_eq!(FragmentField::from_bits(0x9234), field);
        let last = FragmentField::new(MAX_FRAGMENT_INDEX, false);
        assert_eq!(FragmentField::from_bits(last.to_bits()), last);
    }

    #[test]
    fn connection_request_padded() {
        let req = ConnectionRequest { pre_solve: None };
        let mut buf = BytesMut::new();
        req.encode(512, &mut buf);
        assert_eq!(buf.len(), 512);
        assert_eq!(buf[0], MessageType::ConnectionRequest as u8);

        let mut body = &buf[1..];
        assert_eq!(ConnectionRequest::decode(&mut body, false), Some(req));
    }

    #[test]
    fn connection_request_with_pre_solve() {
        let pre = PreSolve {
            timestamp: 1_700_000_000,
            counter: 77,
            iv: 0xABCD,
        };
        let req = ConnectionRequest {
            pre_solve: Some(pre),
        };
        let mut buf = BytesMut::new();
        req.encode(0, &mut buf);
        assert_eq!(
            buf.len(),
            ConnectionRequest::BASE_LEN + ConnectionRequest::PRE_SOLVE_LEN
        );
        let mut body = &buf[1..];
        assert_eq!(ConnectionRequest::decode(&mut body, true), Some(req));
    }

    #[test]
    fn connection_request_rejects_foreign_protocol() {
        let mut body: &[u8] = b"NOTRIPPL";
        assert!(ConnectionRequest::decode(&mut body, false).is_none());
    }

    #[test]
    fn hail_rejects_unknown_channel_type() {
        let mut body: &[u8] = &[2, 0, 9];
        assert!(Hail::decode(&mut body).is_none());
        let mut ok: &[u8] = &[2, 0, 5];
        assert_eq!(
            Hail::decode(&mut ok).unwrap().channel_types,
            vec![
                ChannelType::Reliable,
                ChannelType::ReliableSequencedFragmented
            ]
        );
    }

    #[test]
    fn mtu_probe_length_must_match() {
        let probe = MtuProbe { size: 700 };
        let mut buf = BytesMut::new();
        probe.encode(MessageType::MtuRequest, &mut buf);
        assert_eq!(buf.len(), 700);

        let mut body = &buf[1..];
        assert_eq!(MtuProbe::decode(&mut body, 700), Some(probe));
        let mut body = &buf[1..];
        assert!(MtuProbe::decode(&mut body, 699).is_none());
    }

    #[test]
    fn merged_datagrams_iterate() {
        let body = [0, 2, 6, 1, 0, 1, 5];
        let parts: Vec<&[u8]> = MergedDatagrams::new(&body).collect();
        assert_eq!(parts, vec![&[6u8, 1][..], &[5u8][..]]);
    }

    #[test]
    fn merged_datagrams_stop_on_truncation() {
        let body = [0, 2, 6, 1, 0, 9, 5];
        let mut iter = MergedDatagrams::new(&body);
        assert_eq!(iter.next(), Some(&[6u8, 1][..]));
        assert_eq!(iter.next(), None);
        assert!(iter.is_malformed());
    }
}
