//! Wire packet types and codec.
//!
//! Everything that crosses a transport is a [`Packet`]: a kind byte plus an
//! optional text or binary payload. This module encodes/decodes single
//! packets; [`payload`] frames several packets into one wire unit for
//! request/response transports; [`utf8`] handles the surrogate-tolerant
//! string encoding the framing relies on.
//!
//! # Wire Format (single packet)
//!
//! | Payload | Binary-capable channel | Text-only channel |
//! |---------|------------------------|-------------------|
//! | text    | `"<digit><payload>"`   | `"<digit><payload>"` |
//! | none    | `"<digit>"`            | `"<digit>"` |
//! | binary  | `[code] ++ payload`    | `"b<digit><base64(payload)>"` |
//!
//! The digit/code assignment is a wire-compatibility contract shared with
//! every peer implementation and must not change.

// ============================================================================
// Submodules
// ============================================================================

/// Multi-packet payload framing.
pub mod payload;

/// Surrogate-tolerant UTF-8 codec.
pub mod utf8;

// ============================================================================
// Re-exports
// ============================================================================

pub use payload::{decode_payload, encode_payload};

// ============================================================================
// Imports
// ============================================================================

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Protocol revision spoken by this client (the `EIO` query parameter).
pub const PROTOCOL: u8 = 3;

// ============================================================================
// PacketKind
// ============================================================================

/// Packet kind.
///
/// The numeric codes are fixed by the protocol: Open=0, Close=1, Ping=2,
/// Pong=3, Message=4, Upgrade=5, Noop=6. [`PacketKind::Error`] is not a
/// wire kind; it is synthesized for undecodable data and server-reported
/// errors and never encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    /// Handshake packet carrying the session parameters.
    Open,
    /// Connection teardown.
    Close,
    /// Heartbeat request.
    Ping,
    /// Heartbeat response.
    Pong,
    /// Application data.
    Message,
    /// Transport upgrade commit.
    Upgrade,
    /// Filler packet; carries nothing.
    Noop,
    /// Decode failure or server-reported error. Not a wire kind.
    Error,
}

impl PacketKind {
    /// Returns the kind for a wire code byte.
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Open),
            1 => Some(Self::Close),
            2 => Some(Self::Ping),
            3 => Some(Self::Pong),
            4 => Some(Self::Message),
            5 => Some(Self::Upgrade),
            6 => Some(Self::Noop),
            _ => None,
        }
    }

    /// Returns the kind for a wire ASCII digit.
    #[must_use]
    pub fn from_digit(digit: char) -> Option<Self> {
        digit
            .to_digit(10)
            .and_then(|code| u8::try_from(code).ok())
            .and_then(Self::from_code)
    }

    /// Returns the wire code byte, or `None` for [`PacketKind::Error`].
    #[must_use]
    pub fn code(self) -> Option<u8> {
        match self {
            Self::Open => Some(0),
            Self::Close => Some(1),
            Self::Ping => Some(2),
            Self::Pong => Some(3),
            Self::Message => Some(4),
            Self::Upgrade => Some(5),
            Self::Noop => Some(6),
            Self::Error => None,
        }
    }

    /// Returns the wire ASCII digit, or `None` for [`PacketKind::Error`].
    #[must_use]
    pub fn digit(self) -> Option<char> {
        self.code().map(|code| (b'0' + code) as char)
    }

    /// Returns the protocol name of this kind.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Close => "close",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Message => "message",
            Self::Upgrade => "upgrade",
            Self::Noop => "noop",
            Self::Error => "error",
        }
    }
}

// ============================================================================
// PacketData
// ============================================================================

/// Packet payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PacketData {
    /// No payload.
    #[default]
    None,
    /// UTF-8 text payload.
    Text(String),
    /// Raw binary payload.
    Binary(Vec<u8>),
}

impl PacketData {
    /// Returns the text payload, if any.
    #[inline]
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Returns the binary payload, if any.
    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Binary(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Returns `true` for a binary payload.
    #[inline]
    #[must_use]
    pub fn is_binary(&self) -> bool {
        matches!(self, Self::Binary(_))
    }
}

// ============================================================================
// WireData
// ============================================================================

/// One encoded wire unit, ready to hand to a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireData {
    /// Text frame / request body.
    Text(String),
    /// Binary frame / request body.
    Binary(Vec<u8>),
}

impl WireData {
    /// Byte length of the unit as it goes on the wire.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(bytes) => bytes.len(),
        }
    }

    /// Returns `true` for an empty unit.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Packet
// ============================================================================

/// One protocol packet: kind plus optional payload.
///
/// Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet kind.
    pub kind: PacketKind,
    /// Payload.
    pub data: PacketData,
}

impl Packet {
    /// Creates a payload-less packet.
    #[inline]
    #[must_use]
    pub fn new(kind: PacketKind) -> Self {
        Self {
            kind,
            data: PacketData::None,
        }
    }

    /// Creates a packet with a text payload.
    #[inline]
    #[must_use]
    pub fn text(kind: PacketKind, data: impl Into<String>) -> Self {
        Self {
            kind,
            data: PacketData::Text(data.into()),
        }
    }

    /// Creates a packet with a binary payload.
    #[inline]
    #[must_use]
    pub fn binary(kind: PacketKind, data: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            data: PacketData::Binary(data.into()),
        }
    }

    /// Creates a message packet from either payload form.
    #[inline]
    #[must_use]
    pub fn message(data: PacketData) -> Self {
        Self {
            kind: PacketKind::Message,
            data,
        }
    }

    /// Creates an error packet. Never encoded; dispatched locally.
    #[inline]
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::text(PacketKind::Error, message)
    }

    /// Encodes this packet for the wire.
    ///
    /// `supports_binary` selects raw binary framing for binary payloads;
    /// when `false` the base64 text fallback is produced instead.
    ///
    /// # Errors
    ///
    /// [`Error::Decode`] if the packet is an [`PacketKind::Error`] packet,
    /// which has no wire representation.
    pub fn encode(&self, supports_binary: bool) -> Result<WireData> {
        let code = self
            .kind
            .code()
            .ok_or_else(|| Error::decode("error packets have no wire representation"))?;
        let digit = (b'0' + code) as char;

        Ok(match &self.data {
            PacketData::Binary(bytes) if supports_binary => {
                let mut out = Vec::with_capacity(bytes.len() + 1);
                out.push(code);
                out.extend_from_slice(bytes);
                WireData::Binary(out)
            }
            PacketData::Binary(bytes) => {
                let mut out = String::with_capacity(2 + bytes.len().div_ceil(3) * 4);
                out.push('b');
                out.push(digit);
                out.push_str(&BASE64.encode(bytes));
                WireData::Text(out)
            }
            PacketData::Text(text) => {
                let mut out = String::with_capacity(1 + text.len());
                out.push(digit);
                out.push_str(text);
                WireData::Text(out)
            }
            PacketData::None => digit.to_string().into(),
        })
    }

    /// Decodes one packet from its text representation.
    ///
    /// # Errors
    ///
    /// [`Error::Decode`] on an empty unit, an unrecognized kind digit, or
    /// an undecodable base64 body.
    pub fn decode(data: &str) -> Result<Self> {
        let mut chars = data.chars();
        let first = chars
            .next()
            .ok_or_else(|| Error::decode("empty packet"))?;

        if first == 'b' {
            let digit = chars
                .next()
                .ok_or_else(|| Error::decode("truncated base64 packet"))?;
            let kind = PacketKind::from_digit(digit)
                .ok_or_else(|| Error::decode(format!("unknown packet kind '{digit}'")))?;
            let bytes = BASE64
                .decode(chars.as_str())
                .map_err(|err| Error::decode(format!("invalid base64 payload: {err}")))?;
            return Ok(Self::binary(kind, bytes));
        }

        let kind = PacketKind::from_digit(first)
            .ok_or_else(|| Error::decode(format!("unknown packet kind '{first}'")))?;
        let rest = chars.as_str();
        Ok(if rest.is_empty() {
            Self::new(kind)
        } else {
            Self::text(kind, rest)
        })
    }

    /// Decodes one packet from its binary representation.
    ///
    /// # Errors
    ///
    /// [`Error::Decode`] on an empty unit or an unrecognized kind byte.
    pub fn decode_bytes(data: &[u8]) -> Result<Self> {
        let (&code, payload) = data
            .split_first()
            .ok_or_else(|| Error::decode("empty packet"))?;
        let kind = PacketKind::from_code(code)
            .ok_or_else(|| Error::decode(format!("unknown packet kind byte {code}")))?;
        Ok(if payload.is_empty() {
            Self::new(kind)
        } else {
            Self::binary(kind, payload)
        })
    }
}

impl From<String> for PacketData {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for PacketData {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<Vec<u8>> for PacketData {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Binary(bytes)
    }
}

impl From<&[u8]> for PacketData {
    fn from(bytes: &[u8]) -> Self {
        Self::Binary(bytes.to_vec())
    }
}

impl From<String> for WireData {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Vec<u8>> for WireData {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Binary(bytes)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_codes_are_wire_contract() {
        assert_eq!(PacketKind::Open.code(), Some(0));
        assert_eq!(PacketKind::Close.code(), Some(1));
        assert_eq!(PacketKind::Ping.code(), Some(2));
        assert_eq!(PacketKind::Pong.code(), Some(3));
        assert_eq!(PacketKind::Message.code(), Some(4));
        assert_eq!(PacketKind::Upgrade.code(), Some(5));
        assert_eq!(PacketKind::Noop.code(), Some(6));
        assert_eq!(PacketKind::Error.code(), None);
    }

    #[test]
    fn test_encode_text_packet() {
        let packet = Packet::text(PacketKind::Message, "hello");
        assert_eq!(
            packet.encode(true).unwrap(),
            WireData::Text("4hello".into())
        );
    }

    #[test]
    fn test_encode_empty_packet() {
        let packet = Packet::new(PacketKind::Ping);
        assert_eq!(packet.encode(true).unwrap(), WireData::Text("2".into()));
    }

    #[test]
    fn test_encode_binary_packet() {
        let packet = Packet::binary(PacketKind::Message, vec![1, 2, 3]);
        assert_eq!(
            packet.encode(true).unwrap(),
            WireData::Binary(vec![4, 1, 2, 3])
        );
    }

    #[test]
    fn test_encode_binary_packet_base64_fallback() {
        let packet = Packet::binary(PacketKind::Message, vec![1, 2, 3, 4]);
        assert_eq!(
            packet.encode(false).unwrap(),
            WireData::Text("b4AQIDBA==".into())
        );
    }

    #[test]
    fn test_round_trip_every_kind() {
        for kind in [
            PacketKind::Open,
            PacketKind::Close,
            PacketKind::Ping,
            PacketKind::Pong,
            PacketKind::Message,
            PacketKind::Upgrade,
            PacketKind::Noop,
        ] {
            let empty = Packet::new(kind);
            let encoded = empty.encode(true).unwrap();
            let WireData::Text(text) = encoded else {
                panic!("empty packet should encode as text");
            };
            assert_eq!(Packet::decode(&text).unwrap(), empty);

            let with_text = Packet::text(kind, "payload");
            let WireData::Text(text) = with_text.encode(true).unwrap() else {
                panic!("text packet should encode as text");
            };
            assert_eq!(Packet::decode(&text).unwrap(), with_text);

            let with_binary = Packet::binary(kind, vec![0, 255, 7]);
            let WireData::Binary(bytes) = with_binary.encode(true).unwrap() else {
                panic!("binary packet should encode as binary");
            };
            assert_eq!(Packet::decode_bytes(&bytes).unwrap(), with_binary);
        }
    }

    #[test]
    fn test_base64_round_trip() {
        let packet = Packet::binary(PacketKind::Message, vec![0, 1, 254, 255]);
        let WireData::Text(text) = packet.encode(false).unwrap() else {
            panic!("base64 fallback should be text");
        };
        assert!(text.starts_with("b4"));
        assert_eq!(Packet::decode(&text).unwrap(), packet);
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        assert!(Packet::decode("9oops").unwrap_err().is_decode());
        assert!(Packet::decode("x").unwrap_err().is_decode());
        assert!(Packet::decode_bytes(&[42, 1, 2]).unwrap_err().is_decode());
    }

    #[test]
    fn test_decode_rejects_bad_base64() {
        assert!(Packet::decode("b4!!!").unwrap_err().is_decode());
    }

    #[test]
    fn test_decode_rejects_empty() {
        assert!(Packet::decode("").unwrap_err().is_decode());
        assert!(Packet::decode_bytes(&[]).unwrap_err().is_decode());
    }

    #[test]
    fn test_error_packet_not_encodable() {
        let packet = Packet::error("parser error");
        assert!(packet.encode(true).unwrap_err().is_decode());
    }

    #[test]
    fn test_utf8_text_survives() {
        let packet = Packet::text(PacketKind::Message, "héllo wörld ☃");
        let WireData::Text(text) = packet.encode(true).unwrap() else {
            panic!("text packet should encode as text");
        };
        assert_eq!(Packet::decode(&text).unwrap(), packet);
    }
}
