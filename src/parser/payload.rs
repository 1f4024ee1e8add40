//! Multi-packet payload framing.
//!
//! The polling transport moves several packets per HTTP request, so the
//! packets are concatenated into one self-describing wire unit:
//!
//! - **Text mode**: each packet is prefixed with its length in *characters*
//!   (ASCII digits) and a record separator (U+001E), then appended.
//! - **Binary mode**: each packet is prefixed with a header byte (0 =
//!   string content, 1 = binary content), the decimal digits of its byte
//!   length (one byte per digit, value 0–9, most significant first), and a
//!   terminator byte 255.
//!
//! Either stream can be re-split without out-of-band framing. A payload
//! containing any binary packet encodes in binary mode when the caller's
//! channel allows it; otherwise text mode with the base64 packet fallback.
//!
//! Decoding is callback-driven so the transport can stop at a Close packet
//! without touching the remainder. Malformed input is surfaced as an
//! `Error`-kind packet through the same callback — peers cannot be trusted
//! to be well-formed, and dropping data silently would hide that.

// ============================================================================
// Imports
// ============================================================================

use tracing::trace;

use crate::error::{Error, Result};

use super::utf8;
use super::{Packet, WireData};

// ============================================================================
// Constants
// ============================================================================

/// Delimiter between the length prefix and packet body in text mode.
pub const RECORD_SEPARATOR: char = '\u{1E}';

/// Terminator for the digit run of a binary length prefix.
const LENGTH_TERMINATOR: u8 = 255;

/// Binary-mode header byte: content is a UTF-8 string.
const HEADER_STRING: u8 = 0;

/// Binary-mode header byte: content is raw bytes.
const HEADER_BINARY: u8 = 1;

// ============================================================================
// Encoding
// ============================================================================

/// Encodes a packet sequence as one wire unit.
///
/// Zero packets encode to the empty text unit.
///
/// # Errors
///
/// [`Error::Decode`] if a packet has no wire representation.
pub fn encode_payload(packets: &[Packet], supports_binary: bool) -> Result<WireData> {
    if packets.is_empty() {
        return Ok(WireData::Text(String::new()));
    }

    let has_binary = packets.iter().any(|packet| packet.data.is_binary());
    if has_binary && supports_binary {
        encode_binary(packets)
    } else {
        encode_text(packets)
    }
}

fn encode_text(packets: &[Packet]) -> Result<WireData> {
    let mut out = String::new();

    for packet in packets {
        let text = match packet.encode(false)? {
            WireData::Text(text) => text,
            WireData::Binary(_) => {
                return Err(Error::decode("binary frame in text payload"));
            }
        };
        out.push_str(&text.chars().count().to_string());
        out.push(RECORD_SEPARATOR);
        out.push_str(&text);
    }

    Ok(WireData::Text(out))
}

fn encode_binary(packets: &[Packet]) -> Result<WireData> {
    let mut out = Vec::new();

    for packet in packets {
        match packet.encode(true)? {
            WireData::Text(text) => {
                let bytes = utf8::encode_str(&text);
                out.push(HEADER_STRING);
                push_length(&mut out, bytes.len());
                out.extend_from_slice(&bytes);
            }
            WireData::Binary(bytes) => {
                out.push(HEADER_BINARY);
                push_length(&mut out, bytes.len());
                out.extend_from_slice(&bytes);
            }
        }
    }

    Ok(WireData::Binary(out))
}

/// Appends `len` as raw decimal digit bytes plus the terminator.
fn push_length(out: &mut Vec<u8>, len: usize) {
    for digit in len.to_string().bytes() {
        out.push(digit - b'0');
    }
    out.push(LENGTH_TERMINATOR);
}

// ============================================================================
// Decoding
// ============================================================================

/// Splits a wire unit back into packets, invoking `callback(packet, index,
/// total)` for each. A `false` return stops processing.
///
/// Malformed framing or an undecodable packet delivers one `Error`-kind
/// packet and stops.
pub fn decode_payload<F>(data: &WireData, callback: F)
where
    F: FnMut(Packet, usize, usize) -> bool,
{
    match data {
        WireData::Text(text) => decode_text(text, callback),
        WireData::Binary(bytes) => decode_binary(bytes, callback),
    }
}

fn decode_text<F>(data: &str, mut callback: F)
where
    F: FnMut(Packet, usize, usize) -> bool,
{
    if data.is_empty() {
        return;
    }

    let segments = match split_text(data) {
        Ok(segments) => segments,
        Err(err) => {
            trace!(error = %err, "malformed text payload");
            callback(Packet::error("parser error"), 0, 1);
            return;
        }
    };

    let total = segments.len();
    for (index, segment) in segments.into_iter().enumerate() {
        match Packet::decode(segment) {
            Ok(packet) => {
                if !callback(packet, index, total) {
                    return;
                }
            }
            Err(err) => {
                trace!(error = %err, index, "undecodable packet in payload");
                callback(Packet::error("parser error"), index, total);
                return;
            }
        }
    }
}

fn decode_binary<F>(data: &[u8], mut callback: F)
where
    F: FnMut(Packet, usize, usize) -> bool,
{
    if data.is_empty() {
        return;
    }

    let frames = match split_binary(data) {
        Ok(frames) => frames,
        Err(err) => {
            trace!(error = %err, "malformed binary payload");
            callback(Packet::error("parser error"), 0, 1);
            return;
        }
    };

    let total = frames.len();
    for (index, (header, content)) in frames.into_iter().enumerate() {
        let decoded = if header == HEADER_STRING {
            utf8::decode_to_string(content).and_then(|text| Packet::decode(&text))
        } else {
            Packet::decode_bytes(content)
        };

        match decoded {
            Ok(packet) => {
                if !callback(packet, index, total) {
                    return;
                }
            }
            Err(err) => {
                trace!(error = %err, index, "undecodable packet in payload");
                callback(Packet::error("parser error"), index, total);
                return;
            }
        }
    }
}

/// Splits a text payload into its packet segments.
fn split_text(data: &str) -> Result<Vec<&str>> {
    let mut segments = Vec::new();
    let mut rest = data;

    while !rest.is_empty() {
        let separator = rest
            .find(RECORD_SEPARATOR)
            .ok_or_else(|| Error::decode("missing record separator"))?;
        let (length_str, tail) = rest.split_at(separator);
        let tail = &tail[RECORD_SEPARATOR.len_utf8()..];

        if length_str.is_empty() || !length_str.bytes().all(|byte| byte.is_ascii_digit()) {
            return Err(Error::decode(format!(
                "invalid length prefix '{length_str}'"
            )));
        }
        let char_count: usize = length_str
            .parse()
            .map_err(|_| Error::decode("length prefix out of range"))?;

        // The prefix counts characters, not bytes.
        let mut seen = 0;
        let mut end = None;
        for (offset, _) in tail.char_indices() {
            if seen == char_count {
                end = Some(offset);
                break;
            }
            seen += 1;
        }
        let end = match end {
            Some(offset) => offset,
            None if seen == char_count => tail.len(),
            None => return Err(Error::decode("payload truncated mid-packet")),
        };

        segments.push(&tail[..end]);
        rest = &tail[end..];
    }

    Ok(segments)
}

/// Splits a binary payload into `(header, content)` frames.
fn split_binary(data: &[u8]) -> Result<Vec<(u8, &[u8])>> {
    let mut frames = Vec::new();
    let mut rest = data;

    while !rest.is_empty() {
        let header = rest[0];
        if header != HEADER_STRING && header != HEADER_BINARY {
            return Err(Error::decode(format!("invalid frame header {header}")));
        }
        rest = &rest[1..];

        let mut length: usize = 0;
        let mut saw_digit = false;
        let mut terminated = false;
        while let Some((&byte, tail)) = rest.split_first() {
            rest = tail;
            if byte == LENGTH_TERMINATOR {
                terminated = true;
                break;
            }
            if byte > 9 {
                return Err(Error::decode(format!("invalid length digit {byte}")));
            }
            length = length
                .checked_mul(10)
                .and_then(|value| value.checked_add(usize::from(byte)))
                .ok_or_else(|| Error::decode("length prefix out of range"))?;
            saw_digit = true;
        }
        if !terminated || !saw_digit {
            return Err(Error::decode("truncated length prefix"));
        }
        if rest.len() < length {
            return Err(Error::decode("payload truncated mid-packet"));
        }

        let (content, tail) = rest.split_at(length);
        frames.push((header, content));
        rest = tail;
    }

    Ok(frames)
}

// ============================================================================
// Tests
// ============================================================================
