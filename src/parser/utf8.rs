//! Surrogate-tolerant UTF-8 codec.
//!
//! Payload framing carries strings as UTF-8 bytes, but peers speak in
//! UTF-16 code units and may legally emit *unpaired* surrogate halves.
//! Rust's `String` cannot represent those, and a strict UTF-8 codec would
//! either reject or silently mangle them — both unacceptable for lossless
//! framing of untrusted input. This codec therefore works on raw UTF-16
//! code unit sequences:
//!
//! - A valid surrogate pair encodes as the standard 4-byte sequence of the
//!   combined code point.
//! - An unpaired surrogate encodes as a 3-byte sequence of its raw 16-bit
//!   value. This is not standard UTF-8, but it round-trips, which is what
//!   the wire peers expect.
//!
//! [`encode_str`]/[`decode_to_string`] are the conveniences used by the
//! packet pipeline, where payloads are ordinary Rust strings.

// ============================================================================
// Imports
// ============================================================================

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

const HIGH_SURROGATE: std::ops::RangeInclusive<u16> = 0xD800..=0xDBFF;
const LOW_SURROGATE: std::ops::RangeInclusive<u16> = 0xDC00..=0xDFFF;

// ============================================================================
// Encoding
// ============================================================================

/// Encodes a UTF-16 code unit sequence as bytes.
///
/// Unpaired surrogates are encoded as 3-byte sequences of their raw value
/// instead of being rejected.
#[must_use]
pub fn encode_units(units: &[u16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(units.len() * 3);
    let mut i = 0;

    while i < units.len() {
        let unit = units[i];

        if HIGH_SURROGATE.contains(&unit)
            && i + 1 < units.len()
            && LOW_SURROGATE.contains(&units[i + 1])
        {
            let code_point = 0x10000
                + ((u32::from(unit) - 0xD800) << 10)
                + (u32::from(units[i + 1]) - 0xDC00);
            out.push(0xF0 | (code_point >> 18) as u8);
            out.push(0x80 | ((code_point >> 12) & 0x3F) as u8);
            out.push(0x80 | ((code_point >> 6) & 0x3F) as u8);
            out.push(0x80 | (code_point & 0x3F) as u8);
            i += 2;
            continue;
        }

        match unit {
            0x0000..=0x007F => out.push(unit as u8),
            0x0080..=0x07FF => {
                out.push(0xC0 | (unit >> 6) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
            // 3-byte range, surrogates included: an unpaired half keeps
            // its raw 16-bit value on the wire.
            _ => {
                out.push(0xE0 | (unit >> 12) as u8);
                out.push(0x80 | ((unit >> 6) & 0x3F) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
        }
        i += 1;
    }

    out
}

/// Encodes a Rust string as UTF-8 bytes.
///
/// Valid strings contain no unpaired surrogates, so this is byte-identical
/// to [`encode_units`] over the string's UTF-16 form.
#[inline]
#[must_use]
pub fn encode_str(text: &str) -> Vec<u8> {
    text.as_bytes().to_vec()
}

// ============================================================================
// Decoding
// ============================================================================

/// Decodes bytes back into UTF-16 code units.
///
/// 4-byte sequences become surrogate pairs; 3-byte encodings of lone
/// surrogates pass through unchanged.
///
/// # Errors
///
/// [`Error::Decode`] on a stray continuation byte, a leader not followed
/// by enough continuation bytes, or input truncated mid-sequence.
pub fn decode_units(bytes: &[u8]) -> Result<Vec<u16>> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        let byte = bytes[i];

        if byte < 0x80 {
            out.push(u16::from(byte));
            i += 1;
        } else if byte & 0xE0 == 0xC0 {
            let unit = (u16::from(byte & 0x1F) << 6) | u16::from(continuation(bytes, i + 1)?);
            out.push(unit);
            i += 2;
        } else if byte & 0xF0 == 0xE0 {
            let unit = (u16::from(byte & 0x0F) << 12)
                | (u16::from(continuation(bytes, i + 1)?) << 6)
                | u16::from(continuation(bytes, i + 2)?);
            out.push(unit);
            i += 3;
        } else if byte & 0xF8 == 0xF0 {
            let code_point = (u32::from(byte & 0x07) << 18)
                | (u32::from(continuation(bytes, i + 1)?) << 12)
                | (u32::from(continuation(bytes, i + 2)?) << 6)
                | u32::from(continuation(bytes, i + 3)?);
            if code_point > 0x10FFFF {
                return Err(Error::decode("code point beyond U+10FFFF"));
            }
            let offset = code_point
                .checked_sub(0x10000)
                .ok_or_else(|| Error::decode("overlong 4-byte sequence"))?;
            out.push(0xD800 + (offset >> 10) as u16);
            out.push(0xDC00 + (offset & 0x3FF) as u16);
            i += 4;
        } else {
            return Err(Error::decode(format!(
                "unexpected byte 0x{byte:02X} at offset {i}"
            )));
        }
    }

    Ok(out)
}

/// Decodes bytes into a Rust string.
///
/// # Errors
///
/// [`Error::Decode`] on malformed input, or on decoded unpaired
/// surrogates, which a `String` cannot hold.
pub fn decode_to_string(bytes: &[u8]) -> Result<String> {
    let units = decode_units(bytes)?;
    String::from_utf16(&units)
        .map_err(|_| Error::decode("payload contains unpaired surrogates"))
}

/// Reads the continuation byte at `index`.
fn continuation(bytes: &[u8], index: usize) -> Result<u8> {
    let byte = *bytes
        .get(index)
        .ok_or_else(|| Error::decode("truncated multi-byte sequence"))?;
    if byte & 0xC0 != 0x80 {
        return Err(Error::decode(format!(
            "expected continuation byte at offset {index}, found 0x{byte:02X}"
        )));
    }
    Ok(byte & 0x3F)
}

// ============================================================================
// Tests
// ============================================================================
