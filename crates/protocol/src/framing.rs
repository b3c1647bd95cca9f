//! Text-safe framing for terminal I/O.
//!
//! Terminal input and output are arbitrary byte sequences (control bytes,
//! partial UTF-8, escape sequences). The channel carries JSON text, so every
//! frame is encoded with standard base64 before it is pushed and decoded
//! after it is received.
//!
//! # Decoding policy
//!
//! [`decode`] is strict and reports malformed input as
//! [`ProtocolError::InvalidFrame`]. [`decode_lossy`] never fails: the session
//! has no way to ask the server to retransmit, so a damaged output frame is
//! surfaced as garbled bytes rather than dropped.

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD};
use base64::engine::DecodePaddingMode;
use base64::Engine as _;

use crate::error::Result;

/// Engine used for best-effort decoding of unpadded segments.
const LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_allow_trailing_bits(true)
        .with_decode_padding_mode(DecodePaddingMode::RequireNone),
);

/// Encode raw bytes into their transport-safe text form.
///
/// Zero-length input produces an empty string.
#[inline]
pub fn encode(data: impl AsRef<[u8]>) -> String {
    STANDARD.encode(data.as_ref())
}

/// Decode a frame produced by [`encode`].
pub fn decode(text: &str) -> Result<Vec<u8>> {
    Ok(STANDARD.decode(text)?)
}

/// Decode a frame, recovering as many bytes as possible from malformed input.
///
/// - whitespace and characters outside the base64 alphabet are skipped
/// - URL-safe `-` and `_` are read as `+` and `/`
/// - missing padding is accepted, and `=` ends the current quantum so
///   concatenated padded frames decode back to back
/// - a single dangling character that cannot form a byte is dropped
///
/// Well-formed input decodes exactly as [`decode`] would.
pub fn decode_lossy(text: &str) -> Vec<u8> {
    let mut output = Vec::with_capacity(text.len() / 4 * 3 + 3);
    let mut segment = String::with_capacity(text.len());

    for ch in text.chars() {
        match ch {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '+' | '/' => segment.push(ch),
            '-' => segment.push('+'),
            '_' => segment.push('/'),
            '=' => flush_segment(&mut segment, &mut output),
            _ => {}
        }
    }
    flush_segment(&mut segment, &mut output);

    output
}

fn flush_segment(segment: &mut String, output: &mut Vec<u8>) {
    if segment.len() % 4 == 1 {
        segment.pop();
    }
    if !segment.is_empty() {
        if let Ok(bytes) = LENIENT.decode(segment.as_bytes()) {
            output.extend_from_slice(&bytes);
        }
    }
    segment.clear();
}
