//! UTF-16LE decoding helpers.
//!
//! All value strings in a chunk are UTF-16LE spans into the file image.
//! Decoding replaces unpaired surrogates with U+FFFD instead of failing, so
//! a single mangled code unit cannot sink a whole record.

use std::char::{REPLACEMENT_CHARACTER, decode_utf16};

/// Iterate the little-endian code units of `bytes`.
///
/// A trailing odd byte is ignored.
pub(crate) fn units(bytes: &[u8]) -> impl Iterator<Item = u16> + '_ {
    bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
}

/// Iterate the characters of a UTF-16LE span, lossily.
pub(crate) fn chars(bytes: &[u8]) -> impl Iterator<Item = char> + '_ {
    decode_utf16(units(bytes)).map(|r| r.unwrap_or(REPLACEMENT_CHARACTER))
}

/// Strip a single trailing NUL code unit, if present.
pub(crate) fn strip_trailing_nul(bytes: &[u8]) -> &[u8] {
    let even = bytes.len() & !1;
    let bytes = &bytes[..even];
    if bytes.ends_with(&[0, 0]) {
        &bytes[..bytes.len() - 2]
    } else {
        bytes
    }
}

/// Decode a UTF-16LE span into an owned string, lossily.
pub(crate) fn decode(bytes: &[u8]) -> String {
    chars(bytes).collect()
}
