//! BinXml name structures.
//!
//! A name lives at a chunk-relative offset and is laid out as 4 unknown
//! bytes, a 2-byte hash, a 2-byte character count `n`, `2n` bytes of
//! UTF-16LE, and a 2-byte terminator. Element and attribute tokens carry a
//! 4-byte name offset; when that offset equals the token's own position the
//! name is inline and the stream continues past it, otherwise it is a
//! back-reference into the chunk.

use crate::err::{DeserializationError, DeserializationResult};
use crate::string_cache::StringCache;
use crate::utils::{ByteCursor, bytes, utf16};
use std::rc::Rc;

/// Bytes before the character payload: unknown (4) + hash (2) + count (2).
const NAME_HEADER_SIZE: usize = 8;

/// Decode the name structure at `offset`, returning the string and the
/// structure's total size in bytes (`10 + 2n`).
pub(crate) fn read_name_struct(
    data: &[u8],
    offset: usize,
) -> DeserializationResult<(Rc<str>, usize)> {
    let character_count = bytes::read_u16_le_r(data, offset + 6, "name character count")? as usize;
    let payload = bytes::slice_r(
        data,
        offset + NAME_HEADER_SIZE,
        character_count * 2,
        "name characters",
    )?;
    // Terminator must be present even for the empty name.
    let _ = bytes::read_u16_le_r(data, offset + NAME_HEADER_SIZE + character_count * 2, "name terminator")?;

    let name: String = utf16::chars(payload).collect();
    Ok((Rc::from(name), NAME_HEADER_SIZE + character_count * 2 + 2))
}

/// Resolve the name reference at the cursor.
///
/// Consumes the 4-byte offset, plus the inline structure when the offset
/// points at the current position. Back-references resolve through the
/// per-chunk cache; a reference outside the chunk yields the empty string
/// rather than failing the record.
pub(crate) fn resolve_name(
    cursor: &mut ByteCursor<'_>,
    names: &mut StringCache,
) -> DeserializationResult<Rc<str>> {
    let name_offset = cursor.u32("name offset")? as usize;

    if name_offset == cursor.pos() {
        let (name, total_size) = match read_name_struct(cursor.buf(), name_offset) {
            Ok(read) => read,
            Err(DeserializationError::Truncated { offset, .. }) => {
                return Err(DeserializationError::OutOfChunkBounds {
                    what: "inline name",
                    offset,
                });
            }
            Err(e) => return Err(e),
        };
        cursor.advance(total_size, "inline name")?;
        names.insert(name_offset as u32, Rc::clone(&name));
        return Ok(name);
    }

    Ok(names.get_or_decode(cursor.buf(), name_offset as u32))
}
