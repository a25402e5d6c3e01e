//! Typed value decoding and formatting.
//!
//! Substitution values and inline `Value` tokens share one closed set of
//! type codes. Formatting is a tagged dispatch straight off the code: raw
//! bytes in, text appended to the sink, no intermediate value objects.
//!
//! Embedded-fragment values (`0x21`) are the one code the formatter does not
//! handle; the walker intercepts them and recurses before dispatching here.

use crate::err::{DeserializationError, DeserializationResult};
use crate::guid::Guid;
use crate::ntsid::Sid;
use crate::utils::sink::TextSink;
use crate::utils::{escape, time, utf16};

use encoding::{DecoderTrap, EncodingRef};

#[derive(Debug, PartialOrd, PartialEq, Eq, Clone, Copy)]
pub(crate) enum BinXmlValueType {
    NullType,
    StringType,
    AnsiStringType,
    Int8Type,
    UInt8Type,
    Int16Type,
    UInt16Type,
    Int32Type,
    UInt32Type,
    Int64Type,
    UInt64Type,
    Real32Type,
    Real64Type,
    BoolType,
    BinaryType,
    GuidType,
    SizeTType,
    FileTimeType,
    SysTimeType,
    SidType,
    HexInt32Type,
    HexInt64Type,
    EvtHandleType,
    BinXmlType,
    EvtXmlType,
}

/// A raw type byte: the base code plus the 0x80 array flag.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) struct ValueTypeTag {
    pub base: BinXmlValueType,
    pub is_array: bool,
}

impl ValueTypeTag {
    pub(crate) fn from_u8(byte: u8) -> Option<ValueTypeTag> {
        use BinXmlValueType::*;

        let base = match byte & 0x7F {
            0x00 => NullType,
            0x01 => StringType,
            0x02 => AnsiStringType,
            0x03 => Int8Type,
            0x04 => UInt8Type,
            0x05 => Int16Type,
            0x06 => UInt16Type,
            0x07 => Int32Type,
            0x08 => UInt32Type,
            0x09 => Int64Type,
            0x0a => UInt64Type,
            0x0b => Real32Type,
            0x0c => Real64Type,
            0x0d => BoolType,
            0x0e => BinaryType,
            0x0f => GuidType,
            0x10 => SizeTType,
            0x11 => FileTimeType,
            0x12 => SysTimeType,
            0x13 => SidType,
            0x14 => HexInt32Type,
            0x15 => HexInt64Type,
            0x20 => EvtHandleType,
            0x21 => BinXmlType,
            0x23 => EvtXmlType,
            _ => return None,
        };

        Some(ValueTypeTag {
            base,
            is_array: byte & 0x80 != 0,
        })
    }

    pub(crate) fn is_embedded_binxml(self) -> bool {
        self.base == BinXmlValueType::BinXmlType && !self.is_array
    }

    /// True when a substitution of this type renders as a native JSON
    /// number or boolean rather than a string.
    pub(crate) fn is_json_native(self) -> bool {
        use BinXmlValueType::*;
        !self.is_array
            && matches!(
                self.base,
                Int8Type | UInt8Type | Int16Type | UInt16Type | Int32Type | UInt32Type
                    | Int64Type | UInt64Type | Real32Type | Real64Type | BoolType
            )
    }
}

/// Escaping context for string-producing types.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum ValueMode {
    Xml,
    Json,
}

/// Fixed element size in bytes, for array splitting and inline value reads.
/// Variable-size types (strings, binary, SID, size_t) return `None`.
pub(crate) fn element_size(base: BinXmlValueType) -> Option<usize> {
    use BinXmlValueType::*;
    match base {
        Int8Type | UInt8Type => Some(1),
        Int16Type | UInt16Type => Some(2),
        Int32Type | UInt32Type | Real32Type | BoolType | HexInt32Type => Some(4),
        Int64Type | UInt64Type | Real64Type | HexInt64Type | FileTimeType => Some(8),
        GuidType | SysTimeType => Some(16),
        _ => None,
    }
}

fn truncated(what: &'static str, need: usize, have: usize) -> DeserializationError {
    DeserializationError::Truncated {
        what,
        offset: 0,
        need,
        have,
    }
}

fn le_bytes<const N: usize>(bytes: &[u8], what: &'static str) -> DeserializationResult<[u8; N]> {
    bytes
        .get(..N)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| truncated(what, N, bytes.len()))
}

fn push_escaped(s: &str, mode: ValueMode, out: &mut TextSink) {
    match mode {
        ValueMode::Xml => escape::push_xml_str(s, out),
        ValueMode::Json => escape::push_json_str(s, out),
    }
}

fn push_escaped_utf16(bytes: &[u8], mode: ValueMode, out: &mut TextSink) {
    match mode {
        ValueMode::Xml => escape::push_xml_utf16(bytes, out),
        ValueMode::Json => escape::push_json_utf16(bytes, out),
    }
}

fn decode_ansi(bytes: &[u8], codec: EncodingRef) -> String {
    let terminated = match memchr::memchr(0, bytes) {
        Some(nul) => &bytes[..nul],
        None => bytes,
    };
    codec
        .decode(terminated, DecoderTrap::Replace)
        .unwrap_or_default()
}

fn push_scalar(
    bytes: &[u8],
    base: BinXmlValueType,
    mode: ValueMode,
    ansi_codec: EncodingRef,
    out: &mut TextSink,
) -> DeserializationResult<()> {
    use BinXmlValueType::*;

    match base {
        NullType => {}
        StringType => push_escaped_utf16(utf16::strip_trailing_nul(bytes), mode, out),
        AnsiStringType => push_escaped(&decode_ansi(bytes, ansi_codec), mode, out),
        Int8Type => out.push_i64(i64::from(le_bytes::<1>(bytes, "int8")?[0] as i8)),
        UInt8Type => out.push_u64(u64::from(le_bytes::<1>(bytes, "uint8")?[0])),
        Int16Type => out.push_i64(i64::from(i16::from_le_bytes(le_bytes(bytes, "int16")?))),
        UInt16Type => out.push_u64(u64::from(u16::from_le_bytes(le_bytes(bytes, "uint16")?))),
        Int32Type => out.push_i64(i64::from(i32::from_le_bytes(le_bytes(bytes, "int32")?))),
        UInt32Type => out.push_u64(u64::from(u32::from_le_bytes(le_bytes(bytes, "uint32")?))),
        Int64Type => out.push_i64(i64::from_le_bytes(le_bytes(bytes, "int64")?)),
        UInt64Type => out.push_u64(u64::from_le_bytes(le_bytes(bytes, "uint64")?)),
        Real32Type => out.push_f32(f32::from_le_bytes(le_bytes(bytes, "float32")?)),
        Real64Type => out.push_f64(f64::from_le_bytes(le_bytes(bytes, "float64")?)),
        BoolType => {
            let value = u32::from_le_bytes(le_bytes(bytes, "bool")?);
            out.push_str(if value != 0 { "true" } else { "false" });
        }
        BinaryType | EvtHandleType | EvtXmlType | BinXmlType => {
            // 0x21 is intercepted by the walker before this dispatch; if it
            // lands here anyway (array element), fall through to hex.
            out.push_hex_bytes(bytes, true);
        }
        GuidType => Guid::from_bytes(&le_bytes::<16>(bytes, "guid")?).push_to(out),
        SizeTType => {
            out.push_str("0x");
            if bytes.len() >= 8 {
                out.push_hex_u64(u64::from_le_bytes(le_bytes(bytes, "size_t")?), 16, false);
            } else {
                out.push_hex_u64(
                    u64::from(u32::from_le_bytes(le_bytes(bytes, "size_t")?)),
                    8,
                    false,
                );
            }
        }
        FileTimeType => time::push_filetime(u64::from_le_bytes(le_bytes(bytes, "filetime")?), out),
        SysTimeType => time::push_systemtime(&le_bytes::<16>(bytes, "systemtime")?, out),
        SidType => Sid::from_bytes(bytes)
            .ok_or_else(|| truncated("sid", 8, bytes.len()))?
            .push_to(out),
        HexInt32Type => {
            out.push_str("0x");
            out.push_hex_u64(
                u64::from(u32::from_le_bytes(le_bytes(bytes, "hex_int32")?)),
                8,
                false,
            );
        }
        HexInt64Type => {
            out.push_str("0x");
            out.push_hex_u64(u64::from_le_bytes(le_bytes(bytes, "hex_int64")?), 16, false);
        }
    }

    Ok(())
}

fn push_string_array(
    bytes: &[u8],
    base: BinXmlValueType,
    mode: ValueMode,
    ansi_codec: EncodingRef,
    out: &mut TextSink,
) -> DeserializationResult<()> {
    let mut first = true;
    let mut push_component = |component: &[u8], out: &mut TextSink| {
        if component.is_empty() {
            return;
        }
        if !first {
            out.push_str(", ");
        }
        first = false;
        match base {
            BinXmlValueType::StringType => push_escaped_utf16(component, mode, out),
            _ => push_escaped(&decode_ansi(component, ansi_codec), mode, out),
        }
    };

    if base == BinXmlValueType::StringType {
        // Split on NUL code units.
        let mut start = 0_usize;
        let even = bytes.len() & !1;
        let mut i = 0_usize;
        while i < even {
            if bytes[i] == 0 && bytes[i + 1] == 0 {
                push_component(&bytes[start..i], out);
                start = i + 2;
            }
            i += 2;
        }
        push_component(&bytes[start..even], out);
    } else {
        for component in bytes.split(|&b| b == 0) {
            push_component(component, out);
        }
    }

    Ok(())
}

/// Format `bytes` under `tag`, appending to `out`.
///
/// Array values (`0x80` flag) are joined with `", "`: strings split on NUL
/// terminators (empty components dropped), fixed-size types split at their
/// element size (a trailing partial element is ignored), and anything else
/// falls back to a hex dump of the whole buffer.
pub(crate) fn push_value(
    bytes: &[u8],
    tag: ValueTypeTag,
    mode: ValueMode,
    ansi_codec: EncodingRef,
    out: &mut TextSink,
) -> DeserializationResult<()> {
    use BinXmlValueType::*;

    if !tag.is_array {
        return push_scalar(bytes, tag.base, mode, ansi_codec, out);
    }

    match tag.base {
        StringType | AnsiStringType => push_string_array(bytes, tag.base, mode, ansi_codec, out),
        base => match element_size(base) {
            Some(size) => {
                let mut first = true;
                for element in bytes.chunks_exact(size) {
                    if !first {
                        out.push_str(", ");
                    }
                    first = false;
                    push_scalar(element, base, mode, ansi_codec, out)?;
                }
                Ok(())
            }
            None => {
                out.push_hex_bytes(bytes, true);
                Ok(())
            }
        },
    }
}

/// A substitution counts as empty when its descriptor is null-typed or its
/// payload is zero-length; optional slots render nothing for these.
pub(crate) fn is_empty_value(bytes: &[u8], tag: ValueTypeTag) -> bool {
    tag.base == BinXmlValueType::NullType || bytes.is_empty()
}

/// Format a substitution as a JSON content-array item: a native number or
/// boolean when the type allows it, a quoted string otherwise.
///
/// The value is staged through a scratch sink so that a decode failure still
/// leaves balanced quotes in the output; the error is returned for the
/// caller's diagnostic.
pub(crate) fn push_json_content_value(
    bytes: &[u8],
    tag: ValueTypeTag,
    ansi_codec: EncodingRef,
    out: &mut TextSink,
) -> DeserializationResult<()> {
    let mut scratch = TextSink::new();
    let result = push_value(bytes, tag, ValueMode::Json, ansi_codec, &mut scratch);

    if result.is_ok() && tag.is_json_native() && !scratch.is_empty() {
        out.push_str(scratch.as_str());
    } else {
        out.push('"');
        out.push_str(scratch.as_str());
        out.push('"');
    }
    result
}
