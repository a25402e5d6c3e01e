//! The streaming BinXml token walker.
//!
//! The walker renders a record body directly into a [`TextSink`], in either
//! XML or structural JSON form. It is both the cold path for templates that
//! could not be compiled (re-parsing the body against the record's
//! substitution vector) and the machinery that parses template instances and
//! dispatches to the compiled zipper on the hot path.
//!
//! Error policy: structural failures (`DeserializationError`) propagate to
//! the record parser, which keeps the partial output and attaches a
//! diagnostic. Conditions the walker can step over (missing names, skipped
//! substitutions, the recursion cap) are noted on the context and rendering
//! continues.

use crate::binxml::name::resolve_name;
use crate::binxml::tokens::BinXmlRawToken;
use crate::binxml::value_variant::{
    ValueMode, ValueTypeTag, element_size, is_empty_value, push_json_content_value, push_value,
};
use crate::err::{DeserializationError, DeserializationResult};
use crate::settings::OutputFormat;
use crate::string_cache::StringCache;
use crate::template_cache::{
    LocalTemplateCache, TEMPLATE_DEFINITION_HEADER_SIZE, TemplateDescriptor, TemplateTable,
    read_template_definition_header,
};
use crate::utils::sink::TextSink;
use crate::utils::{ByteCursor, escape, utf16};

use encoding::EncodingRef;
use log::trace;
use std::sync::Arc;

/// Maximum accepted element nesting. Depth 64 renders; depth 65 degrades.
pub(crate) const MAX_ELEMENT_DEPTH: usize = 64;

/// Everything a render needs besides the sink: the chunk image, the
/// per-chunk caches, and the first-degradation note.
pub(crate) struct RenderContext<'a, 'c> {
    pub data: &'a [u8],
    pub names: &'c mut StringCache,
    pub templates: Option<&'c TemplateTable>,
    pub compiled: &'c mut LocalTemplateCache,
    pub ansi_codec: EncodingRef,
    diagnostic: Option<String>,
}

impl<'a, 'c> RenderContext<'a, 'c> {
    pub(crate) fn new(
        data: &'a [u8],
        names: &'c mut StringCache,
        templates: Option<&'c TemplateTable>,
        compiled: &'c mut LocalTemplateCache,
        ansi_codec: EncodingRef,
    ) -> Self {
        RenderContext {
            data,
            names,
            templates,
            compiled,
            ansi_codec,
            diagnostic: None,
        }
    }

    /// Record a degradation. The first note wins; later ones are usually
    /// knock-on effects of the first.
    pub(crate) fn note(&mut self, message: &str) {
        if self.diagnostic.is_none() {
            self.diagnostic = Some(message.to_owned());
        }
    }

    pub(crate) fn take_diagnostic(&mut self) -> Option<String> {
        self.diagnostic.take()
    }
}

#[derive(Debug, Clone, Copy)]
struct SubstitutionEntry {
    offset: usize,
    size: u16,
    tag: ValueTypeTag,
}

/// One template instance's typed values, as spans into the chunk.
pub(crate) struct SubstitutionVector<'a> {
    data: &'a [u8],
    entries: Vec<SubstitutionEntry>,
}

impl<'a> SubstitutionVector<'a> {
    /// Assemble a vector from `(offset, size, tag)` triples over `data`.
    #[cfg(test)]
    pub(crate) fn from_raw(data: &'a [u8], raw: Vec<(usize, u16, ValueTypeTag)>) -> Self {
        SubstitutionVector {
            data,
            entries: raw
                .into_iter()
                .map(|(offset, size, tag)| SubstitutionEntry { offset, size, tag })
                .collect(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// The value bytes and descriptor type of slot `index`.
    pub(crate) fn get(&self, index: u16) -> Option<(&'a [u8], ValueTypeTag)> {
        let entry = self.entries.get(index as usize)?;
        let bytes = self
            .data
            .get(entry.offset..entry.offset + usize::from(entry.size))?;
        Some((bytes, entry.tag))
    }

    /// The chunk-relative span of slot `index`, for embedded fragments.
    pub(crate) fn get_span(&self, index: u16) -> Option<(usize, usize)> {
        let entry = self.entries.get(index as usize)?;
        Some((entry.offset, usize::from(entry.size)))
    }
}

/// Render a record body (`body_start..body_end`, chunk-relative).
pub(crate) fn render_record_body(
    ctx: &mut RenderContext<'_, '_>,
    format: OutputFormat,
    body_start: usize,
    body_end: usize,
    out: &mut TextSink,
) -> DeserializationResult<()> {
    let mut cursor = ByteCursor::with_pos(ctx.data, body_start)?;
    render_fragment(ctx, &mut cursor, None, 0, format, body_end, out)
}

/// The fragment-level loop: fragment headers, template instances, root
/// elements, and processing instructions.
pub(crate) fn render_fragment(
    ctx: &mut RenderContext<'_, '_>,
    cursor: &mut ByteCursor<'_>,
    subs: Option<&SubstitutionVector<'_>>,
    depth: usize,
    format: OutputFormat,
    end: usize,
    out: &mut TextSink,
) -> DeserializationResult<()> {
    while cursor.pos() < end {
        let offset = cursor.pos() as u64;
        let byte = cursor.u8("token")?;
        let token = BinXmlRawToken::from_u8(byte)
            .ok_or(DeserializationError::InvalidToken { value: byte, offset })?;

        match token {
            BinXmlRawToken::FragmentHeader => cursor.advance(3, "fragment header")?,
            BinXmlRawToken::EndOfStream => break,
            BinXmlRawToken::OpenStartElement { has_attributes } => {
                render_element(ctx, cursor, subs, depth + 1, has_attributes, format, out)?;
            }
            BinXmlRawToken::TemplateInstance => {
                render_template_instance(ctx, cursor, depth, format, out)?;
            }
            BinXmlRawToken::PITarget => render_pi(ctx, cursor, format, out)?,
            // A bare PIData without a preceding target is consumed silently.
            BinXmlRawToken::PIData => {
                let _ = read_sized_utf16(cursor)?;
            }
            _ => {
                return Err(DeserializationError::UnexpectedToken {
                    value: byte,
                    expected: "a fragment-level token",
                    offset,
                });
            }
        }
    }
    Ok(())
}

fn render_element(
    ctx: &mut RenderContext<'_, '_>,
    cursor: &mut ByteCursor<'_>,
    subs: Option<&SubstitutionVector<'_>>,
    depth: usize,
    has_attributes: bool,
    format: OutputFormat,
    out: &mut TextSink,
) -> DeserializationResult<()> {
    match format {
        OutputFormat::Xml => render_element_xml(ctx, cursor, subs, depth, has_attributes, out),
        OutputFormat::Json => render_element_json(ctx, cursor, subs, depth, has_attributes, out),
    }
}

pub(crate) fn peek_token(cursor: &ByteCursor<'_>) -> Option<BinXmlRawToken> {
    cursor.peek_u8().and_then(BinXmlRawToken::from_u8)
}

/// A length-prefixed UTF-16 text run (2-byte character count, no
/// terminator), as used by CDATA, PI data, and inline string values.
pub(crate) fn read_sized_utf16<'a>(cursor: &mut ByteCursor<'a>) -> DeserializationResult<&'a [u8]> {
    let characters = cursor.u16("text length")? as usize;
    cursor.take_bytes(characters * 2, "text characters")
}

/// Read an inline `Value` token's payload. The type byte has already been
/// consumed into `tag`.
fn read_inline_value<'a>(
    cursor: &mut ByteCursor<'a>,
    tag: ValueTypeTag,
) -> DeserializationResult<&'a [u8]> {
    use crate::binxml::value_variant::BinXmlValueType::*;

    if tag.is_array {
        // Inline arrays carry a byte count up front.
        let len = cursor.u16("array value length")? as usize;
        return cursor.take_bytes(len, "array value");
    }

    match tag.base {
        NullType => Ok(&[]),
        StringType => read_sized_utf16(cursor),
        AnsiStringType | BinaryType => {
            let len = cursor.u16("value length")? as usize;
            cursor.take_bytes(len, "value bytes")
        }
        SidType => {
            let header = crate::utils::bytes::slice_r(cursor.buf(), cursor.pos(), 8, "sid")?;
            let len = 8 + usize::from(header[1]) * 4;
            cursor.take_bytes(len, "sid value")
        }
        SizeTType => cursor.take_bytes(8, "size_t value"),
        base => match element_size(base) {
            Some(size) => cursor.take_bytes(size, "value bytes"),
            None => Err(DeserializationError::InvalidValueVariant {
                value: 0,
                offset: cursor.pos() as u64,
            }),
        },
    }
}

pub(crate) fn read_value_token<'a>(
    cursor: &mut ByteCursor<'a>,
) -> DeserializationResult<(&'a [u8], ValueTypeTag)> {
    let offset = cursor.pos() as u64;
    let type_byte = cursor.u8("value type")?;
    let tag = ValueTypeTag::from_u8(type_byte).ok_or(DeserializationError::InvalidValueVariant {
        value: type_byte,
        offset,
    })?;
    let bytes = read_inline_value(cursor, tag)?;
    Ok((bytes, tag))
}

/// Read the index/type pair shared by both substitution tokens.
pub(crate) fn read_substitution_header(
    cursor: &mut ByteCursor<'_>,
) -> DeserializationResult<(u16, ValueTypeTag)> {
    let index = cursor.u16("substitution index")?;
    let offset = cursor.pos() as u64;
    let type_byte = cursor.u8("substitution type")?;
    let tag = ValueTypeTag::from_u8(type_byte).ok_or(DeserializationError::InvalidValueVariant {
        value: type_byte,
        offset,
    })?;
    Ok((index, tag))
}

// ---------------------------------------------------------------------------
// XML rendering
// ---------------------------------------------------------------------------

fn render_element_xml(
    ctx: &mut RenderContext<'_, '_>,
    cursor: &mut ByteCursor<'_>,
    subs: Option<&SubstitutionVector<'_>>,
    depth: usize,
    has_attributes: bool,
    out: &mut TextSink,
) -> DeserializationResult<()> {
    let _dependency_id = cursor.u16("dependency id")?;
    let data_size = cursor.u32("element data size")? as usize;
    // The size counts everything after its own field, through the close token.
    let element_end = cursor.pos().saturating_add(data_size).min(ctx.data.len());
    let name = resolve_name(cursor, ctx.names)?;

    if depth > MAX_ELEMENT_DEPTH {
        ctx.note("element nesting exceeds 64 levels");
        out.push('<');
        out.push_str(&name);
        out.push_str("/>");
        cursor.set_pos(element_end, "oversized element skip")?;
        return Ok(());
    }

    out.push('<');
    out.push_str(&name);

    if has_attributes {
        let _attribute_list_size = cursor.u32("attribute list size")?;
        while let Some(BinXmlRawToken::Attribute { .. }) = peek_token(cursor) {
            cursor.advance(1, "attribute token")?;
            render_attribute_xml(ctx, cursor, subs, depth, out)?;
        }
    }

    let offset = cursor.pos() as u64;
    let close_byte = cursor.u8("element close token")?;
    match BinXmlRawToken::from_u8(close_byte) {
        Some(BinXmlRawToken::CloseEmptyElement) => {
            out.push_str("/>");
            return Ok(());
        }
        Some(BinXmlRawToken::CloseStartElement) => out.push('>'),
        _ => {
            return Err(DeserializationError::UnexpectedToken {
                value: close_byte,
                expected: "an element close token",
                offset,
            });
        }
    }

    loop {
        let offset = cursor.pos() as u64;
        let byte = cursor.u8("content token")?;
        let token = BinXmlRawToken::from_u8(byte)
            .ok_or(DeserializationError::InvalidToken { value: byte, offset })?;

        match token {
            BinXmlRawToken::CloseElement => break,
            BinXmlRawToken::EndOfStream => {
                ctx.note("element content ends before its close token");
                break;
            }
            BinXmlRawToken::OpenStartElement { has_attributes } => {
                render_element_xml(ctx, cursor, subs, depth + 1, has_attributes, out)?;
            }
            BinXmlRawToken::Value => {
                let (bytes, tag) = read_value_token(cursor)?;
                if let Err(e) = push_value(bytes, tag, ValueMode::Xml, ctx.ansi_codec, out) {
                    trace!("inline value failed to format: {e}");
                    ctx.note("inline value could not be formatted");
                }
            }
            BinXmlRawToken::NormalSubstitution => {
                render_substitution_xml(ctx, cursor, subs, depth, false, out)?;
            }
            BinXmlRawToken::OptionalSubstitution => {
                render_substitution_xml(ctx, cursor, subs, depth, true, out)?;
            }
            BinXmlRawToken::CharReference => {
                let value = cursor.u16("character reference")?;
                out.push_str("&#");
                out.push_u64(u64::from(value));
                out.push(';');
            }
            BinXmlRawToken::EntityReference => {
                let entity = resolve_name(cursor, ctx.names)?;
                out.push('&');
                out.push_str(&entity);
                out.push(';');
            }
            BinXmlRawToken::CDataSection => {
                let text = read_sized_utf16(cursor)?;
                out.push_str("<![CDATA[");
                for ch in utf16::chars(text) {
                    out.push(ch);
                }
                out.push_str("]]>");
            }
            BinXmlRawToken::TemplateInstance => {
                render_template_instance(ctx, cursor, depth, OutputFormat::Xml, out)?;
            }
            BinXmlRawToken::PITarget => render_pi(ctx, cursor, OutputFormat::Xml, out)?,
            BinXmlRawToken::PIData => {
                let _ = read_sized_utf16(cursor)?;
            }
            BinXmlRawToken::FragmentHeader => cursor.advance(3, "fragment header")?,
            BinXmlRawToken::CloseStartElement
            | BinXmlRawToken::CloseEmptyElement
            | BinXmlRawToken::Attribute { .. } => {
                ctx.note("unexpected break token in element content");
                break;
            }
        }
    }

    out.push_str("</");
    out.push_str(&name);
    out.push('>');
    Ok(())
}

fn render_attribute_xml(
    ctx: &mut RenderContext<'_, '_>,
    cursor: &mut ByteCursor<'_>,
    subs: Option<&SubstitutionVector<'_>>,
    depth: usize,
    out: &mut TextSink,
) -> DeserializationResult<()> {
    let name = resolve_name(cursor, ctx.names)?;
    out.push(' ');
    out.push_str(&name);
    out.push_str("=\"");

    loop {
        let offset = cursor.pos() as u64;
        let Some(byte) = cursor.peek_u8() else { break };
        let token = BinXmlRawToken::from_u8(byte)
            .ok_or(DeserializationError::InvalidToken { value: byte, offset })?;
        if token.is_break() {
            break;
        }
        cursor.advance(1, "attribute value token")?;

        match token {
            BinXmlRawToken::Value => {
                let (bytes, tag) = read_value_token(cursor)?;
                if let Err(e) = push_value(bytes, tag, ValueMode::Xml, ctx.ansi_codec, out) {
                    trace!("attribute value failed to format: {e}");
                    ctx.note("attribute value could not be formatted");
                }
            }
            BinXmlRawToken::NormalSubstitution => {
                render_substitution_xml(ctx, cursor, subs, depth, false, out)?;
            }
            BinXmlRawToken::OptionalSubstitution => {
                render_substitution_xml(ctx, cursor, subs, depth, true, out)?;
            }
            BinXmlRawToken::CharReference => {
                let value = cursor.u16("character reference")?;
                out.push_str("&#");
                out.push_u64(u64::from(value));
                out.push(';');
            }
            BinXmlRawToken::EntityReference => {
                let entity = resolve_name(cursor, ctx.names)?;
                out.push('&');
                out.push_str(&entity);
                out.push(';');
            }
            BinXmlRawToken::CDataSection => {
                let text = read_sized_utf16(cursor)?;
                escape::push_xml_utf16(text, out);
            }
            BinXmlRawToken::FragmentHeader => cursor.advance(3, "fragment header")?,
            _ => {
                return Err(DeserializationError::UnexpectedToken {
                    value: byte,
                    expected: "an attribute value token",
                    offset,
                });
            }
        }
    }

    out.push('"');
    Ok(())
}

fn render_substitution_xml(
    ctx: &mut RenderContext<'_, '_>,
    cursor: &mut ByteCursor<'_>,
    subs: Option<&SubstitutionVector<'_>>,
    depth: usize,
    optional: bool,
    out: &mut TextSink,
) -> DeserializationResult<()> {
    let (index, _token_tag) = read_substitution_header(cursor)?;

    let Some(subs) = subs else {
        ctx.note("substitution token outside a template instance");
        return Ok(());
    };
    // The descriptor's type wins over the token's: a null descriptor marks a
    // deleted value no matter what the template says.
    let Some((bytes, tag)) = subs.get(index) else {
        ctx.note("substitution index out of range");
        return Ok(());
    };

    if optional && is_empty_value(bytes, tag) {
        return Ok(());
    }

    if tag.is_embedded_binxml() {
        let (start, len) = subs.get_span(index).unwrap_or((0, 0));
        return render_embedded(ctx, start, len, depth, OutputFormat::Xml, out);
    }

    if let Err(e) = push_value(bytes, tag, ValueMode::Xml, ctx.ansi_codec, out) {
        trace!("substitution {index} failed to format: {e}");
        ctx.note("substitution value could not be formatted");
    }
    Ok(())
}

fn render_pi(
    ctx: &mut RenderContext<'_, '_>,
    cursor: &mut ByteCursor<'_>,
    format: OutputFormat,
    out: &mut TextSink,
) -> DeserializationResult<()> {
    let name = resolve_name(cursor, ctx.names)?;

    let data = if peek_token(cursor) == Some(BinXmlRawToken::PIData) {
        cursor.advance(1, "pi data token")?;
        Some(read_sized_utf16(cursor)?)
    } else {
        None
    };

    // Structural JSON has no representation for processing instructions.
    if format == OutputFormat::Json {
        return Ok(());
    }

    out.push_str("<?");
    out.push_str(&name);
    if let Some(data) = data {
        out.push(' ');
        for ch in utf16::chars(data) {
            out.push(ch);
        }
    }
    out.push_str("?>");
    Ok(())
}

// ---------------------------------------------------------------------------
// JSON rendering
// ---------------------------------------------------------------------------

/// Resolve the five predefined entities; anything else stays literal.
pub(crate) fn push_entity_json(name: &str, out: &mut TextSink) {
    match name {
        "amp" => escape::push_json_char('&', out),
        "lt" => escape::push_json_char('<', out),
        "gt" => escape::push_json_char('>', out),
        "quot" => escape::push_json_char('"', out),
        "apos" => escape::push_json_char('\'', out),
        other => {
            out.push('&');
            escape::push_json_str(other, out);
            out.push(';');
        }
    }
}

fn render_element_json(
    ctx: &mut RenderContext<'_, '_>,
    cursor: &mut ByteCursor<'_>,
    subs: Option<&SubstitutionVector<'_>>,
    depth: usize,
    has_attributes: bool,
    out: &mut TextSink,
) -> DeserializationResult<()> {
    let _dependency_id = cursor.u16("dependency id")?;
    let data_size = cursor.u32("element data size")? as usize;
    let element_end = cursor.pos().saturating_add(data_size).min(ctx.data.len());
    let name = resolve_name(cursor, ctx.names)?;

    if depth > MAX_ELEMENT_DEPTH {
        ctx.note("element nesting exceeds 64 levels");
        out.push_str("null");
        cursor.set_pos(element_end, "oversized element skip")?;
        return Ok(());
    }

    out.push_str("{\"#name\":\"");
    escape::push_json_str(&name, out);
    out.push('"');

    if has_attributes {
        let _attribute_list_size = cursor.u32("attribute list size")?;
        let mut first = true;
        while let Some(BinXmlRawToken::Attribute { .. }) = peek_token(cursor) {
            cursor.advance(1, "attribute token")?;
            if first {
                out.push_str(",\"#attrs\":{");
                first = false;
            } else {
                out.push(',');
            }
            render_attribute_json(ctx, cursor, subs, depth, out)?;
        }
        if !first {
            out.push('}');
        }
    }

    let offset = cursor.pos() as u64;
    let close_byte = cursor.u8("element close token")?;
    match BinXmlRawToken::from_u8(close_byte) {
        Some(BinXmlRawToken::CloseEmptyElement) => {
            out.push('}');
            return Ok(());
        }
        Some(BinXmlRawToken::CloseStartElement) => {}
        _ => {
            return Err(DeserializationError::UnexpectedToken {
                value: close_byte,
                expected: "an element close token",
                offset,
            });
        }
    }

    // An element whose content is syntactically empty omits #content; one
    // whose optional substitutions all skip still gets an empty array, the
    // same shape the compiled path produces.
    if peek_token(cursor) == Some(BinXmlRawToken::CloseElement) {
        cursor.advance(1, "element end token")?;
        out.push('}');
        return Ok(());
    }

    out.push_str(",\"#content\":[");
    let mut emitted_any = false;
    let mut text_open = false;

    macro_rules! open_text {
        () => {
            if !text_open {
                if emitted_any {
                    out.push(',');
                }
                out.push('"');
                text_open = true;
                emitted_any = true;
            }
        };
    }
    macro_rules! close_text {
        () => {
            if text_open {
                out.push('"');
                text_open = false;
            }
        };
    }

    loop {
        let offset = cursor.pos() as u64;
        let byte = cursor.u8("content token")?;
        let token = BinXmlRawToken::from_u8(byte)
            .ok_or(DeserializationError::InvalidToken { value: byte, offset })?;

        match token {
            BinXmlRawToken::CloseElement => break,
            BinXmlRawToken::EndOfStream => {
                ctx.note("element content ends before its close token");
                break;
            }
            BinXmlRawToken::OpenStartElement { has_attributes } => {
                close_text!();
                if emitted_any {
                    out.push(',');
                }
                render_element_json(ctx, cursor, subs, depth + 1, has_attributes, out)?;
                emitted_any = true;
            }
            BinXmlRawToken::Value => {
                open_text!();
                let (bytes, tag) = read_value_token(cursor)?;
                if let Err(e) = push_value(bytes, tag, ValueMode::Json, ctx.ansi_codec, out) {
                    trace!("inline value failed to format: {e}");
                    ctx.note("inline value could not be formatted");
                }
            }
            BinXmlRawToken::CharReference => {
                open_text!();
                let value = cursor.u16("character reference")?;
                let ch = char::from_u32(u32::from(value)).unwrap_or('\u{FFFD}');
                escape::push_json_char(ch, out);
            }
            BinXmlRawToken::EntityReference => {
                open_text!();
                let entity = resolve_name(cursor, ctx.names)?;
                push_entity_json(&entity, out);
            }
            BinXmlRawToken::CDataSection => {
                open_text!();
                let text = read_sized_utf16(cursor)?;
                escape::push_json_utf16(text, out);
            }
            BinXmlRawToken::NormalSubstitution => {
                close_text!();
                render_content_substitution_json(
                    ctx,
                    cursor,
                    subs,
                    depth,
                    false,
                    &mut emitted_any,
                    out,
                )?;
            }
            BinXmlRawToken::OptionalSubstitution => {
                close_text!();
                render_content_substitution_json(
                    ctx,
                    cursor,
                    subs,
                    depth,
                    true,
                    &mut emitted_any,
                    out,
                )?;
            }
            BinXmlRawToken::TemplateInstance => {
                close_text!();
                if emitted_any {
                    out.push(',');
                }
                render_template_instance(ctx, cursor, depth, OutputFormat::Json, out)?;
                emitted_any = true;
            }
            BinXmlRawToken::PITarget => render_pi(ctx, cursor, OutputFormat::Json, out)?,
            BinXmlRawToken::PIData => {
                let _ = read_sized_utf16(cursor)?;
            }
            BinXmlRawToken::FragmentHeader => cursor.advance(3, "fragment header")?,
            BinXmlRawToken::CloseStartElement
            | BinXmlRawToken::CloseEmptyElement
            | BinXmlRawToken::Attribute { .. } => {
                ctx.note("unexpected break token in element content");
                break;
            }
        }
    }

    close_text!();
    out.push_str("]}");
    Ok(())
}

fn render_attribute_json(
    ctx: &mut RenderContext<'_, '_>,
    cursor: &mut ByteCursor<'_>,
    subs: Option<&SubstitutionVector<'_>>,
    depth: usize,
    out: &mut TextSink,
) -> DeserializationResult<()> {
    let name = resolve_name(cursor, ctx.names)?;
    out.push('"');
    escape::push_json_str(&name, out);
    out.push_str("\":\"");

    loop {
        let offset = cursor.pos() as u64;
        let Some(byte) = cursor.peek_u8() else { break };
        let token = BinXmlRawToken::from_u8(byte)
            .ok_or(DeserializationError::InvalidToken { value: byte, offset })?;
        if token.is_break() {
            break;
        }
        cursor.advance(1, "attribute value token")?;

        match token {
            BinXmlRawToken::Value => {
                let (bytes, tag) = read_value_token(cursor)?;
                if let Err(e) = push_value(bytes, tag, ValueMode::Json, ctx.ansi_codec, out) {
                    trace!("attribute value failed to format: {e}");
                    ctx.note("attribute value could not be formatted");
                }
            }
            BinXmlRawToken::NormalSubstitution => {
                render_string_substitution_json(ctx, cursor, subs, depth, false, out)?;
            }
            BinXmlRawToken::OptionalSubstitution => {
                render_string_substitution_json(ctx, cursor, subs, depth, true, out)?;
            }
            BinXmlRawToken::CharReference => {
                let value = cursor.u16("character reference")?;
                let ch = char::from_u32(u32::from(value)).unwrap_or('\u{FFFD}');
                escape::push_json_char(ch, out);
            }
            BinXmlRawToken::EntityReference => {
                let entity = resolve_name(cursor, ctx.names)?;
                push_entity_json(&entity, out);
            }
            BinXmlRawToken::CDataSection => {
                let text = read_sized_utf16(cursor)?;
                escape::push_json_utf16(text, out);
            }
            BinXmlRawToken::FragmentHeader => cursor.advance(3, "fragment header")?,
            _ => {
                return Err(DeserializationError::UnexpectedToken {
                    value: byte,
                    expected: "an attribute value token",
                    offset,
                });
            }
        }
    }

    out.push('"');
    Ok(())
}

/// A substitution inside an already-open JSON string literal (attribute
/// values): no quotes of its own, string escaping only.
fn render_string_substitution_json(
    ctx: &mut RenderContext<'_, '_>,
    cursor: &mut ByteCursor<'_>,
    subs: Option<&SubstitutionVector<'_>>,
    depth: usize,
    optional: bool,
    out: &mut TextSink,
) -> DeserializationResult<()> {
    let (index, _token_tag) = read_substitution_header(cursor)?;

    let Some(subs) = subs else {
        ctx.note("substitution token outside a template instance");
        return Ok(());
    };
    let Some((bytes, tag)) = subs.get(index) else {
        ctx.note("substitution index out of range");
        return Ok(());
    };

    if optional && is_empty_value(bytes, tag) {
        return Ok(());
    }

    if tag.is_embedded_binxml() {
        let (start, len) = subs.get_span(index).unwrap_or((0, 0));
        let mut nested = TextSink::new();
        render_embedded(ctx, start, len, depth, OutputFormat::Json, &mut nested)?;
        escape::push_json_str(nested.as_str(), out);
        return Ok(());
    }

    if let Err(e) = push_value(bytes, tag, ValueMode::Json, ctx.ansi_codec, out) {
        trace!("substitution {index} failed to format: {e}");
        ctx.note("substitution value could not be formatted");
    }
    Ok(())
}

/// A substitution that is a content-array item: skipped when optional-empty,
/// otherwise a native scalar or a quoted string, with comma bookkeeping.
fn render_content_substitution_json(
    ctx: &mut RenderContext<'_, '_>,
    cursor: &mut ByteCursor<'_>,
    subs: Option<&SubstitutionVector<'_>>,
    depth: usize,
    optional: bool,
    emitted_any: &mut bool,
    out: &mut TextSink,
) -> DeserializationResult<()> {
    let (index, _token_tag) = read_substitution_header(cursor)?;

    let Some(subs) = subs else {
        ctx.note("substitution token outside a template instance");
        return Ok(());
    };
    let Some((bytes, tag)) = subs.get(index) else {
        ctx.note("substitution index out of range");
        return Ok(());
    };

    if optional && is_empty_value(bytes, tag) {
        return Ok(());
    }

    if *emitted_any {
        out.push(',');
    }
    *emitted_any = true;

    if tag.is_embedded_binxml() {
        let (start, len) = subs.get_span(index).unwrap_or((0, 0));
        let mut nested = TextSink::new();
        render_embedded(ctx, start, len, depth, OutputFormat::Json, &mut nested)?;
        out.push('"');
        escape::push_json_str(nested.as_str(), out);
        out.push('"');
        return Ok(());
    }

    if let Err(e) = push_json_content_value(bytes, tag, ctx.ansi_codec, out) {
        trace!("substitution {index} failed to format: {e}");
        ctx.note("substitution value could not be formatted");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Template instances and embedded fragments
// ---------------------------------------------------------------------------

/// Render an embedded BinXml fragment carried by a substitution value.
pub(crate) fn render_embedded(
    ctx: &mut RenderContext<'_, '_>,
    start: usize,
    len: usize,
    depth: usize,
    format: OutputFormat,
    out: &mut TextSink,
) -> DeserializationResult<()> {
    let end = start.saturating_add(len).min(ctx.data.len());
    let mut cursor = ByteCursor::with_pos(ctx.data, start.min(ctx.data.len()))?;
    render_fragment(ctx, &mut cursor, None, depth, format, end, out)
}

/// Resolve a template instance's definition: its GUID and body span.
fn resolve_template_definition(
    ctx: &mut RenderContext<'_, '_>,
    cursor: &mut ByteCursor<'_>,
) -> DeserializationResult<([u8; 16], usize, usize)> {
    let instance_offset = cursor.pos() as u64;
    let def_offset = cursor.u32("template definition offset")? as usize;

    if def_offset == cursor.pos() {
        // Inline definition: the body follows and is skipped here; rendering
        // indexes it by offset.
        cursor.advance(4, "template next pointer")?;
        let guid = cursor.array::<16>("template guid")?;
        let body_size = cursor.u32("template body size")? as usize;
        let body_start = cursor.pos();
        cursor.advance(body_size, "template body")?;
        return Ok((guid, body_start, body_size));
    }

    let descriptor: Option<TemplateDescriptor> = ctx
        .templates
        .and_then(|table| table.get(def_offset as u32))
        .copied();

    let descriptor = match descriptor {
        Some(descriptor) => descriptor,
        None => {
            // Not in the preload (or no table at all, as in recovery): read
            // the definition header straight from the chunk.
            trace!("template back-reference to {def_offset} missed the table");
            match read_template_definition_header(ctx.data, def_offset) {
                Ok((_, descriptor)) => descriptor,
                Err(_) => {
                    return Err(DeserializationError::UnresolvedTemplate {
                        offset: instance_offset,
                    });
                }
            }
        }
    };

    let body_start = def_offset + TEMPLATE_DEFINITION_HEADER_SIZE;
    Ok((descriptor.guid, body_start, descriptor.data_size as usize))
}

/// Parse and render a `TemplateInstance` token (already consumed).
pub(crate) fn render_template_instance(
    ctx: &mut RenderContext<'_, '_>,
    cursor: &mut ByteCursor<'_>,
    depth: usize,
    format: OutputFormat,
    out: &mut TextSink,
) -> DeserializationResult<()> {
    let _ = cursor.u8("template instance byte")?;
    let _template_id = cursor.u32("template id")?;

    let (guid, body_start, body_size) = resolve_template_definition(ctx, cursor)?;
    let body_end = body_start.saturating_add(body_size);
    if body_start > ctx.data.len() || body_end > ctx.data.len() {
        return Err(DeserializationError::OutOfChunkBounds {
            what: "template body",
            offset: body_start as u64,
        });
    }

    // Substitution descriptor table, then the value bytes back to back.
    let num_values = cursor.u32("substitution count")? as usize;
    if num_values > cursor.remaining() / 4 {
        return Err(DeserializationError::Truncated {
            what: "substitution descriptors",
            offset: cursor.pos() as u64,
            need: num_values * 4,
            have: cursor.remaining(),
        });
    }

    let mut descriptors = Vec::with_capacity(num_values);
    for _ in 0..num_values {
        let size = cursor.u16("descriptor size")?;
        let offset = cursor.pos() as u64;
        let type_byte = cursor.u8("descriptor type")?;
        let tag =
            ValueTypeTag::from_u8(type_byte).ok_or(DeserializationError::InvalidValueVariant {
                value: type_byte,
                offset,
            })?;
        let _padding = cursor.u8("descriptor padding")?;
        descriptors.push((size, tag));
    }

    let mut entries = Vec::with_capacity(num_values);
    let mut value_offset = cursor.pos();
    for (size, tag) in descriptors {
        entries.push(SubstitutionEntry {
            offset: value_offset,
            size,
            tag,
        });
        value_offset += usize::from(size);
    }
    cursor.set_pos(value_offset.min(ctx.data.len()), "substitution values")?;
    if value_offset > ctx.data.len() {
        return Err(DeserializationError::Truncated {
            what: "substitution values",
            offset: ctx.data.len() as u64,
            need: value_offset - ctx.data.len(),
            have: 0,
        });
    }

    let subs = SubstitutionVector {
        data: ctx.data,
        entries,
    };
    trace!("template instance with {} substitutions", subs.len());

    // Hot path: compiled zipper. Cold path: re-walk the body.
    let compiled = match ctx.compiled.lookup(&guid) {
        Some(hit) => hit,
        None => {
            let result = crate::binxml::compiler::compile_template(
                ctx, format, body_start, body_end,
            )
            .map(Arc::new);
            ctx.compiled.insert(guid, result.clone());
            result
        }
    };

    match compiled {
        Some(template) if template.flavor() == format => {
            template.render(ctx, &subs, depth, out)
        }
        _ => {
            let mut body_cursor = ByteCursor::with_pos(ctx.data, body_start)?;
            render_fragment(
                ctx,
                &mut body_cursor,
                Some(&subs),
                depth,
                format,
                body_end,
                out,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binxml::test_support::TestBinXml;
    use crate::template_cache::CompiledTemplateCache;
    use encoding::all::ISO_8859_1;
    use pretty_assertions::assert_eq;

    fn utf16le(s: &str) -> Vec<u8> {
        s.encode_utf16().flat_map(u16::to_le_bytes).collect()
    }

    /// Walk a hand-encoded record body and collect output plus diagnostic.
    fn render(
        format: OutputFormat,
        build: impl FnOnce(&mut TestBinXml),
    ) -> (String, Option<String>) {
        crate::ensure_env_logger_initialized();
        let mut encoder = TestBinXml::new();
        build(&mut encoder);
        let buf = encoder.buf;

        let mut names = StringCache::empty();
        let mut compiled = LocalTemplateCache::new(Arc::new(CompiledTemplateCache::new()), false);
        let mut ctx = RenderContext::new(&buf, &mut names, None, &mut compiled, ISO_8859_1);

        let mut out = TextSink::new();
        let walked = render_record_body(&mut ctx, format, 0, buf.len(), &mut out);
        let mut diagnostic = ctx.take_diagnostic();
        if let Err(e) = walked {
            diagnostic.get_or_insert_with(|| e.to_string());
        }
        (out.into_string(), diagnostic)
    }

    #[test]
    fn renders_a_plain_element() {
        let (xml, diag) = render(OutputFormat::Xml, |w| {
            w.fragment_header();
            w.start_element("Event", false);
            w.close_start_element();
            w.value_string("hello");
            w.end_element();
            w.eof();
        });
        assert_eq!(xml, "<Event>hello</Event>");
        assert_eq!(diag, None);

        let (json, diag) = render(OutputFormat::Json, |w| {
            w.fragment_header();
            w.start_element("Event", false);
            w.close_start_element();
            w.value_string("hello");
            w.end_element();
            w.eof();
        });
        assert_eq!(json, "{\"#name\":\"Event\",\"#content\":[\"hello\"]}");
        assert_eq!(diag, None);
    }

    #[test]
    fn self_closing_element() {
        let (xml, _) = render(OutputFormat::Xml, |w| {
            w.fragment_header();
            w.start_element("Empty", false);
            w.close_empty_element();
            w.eof();
        });
        assert_eq!(xml, "<Empty/>");

        let (json, _) = render(OutputFormat::Json, |w| {
            w.fragment_header();
            w.start_element("Empty", false);
            w.close_empty_element();
            w.eof();
        });
        assert_eq!(json, "{\"#name\":\"Empty\"}");
    }

    #[test]
    fn element_with_no_content_tokens_omits_content() {
        let (json, _) = render(OutputFormat::Json, |w| {
            w.fragment_header();
            w.start_element("Hollow", false);
            w.close_start_element();
            w.end_element();
            w.eof();
        });
        assert_eq!(json, "{\"#name\":\"Hollow\"}");
    }

    #[test]
    fn bare_pi_data_is_a_no_op() {
        let (xml, diag) = render(OutputFormat::Xml, |w| {
            w.fragment_header();
            w.buf.push(0x0b);
            let data = utf16le("orphan");
            w.buf
                .extend_from_slice(&(data.len() as u16 / 2).to_le_bytes());
            w.buf.extend_from_slice(&data);
            w.start_element("After", false);
            w.close_empty_element();
            w.eof();
        });
        assert_eq!(xml, "<After/>");
        assert_eq!(diag, None);
    }

    #[test]
    fn substitution_outside_a_template_is_skipped_with_note() {
        let (xml, diag) = render(OutputFormat::Xml, |w| {
            w.fragment_header();
            w.start_element("A", false);
            w.close_start_element();
            w.substitution(0, 0x01, false);
            w.end_element();
            w.eof();
        });
        assert_eq!(xml, "<A></A>");
        assert!(diag.is_some());
    }

    #[test]
    fn content_hitting_eof_closes_the_tag_and_notes() {
        let (xml, diag) = render(OutputFormat::Xml, |w| {
            w.fragment_header();
            w.start_element("Cut", false);
            w.close_start_element();
            w.value_string("partial");
            w.eof(); // no end-element token
        });
        assert_eq!(xml, "<Cut>partial</Cut>");
        assert!(diag.is_some());

        let (json, diag) = render(OutputFormat::Json, |w| {
            w.fragment_header();
            w.start_element("Cut", false);
            w.close_start_element();
            w.value_string("partial");
            w.eof();
        });
        assert_eq!(json, "{\"#name\":\"Cut\",\"#content\":[\"partial\"]}");
        assert!(diag.is_some());
    }

    #[test]
    fn unknown_entity_stays_literal_in_json() {
        let (json, _) = render(OutputFormat::Json, |w| {
            w.fragment_header();
            w.start_element("E", false);
            w.close_start_element();
            w.buf.push(0x09);
            // Inline name "nbsp".
            let offset = (w.buf.len() as u32) + 4;
            w.buf.extend_from_slice(&offset.to_le_bytes());
            w.buf.extend_from_slice(&[0_u8; 4]);
            w.buf.extend_from_slice(&0_u16.to_le_bytes());
            let units = utf16le("nbsp");
            w.buf
                .extend_from_slice(&(units.len() as u16 / 2).to_le_bytes());
            w.buf.extend_from_slice(&units);
            w.buf.extend_from_slice(&[0, 0]);
            w.end_element();
            w.eof();
        });
        assert_eq!(json, "{\"#name\":\"E\",\"#content\":[\"&nbsp;\"]}");
    }

    #[test]
    fn consecutive_text_tokens_merge_into_one_json_item() {
        let (json, _) = render(OutputFormat::Json, |w| {
            w.fragment_header();
            w.start_element("T", false);
            w.close_start_element();
            w.value_string("a");
            w.value_string("b");
            w.end_element();
            w.eof();
        });
        assert_eq!(json, "{\"#name\":\"T\",\"#content\":[\"ab\"]}");
    }

    #[test]
    fn invalid_token_byte_is_a_structural_error() {
        let (_, diag) = render(OutputFormat::Xml, |w| {
            w.fragment_header();
            w.buf.push(0x7F);
        });
        assert!(diag.is_some());
    }
}
