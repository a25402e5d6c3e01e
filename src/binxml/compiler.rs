//! One-pass template-body compilation.
//!
//! On a compiled-cache miss the template body is walked once, without any
//! record's substitution vector, and lowered into the part/slot form of
//! [`CompiledTemplate`]. Compilation succeeds only when every token is
//! expressible as static output plus substitution slots:
//!
//! - a nested `TemplateInstance` aborts (its definition offset is a
//!   record-level fact, not a template-level one), and
//! - in JSON, a content item whose leading comma would depend on whether an
//!   earlier optional substitution emitted aborts (the comma cannot be made
//!   static).
//!
//! An aborted compilation is cached as "uncompilable" by the caller, so the
//! fallback walker handles that GUID from then on without retrying.

use crate::binxml::compiled::{CommaRule, CompiledTemplate, SlotContext, TemplateSlot};
use crate::binxml::deserializer::{
    MAX_ELEMENT_DEPTH, RenderContext, peek_token, push_entity_json, read_sized_utf16,
    read_substitution_header, read_value_token,
};
use crate::binxml::name::resolve_name;
use crate::binxml::tokens::BinXmlRawToken;
use crate::binxml::value_variant::{ValueMode, push_value};
use crate::err::DeserializationError;
use crate::settings::OutputFormat;
use crate::utils::sink::TextSink;
use crate::utils::{ByteCursor, escape, utf16};

use log::trace;

enum CompileAbort {
    /// The body uses a construct the compiled form cannot express.
    Unsupported(&'static str),
    /// The body is structurally broken.
    Structural(DeserializationError),
}

impl From<DeserializationError> for CompileAbort {
    fn from(e: DeserializationError) -> Self {
        CompileAbort::Structural(e)
    }
}

type CompileResult<T> = Result<T, CompileAbort>;

/// Accumulates interleaved static parts and slots.
struct Builder {
    parts: Vec<String>,
    slots: Vec<TemplateSlot>,
    cur: TextSink,
}

impl Builder {
    fn new() -> Self {
        Builder {
            parts: Vec::new(),
            slots: Vec::new(),
            cur: TextSink::new(),
        }
    }

    fn out(&mut self) -> &mut TextSink {
        &mut self.cur
    }

    fn slot(&mut self, index: u16, optional: bool, context: SlotContext) {
        self.parts.push(self.cur.as_str().to_owned());
        self.cur.clear();
        self.slots.push(TemplateSlot {
            index,
            optional,
            context,
        });
    }

    fn finish(mut self, flavor: OutputFormat) -> CompiledTemplate {
        self.parts.push(self.cur.as_str().to_owned());
        CompiledTemplate::new(flavor, self.parts, self.slots)
    }
}

/// Compile the template body at `body_start..body_end`, or `None` when the
/// body is not compilable (the caller caches the rejection).
pub(crate) fn compile_template(
    ctx: &mut RenderContext<'_, '_>,
    format: OutputFormat,
    body_start: usize,
    body_end: usize,
) -> Option<CompiledTemplate> {
    let mut builder = Builder::new();
    let mut cursor = match ByteCursor::with_pos(ctx.data, body_start) {
        Ok(cursor) => cursor,
        Err(_) => return None,
    };

    let walked = match format {
        OutputFormat::Xml => compile_fragment_xml(ctx, &mut cursor, &mut builder, body_end),
        OutputFormat::Json => compile_fragment_json(ctx, &mut cursor, &mut builder, body_end),
    };

    match walked {
        Ok(()) => Some(builder.finish(format)),
        Err(CompileAbort::Unsupported(why)) => {
            trace!("template at {body_start} is not compilable: {why}");
            None
        }
        Err(CompileAbort::Structural(e)) => {
            trace!("template at {body_start} failed to compile: {e}");
            None
        }
    }
}

fn next_token(cursor: &mut ByteCursor<'_>) -> CompileResult<(u64, BinXmlRawToken)> {
    let offset = cursor.pos() as u64;
    let byte = cursor.u8("token")?;
    let token = BinXmlRawToken::from_u8(byte)
        .ok_or(DeserializationError::InvalidToken { value: byte, offset })?;
    Ok((offset, token))
}

fn read_element_start(
    ctx: &mut RenderContext<'_, '_>,
    cursor: &mut ByteCursor<'_>,
) -> CompileResult<std::rc::Rc<str>> {
    let _dependency_id = cursor.u16("dependency id")?;
    let _data_size = cursor.u32("element data size")?;
    Ok(resolve_name(cursor, ctx.names)?)
}

// ---------------------------------------------------------------------------
// XML flavor
// ---------------------------------------------------------------------------

fn compile_fragment_xml(
    ctx: &mut RenderContext<'_, '_>,
    cursor: &mut ByteCursor<'_>,
    builder: &mut Builder,
    end: usize,
) -> CompileResult<()> {
    while cursor.pos() < end {
        let (offset, token) = next_token(cursor)?;
        match token {
            BinXmlRawToken::FragmentHeader => cursor.advance(3, "fragment header")?,
            BinXmlRawToken::EndOfStream => break,
            BinXmlRawToken::OpenStartElement { has_attributes } => {
                compile_element_xml(ctx, cursor, builder, 1, has_attributes)?;
            }
            BinXmlRawToken::TemplateInstance => {
                return Err(CompileAbort::Unsupported("nested template instance"));
            }
            BinXmlRawToken::PITarget => compile_pi_xml(ctx, cursor, builder)?,
            BinXmlRawToken::PIData => {
                let _ = read_sized_utf16(cursor)?;
            }
            _ => {
                return Err(CompileAbort::Structural(
                    DeserializationError::UnexpectedToken {
                        value: 0,
                        expected: "a fragment-level token",
                        offset,
                    },
                ));
            }
        }
    }
    Ok(())
}

fn compile_pi_xml(
    ctx: &mut RenderContext<'_, '_>,
    cursor: &mut ByteCursor<'_>,
    builder: &mut Builder,
) -> CompileResult<()> {
    let name = resolve_name(cursor, ctx.names)?;
    let out = builder.out();
    out.push_str("<?");
    out.push_str(&name);
    if peek_token(cursor) == Some(BinXmlRawToken::PIData) {
        cursor.advance(1, "pi data token")?;
        let data = read_sized_utf16(cursor)?;
        out.push(' ');
        for ch in utf16::chars(data) {
            out.push(ch);
        }
    }
    out.push_str("?>");
    Ok(())
}

fn compile_element_xml(
    ctx: &mut RenderContext<'_, '_>,
    cursor: &mut ByteCursor<'_>,
    builder: &mut Builder,
    depth: usize,
    has_attributes: bool,
) -> CompileResult<()> {
    if depth > MAX_ELEMENT_DEPTH {
        // Let the walker degrade this one at render time instead.
        return Err(CompileAbort::Unsupported("element nesting too deep"));
    }

    let name = read_element_start(ctx, cursor)?;
    builder.out().push('<');
    builder.out().push_str(&name);

    if has_attributes {
        let _attribute_list_size = cursor.u32("attribute list size")?;
        while let Some(BinXmlRawToken::Attribute { .. }) = peek_token(cursor) {
            cursor.advance(1, "attribute token")?;
            compile_attribute_xml(ctx, cursor, builder)?;
        }
    }

    let (offset, close) = next_token(cursor)?;
    match close {
        BinXmlRawToken::CloseEmptyElement => {
            builder.out().push_str("/>");
            return Ok(());
        }
        BinXmlRawToken::CloseStartElement => builder.out().push('>'),
        _ => {
            return Err(CompileAbort::Structural(
                DeserializationError::UnexpectedToken {
                    value: 0,
                    expected: "an element close token",
                    offset,
                },
            ));
        }
    }

    loop {
        let (offset, token) = next_token(cursor)?;
        match token {
            BinXmlRawToken::CloseElement => break,
            BinXmlRawToken::OpenStartElement { has_attributes } => {
                compile_element_xml(ctx, cursor, builder, depth + 1, has_attributes)?;
            }
            BinXmlRawToken::Value => {
                let (bytes, tag) = read_value_token(cursor)?;
                push_value(bytes, tag, ValueMode::Xml, ctx.ansi_codec, builder.out())
                    .map_err(CompileAbort::Structural)?;
            }
            BinXmlRawToken::NormalSubstitution => {
                let (index, _) = read_substitution_header(cursor)?;
                builder.slot(index, false, SlotContext::Xml);
            }
            BinXmlRawToken::OptionalSubstitution => {
                let (index, _) = read_substitution_header(cursor)?;
                builder.slot(index, true, SlotContext::Xml);
            }
            BinXmlRawToken::CharReference => {
                let value = cursor.u16("character reference")?;
                let out = builder.out();
                out.push_str("&#");
                out.push_u64(u64::from(value));
                out.push(';');
            }
            BinXmlRawToken::EntityReference => {
                let entity = resolve_name(cursor, ctx.names)?;
                let out = builder.out();
                out.push('&');
                out.push_str(&entity);
                out.push(';');
            }
            BinXmlRawToken::CDataSection => {
                let text = read_sized_utf16(cursor)?;
                let out = builder.out();
                out.push_str("<![CDATA[");
                for ch in utf16::chars(text) {
                    out.push(ch);
                }
                out.push_str("]]>");
            }
            BinXmlRawToken::TemplateInstance => {
                return Err(CompileAbort::Unsupported("nested template instance"));
            }
            BinXmlRawToken::PITarget => compile_pi_xml(ctx, cursor, builder)?,
            BinXmlRawToken::PIData => {
                let _ = read_sized_utf16(cursor)?;
            }
            BinXmlRawToken::FragmentHeader => cursor.advance(3, "fragment header")?,
            BinXmlRawToken::EndOfStream
            | BinXmlRawToken::CloseStartElement
            | BinXmlRawToken::CloseEmptyElement
            | BinXmlRawToken::Attribute { .. } => {
                return Err(CompileAbort::Structural(
                    DeserializationError::UnexpectedToken {
                        value: 0,
                        expected: "element content",
                        offset,
                    },
                ));
            }
        }
    }

    let out = builder.out();
    out.push_str("</");
    out.push_str(&name);
    out.push('>');
    Ok(())
}

fn compile_attribute_xml(
    ctx: &mut RenderContext<'_, '_>,
    cursor: &mut ByteCursor<'_>,
    builder: &mut Builder,
) -> CompileResult<()> {
    let name = resolve_name(cursor, ctx.names)?;
    let out = builder.out();
    out.push(' ');
    out.push_str(&name);
    out.push_str("=\"");

    compile_attribute_content(ctx, cursor, builder, OutputFormat::Xml)?;

    builder.out().push('"');
    Ok(())
}

/// Attribute value tokens up to (not including) the break token. Used by
/// both flavors; the mode picks escaping and the slot context.
fn compile_attribute_content(
    ctx: &mut RenderContext<'_, '_>,
    cursor: &mut ByteCursor<'_>,
    builder: &mut Builder,
    format: OutputFormat,
) -> CompileResult<()> {
    let mode = match format {
        OutputFormat::Xml => ValueMode::Xml,
        OutputFormat::Json => ValueMode::Json,
    };
    let slot_context = match format {
        OutputFormat::Xml => SlotContext::Xml,
        OutputFormat::Json => SlotContext::JsonString,
    };

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
                push_value(bytes, tag, mode, ctx.ansi_codec, builder.out())
                    .map_err(CompileAbort::Structural)?;
            }
            BinXmlRawToken::NormalSubstitution => {
                let (index, _) = read_substitution_header(cursor)?;
                builder.slot(index, false, slot_context);
            }
            BinXmlRawToken::OptionalSubstitution => {
                let (index, _) = read_substitution_header(cursor)?;
                builder.slot(index, true, slot_context);
            }
            BinXmlRawToken::CharReference => {
                let value = cursor.u16("character reference")?;
                match format {
                    OutputFormat::Xml => {
                        let out = builder.out();
                        out.push_str("&#");
                        out.push_u64(u64::from(value));
                        out.push(';');
                    }
                    OutputFormat::Json => {
                        let ch = char::from_u32(u32::from(value)).unwrap_or('\u{FFFD}');
                        escape::push_json_char(ch, builder.out());
                    }
                }
            }
            BinXmlRawToken::EntityReference => {
                let entity = resolve_name(cursor, ctx.names)?;
                match format {
                    OutputFormat::Xml => {
                        let out = builder.out();
                        out.push('&');
                        out.push_str(&entity);
                        out.push(';');
                    }
                    OutputFormat::Json => push_entity_json(&entity, builder.out()),
                }
            }
            BinXmlRawToken::CDataSection => {
                let text = read_sized_utf16(cursor)?;
                match format {
                    OutputFormat::Xml => escape::push_xml_utf16(text, builder.out()),
                    OutputFormat::Json => escape::push_json_utf16(text, builder.out()),
                }
            }
            BinXmlRawToken::FragmentHeader => cursor.advance(3, "fragment header")?,
            _ => {
                return Err(CompileAbort::Structural(
                    DeserializationError::UnexpectedToken {
                        value: byte,
                        expected: "an attribute value token",
                        offset,
                    },
                ));
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// JSON flavor
// ---------------------------------------------------------------------------

fn compile_fragment_json(
    ctx: &mut RenderContext<'_, '_>,
    cursor: &mut ByteCursor<'_>,
    builder: &mut Builder,
    end: usize,
) -> CompileResult<()> {
    while cursor.pos() < end {
        let (offset, token) = next_token(cursor)?;
        match token {
            BinXmlRawToken::FragmentHeader => cursor.advance(3, "fragment header")?,
            BinXmlRawToken::EndOfStream => break,
            BinXmlRawToken::OpenStartElement { has_attributes } => {
                compile_element_json(ctx, cursor, builder, 1, has_attributes)?;
            }
            BinXmlRawToken::TemplateInstance => {
                return Err(CompileAbort::Unsupported("nested template instance"));
            }
            // Structural JSON has no representation for PIs.
            BinXmlRawToken::PITarget => {
                let _ = resolve_name(cursor, ctx.names)?;
                if peek_token(cursor) == Some(BinXmlRawToken::PIData) {
                    cursor.advance(1, "pi data token")?;
                    let _ = read_sized_utf16(cursor)?;
                }
            }
            BinXmlRawToken::PIData => {
                let _ = read_sized_utf16(cursor)?;
            }
            _ => {
                return Err(CompileAbort::Structural(
                    DeserializationError::UnexpectedToken {
                        value: 0,
                        expected: "a fragment-level token",
                        offset,
                    },
                ));
            }
        }
    }
    Ok(())
}

/// Comma bookkeeping for one `#content` array during compilation.
struct ContentArray {
    item_count: usize,
    always_seen: bool,
}

impl ContentArray {
    fn new() -> Self {
        ContentArray {
            item_count: 0,
            always_seen: false,
        }
    }

    /// Register an item that always emits; its leading comma must be static.
    fn static_item(&mut self, builder: &mut Builder) -> CompileResult<()> {
        if self.item_count > 0 {
            if !self.always_seen {
                // Whether a comma belongs here depends on an earlier optional
                // substitution emitting at render time.
                return Err(CompileAbort::Unsupported(
                    "content after an optional substitution",
                ));
            }
            builder.out().push(',');
        }
        self.item_count += 1;
        self.always_seen = true;
        Ok(())
    }

    /// Register a substitution slot and resolve its comma rule.
    fn slot_item(&mut self, optional: bool) -> CommaRule {
        let comma = if self.item_count == 0 {
            CommaRule::None
        } else if self.always_seen {
            CommaRule::Always
        } else {
            CommaRule::IfRunEmitted
        };
        self.item_count += 1;
        if !optional {
            // A required slot always produces an item, even an empty string.
            self.always_seen = true;
        }
        comma
    }
}

fn compile_element_json(
    ctx: &mut RenderContext<'_, '_>,
    cursor: &mut ByteCursor<'_>,
    builder: &mut Builder,
    depth: usize,
    has_attributes: bool,
) -> CompileResult<()> {
    if depth > MAX_ELEMENT_DEPTH {
        return Err(CompileAbort::Unsupported("element nesting too deep"));
    }

    let name = read_element_start(ctx, cursor)?;
    builder.out().push_str("{\"#name\":\"");
    escape::push_json_str(&name, builder.out());
    builder.out().push('"');

    if has_attributes {
        let _attribute_list_size = cursor.u32("attribute list size")?;
        let mut first = true;
        while let Some(BinXmlRawToken::Attribute { .. }) = peek_token(cursor) {
            cursor.advance(1, "attribute token")?;
            if first {
                builder.out().push_str(",\"#attrs\":{");
                first = false;
            } else {
                builder.out().push(',');
            }

            let attr_name = resolve_name(cursor, ctx.names)?;
            builder.out().push('"');
            escape::push_json_str(&attr_name, builder.out());
            builder.out().push_str("\":\"");
            compile_attribute_content(ctx, cursor, builder, OutputFormat::Json)?;
            builder.out().push('"');
        }
        if !first {
            builder.out().push('}');
        }
    }

    let (offset, close) = next_token(cursor)?;
    match close {
        BinXmlRawToken::CloseEmptyElement => {
            builder.out().push('}');
            return Ok(());
        }
        BinXmlRawToken::CloseStartElement => {}
        _ => {
            return Err(CompileAbort::Structural(
                DeserializationError::UnexpectedToken {
                    value: 0,
                    expected: "an element close token",
                    offset,
                },
            ));
        }
    }

    if peek_token(cursor) == Some(BinXmlRawToken::CloseElement) {
        cursor.advance(1, "element end token")?;
        builder.out().push('}');
        return Ok(());
    }

    builder.out().push_str(",\"#content\":[");
    let mut array = ContentArray::new();
    let mut text_open = false;

    macro_rules! open_text {
        () => {
            if !text_open {
                array.static_item(builder)?;
                builder.out().push('"');
                text_open = true;
            }
        };
    }
    macro_rules! close_text {
        () => {
            if text_open {
                builder.out().push('"');
                text_open = false;
            }
        };
    }

    loop {
        let (offset, token) = next_token(cursor)?;
        match token {
            BinXmlRawToken::CloseElement => break,
            BinXmlRawToken::OpenStartElement { has_attributes } => {
                close_text!();
                array.static_item(builder)?;
                compile_element_json(ctx, cursor, builder, depth + 1, has_attributes)?;
            }
            BinXmlRawToken::Value => {
                open_text!();
                let (bytes, tag) = read_value_token(cursor)?;
                push_value(bytes, tag, ValueMode::Json, ctx.ansi_codec, builder.out())
                    .map_err(CompileAbort::Structural)?;
            }
            BinXmlRawToken::CharReference => {
                open_text!();
                let value = cursor.u16("character reference")?;
                let ch = char::from_u32(u32::from(value)).unwrap_or('\u{FFFD}');
                escape::push_json_char(ch, builder.out());
            }
            BinXmlRawToken::EntityReference => {
                open_text!();
                let entity = resolve_name(cursor, ctx.names)?;
                push_entity_json(&entity, builder.out());
            }
            BinXmlRawToken::CDataSection => {
                open_text!();
                let text = read_sized_utf16(cursor)?;
                escape::push_json_utf16(text, builder.out());
            }
            BinXmlRawToken::NormalSubstitution => {
                close_text!();
                let (index, _) = read_substitution_header(cursor)?;
                let comma = array.slot_item(false);
                builder.slot(index, false, SlotContext::JsonContent { comma });
            }
            BinXmlRawToken::OptionalSubstitution => {
                close_text!();
                let (index, _) = read_substitution_header(cursor)?;
                let comma = array.slot_item(true);
                builder.slot(index, true, SlotContext::JsonContent { comma });
            }
            BinXmlRawToken::TemplateInstance => {
                return Err(CompileAbort::Unsupported("nested template instance"));
            }
            BinXmlRawToken::PITarget => {
                let _ = resolve_name(cursor, ctx.names)?;
                if peek_token(cursor) == Some(BinXmlRawToken::PIData) {
                    cursor.advance(1, "pi data token")?;
                    let _ = read_sized_utf16(cursor)?;
                }
            }
            BinXmlRawToken::PIData => {
                let _ = read_sized_utf16(cursor)?;
            }
            BinXmlRawToken::FragmentHeader => cursor.advance(3, "fragment header")?,
            BinXmlRawToken::EndOfStream
            | BinXmlRawToken::CloseStartElement
            | BinXmlRawToken::CloseEmptyElement
            | BinXmlRawToken::Attribute { .. } => {
                return Err(CompileAbort::Structural(
                    DeserializationError::UnexpectedToken {
                        value: 0,
                        expected: "element content",
                        offset,
                    },
                ));
            }
        }
    }

    close_text!();
    builder.out().push_str("]}");
    Ok(())
}
