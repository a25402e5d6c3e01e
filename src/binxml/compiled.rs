//! The compiled-template representation and its "zipper" renderer.
//!
//! A compiled template is a template body pre-rendered into static output
//! fragments with substitution slots between them:
//! `[part0, slot0, part1, slot1, ..., partN]`. Rendering a record against
//! it is a single pass that alternates appending a part and formatting a
//! slot's value, skipping the token walk entirely.
//!
//! Compiled templates are immutable and shared across workers through the
//! GUID-keyed cache in `template_cache`.

use crate::binxml::deserializer::{RenderContext, SubstitutionVector, render_embedded};
use crate::binxml::value_variant::{
    ValueMode, is_empty_value, push_json_content_value, push_value,
};
use crate::err::DeserializationResult;
use crate::settings::OutputFormat;
use crate::utils::escape;
use crate::utils::sink::TextSink;

use log::trace;

/// When to emit a separating comma before a JSON content slot.
///
/// The compiler resolves each slot's predecessors in its content array:
/// no predecessor at all, at least one that always emits (static text, a
/// child element), or only optional slots whose presence is a runtime fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommaRule {
    /// First item of its array: never a comma.
    None,
    /// Something before this slot always emits: comma whenever the slot does.
    Always,
    /// Only skippable slots precede: comma only if one of them emitted.
    IfRunEmitted,
}

/// Rendering context a slot was compiled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotContext {
    /// XML output; entity escaping, no structural bookkeeping.
    Xml,
    /// Inside an already-open JSON string literal (attribute values).
    JsonString,
    /// A standalone JSON content-array item.
    JsonContent { comma: CommaRule },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemplateSlot {
    pub index: u16,
    pub optional: bool,
    pub context: SlotContext,
}

#[derive(Debug, Clone)]
pub struct CompiledTemplate {
    flavor: OutputFormat,
    parts: Vec<Box<str>>,
    slots: Vec<TemplateSlot>,
}

impl CompiledTemplate {
    /// Build a compiled template from `parts.len() == slots.len() + 1`
    /// interleaved pieces. Also the seeding entry point for externally
    /// extracted templates.
    pub fn new(flavor: OutputFormat, parts: Vec<String>, slots: Vec<TemplateSlot>) -> Self {
        debug_assert_eq!(parts.len(), slots.len() + 1);
        CompiledTemplate {
            flavor,
            parts: parts.into_iter().map(String::into_boxed_str).collect(),
            slots,
        }
    }

    pub fn flavor(&self) -> OutputFormat {
        self.flavor
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Zipper-render against one record's substitution vector.
    pub(crate) fn render(
        &self,
        ctx: &mut RenderContext<'_, '_>,
        subs: &SubstitutionVector<'_>,
        depth: usize,
        out: &mut TextSink,
    ) -> DeserializationResult<()> {
        let mut run_emitted = false;

        for (slot_index, slot) in self.slots.iter().enumerate() {
            if let Some(part) = self.parts.get(slot_index) {
                out.push_str(part);
            }

            let Some((bytes, tag)) = subs.get(slot.index) else {
                ctx.note("substitution index out of range");
                continue;
            };
            let empty = is_empty_value(bytes, tag);

            match slot.context {
                SlotContext::Xml => {
                    if slot.optional && empty {
                        continue;
                    }
                    if tag.is_embedded_binxml() {
                        let (start, len) = subs.get_span(slot.index).unwrap_or((0, 0));
                        render_embedded(ctx, start, len, depth, OutputFormat::Xml, out)?;
                    } else if let Err(e) =
                        push_value(bytes, tag, ValueMode::Xml, ctx.ansi_codec, out)
                    {
                        trace!("slot {} failed to format: {e}", slot.index);
                        ctx.note("substitution value could not be formatted");
                    }
                }
                SlotContext::JsonString => {
                    if slot.optional && empty {
                        continue;
                    }
                    if tag.is_embedded_binxml() {
                        let (start, len) = subs.get_span(slot.index).unwrap_or((0, 0));
                        let mut nested = TextSink::new();
                        render_embedded(ctx, start, len, depth, OutputFormat::Json, &mut nested)?;
                        escape::push_json_str(nested.as_str(), out);
                    } else if let Err(e) =
                        push_value(bytes, tag, ValueMode::Json, ctx.ansi_codec, out)
                    {
                        trace!("slot {} failed to format: {e}", slot.index);
                        ctx.note("substitution value could not be formatted");
                    }
                }
                SlotContext::JsonContent { comma } => {
                    let emit = !(slot.optional && empty);
                    if emit {
                        let comma_needed = match comma {
                            CommaRule::None => false,
                            CommaRule::Always => true,
                            CommaRule::IfRunEmitted => run_emitted,
                        };
                        if comma_needed {
                            out.push(',');
                        }

                        if tag.is_embedded_binxml() {
                            let (start, len) = subs.get_span(slot.index).unwrap_or((0, 0));
                            let mut nested = TextSink::new();
                            render_embedded(
                                ctx,
                                start,
                                len,
                                depth,
                                OutputFormat::Json,
                                &mut nested,
                            )?;
                            out.push('"');
                            escape::push_json_str(nested.as_str(), out);
                            out.push('"');
                        } else if let Err(e) =
                            push_json_content_value(bytes, tag, ctx.ansi_codec, out)
                        {
                            trace!("slot {} failed to format: {e}", slot.index);
                            ctx.note("substitution value could not be formatted");
                        }
                    }
                    match comma {
                        CommaRule::None => run_emitted = emit,
                        _ => run_emitted |= emit,
                    }
                }
            }
        }

        if let Some(tail) = self.parts.get(self.slots.len()) {
            out.push_str(tail);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binxml::value_variant::ValueTypeTag;
    use crate::string_cache::StringCache;
    use crate::template_cache::{CompiledTemplateCache, LocalTemplateCache};
    use encoding::all::ISO_8859_1;
    use std::sync::Arc;

    fn render(
        template: &CompiledTemplate,
        data: &[u8],
        raw_entries: Vec<(usize, u16, ValueTypeTag)>,
    ) -> String {
        let mut names = StringCache::empty();
        let mut compiled = LocalTemplateCache::new(Arc::new(CompiledTemplateCache::new()), false);
        let mut ctx = RenderContext::new(data, &mut names, None, &mut compiled, ISO_8859_1);
        let subs = SubstitutionVector::from_raw(data, raw_entries);

        let mut out = TextSink::new();
        template.render(&mut ctx, &subs, 0, &mut out).unwrap();
        out.into_string()
    }

    fn tag(byte: u8) -> ValueTypeTag {
        ValueTypeTag::from_u8(byte).unwrap()
    }

    #[test]
    fn xml_zipper_alternates_parts_and_values() {
        let template = CompiledTemplate::new(
            OutputFormat::Xml,
            vec![
                "<Event Name=\"".to_owned(),
                "\">".to_owned(),
                "</Event>".to_owned(),
            ],
            vec![
                TemplateSlot {
                    index: 0,
                    optional: false,
                    context: SlotContext::Xml,
                },
                TemplateSlot {
                    index: 1,
                    optional: false,
                    context: SlotContext::Xml,
                },
            ],
        );

        // Value 0: "X" utf16; value 1: u32 42.
        let mut data: Vec<u8> = vec![b'X', 0x00];
        data.extend_from_slice(&42_u32.to_le_bytes());

        let rendered = render(
            &template,
            &data,
            vec![(0, 2, tag(0x01)), (2, 4, tag(0x08))],
        );
        assert_eq!(rendered, "<Event Name=\"X\">42</Event>");
    }

    #[test]
    fn optional_empty_slot_is_skipped() {
        let template = CompiledTemplate::new(
            OutputFormat::Xml,
            vec!["<A>".to_owned(), "</A>".to_owned()],
            vec![TemplateSlot {
                index: 0,
                optional: true,
                context: SlotContext::Xml,
            }],
        );

        assert_eq!(
            render(&template, &[], vec![(0, 0, tag(0x00))]),
            "<A></A>"
        );
    }

    #[test]
    fn json_content_comma_threading() {
        // Content array of three optional slots: no static commas at all.
        let template = CompiledTemplate::new(
            OutputFormat::Json,
            vec![
                "{\"#name\":\"D\",\"#content\":[".to_owned(),
                "".to_owned(),
                "".to_owned(),
                "]}".to_owned(),
            ],
            vec![
                TemplateSlot {
                    index: 0,
                    optional: true,
                    context: SlotContext::JsonContent {
                        comma: CommaRule::None,
                    },
                },
                TemplateSlot {
                    index: 1,
                    optional: true,
                    context: SlotContext::JsonContent {
                        comma: CommaRule::IfRunEmitted,
                    },
                },
                TemplateSlot {
                    index: 2,
                    optional: true,
                    context: SlotContext::JsonContent {
                        comma: CommaRule::IfRunEmitted,
                    },
                },
            ],
        );

        let data: Vec<u8> = vec![b'a', 0x00, b'b', 0x00];

        // All present.
        let rendered = render(
            &template,
            &data,
            vec![(0, 2, tag(0x01)), (2, 2, tag(0x01)), (0, 2, tag(0x01))],
        );
        assert_eq!(rendered, "{\"#name\":\"D\",\"#content\":[\"a\",\"b\",\"a\"]}");

        // First one missing: no leading comma.
        let rendered = render(
            &template,
            &data,
            vec![(0, 0, tag(0x00)), (2, 2, tag(0x01)), (0, 2, tag(0x01))],
        );
        assert_eq!(rendered, "{\"#name\":\"D\",\"#content\":[\"b\",\"a\"]}");

        // Middle one missing.
        let rendered = render(
            &template,
            &data,
            vec![(0, 2, tag(0x01)), (2, 0, tag(0x00)), (2, 2, tag(0x01))],
        );
        assert_eq!(rendered, "{\"#name\":\"D\",\"#content\":[\"a\",\"b\"]}");

        // All missing: empty array, no stray commas.
        let rendered = render(
            &template,
            &data,
            vec![(0, 0, tag(0x00)), (0, 0, tag(0x00)), (0, 0, tag(0x00))],
        );
        assert_eq!(rendered, "{\"#name\":\"D\",\"#content\":[]}");
    }

    #[test]
    fn json_native_scalars_in_content() {
        let template = CompiledTemplate::new(
            OutputFormat::Json,
            vec![
                "{\"#name\":\"Level\",\"#content\":[".to_owned(),
                "]}".to_owned(),
            ],
            vec![TemplateSlot {
                index: 0,
                optional: false,
                context: SlotContext::JsonContent {
                    comma: CommaRule::None,
                },
            }],
        );

        let data = 4_u32.to_le_bytes().to_vec();
        assert_eq!(
            render(&template, &data, vec![(0, 4, tag(0x08))]),
            "{\"#name\":\"Level\",\"#content\":[4]}"
        );

        // Strings stay quoted.
        let data: Vec<u8> = vec![b'4', 0x00];
        assert_eq!(
            render(&template, &data, vec![(0, 2, tag(0x01))]),
            "{\"#name\":\"Level\",\"#content\":[\"4\"]}"
        );
    }

    #[test]
    fn comma_after_always_emitting_item() {
        // [static "x", optional slot]: comma is Always, emitted only when
        // the slot emits.
        let template = CompiledTemplate::new(
            OutputFormat::Json,
            vec![
                "{\"#name\":\"D\",\"#content\":[\"x\"".to_owned(),
                "]}".to_owned(),
            ],
            vec![TemplateSlot {
                index: 0,
                optional: true,
                context: SlotContext::JsonContent {
                    comma: CommaRule::Always,
                },
            }],
        );

        let data: Vec<u8> = vec![b'y', 0x00];
        assert_eq!(
            render(&template, &data, vec![(0, 2, tag(0x01))]),
            "{\"#name\":\"D\",\"#content\":[\"x\",\"y\"]}"
        );
        assert_eq!(
            render(&template, &data, vec![(0, 0, tag(0x00))]),
            "{\"#name\":\"D\",\"#content\":[\"x\"]}"
        );
    }
}
