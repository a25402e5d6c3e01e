use fixtures::*;

use evtxscan::{EvtxParser, OutputFormat, ParserSettings};
use pretty_assertions::assert_eq;

fn parse_xml(image: Vec<u8>) -> Vec<evtxscan::RenderedEvent> {
    EvtxParser::from_buffer(image)
        .unwrap()
        .with_configuration(ParserSettings::new().num_threads(1))
        .parse()
}

fn parse_json(image: Vec<u8>) -> Vec<evtxscan::RenderedEvent> {
    EvtxParser::from_buffer(image)
        .unwrap()
        .with_configuration(
            ParserSettings::new()
                .num_threads(1)
                .output_format(OutputFormat::Json),
        )
        .parse()
}

#[test]
fn single_record_xml() {
    ensure_env_logger_initialized();
    let events = parse_xml(single_record_file());
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].data.as_str(), "<Event Name=\"X\">42</Event>");
    assert_eq!(events[0].diagnostic, None);
}

#[test]
fn single_record_json() {
    ensure_env_logger_initialized();
    let events = parse_json(single_record_file());
    assert_eq!(events.len(), 1);
    assert_eq!(
        events[0].data.as_str(),
        "{\"#name\":\"Event\",\"#attrs\":{\"Name\":\"X\"},\"#content\":[\"42\"]}"
    );
    events[0].json_value().unwrap();
}

fn template_file(values_per_record: Vec<Vec<SubValue>>) -> Vec<u8> {
    let mut chunk = ChunkBuilder::new();
    for (index, values) in values_per_record.into_iter().enumerate() {
        chunk.add_record(index as u64 + 1, 0, move |w| {
            w.fragment_header();
            w.template_instance(
                [0x11; 16],
                |t| {
                    t.fragment_header();
                    t.start_element("Event", true);
                    t.attribute_start("Name");
                    t.substitution(0, 0x01, true);
                    t.close_start_element();
                    t.substitution(1, 0x01, true);
                    t.end_element();
                    t.eof();
                },
                &values,
            );
            w.eof();
        });
    }
    build_file(1, vec![chunk.finish()])
}

#[test]
fn template_rendering_xml_and_json() {
    ensure_env_logger_initialized();
    let image = template_file(vec![
        vec![SubValue::Str("X"), SubValue::Str("42")],
        vec![SubValue::Str("Y"), SubValue::Str("43")],
    ]);

    // Record two rides the template compiled for record one.
    let events = parse_xml(image.clone());
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].data.as_str(), "<Event Name=\"X\">42</Event>");
    assert_eq!(events[1].data.as_str(), "<Event Name=\"Y\">43</Event>");

    let events = parse_json(image);
    assert_eq!(
        events[0].data.as_str(),
        "{\"#name\":\"Event\",\"#attrs\":{\"Name\":\"X\"},\"#content\":[\"42\"]}"
    );
    assert_eq!(
        events[1].data.as_str(),
        "{\"#name\":\"Event\",\"#attrs\":{\"Name\":\"Y\"},\"#content\":[\"43\"]}"
    );
}

#[test]
fn optional_null_substitution_is_omitted() {
    ensure_env_logger_initialized();
    let image = template_file(vec![vec![SubValue::Null, SubValue::Str("42")]]);

    let events = parse_xml(image.clone());
    assert_eq!(events[0].data.as_str(), "<Event Name=\"\">42</Event>");
    assert_eq!(events[0].diagnostic, None);

    // No stray comma in the content array, no null placeholder.
    let image = template_file(vec![vec![SubValue::Str("X"), SubValue::Null]]);
    let events = parse_json(image);
    assert_eq!(
        events[0].data.as_str(),
        "{\"#name\":\"Event\",\"#attrs\":{\"Name\":\"X\"},\"#content\":[]}"
    );
    events[0].json_value().unwrap();
}

#[test]
fn typed_substitutions_render_per_type_rules() {
    ensure_env_logger_initialized();

    let sid = vec![
        0x01, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x05, 0x20, 0x00, 0x00, 0x00, 0x20, 0x02,
        0x00, 0x00,
    ];
    let guid: Vec<u8> = vec![
        0x33, 0x22, 0x11, 0x00, 0x55, 0x44, 0x77, 0x66, 0x88, 0x99, 0xAA, 0xBB, 0xCC, 0xDD,
        0xEE, 0xFF,
    ];
    let mut string_array = utf16le("one");
    string_array.extend_from_slice(&[0, 0]);
    string_array.extend_from_slice(&utf16le("two"));

    let mut chunk = ChunkBuilder::new();
    chunk.add_record(1, 0, |w| {
        w.fragment_header();
        w.template_instance(
            [0x22; 16],
            |t| {
                t.fragment_header();
                t.start_element("Data", false);
                t.close_start_element();
                t.substitution(0, 0x13, false); // SID
                t.value_string(" ");
                t.substitution(1, 0x0f, false); // GUID
                t.value_string(" ");
                t.substitution(2, 0x14, false); // hex int32
                t.value_string(" ");
                t.substitution(3, 0x11, false); // FILETIME
                t.value_string(" ");
                t.substitution(4, 0x81, false); // string array
                t.value_string(" ");
                t.substitution(5, 0x0d, false); // bool
                t.end_element();
                t.eof();
            },
            &[
                SubValue::Raw(0x13, sid),
                SubValue::Raw(0x0f, guid),
                SubValue::Raw(0x14, 0x2a_u32.to_le_bytes().to_vec()),
                SubValue::Raw(0x11, 116_444_736_000_000_000_u64.to_le_bytes().to_vec()),
                SubValue::Raw(0x81, string_array),
                SubValue::Raw(0x0d, 1_u32.to_le_bytes().to_vec()),
            ],
        );
        w.eof();
    });

    let events = parse_xml(build_file(1, vec![chunk.finish()]));
    assert_eq!(
        events[0].data.as_str(),
        "<Data>S-1-5-32-544 00112233-4455-6677-8899-AABBCCDDEEFF 0x0000002a \
         1970-01-01T00:00:00.0000000Z one, two true</Data>"
    );
}

#[test]
fn entity_char_refs_and_cdata() {
    ensure_env_logger_initialized();
    let mut chunk = ChunkBuilder::new();
    chunk.add_record(1, 0, |w| {
        w.fragment_header();
        w.start_element("Message", false);
        w.close_start_element();
        w.entity_ref("amp");
        w.char_ref(65);
        w.cdata("raw <not> escaped");
        w.end_element();
        w.eof();
    });
    let image = build_file(1, vec![chunk.finish()]);

    let events = parse_xml(image.clone());
    assert_eq!(
        events[0].data.as_str(),
        "<Message>&amp;&#65;<![CDATA[raw <not> escaped]]></Message>"
    );

    // JSON resolves the predefined entity and the char ref to characters.
    let events = parse_json(image);
    assert_eq!(
        events[0].data.as_str(),
        "{\"#name\":\"Message\",\"#content\":[\"&Araw <not> escaped\"]}"
    );
}

#[test]
fn processing_instructions() {
    ensure_env_logger_initialized();
    let mut chunk = ChunkBuilder::new();
    chunk.add_record(1, 0, |w| {
        w.fragment_header();
        w.pi("mso-application", Some("progid=\"Word.Document\""));
        w.start_element("Doc", false);
        w.close_empty_element();
        w.eof();
    });
    let image = build_file(1, vec![chunk.finish()]);

    let events = parse_xml(image.clone());
    assert_eq!(
        events[0].data.as_str(),
        "<?mso-application progid=\"Word.Document\"?><Doc/>"
    );

    // JSON ignores processing instructions entirely.
    let events = parse_json(image);
    assert_eq!(events[0].data.as_str(), "{\"#name\":\"Doc\"}");
}

#[test]
fn xml_entities_are_escaped_in_values() {
    ensure_env_logger_initialized();
    let mut chunk = ChunkBuilder::new();
    chunk.add_record(1, 0, |w| {
        w.fragment_header();
        w.start_element("M", true);
        w.attribute_string("a", "q\"q & <b>");
        w.close_start_element();
        w.value_string("1 < 2 & 3 > 2");
        w.end_element();
        w.eof();
    });

    let events = parse_xml(build_file(1, vec![chunk.finish()]));
    assert_eq!(
        events[0].data.as_str(),
        "<M a=\"q&quot;q &amp; &lt;b&gt;\">1 &lt; 2 &amp; 3 &gt; 2</M>"
    );
}

fn nested_file(depth: usize) -> Vec<u8> {
    let mut chunk = ChunkBuilder::new();
    chunk.add_record(1, 0, |w| {
        w.fragment_header();
        for _ in 0..depth {
            w.start_element("N", false);
            w.close_start_element();
        }
        for _ in 0..depth {
            w.end_element();
        }
        w.eof();
    });
    build_file(1, vec![chunk.finish()])
}

#[test]
fn nesting_of_64_levels_is_accepted() {
    ensure_env_logger_initialized();
    let events = parse_xml(nested_file(64));
    assert_eq!(events[0].diagnostic, None);
    assert!(events[0].data.as_str().starts_with("<N><N>"));
    assert!(events[0].data.as_str().ends_with("</N></N>"));
}

#[test]
fn nesting_of_65_levels_degrades() {
    ensure_env_logger_initialized();
    let events = parse_xml(nested_file(65));
    assert_eq!(events.len(), 1);
    let diagnostic = events[0].diagnostic.as_deref().expect("a diagnostic");
    assert!(diagnostic.contains("64"), "{diagnostic}");

    let events = parse_json(nested_file(65));
    assert!(events[0].diagnostic.is_some());
    assert!(events[0].data.as_str().contains("null"));
}

#[test]
fn back_referenced_template_through_the_table() {
    ensure_env_logger_initialized();
    let mut chunk = ChunkBuilder::new();
    let def_offset = chunk.add_template_definition(0, [0x33; 16], |t| {
        t.fragment_header();
        t.start_element("Event", false);
        t.close_start_element();
        t.substitution(0, 0x01, false);
        t.end_element();
        t.eof();
    });
    chunk.add_record(1, 0, move |w| {
        w.fragment_header();
        w.template_instance_ref(def_offset, &[SubValue::Str("via-table")]);
        w.eof();
    });

    let events = parse_xml(build_file(1, vec![chunk.finish()]));
    assert_eq!(events[0].data.as_str(), "<Event>via-table</Event>");
    assert_eq!(events[0].diagnostic, None);
}

#[test]
fn back_reference_missing_from_table_reads_raw_header() {
    ensure_env_logger_initialized();
    let mut chunk = ChunkBuilder::new();
    let def_offset = chunk.add_unlinked_template_definition([0x44; 16], |t| {
        t.fragment_header();
        t.start_element("Event", false);
        t.close_start_element();
        t.substitution(0, 0x01, false);
        t.end_element();
        t.eof();
    });
    chunk.add_record(1, 0, move |w| {
        w.fragment_header();
        w.template_instance_ref(def_offset, &[SubValue::Str("raw-fallback")]);
        w.eof();
    });

    let events = parse_xml(build_file(1, vec![chunk.finish()]));
    assert_eq!(events[0].data.as_str(), "<Event>raw-fallback</Event>");
    assert_eq!(events[0].diagnostic, None);
}

#[test]
fn unresolvable_back_reference_degrades() {
    ensure_env_logger_initialized();
    let mut chunk = ChunkBuilder::new();
    chunk.add_record(1, 0, |w| {
        w.fragment_header();
        // Points four bytes short of the chunk's end: the definition header
        // cannot be read there.
        w.template_instance_ref(65_532, &[SubValue::Str("lost")]);
        w.eof();
    });

    let events = parse_xml(build_file(1, vec![chunk.finish()]));
    assert_eq!(events.len(), 1);
    assert!(events[0].diagnostic.is_some());
}

#[test]
fn embedded_binxml_substitution() {
    ensure_env_logger_initialized();
    let mut chunk = ChunkBuilder::new();
    chunk.add_record(1, 0, |w| {
        w.fragment_header();
        w.template_instance(
            [0x55; 16],
            |t| {
                t.fragment_header();
                t.start_element("Outer", false);
                t.close_start_element();
                t.substitution(0, 0x21, false);
                t.end_element();
                t.eof();
            },
            &[SubValue::Fragment(Box::new(|f: &mut BinXmlWriter| {
                f.fragment_header();
                f.start_element("Inner", false);
                f.close_start_element();
                f.value_string("7");
                f.end_element();
                f.eof();
            }))],
        );
        w.eof();
    });
    let image = build_file(1, vec![chunk.finish()]);

    let events = parse_xml(image.clone());
    assert_eq!(
        events[0].data.as_str(),
        "<Outer><Inner>7</Inner></Outer>"
    );

    // In JSON the nested fragment is rendered, then escaped into a string.
    let events = parse_json(image);
    assert_eq!(
        events[0].data.as_str(),
        "{\"#name\":\"Outer\",\"#content\":[\"{\\\"#name\\\":\\\"Inner\\\",\\\"#content\\\":[\\\"7\\\"]}\"]}"
    );
    events[0].json_value().unwrap();
}

#[test]
fn common_string_back_references_resolve() {
    ensure_env_logger_initialized();
    let mut chunk = ChunkBuilder::new();
    let name_offset = chunk.add_common_string(3, "Computer");
    chunk.add_record(1, 0, move |w| {
        w.fragment_header();
        w.start_element_ref(name_offset, false);
        w.close_start_element();
        w.value_string("HOST-1");
        w.end_element();
        w.eof();
    });

    let events = parse_xml(build_file(1, vec![chunk.finish()]));
    assert_eq!(events[0].data.as_str(), "<Computer>HOST-1</Computer>");
}

#[test]
fn every_xml_output_is_well_formed() {
    ensure_env_logger_initialized();
    let image = varied_file();
    for event in parse_xml(image) {
        if event.diagnostic.is_some() {
            continue;
        }
        let mut reader = quick_xml::Reader::from_str(event.data.as_str());
        loop {
            match reader.read_event() {
                Ok(quick_xml::events::Event::Eof) => break,
                Ok(_) => {}
                Err(e) => panic!("malformed xml {e}: {}", event.data.as_str()),
            }
        }
    }
}

#[test]
fn every_json_output_parses() {
    ensure_env_logger_initialized();
    for event in parse_json(varied_file()) {
        if event.diagnostic.is_some() {
            continue;
        }
        event.json_value().expect("valid json");
    }
}

/// A chunk exercising most token and value shapes at once.
fn varied_file() -> Vec<u8> {
    let mut chunk = ChunkBuilder::new();
    chunk.add_record(1, far_ticks(), |w| {
        w.fragment_header();
        w.template_instance(
            [0x66; 16],
            |t| {
                t.fragment_header();
                t.start_element("Event", true);
                t.attribute_start("Provider");
                t.substitution(0, 0x01, true);
                t.close_start_element();
                t.start_element("TimeCreated", true);
                t.attribute_start("SystemTime");
                t.substitution(1, 0x11, true);
                t.close_empty_element();
                t.start_element("EventData", false);
                t.close_start_element();
                t.substitution(2, 0x01, true);
                t.substitution(3, 0x08, true);
                t.end_element();
                t.end_element();
                t.eof();
            },
            &[
                SubValue::Str("Microsoft-Windows-Security & Co <auditing>"),
                SubValue::Raw(0x11, far_ticks().to_le_bytes().to_vec()),
                SubValue::Str("line1\nline2\ttabbed \"quoted\""),
                SubValue::U32(4625),
            ],
        );
        w.eof();
    });
    chunk.add_record(2, 0, |w| {
        w.fragment_header();
        w.start_element("Bare", true);
        w.attribute_string("k", "v");
        w.close_start_element();
        w.entity_ref("lt");
        w.char_ref(0x2764);
        w.cdata("cdata section");
        w.value_string("tail");
        w.end_element();
        w.eof();
    });
    build_file(1, vec![chunk.finish()])
}

fn far_ticks() -> u64 {
    131_616_000_000_000_000
}
