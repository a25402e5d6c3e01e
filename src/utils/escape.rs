//! XML-entity and JSON escape appenders.
//!
//! Both renderers escape on the fly while appending into a [`TextSink`];
//! nothing here allocates. The JSON path scans for the two structural bytes
//! with `memchr2` and copies clean runs wholesale.

use crate::utils::sink::TextSink;
use memchr::memchr2;

/// Append `ch` with XML entity escaping for `& < > " '`.
#[inline]
pub(crate) fn push_xml_char(ch: char, out: &mut TextSink) {
    match ch {
        '&' => out.push_str("&amp;"),
        '<' => out.push_str("&lt;"),
        '>' => out.push_str("&gt;"),
        '"' => out.push_str("&quot;"),
        '\'' => out.push_str("&apos;"),
        _ => out.push(ch),
    }
}

/// Append `s` with XML entity escaping.
pub(crate) fn push_xml_str(s: &str, out: &mut TextSink) {
    for ch in s.chars() {
        push_xml_char(ch, out);
    }
}

/// Append a UTF-16LE span with XML entity escaping.
pub(crate) fn push_xml_utf16(bytes: &[u8], out: &mut TextSink) {
    for ch in crate::utils::utf16::chars(bytes) {
        push_xml_char(ch, out);
    }
}

#[inline]
fn push_json_control(b: u8, out: &mut TextSink) {
    match b {
        b'\n' => out.push_str("\\n"),
        b'\r' => out.push_str("\\r"),
        b'\t' => out.push_str("\\t"),
        0x08 => out.push_str("\\b"),
        0x0C => out.push_str("\\f"),
        _ => {
            out.push_str("\\u00");
            out.push_hex_u64(u64::from(b), 2, false);
        }
    }
}

/// Append `ch` with JSON string-literal escaping.
#[inline]
pub(crate) fn push_json_char(ch: char, out: &mut TextSink) {
    match ch {
        '"' => out.push_str("\\\""),
        '\\' => out.push_str("\\\\"),
        '\u{0}'..='\u{1F}' => push_json_control(ch as u8, out),
        _ => out.push(ch),
    }
}

/// Append `s` with JSON string-literal escaping.
///
/// Clean runs between `"` / `\` occurrences are copied in one append; control
/// characters inside a run are handled byte-wise (they are standalone ASCII
/// bytes in UTF-8, so slicing around them stays on char boundaries).
pub(crate) fn push_json_str(s: &str, out: &mut TextSink) {
    let bytes = s.as_bytes();
    let mut start = 0_usize;
    let mut i = 0_usize;

    while i < bytes.len() {
        let stop = match memchr2(b'"', b'\\', &bytes[i..]) {
            Some(p) => i + p,
            None => bytes.len(),
        };

        let mut j = i;
        while j < stop {
            let b = bytes[j];
            if b < 0x20 {
                if start < j {
                    out.push_str(&s[start..j]);
                }
                push_json_control(b, out);
                start = j + 1;
            }
            j += 1;
        }

        if stop >= bytes.len() {
            break;
        }

        if start < stop {
            out.push_str(&s[start..stop]);
        }
        match bytes[stop] {
            b'"' => out.push_str("\\\""),
            _ => out.push_str("\\\\"),
        }
        start = stop + 1;
        i = stop + 1;
    }

    if start < bytes.len() {
        out.push_str(&s[start..]);
    }
}

/// Append a UTF-16LE span with JSON string-literal escaping.
pub(crate) fn push_json_utf16(bytes: &[u8], out: &mut TextSink) {
    for ch in crate::utils::utf16::chars(bytes) {
        push_json_char(ch, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xml(s: &str) -> String {
        let mut sink = TextSink::new();
        push_xml_str(s, &mut sink);
        sink.into_string()
    }

    fn json(s: &str) -> String {
        let mut sink = TextSink::new();
        push_json_str(s, &mut sink);
        sink.into_string()
    }

    #[test]
    fn xml_entities() {
        assert_eq!(xml(r#"a<b>&"c'"#), "a&lt;b&gt;&amp;&quot;c&apos;");
        assert_eq!(xml("plain"), "plain");
    }

    #[test]
    fn json_structural_and_controls() {
        assert_eq!(json(r#"say "hi"\now"#), r#"say \"hi\"\\now"#);
        assert_eq!(json("a\nb\tc\u{1}"), "a\\nb\\tc\\u0001");
        assert_eq!(json("clean run"), "clean run");
    }

    #[test]
    fn json_multibyte_passthrough() {
        assert_eq!(json("héllo \u{1F600}"), "héllo \u{1F600}");
    }
}
