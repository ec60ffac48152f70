//! Inbound frame scanning.
//!
//! The gateway resends the full best-known answer on every frame rather
//! than streaming deltas, interleaved with auxiliary "embedded screens"
//! content such as previews and intermediate reasoning. Which text is the
//! primary answer is decided by marker position alone, a heuristic
//! recovered from the web client rather than a documented contract, so
//! all of that judgement is isolated here.

/// Marker preceding the primary answer text in a frame.
pub const PRIMARY_TEXT_MARKER: &str = "\"GenAIMarkdownTextUXPrimitive\",\"text\":\"";
/// Marker opening the auxiliary side-channel section of a frame.
pub const SIDE_CHANNEL_MARKER: &str = "\"embedded_screens\"";

/// Outcome of scanning one inbound frame for answer text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameText {
    /// Primary answer text, escape-decoded. Replaces any earlier text.
    Primary(String),
    /// A text marker was present but sits inside side-channel content;
    /// the previously accumulated answer must be kept.
    SideChannel,
    /// No text marker in this frame.
    Absent,
}

/// Scan a raw inbound frame for answer text.
///
/// The frame is viewed as lossy UTF-8; binary header bytes around the
/// JSON body decode to replacement characters without disturbing the
/// markers. A text marker only counts as the primary answer when it
/// appears before any side-channel section.
pub fn scan_frame(frame: &[u8]) -> FrameText {
    let view = String::from_utf8_lossy(frame);
    let Some(marker_idx) = view.find(PRIMARY_TEXT_MARKER) else {
        return FrameText::Absent;
    };
    if let Some(side_idx) = view.find(SIDE_CHANNEL_MARKER) {
        if marker_idx > side_idx {
            return FrameText::SideChannel;
        }
    }
    let start = marker_idx + PRIMARY_TEXT_MARKER.len();
    let raw = &view[start..];
    let end = end_of_json_string(raw);
    FrameText::Primary(decode_escapes(&raw[..end]))
}

/// Byte index of the closing unescaped quote of a JSON string body, or
/// the full length when the frame truncates mid-string.
fn end_of_json_string(s: &str) -> usize {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'"' => return i,
            _ => i += 1,
        }
    }
    bytes.len()
}

/// Decode JSON string escapes in a single pass.
///
/// Handles `\n`, `\t`, `\"`, `\\` and `\uXXXX` including surrogate
/// pairs. Unknown escapes and malformed `\u` sequences pass through
/// verbatim; lone surrogates decode to U+FFFD.
pub fn decode_escapes(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(pos) = rest.find('\\') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos + 1..];
        let mut consumed = 1;
        match tail.as_bytes().first() {
            Some(b'n') => {
                out.push('\n');
                consumed += 1;
            }
            Some(b't') => {
                out.push('\t');
                consumed += 1;
            }
            Some(b'"') => {
                out.push('"');
                consumed += 1;
            }
            Some(b'\\') => {
                out.push('\\');
                consumed += 1;
            }
            Some(b'u') => match decode_unicode_escape(tail) {
                Some((ch, used)) => {
                    out.push(ch);
                    consumed += used;
                }
                None => out.push('\\'),
            },
            _ => out.push('\\'),
        }
        rest = &rest[pos + consumed..];
    }
    out.push_str(rest);
    out
}

/// Decode `uXXXX` at the head of `tail`, consuming a following `\uXXXX`
/// low surrogate when the first unit is a high surrogate. Returns the
/// decoded char and the bytes consumed from `tail`.
fn decode_unicode_escape(tail: &str) -> Option<(char, usize)> {
    let hex = tail.get(1..5)?;
    let unit = u32::from_str_radix(hex, 16).ok()?;
    if (0xd800..0xdc00).contains(&unit) {
        if let Some(low_hex) = tail.get(5..11).and_then(|s| s.strip_prefix("\\u")) {
            if let Ok(low) = u32::from_str_radix(low_hex, 16) {
                if (0xdc00..0xe000).contains(&low) {
                    let combined = 0x10000 + ((unit - 0xd800) << 10) + (low - 0xdc00);
                    if let Some(ch) = char::from_u32(combined) {
                        return Some((ch, 11));
                    }
                }
            }
        }
        return Some((char::REPLACEMENT_CHARACTER, 5));
    }
    if (0xdc00..0xe000).contains(&unit) {
        return Some((char::REPLACEMENT_CHARACTER, 5));
    }
    char::from_u32(unit).map(|ch| (ch, 5))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with(text: &str) -> Vec<u8> {
        let mut frame = vec![0x0d, 0x00, 0xff];
        frame.extend_from_slice(
            format!(r#"{{"primitive":{{"__typename":"GenAIMarkdownTextUXPrimitive","text":"{text}"}}}}"#)
                .as_bytes(),
        );
        frame
    }

    #[test]
    fn extracts_primary_text() {
        assert_eq!(
            scan_frame(&frame_with("Hello there")),
            FrameText::Primary("Hello there".into())
        );
    }

    #[test]
    fn absent_without_marker() {
        assert_eq!(scan_frame(br#"{"code":200}"#), FrameText::Absent);
        assert_eq!(scan_frame(&[]), FrameText::Absent);
    }

    #[test]
    fn marker_inside_side_channel_is_rejected() {
        let frame =
            br#"{"embedded_screens":[{"__typename":"GenAIMarkdownTextUXPrimitive","text":"thinking..."}]}"#;
        assert_eq!(scan_frame(frame), FrameText::SideChannel);
    }

    #[test]
    fn marker_before_side_channel_wins() {
        let frame =
            br#"{"__typename":"GenAIMarkdownTextUXPrimitive","text":"the answer","embedded_screens":[{"text":"draft"}]}"#;
        assert_eq!(
            scan_frame(frame),
            FrameText::Primary("the answer".into())
        );
    }

    #[test]
    fn text_ends_at_first_unescaped_quote() {
        assert_eq!(
            scan_frame(&frame_with(r#"she said \"hi\"","next":"x"#)),
            FrameText::Primary("she said \"hi\"".into())
        );
    }

    #[test]
    fn trailing_escaped_backslash_does_not_eat_the_closing_quote() {
        // Text body is `a\\` in raw JSON: decodes to a single backslash,
        // and the quote after it terminates the string.
        assert_eq!(
            scan_frame(&frame_with(r"a\\")),
            FrameText::Primary("a\\".into())
        );
    }

    #[test]
    fn decodes_simple_escapes() {
        assert_eq!(decode_escapes(r"line1\nline2"), "line1\nline2");
        assert_eq!(decode_escapes(r"col1\tcol2"), "col1\tcol2");
        assert_eq!(decode_escapes(r#"say \"hi\""#), "say \"hi\"");
        assert_eq!(decode_escapes(r"C:\\temp"), "C:\\temp");
    }

    #[test]
    fn decodes_unicode_escapes() {
        assert_eq!(decode_escapes(r"Ol\u00e1"), "Olá");
        assert_eq!(decode_escapes(r"snow \u2603!"), "snow ☃!");
    }

    #[test]
    fn decodes_surrogate_pairs() {
        assert_eq!(decode_escapes(r"\ud83d\ude00"), "😀");
    }

    #[test]
    fn lone_surrogate_becomes_replacement_char() {
        assert_eq!(decode_escapes(r"x\ud83dx"), "x\u{fffd}x");
        assert_eq!(decode_escapes(r"x\ude00x"), "x\u{fffd}x");
    }

    #[test]
    fn unknown_escapes_pass_through() {
        assert_eq!(decode_escapes(r"a\qb"), r"a\qb");
        assert_eq!(decode_escapes(r"tail\"), "tail\\");
        assert_eq!(decode_escapes(r"bad\uZZZZ"), r"bad\uZZZZ");
    }

    #[test]
    fn binary_prefix_does_not_disturb_the_scan() {
        let mut frame = vec![0xff, 0xfe, 0x80, 0x81];
        frame.extend_from_slice(br#"..."GenAIMarkdownTextUXPrimitive","text":"ok""#);
        assert_eq!(scan_frame(&frame), FrameText::Primary("ok".into()));
    }
}
