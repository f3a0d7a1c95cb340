//! Terminal-output cleanup.
//!
//! CLIs write ANSI colour codes, cursor movement, OSC titles and spinner frames
//! even when piped. None of that is useful downstream.

use std::sync::OnceLock;

use regex::Regex;

fn escape_sequences() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // CSI, OSC (BEL or ST terminated), then two-byte escapes.
        Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)?|\x1b[@-Z\\-_]")
            .expect("escape sequence pattern is valid")
    })
}

/// Remove escape sequences and control characters other than `\n` and `\t`.
/// Carriage returns become line breaks.
pub fn strip_control_sequences(input: &str) -> String {
    let without_escapes = escape_sequences().replace_all(input, "");
    let unified = without_escapes.replace("\r\n", "\n").replace('\r', "\n");
    unified
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect()
}

/// Longest unfinished sequence held back for the next chunk.
const MAX_PENDING_ESCAPE: usize = 4096;

/// Split off a trailing escape sequence that has not received its final byte.
///
/// Returns `(complete, pending)`; `pending` is empty when `text` ends cleanly.
/// Prepend `pending` to the next chunk read from the same stream.
pub fn split_incomplete_escape(text: &str) -> (&str, &str) {
    let Some(last) = text.rfind('\x1b') else {
        return (text, "");
    };
    let body = &text[last + 1..];
    let unfinished = if body.is_empty() {
        true
    } else if let Some(params) = body.strip_prefix('[') {
        params.bytes().all(|b| (0x20..=0x3f).contains(&b))
    } else if let Some(osc) = body.strip_prefix(']') {
        !osc.contains('\x07')
    } else {
        false
    };
    if !unfinished {
        return (text, "");
    }

    // A lone ESC may open the string terminator of an OSC.
    let mut start = last;
    if body.is_empty() {
        if let Some(open) = text[..last].rfind("\x1b]") {
            let title = &text[open + 2..last];
            if !title.contains(['\x07', '\x1b']) {
                start = open;
            }
        }
    }

    if text.len() - start > MAX_PENDING_ESCAPE {
        return (text, "");
    }
    text.split_at(start)
}

fn is_spinner_glyph(c: char) -> bool {
    matches!(c, '\u{2800}'..='\u{28FF}')
        || matches!(c, '◐' | '◓' | '◑' | '◒' | '◴' | '◷' | '◶' | '◵' | '●' | '○' | '·' | '•')
}

/// True for lines that contain nothing but spinner frames.
pub fn is_spinner_line(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return false;
    }
    if trimmed.chars().count() == 1 && matches!(trimmed, "|" | "/" | "-" | "\\") {
        return true;
    }
    trimmed
        .chars()
        .all(|c| c.is_whitespace() || is_spinner_glyph(c))
}

/// Strip control sequences and drop spinner-only lines, keeping line structure.
///
/// An unterminated tail may be a streamed text fragment such as `-` or `•`,
/// so only braille frames are dropped there.
pub fn normalize_output(input: &str) -> String {
    let stripped = strip_control_sequences(input);
    stripped
        .split_inclusive('\n')
        .filter(|segment| match segment.strip_suffix('\n') {
            Some(line) => !is_spinner_line(line),
            None => !is_braille_frame(segment),
        })
        .collect()
}

fn is_braille_frame(segment: &str) -> bool {
    let trimmed = segment.trim();
    !trimmed.is_empty()
        && trimmed
            .chars()
            .all(|c| c.is_whitespace() || matches!(c, '\u{2800}'..='\u{28FF}'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_colour_and_cursor_codes() {
        let raw = "\x1b[1;32mPASS\x1b[0m tests\x1b[2K\x1b[1G done";
        assert_eq!(strip_control_sequences(raw), "PASS tests done");
    }

    #[test]
    fn test_strips_osc_title() {
        let raw = "\x1b]0;claude\x07hello";
        assert_eq!(strip_control_sequences(raw), "hello");
    }

    #[test]
    fn test_carriage_returns_become_newlines() {
        assert_eq!(strip_control_sequences("a\r\nb\rc\u{8}"), "a\nb\nc");
    }

    #[test]
    fn test_spinner_lines() {
        assert!(is_spinner_line("⠋"));
        assert!(is_spinner_line("  ⠙ ⠹ "));
        assert!(is_spinner_line("|"));
        assert!(!is_spinner_line("---"));
        assert!(!is_spinner_line("⠋ Thinking"));
        assert!(!is_spinner_line(""));
    }

    #[test]
    fn test_normalize_drops_spinner_frames() {
        let raw = "\x1b[36m⠋\x1b[0m\nBuilding\n⠙\r⠹\nDone\n";
        assert_eq!(normalize_output(raw), "Building\nDone\n");
    }

    #[test]
    fn test_split_incomplete_escape() {
        assert_eq!(split_incomplete_escape("ready\n"), ("ready\n", ""));
        assert_eq!(split_incomplete_escape("ok\x1b[3"), ("ok", "\x1b[3"));
        assert_eq!(split_incomplete_escape("ok\x1b"), ("ok", "\x1b"));
        assert_eq!(split_incomplete_escape("\x1b[32mok\x1b[0m"), ("\x1b[32mok\x1b[0m", ""));
        assert_eq!(split_incomplete_escape("a\x1b]0;tit"), ("a", "\x1b]0;tit"));
        assert_eq!(split_incomplete_escape("a\x1b]0;title\x1b"), ("a", "\x1b]0;title\x1b"));
        assert_eq!(split_incomplete_escape("a\x1b]0;t\x07b"), ("a\x1b]0;t\x07b", ""));

        let runaway = format!("\x1b]{}", "x".repeat(MAX_PENDING_ESCAPE));
        assert_eq!(split_incomplete_escape(&runaway).1, "");
    }

    #[test]
    fn test_normalize_keeps_streamed_fragments() {
        assert_eq!(normalize_output("-"), "-");
        assert_eq!(normalize_output("•"), "•");
        assert_eq!(normalize_output("⠋"), "");
        assert_eq!(normalize_output("-\n"), "");
    }
}
