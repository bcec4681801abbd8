use std::sync::OnceLock;

use regex::Regex;

const SPINNER_GLYPHS: [char; 4] = ['|', '/', '-', '\\'];

fn sgr_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new("\u{1b}\\[[0-9;]*m").expect("static SGR pattern"))
}

/// Removes SGR color/style sequences (`ESC [ params m`). Other CSI sequences
/// are left alone; classification only needs colors out of the way, and the
/// stored output keeps every raw byte regardless.
pub fn strip_sgr(line: &str) -> String {
    sgr_pattern().replace_all(line, "").into_owned()
}

/// True when `next` is a spinner repaint of `prev`: after SGR stripping and
/// trailing-whitespace trimming both lines have the same length, end in one of
/// `| / - \`, and agree on every character before the last.
pub fn is_spinner_frame(prev: &str, next: &str) -> bool {
    let prev = strip_sgr(prev);
    let next = strip_sgr(next);
    let prev = prev.trim_end();
    let next = next.trim_end();

    let (Some(prev_last), Some(next_last)) = (prev.chars().last(), next.chars().last()) else {
        return false;
    };
    if !SPINNER_GLYPHS.contains(&prev_last) || !SPINNER_GLYPHS.contains(&next_last) {
        return false;
    }
    if prev.len() != next.len() {
        return false;
    }
    let prev_body = &prev[..prev.len() - prev_last.len_utf8()];
    let next_body = &next[..next.len() - next_last.len_utf8()];
    prev_body == next_body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_sgr_sequences_only() {
        assert_eq!(strip_sgr("\u{1b}[1;32mok\u{1b}[0m"), "ok");
        // Non-SGR CSI sequences pass through untouched.
        assert_eq!(strip_sgr("\u{1b}[2Jcleared"), "\u{1b}[2Jcleared");
        assert_eq!(strip_sgr("plain"), "plain");
    }

    #[test]
    fn successive_spinner_frames_are_recognized() {
        assert!(is_spinner_frame("working |", "working /"));
        assert!(is_spinner_frame("working /", "working -"));
        assert!(is_spinner_frame("working -", "working \\"));
        assert!(is_spinner_frame("working \\", "working |"));
    }

    #[test]
    fn identical_spinner_frame_counts_as_repaint() {
        assert!(is_spinner_frame("working |", "working |"));
    }

    #[test]
    fn trailing_whitespace_and_color_are_ignored() {
        assert!(is_spinner_frame("working |  ", "\u{1b}[36mworking /\u{1b}[0m"));
    }

    #[test]
    fn real_output_is_not_a_spinner_frame() {
        assert!(!is_spinner_frame("working |", "done"));
        assert!(!is_spinner_frame("working |", "working on /"));
        assert!(!is_spinner_frame("compiling", "compiling"));
        assert!(!is_spinner_frame("", "|"));
        assert!(!is_spinner_frame("|", ""));
    }

    #[test]
    fn body_must_match_exactly() {
        assert!(!is_spinner_frame("fetch a |", "fetch b /"));
    }
}
