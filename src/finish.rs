use std::sync::OnceLock;

use regex::Regex;

use crate::ansi::strip_sgr;

// Common command-completion idioms: checkmarks, package-manager summaries,
// build and server-ready lines, publish/push confirmations, and timing
// footers. Advisory only; a match never completes a session by itself.
const FINISH_PATTERNS: &[&str] = &[
    r"[✔✓]",
    r"(?i)\b(?:success|done|completed)\b",
    r"(?i)\ball tests passed\b",
    r"(?i)\b(?:added|audited)\s+\d+\s+packages?\b",
    r"(?i)\bup to date\b",
    r"(?i)\bbuilt successfully\b",
    r"(?i)\bbuild (?:succeeded|failed)\b",
    r"(?i)\b(?:listening|running) on https?\b",
    r"(?i)\bpublished\b",
    r"(?i)\bpushed\b",
    r"(?i)\bdone in \d+(?:\.\d+)?\s*s\b",
    r"(?i)\btotal time:\s*\d+(?:\.\d+)?\s*(?:ms|s|m|h)\b",
];

fn compiled_patterns() -> &'static Vec<Regex> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        FINISH_PATTERNS
            .iter()
            .map(|pattern| Regex::new(pattern).expect("static finish pattern"))
            .collect()
    })
}

/// Whether a line reads like the tail of a finished command.
pub fn looks_finished(line: &str) -> bool {
    let stripped = strip_sgr(line);
    compiled_patterns()
        .iter()
        .any(|pattern| pattern.is_match(&stripped))
}
