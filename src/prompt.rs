use std::sync::OnceLock;

use regex::Regex;

use crate::ansi::strip_sgr;

/// A shell prompt shape calibrated from observed output. Once a session has
/// seen one of these at end-of-line, re-appearance of the same shape is the
/// strongest available completion hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptPattern {
    /// `PS C:\some\path> ` with a trailing space.
    WindowsPowerShell,
    /// Any prefix ending in `$ ` or `# `.
    PosixShell,
}

fn powershell_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"PS [^>]*> $").expect("static powershell prompt pattern"))
}

fn posix_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[$#] $").expect("static posix prompt pattern"))
}

impl PromptPattern {
    pub fn matches(self, line: &str) -> bool {
        let stripped = strip_sgr(line);
        match self {
            PromptPattern::WindowsPowerShell => powershell_pattern().is_match(&stripped),
            PromptPattern::PosixShell => posix_pattern().is_match(&stripped),
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            PromptPattern::WindowsPowerShell => "powershell",
            PromptPattern::PosixShell => "posix-shell",
        }
    }
}

/// Tests a line against the built-in prompt shapes and returns the first
/// match. The caller caches the result on the session; a cached pattern is
/// never replaced for the session's lifetime.
pub fn detect(line: &str) -> Option<PromptPattern> {
    let stripped = strip_sgr(line);
    if powershell_pattern().is_match(&stripped) {
        return Some(PromptPattern::WindowsPowerShell);
    }
    if posix_pattern().is_match(&stripped) {
        return Some(PromptPattern::PosixShell);
    }
    None
}
