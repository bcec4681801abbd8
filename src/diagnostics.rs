use std::sync::OnceLock;

use crate::config::LogLevel;

static ACTIVE_LEVEL: OnceLock<LogLevel> = OnceLock::new();

/// Installs the stderr log threshold. First call wins; later calls (tests,
/// re-initialization) are ignored.
pub fn initialize(level: LogLevel) {
    let _ = ACTIVE_LEVEL.set(level);
}

fn active_level() -> LogLevel {
    ACTIVE_LEVEL.get().copied().unwrap_or(LogLevel::Info)
}

pub fn log(level: LogLevel, message: impl AsRef<str>) {
    if level > active_level() {
        return;
    }
    eprintln!("mcp-terminal[{}] {}", level.as_str(), message.as_ref());
}

pub fn error(message: impl AsRef<str>) {
    log(LogLevel::Error, message);
}

pub fn warn(message: impl AsRef<str>) {
    log(LogLevel::Warn, message);
}

pub fn info(message: impl AsRef<str>) {
    log(LogLevel::Info, message);
}

pub fn debug(message: impl AsRef<str>) {
    log(LogLevel::Debug, message);
}
