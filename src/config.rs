use std::time::Duration;

pub const USE_PTY_ENV: &str = "USE_PTY";
pub const DEFAULT_SHELL_ENV: &str = "DEFAULT_SHELL";
pub const MAX_SESSIONS_ENV: &str = "MAX_SESSIONS";
pub const SESSION_TIMEOUT_MS_ENV: &str = "SESSION_TIMEOUT_MS";
pub const LOG_LEVEL_ENV: &str = "LOG_LEVEL";

const DEFAULT_MAX_SESSIONS: usize = 50;
const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_millis(3_600_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    pub fn parse(value: &str) -> Result<Self, String> {
        match value.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "warn" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            other => Err(format!(
                "invalid log level: {other} (expected error|warn|info|debug)"
            )),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub use_pty: bool,
    pub default_shell: Option<String>,
    pub max_sessions: usize,
    pub session_timeout: Duration,
    pub log_level: LogLevel,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            use_pty: false,
            default_shell: None,
            max_sessions: DEFAULT_MAX_SESSIONS,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            log_level: LogLevel::Info,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, String> {
        Self::from_env_iter(std::env::vars())
    }

    fn from_env_iter<I>(vars: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut config = Self::default();
        for (key, value) in vars {
            match key.as_str() {
                USE_PTY_ENV => {
                    config.use_pty = match value.trim() {
                        "1" => true,
                        "0" | "" => false,
                        other => return Err(format!("invalid {USE_PTY_ENV}: {other} (expected 0|1)")),
                    };
                }
                DEFAULT_SHELL_ENV => {
                    let trimmed = value.trim();
                    if !trimmed.is_empty() {
                        config.default_shell = Some(trimmed.to_string());
                    }
                }
                MAX_SESSIONS_ENV => {
                    let parsed: usize = value
                        .trim()
                        .parse()
                        .map_err(|_| format!("invalid {MAX_SESSIONS_ENV}: {value}"))?;
                    if parsed == 0 {
                        return Err(format!("{MAX_SESSIONS_ENV} must be at least 1"));
                    }
                    config.max_sessions = parsed;
                }
                SESSION_TIMEOUT_MS_ENV => {
                    let parsed: u64 = value
                        .trim()
                        .parse()
                        .map_err(|_| format!("invalid {SESSION_TIMEOUT_MS_ENV}: {value}"))?;
                    if parsed == 0 {
                        return Err(format!("{SESSION_TIMEOUT_MS_ENV} must be positive"));
                    }
                    config.session_timeout = Duration::from_millis(parsed);
                }
                LOG_LEVEL_ENV => {
                    config.log_level = LogLevel::parse(&value)?;
                }
                _ => {}
            }
        }
        Ok(config)
    }
}
