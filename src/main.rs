mod adapter;
mod ansi;
mod config;
mod diagnostics;
mod event_log;
mod finish;
mod heuristics;
mod hooks;
mod prompt;
mod server;
mod session;

use std::path::PathBuf;

use crate::config::{LogLevel, ServerConfig};

struct CliOptions {
    config: ServerConfig,
    debug_events_dir: Option<PathBuf>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(target_family = "unix")]
    // The server writes tool results and diagnostics to stdout/stderr. If a
    // downstream reader disconnects and closes its read end, future writes can
    // raise SIGPIPE and terminate the process on Unix. Ignore SIGPIPE so we
    // surface broken-pipe errors normally instead of crashing.
    ignore_sigpipe();

    let options = parse_cli_args()?;
    diagnostics::initialize(options.config.log_level);
    event_log::initialize(options.debug_events_dir)?;
    server::run(options.config).await
}

#[cfg(target_family = "unix")]
fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

fn parse_cli_args() -> Result<CliOptions, Box<dyn std::error::Error>> {
    let mut parser = ArgParser::new();
    let mut config = ServerConfig::from_env()?;
    let mut debug_events_dir = None;

    while let Some(arg) = parser.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                print_usage();
                std::process::exit(0);
            }
            "--use-pty" => {
                config.use_pty = true;
            }
            "--shell" => {
                let value = parser.next_value("--shell")?;
                if value.trim().is_empty() {
                    return Err("missing value for --shell".into());
                }
                config.default_shell = Some(value);
            }
            _ if arg.starts_with("--shell=") => {
                let value = arg.split_once('=').map(|(_, value)| value).unwrap_or("");
                if value.trim().is_empty() {
                    return Err("missing value for --shell".into());
                }
                config.default_shell = Some(value.to_string());
            }
            "--max-sessions" => {
                let value = parser.next_value("--max-sessions")?;
                config.max_sessions = parse_max_sessions(&value)?;
            }
            _ if arg.starts_with("--max-sessions=") => {
                let value = arg.split_once('=').map(|(_, value)| value).unwrap_or("");
                config.max_sessions = parse_max_sessions(value)?;
            }
            "--log-level" => {
                let value = parser.next_value("--log-level")?;
                config.log_level = LogLevel::parse(&value).map_err(|err| err.to_string())?;
            }
            _ if arg.starts_with("--log-level=") => {
                let value = arg.split_once('=').map(|(_, value)| value).unwrap_or("");
                config.log_level = LogLevel::parse(value).map_err(|err| err.to_string())?;
            }
            "--debug-events-dir" => {
                let value = parser.next_value("--debug-events-dir")?;
                if value.trim().is_empty() {
                    return Err("missing value for --debug-events-dir".into());
                }
                debug_events_dir = Some(PathBuf::from(value));
            }
            _ if arg.starts_with("--debug-events-dir=") => {
                let value = arg.split_once('=').map(|(_, value)| value).unwrap_or("");
                if value.trim().is_empty() {
                    return Err("missing value for --debug-events-dir".into());
                }
                debug_events_dir = Some(PathBuf::from(value));
            }
            _ => return Err(format!("unknown argument: {arg}").into()),
        }
    }

    Ok(CliOptions {
        config,
        debug_events_dir,
    })
}

fn parse_max_sessions(value: &str) -> Result<usize, Box<dyn std::error::Error>> {
    let parsed: usize = value
        .trim()
        .parse()
        .map_err(|_| format!("invalid --max-sessions value: {value}"))?;
    if parsed == 0 {
        return Err("--max-sessions must be at least 1".into());
    }
    Ok(parsed)
}

struct ArgParser {
    args: Vec<String>,
    index: usize,
}

impl ArgParser {
    fn new() -> Self {
        Self {
            args: std::env::args().skip(1).collect(),
            index: 0,
        }
    }

    fn next(&mut self) -> Option<String> {
        let value = self.args.get(self.index)?.clone();
        self.index += 1;
        Some(value)
    }

    fn next_value(&mut self, flag: &str) -> Result<String, Box<dyn std::error::Error>> {
        self.next()
            .ok_or_else(|| format!("missing value for {flag}").into())
    }
}

fn print_usage() {
    println!(
        "Usage:\n\
mcp-terminal [--use-pty] [--shell <path>] [--max-sessions <n>] [--log-level <error|warn|info|debug>] [--debug-events-dir <dir>]\n\n\
Runs an MCP server over stdio that executes shell commands and classifies\n\
their liveness (running / waiting / possibly-stuck / completed / error).\n\n\
--use-pty: spawn commands under a pseudo-terminal (env: USE_PTY=1)\n\
--shell: shell binary for spawned commands (env: DEFAULT_SHELL)\n\
--max-sessions: soft cap on live sessions (env: MAX_SESSIONS; default 50)\n\
--log-level: stderr diagnostics threshold (env: LOG_LEVEL; default info)\n\
--debug-events-dir: directory for per-startup JSONL debug event logs (env: MCP_TERMINAL_DEBUG_EVENTS_DIR)\n\
Session inactivity eviction is controlled by SESSION_TIMEOUT_MS (default 3600000)."
    );
}
