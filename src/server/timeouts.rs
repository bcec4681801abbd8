use std::time::Duration;

use rmcp::model::ErrorData as McpError;

use crate::session::{DEFAULT_MAX_BUFFER_BYTES, SessionSettings};

const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_QUIET_MS: u64 = 300;
const DEFAULT_WAITING_MS: u64 = 10_000;
const DEFAULT_STUCK_MS: u64 = 45_000;

pub(crate) const DEFAULT_TAIL_BYTES: usize = 2_000;

/// Validates the timing knobs of a `terminal.run` call. `timeout_ms` of zero
/// disables the run timeout; every other knob must be positive.
pub(crate) fn resolve_run_settings(
    timeout_ms: Option<u64>,
    quiet_ms: Option<u64>,
    waiting_ms: Option<u64>,
    stuck_ms: Option<u64>,
    max_buffer_bytes: Option<usize>,
) -> Result<SessionSettings, McpError> {
    let timeout_ms = timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS);
    let quiet_ms = require_positive(quiet_ms.unwrap_or(DEFAULT_QUIET_MS), "quietMs")?;
    let waiting_ms = require_positive(waiting_ms.unwrap_or(DEFAULT_WAITING_MS), "waitingMs")?;
    let stuck_ms = require_positive(stuck_ms.unwrap_or(DEFAULT_STUCK_MS), "stuckMs")?;
    let max_buffer_bytes = max_buffer_bytes.unwrap_or(DEFAULT_MAX_BUFFER_BYTES);
    if max_buffer_bytes == 0 {
        return Err(McpError::invalid_params(
            "maxBufferBytes must be positive",
            None,
        ));
    }

    Ok(SessionSettings {
        timeout: (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms)),
        quiet_window: Duration::from_millis(quiet_ms),
        waiting_after: Duration::from_millis(waiting_ms),
        stuck_after: Duration::from_millis(stuck_ms),
        max_buffer_bytes,
    })
}

fn require_positive(value: u64, name: &str) -> Result<u64, McpError> {
    if value == 0 {
        return Err(McpError::invalid_params(
            format!("{name} must be positive"),
            None,
        ));
    }
    Ok(value)
}
