use serde::Serialize;
use serde_json::json;

/// One progress event for a tool invocation. Mirrors the wire shape of the
/// `notifications/progress` payload.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressUpdate {
    pub tool: String,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    pub indeterminate: bool,
    pub message: String,
}

/// Receives progress events while a command runs. Implementations must not
/// block; the engine calls this on its own threads.
pub trait ProgressSink: Send + Sync {
    fn progress(&self, update: ProgressUpdate);
}

/// Record handed to the completion sink once per terminal-state transition.
/// Both adapter variants merge output streams, so `stdout` carries the
/// combined bytes and `stderr` stays empty.
#[derive(Debug, Clone, Serialize)]
pub struct CompletedCommand {
    pub session_id: String,
    pub command: String,
    pub exit_code: Option<i32>,
    pub exit_signal: Option<String>,
    pub duration_ms: u128,
    pub stdout: String,
    pub stderr: String,
    pub cwd: Option<String>,
    pub shell: String,
    pub started_at: u128,
    pub ended_at: u128,
}

/// Opaque sink for completed-session records (journaling, history, ...).
/// Delivery is offloaded by the engine; a failing or slow sink never affects
/// the session result.
pub trait CompletionSink: Send + Sync {
    fn completed(&self, record: CompletedCommand);
}

/// Default sinks: everything lands in the JSONL debug event log.
pub struct EventLogSink;

impl ProgressSink for EventLogSink {
    fn progress(&self, update: ProgressUpdate) {
        crate::event_log::log_lazy("progress", || {
            serde_json::to_value(&update).unwrap_or_else(|err| json!({"error": err.to_string()}))
        });
    }
}

impl CompletionSink for EventLogSink {
    fn completed(&self, record: CompletedCommand) {
        crate::event_log::log_lazy("session_record", || {
            json!({
                "session_id": record.session_id,
                "command": record.command,
                "exit_code": record.exit_code,
                "exit_signal": record.exit_signal,
                "duration_ms": record.duration_ms,
                "cwd": record.cwd,
                "shell": record.shell,
                "started_at": record.started_at,
                "ended_at": record.ended_at,
                "stdout_bytes": record.stdout.len(),
            })
        });
    }
}
