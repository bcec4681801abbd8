use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use rmcp::handler::server::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{
    CallToolResult, Content, ErrorData as McpError, Implementation, ProgressNotificationParam,
    ProtocolVersion, ServerCapabilities, ServerInfo,
};
use rmcp::service::RequestContext;
use rmcp::{RoleServer, ServerHandler, tool, tool_handler, tool_router};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};

mod timeouts;


use self::timeouts::{DEFAULT_TAIL_BYTES, resolve_run_settings};

use crate::adapter::{AdapterSignal, DataCallback, ExitCallback, ProcessAdapter, SpawnRequest};
use crate::config::ServerConfig;
use crate::heuristics::Heuristics;
use crate::hooks::{CompletionSink, EventLogSink, ProgressSink, ProgressUpdate};
use crate::session::{SessionSettings, SessionStatus, SessionStore, SessionView};

#[derive(Clone)]
pub struct TerminalServer {
    store: Arc<SessionStore>,
    config: Arc<ServerConfig>,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl TerminalServer {
    pub fn new(config: ServerConfig) -> Self {
        let store = Arc::new(SessionStore::new(
            config.max_sessions,
            config.session_timeout,
        ));
        Self {
            store,
            config: Arc::new(config),
            tool_router: Self::tool_router(),
        }
    }

    fn get_info(&self) -> ServerInfo {
        server_info()
    }

    /// Run a shell command, stream progress while it executes, and return its
    /// output once the session completes, errors, or times out. The session
    /// stays queryable for a grace period afterwards.
    #[tool(name = "terminal.run")]
    async fn run(
        &self,
        params: Parameters<RunArgs>,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let args = params.0;
        if args.command.trim().is_empty() {
            return Err(McpError::invalid_params("command must not be empty", None));
        }
        let settings = resolve_run_settings(
            args.timeout_ms,
            args.quiet_ms,
            args.waiting_ms,
            args.stuck_ms,
            args.max_buffer_bytes,
        )?;
        crate::event_log::log_lazy("tool_call_begin", || {
            json!({
                "tool": "terminal.run",
                "command": args.command.clone(),
                "cwd": args.cwd.clone(),
            })
        });

        let progress = progress_sink_for(&context, "terminal.run");
        let store = self.store.clone();
        let config = self.config.clone();
        let result = tokio::task::spawn_blocking(move || {
            run_session_blocking(&store, &config, args, settings, progress)
        })
        .await
        .map_err(|err| McpError::internal_error(err.to_string(), None))?;

        crate::event_log::log_lazy("tool_call_end", || {
            json!({
                "tool": "terminal.run",
                "is_error": result.is_error,
            })
        });
        Ok(result)
    }

    /// Report a session's liveness status, exit information, and the tail of
    /// its captured output.
    #[tool(name = "terminal.status")]
    async fn status(&self, params: Parameters<StatusArgs>) -> Result<CallToolResult, McpError> {
        let args = params.0;
        status_result(&self.store, &args.session_id, args.tail)
    }

    /// Write bytes verbatim to a running session's stdin. Include a trailing
    /// newline to submit a line.
    #[tool(name = "terminal.write")]
    async fn write(&self, params: Parameters<WriteArgs>) -> Result<CallToolResult, McpError> {
        let args = params.0;
        write_result(&self.store, &args.session_id, &args.data)
    }

    /// Send SIGINT, SIGTERM, or KILL to a running session, or CTRL_C to write
    /// an interrupt byte instead of signaling.
    #[tool(name = "terminal.signal")]
    async fn signal(&self, params: Parameters<SignalArgs>) -> Result<CallToolResult, McpError> {
        let args = params.0;
        let signal = args.signal.as_deref().unwrap_or("SIGINT");
        signal_result(&self.store, &args.session_id, signal)
    }

    /// Snapshot every known session.
    #[tool(name = "terminal.list")]
    async fn list(&self, _params: Parameters<ListArgs>) -> Result<CallToolResult, McpError> {
        Ok(list_result(&self.store))
    }

    /// Return a session's full buffered output together with its status.
    #[tool(name = "terminal.attach")]
    async fn attach(&self, params: Parameters<AttachArgs>) -> Result<CallToolResult, McpError> {
        let args = params.0;
        attach_result(&self.store, &args.session_id)
    }
}

#[tool_handler]
impl ServerHandler for TerminalServer {
    fn get_info(&self) -> ServerInfo {
        TerminalServer::get_info(self)
    }
}

fn server_info() -> ServerInfo {
    ServerInfo {
        protocol_version: ProtocolVersion::V_2025_06_18,
        capabilities: ServerCapabilities::builder().enable_tools().build(),
        server_info: Implementation {
            name: "mcp-terminal".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            ..Implementation::default()
        },
        ..ServerInfo::default()
    }
}

#[derive(Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RunArgs {
    command: String,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    shell: Option<String>,
    #[serde(default)]
    env: Option<HashMap<String, String>>,
    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(default)]
    quiet_ms: Option<u64>,
    #[serde(default)]
    waiting_ms: Option<u64>,
    #[serde(default)]
    stuck_ms: Option<u64>,
    #[serde(default)]
    max_buffer_bytes: Option<usize>,
}

#[derive(Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct StatusArgs {
    session_id: String,
    #[serde(default)]
    tail: Option<usize>,
}

#[derive(Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct WriteArgs {
    session_id: String,
    data: String,
}

#[derive(Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SignalArgs {
    session_id: String,
    #[serde(default)]
    signal: Option<String>,
}

#[derive(Deserialize, JsonSchema, Default)]
#[serde(deny_unknown_fields)]
struct ListArgs {}

#[derive(Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct AttachArgs {
    session_id: String,
}

/// Creates the session, spawns the adapter, wires the heuristics engine, and
/// blocks until the session reaches a terminal state. Spawn failures surface
/// as `{success: false, error}` payloads rather than MCP errors.
fn run_session_blocking(
    store: &Arc<SessionStore>,
    config: &Arc<ServerConfig>,
    args: RunArgs,
    settings: SessionSettings,
    progress: Arc<dyn ProgressSink>,
) -> CallToolResult {
    let session = match store.create(settings, args.command.clone(), args.cwd.clone()) {
        Ok(session) => session,
        Err(err) => return tool_error_result(err.to_string()),
    };
    let completions: Arc<dyn CompletionSink> = Arc::new(EventLogSink);
    let engine = Heuristics::new(session.clone(), store.clone(), progress, completions);
    engine.start();

    let request = SpawnRequest {
        command: args.command,
        cwd: args.cwd.map(PathBuf::from),
        shell: args.shell,
        env: args
            .env
            .map(|env| env.into_iter().collect())
            .unwrap_or_default(),
        use_pty: config.use_pty,
        default_shell: config.default_shell.clone(),
    };
    let data_engine = engine.clone();
    let on_data: DataCallback = Arc::new(move |bytes: &[u8]| data_engine.on_chunk(bytes));
    let exit_engine = engine.clone();
    let on_exit: ExitCallback = Arc::new(move |code, signal| exit_engine.on_exit(code, signal));

    match ProcessAdapter::spawn(&request, on_data, on_exit) {
        Ok(adapter) => engine.begin(adapter),
        Err(err) => engine.fail_spawn(err.to_string()),
    }

    session.wait_until_terminal();
    let view = session.view(None);
    run_result(&view)
}

fn run_result(view: &SessionView) -> CallToolResult {
    let success = view.status == SessionStatus::Completed && view.exit_code == Some(0);
    let payload = json!({
        "sessionId": view.id,
        "output": view.text,
        "exitCode": view.exit_code,
        "exitSignal": view.exit_signal,
        "success": success,
        "error": view.error_reason,
    });
    let text = match &view.error_reason {
        Some(reason) if view.status == SessionStatus::Error => {
            if view.text.is_empty() {
                reason.clone()
            } else {
                format!("{reason}\n{}", view.text)
            }
        }
        _ => view.text.clone(),
    };
    text_and_json(text, payload)
}

fn status_result(
    store: &Arc<SessionStore>,
    session_id: &str,
    tail: Option<usize>,
) -> Result<CallToolResult, McpError> {
    let session = lookup(store, session_id)?;
    let view = session.view(Some(tail.unwrap_or(DEFAULT_TAIL_BYTES)));
    let payload = json!({
        "sessionId": view.id,
        "status": view.status.as_str(),
        "lastOutputAt": view.last_output_unix_ms as u64,
        "exitCode": view.exit_code,
        "exitSignal": view.exit_signal,
        "errorReason": view.error_reason,
        "text": view.text,
    });
    Ok(text_and_json(view.text.clone(), payload))
}

fn write_result(
    store: &Arc<SessionStore>,
    session_id: &str,
    data: &str,
) -> Result<CallToolResult, McpError> {
    let session = lookup(store, session_id)?;
    let adapter = writable_adapter(&session);
    let Some(adapter) = adapter else {
        return Ok(tool_error_result(format!(
            "session {session_id} is not writable (terminated or adapter released)"
        )));
    };
    match adapter.write(data.as_bytes()) {
        Ok(()) => Ok(text_and_json(
            format!("wrote {} bytes", data.len()),
            json!({ "sessionId": session_id, "written": data.len() }),
        )),
        Err(err) => Ok(tool_error_result(format!("write failed: {err}"))),
    }
}

enum SignalRequest {
    /// Synthetic interrupt: an `0x03` byte on stdin, no OS signal.
    CtrlC,
    Os(AdapterSignal),
}

fn signal_result(
    store: &Arc<SessionStore>,
    session_id: &str,
    signal: &str,
) -> Result<CallToolResult, McpError> {
    let request = match signal {
        "CTRL_C" => SignalRequest::CtrlC,
        "SIGINT" => SignalRequest::Os(AdapterSignal::Interrupt),
        "SIGTERM" => SignalRequest::Os(AdapterSignal::Terminate),
        "KILL" | "SIGKILL" => SignalRequest::Os(AdapterSignal::Kill),
        other => {
            return Err(McpError::invalid_params(
                format!("unsupported signal: {other} (expected SIGINT|SIGTERM|KILL|CTRL_C)"),
                None,
            ));
        }
    };

    let session = lookup(store, session_id)?;
    let Some(adapter) = writable_adapter(&session) else {
        return Ok(tool_error_result(format!(
            "session {session_id} is not signalable (terminated or adapter released)"
        )));
    };

    match request {
        SignalRequest::CtrlC => match adapter.write(&[0x03]) {
            Ok(()) => Ok(text_and_json(
                "wrote interrupt byte".to_string(),
                json!({ "sessionId": session_id, "signal": "CTRL_C" }),
            )),
            Err(err) => Ok(tool_error_result(format!("interrupt write failed: {err}"))),
        },
        SignalRequest::Os(parsed) => match adapter.signal(parsed) {
            Ok(()) => Ok(text_and_json(
                format!("sent {signal}"),
                json!({ "sessionId": session_id, "signal": signal }),
            )),
            Err(err) => Ok(tool_error_result(format!("signal failed: {err}"))),
        },
    }
}

fn list_result(store: &Arc<SessionStore>) -> CallToolResult {
    let sessions: Vec<JsonValue> = store
        .list()
        .iter()
        .map(|session| {
            let view = session.view(Some(0));
            json!({
                "id": view.id,
                "status": view.status.as_str(),
                "lastOutputAt": view.last_output_unix_ms as u64,
                "exitCode": view.exit_code,
                "exitSignal": view.exit_signal,
                "errorReason": view.error_reason,
            })
        })
        .collect();
    let text = format!("{} session(s)", sessions.len());
    text_and_json(text, json!({ "sessions": sessions }))
}

fn attach_result(store: &Arc<SessionStore>, session_id: &str) -> Result<CallToolResult, McpError> {
    let session = lookup(store, session_id)?;
    let view = session.view(None);
    let payload = json!({
        "sessionId": view.id,
        "status": view.status.as_str(),
        "lastOutputAt": view.last_output_unix_ms as u64,
        "totalBytes": view.total_bytes,
        "output": view.text,
    });
    Ok(text_and_json(view.text.clone(), payload))
}

fn lookup(
    store: &Arc<SessionStore>,
    session_id: &str,
) -> Result<Arc<crate::session::Session>, McpError> {
    store.get(session_id).ok_or_else(|| {
        McpError::invalid_params(format!("unknown session id: {session_id}"), None)
    })
}

fn writable_adapter(session: &Arc<crate::session::Session>) -> Option<Arc<ProcessAdapter>> {
    let inner = session.lock();
    if inner.status.is_terminal() {
        return None;
    }
    inner.adapter.clone()
}

fn text_and_json(text: String, payload: JsonValue) -> CallToolResult {
    let mut result = CallToolResult::success(vec![Content::text(text)]);
    result.structured_content = Some(payload);
    result
}

fn tool_error_result(message: String) -> CallToolResult {
    let mut result = CallToolResult::error(vec![Content::text(message.clone())]);
    result.structured_content = Some(json!({ "error": message }));
    result
}

struct ChannelProgressSink {
    tx: tokio::sync::mpsc::UnboundedSender<ProgressUpdate>,
}

impl ProgressSink for ChannelProgressSink {
    fn progress(&self, update: ProgressUpdate) {
        let _ = self.tx.send(update);
    }
}

/// When the caller attached a progress token, forward progress events as MCP
/// `notifications/progress` through a single ordered channel; otherwise they
/// only reach the debug event log.
fn progress_sink_for(
    context: &RequestContext<RoleServer>,
    tool: &str,
) -> Arc<dyn ProgressSink> {
    let Some(token) = context.meta.get_progress_token() else {
        return Arc::new(EventLogSink);
    };
    let peer = context.peer.clone();
    let tool = tool.to_string();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<ProgressUpdate>();
    tokio::spawn(async move {
        let mut step: u32 = 0;
        while let Some(update) = rx.recv().await {
            step += 1;
            crate::event_log::log_lazy("progress", || {
                serde_json::to_value(&update)
                    .unwrap_or_else(|err| json!({ "error": err.to_string() }))
            });
            let notification = ProgressNotificationParam {
                progress_token: token.clone(),
                progress: step.into(),
                total: None,
                message: Some(format!("{tool}: {}", update.message)),
            };
            if peer.notify_progress(notification).await.is_err() {
                break;
            }
        }
    });
    Arc::new(ChannelProgressSink { tx })
}

/// Serves the tool surface over stdio until the client disconnects.
pub async fn run(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    crate::diagnostics::info("starting mcp-terminal server");
    crate::event_log::log("server_listen_begin", json!({}));
    let service = TerminalServer::new(config);
    let result: Result<(), Box<dyn std::error::Error>> = async {
        let running = rmcp::serve_server(service, rmcp::transport::stdio()).await?;
        running
            .waiting()
            .await
            .map(|_| ())
            .map_err(|err| err.into())
    }
    .await;
    match &result {
        Ok(()) => crate::event_log::log("server_listen_end", json!({"status": "ok"})),
        Err(err) => {
            crate::diagnostics::error(format!("server terminated with error: {err}"));
            crate::event_log::log(
                "server_listen_end",
                json!({
                    "status": "error",
                    "error": err.to_string(),
                }),
            );
        }
    }
    result
}
