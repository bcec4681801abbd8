#![allow(dead_code)]

use std::error::Error;
use std::path::PathBuf;

use rmcp::ServiceExt;
use rmcp::handler::client::ClientHandler;
use rmcp::model::{CallToolRequestParam, CallToolResult, RawContent};
use rmcp::service::{RoleClient, RunningService, ServiceError};
use rmcp::transport::{ConfigureCommandExt, TokioChildProcess};
use serde_json::Value;
use tokio::process::Command;

pub type TestResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

#[derive(Clone)]
struct TestClient;

impl ClientHandler for TestClient {}

pub struct McpTestSession {
    service: RunningService<RoleClient, TestClient>,
    server_pid: Option<u32>,
}

impl McpTestSession {
    pub fn server_info(&self) -> Option<&rmcp::model::ServerInfo> {
        self.service.peer_info()
    }

    pub async fn list_tool_names(&self) -> TestResult<Vec<String>> {
        let tools = self.service.list_tools(Default::default()).await?;
        let mut names: Vec<String> = tools
            .tools
            .into_iter()
            .map(|tool| tool.name.to_string())
            .collect();
        names.sort();
        Ok(names)
    }

    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: Value,
    ) -> Result<CallToolResult, ServiceError> {
        let arguments = match arguments {
            Value::Null => None,
            Value::Object(map) => Some(map.into_iter().collect()),
            other => panic!("tool arguments must be a JSON object, got {other}"),
        };
        self.service
            .call_tool(CallToolRequestParam {
                name: tool.to_string().into(),
                arguments,
            })
            .await
    }

    pub async fn cancel(self) -> TestResult<()> {
        self.service.cancel().await?;
        if let Some(pid) = self.server_pid {
            terminate_process(pid);
        }
        Ok(())
    }
}

pub async fn spawn_server() -> TestResult<McpTestSession> {
    spawn_server_with_env(Vec::new()).await
}

pub async fn spawn_server_with_env(env_vars: Vec<(String, String)>) -> TestResult<McpTestSession> {
    let exe = resolve_server_path()?;
    let transport = TokioChildProcess::new(Command::new(exe).configure(|cmd| {
        for (key, value) in &env_vars {
            cmd.env(key, value);
        }
    }))?;
    let server_pid = transport.id();
    let service = TestClient.serve(transport).await?;
    Ok(McpTestSession {
        service,
        server_pid,
    })
}

fn resolve_server_path() -> TestResult<PathBuf> {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_mcp-terminal") {
        return Ok(PathBuf::from(path));
    }

    let mut path = std::env::current_exe()?;
    path.pop();
    path.pop();
    path.push("mcp-terminal");
    if cfg!(windows) {
        path.set_extension("exe");
    }

    if path.exists() {
        Ok(path)
    } else {
        Err("unable to locate mcp-terminal test binary".into())
    }
}

#[cfg(unix)]
fn terminate_process(pid: u32) {
    unsafe {
        libc::kill(pid as i32, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn terminate_process(pid: u32) {
    let _ = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .status();
}

/// Structured payload of a tool result; every mcp-terminal tool attaches one.
pub fn structured(result: &CallToolResult) -> &Value {
    result
        .structured_content
        .as_ref()
        .expect("tool result should carry structured content")
}

pub fn first_text(result: &CallToolResult) -> String {
    result
        .content
        .iter()
        .filter_map(|content| match &content.raw {
            RawContent::Text(text) => Some(text.text.clone()),
            _ => None,
        })
        .next()
        .unwrap_or_default()
}
