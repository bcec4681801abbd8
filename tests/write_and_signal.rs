#![cfg(unix)]

mod common;

use std::time::Duration;

use common::{McpTestSession, TestResult, spawn_server, structured};
use serde_json::json;
use tokio::time::sleep;

/// Polls `terminal.list` until a non-terminal session shows up.
async fn wait_for_live_session(session: &McpTestSession) -> TestResult<String> {
    for _ in 0..100 {
        let list = session.call_tool("terminal.list", json!({})).await?;
        let sessions = structured(&list)["sessions"]
            .as_array()
            .expect("sessions")
            .clone();
        if let Some(entry) = sessions.iter().find(|entry| {
            matches!(
                entry["status"].as_str(),
                Some("running") | Some("waiting") | Some("possibly-stuck")
            )
        }) {
            return Ok(entry["id"].as_str().expect("id").to_string());
        }
        sleep(Duration::from_millis(50)).await;
    }
    Err("no live session appeared".into())
}

async fn wait_for_status(
    session: &McpTestSession,
    session_id: &str,
    expected: &str,
    attempts: u32,
) -> TestResult<bool> {
    for _ in 0..attempts {
        let status = session
            .call_tool("terminal.status", json!({ "sessionId": session_id }))
            .await?;
        if structured(&status)["status"] == json!(expected) {
            return Ok(true);
        }
        sleep(Duration::from_millis(100)).await;
    }
    Ok(false)
}

#[tokio::test(flavor = "multi_thread")]
async fn write_feeds_an_interactive_session() -> TestResult<()> {
    let session = spawn_server().await?;

    let run = session.call_tool(
        "terminal.run",
        json!({ "command": "cat", "quietMs": 150, "timeoutMs": 30_000 }),
    );
    let driver = async {
        let session_id = wait_for_live_session(&session).await?;

        let write = session
            .call_tool(
                "terminal.write",
                json!({ "sessionId": session_id, "data": "hello interactive\n" }),
            )
            .await?;
        assert_ne!(write.is_error, Some(true));

        // cat echoes the line back into the session buffer.
        let mut echoed = false;
        for _ in 0..50 {
            let status = session
                .call_tool("terminal.status", json!({ "sessionId": session_id }))
                .await?;
            let text = structured(&status)["text"].as_str().unwrap_or("").to_string();
            if text.contains("hello interactive") {
                echoed = true;
                break;
            }
            sleep(Duration::from_millis(100)).await;
        }
        assert!(echoed, "written line was never echoed");

        let signal = session
            .call_tool(
                "terminal.signal",
                json!({ "sessionId": session_id, "signal": "SIGTERM" }),
            )
            .await?;
        assert_ne!(signal.is_error, Some(true));
        Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
    };

    let (run, driver) = tokio::join!(run, driver);
    driver?;
    let run = run?;
    let run_payload = structured(&run);
    assert_eq!(run_payload["success"], json!(false));
    assert_eq!(run_payload["exitSignal"], json!("SIGTERM"));
    let output = run_payload["output"].as_str().expect("output");
    assert!(output.contains("hello interactive"));

    session.cancel().await
}

#[tokio::test(flavor = "multi_thread")]
async fn ctrl_c_writes_a_byte_instead_of_signaling() -> TestResult<()> {
    let session = spawn_server().await?;

    let run = session.call_tool(
        "terminal.run",
        json!({ "command": "cat", "quietMs": 150, "timeoutMs": 30_000 }),
    );
    let driver = async {
        let session_id = wait_for_live_session(&session).await?;

        let ctrl_c = session
            .call_tool(
                "terminal.signal",
                json!({ "sessionId": session_id, "signal": "CTRL_C" }),
            )
            .await?;
        assert_ne!(ctrl_c.is_error, Some(true));
        assert_eq!(structured(&ctrl_c)["signal"], json!("CTRL_C"));

        // Without a terminal the byte is plain input, so the session is
        // still alive: no OS signal was delivered.
        sleep(Duration::from_millis(500)).await;
        let status = session
            .call_tool("terminal.status", json!({ "sessionId": session_id }))
            .await?;
        let current = structured(&status)["status"].as_str().unwrap_or("").to_string();
        assert_ne!(current, "completed");
        assert_ne!(current, "error");

        let _ = session
            .call_tool(
                "terminal.signal",
                json!({ "sessionId": session_id, "signal": "SIGTERM" }),
            )
            .await?;
        Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
    };

    let (run, driver) = tokio::join!(run, driver);
    driver?;
    let run = run?;
    let run_payload = structured(&run);
    // The interrupt byte went down stdin verbatim; cat echoed it back.
    let output = run_payload["output"].as_str().expect("output");
    assert!(
        output.contains('\u{3}'),
        "expected the 0x03 byte in the captured output"
    );

    session.cancel().await
}

#[tokio::test(flavor = "multi_thread")]
async fn idle_sessions_classify_as_waiting_then_possibly_stuck() -> TestResult<()> {
    let session = spawn_server().await?;

    let run = session.call_tool(
        "terminal.run",
        json!({
            "command": "printf started; sleep 6",
            "quietMs": 150,
            "waitingMs": 800,
            "stuckMs": 2_500,
            "timeoutMs": 30_000,
        }),
    );
    let driver = async {
        let session_id = wait_for_live_session(&session).await?;
        assert!(
            wait_for_status(&session, &session_id, "waiting", 30).await?,
            "session never classified as waiting"
        );
        assert!(
            wait_for_status(&session, &session_id, "possibly-stuck", 40).await?,
            "session never classified as possibly-stuck"
        );
        Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
    };

    let (run, driver) = tokio::join!(run, driver);
    driver?;
    let run = run?;
    let run_payload = structured(&run);
    assert_eq!(run_payload["success"], json!(true));
    assert_eq!(run_payload["exitCode"], json!(0));

    session.cancel().await
}

#[tokio::test(flavor = "multi_thread")]
async fn write_after_completion_is_a_tool_error() -> TestResult<()> {
    let session = spawn_server().await?;

    let run = session
        .call_tool(
            "terminal.run",
            json!({ "command": "echo done", "quietMs": 100 }),
        )
        .await?;
    let session_id = structured(&run)["sessionId"]
        .as_str()
        .expect("session id")
        .to_string();

    let write = session
        .call_tool(
            "terminal.write",
            json!({ "sessionId": session_id, "data": "late\n" }),
        )
        .await?;
    assert_eq!(write.is_error, Some(true));

    let signal = session
        .call_tool(
            "terminal.signal",
            json!({ "sessionId": session_id, "signal": "SIGTERM" }),
        )
        .await?;
    assert_eq!(signal.is_error, Some(true));

    session.cancel().await
}

#[tokio::test(flavor = "multi_thread")]
async fn unsupported_signal_is_rejected() -> TestResult<()> {
    let session = spawn_server().await?;

    let run = session.call_tool(
        "terminal.run",
        json!({ "command": "sleep 2", "quietMs": 100, "timeoutMs": 30_000 }),
    );
    let driver = async {
        let session_id = wait_for_live_session(&session).await?;
        let result = session
            .call_tool(
                "terminal.signal",
                json!({ "sessionId": session_id, "signal": "SIGQUIT" }),
            )
            .await;
        assert!(result.is_err(), "unsupported signal should be rejected");
        Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
    };

    let (run, driver) = tokio::join!(run, driver);
    driver?;
    let _ = structured(&run?);

    session.cancel().await
}
