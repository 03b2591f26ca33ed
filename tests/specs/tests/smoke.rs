// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end smoke tests that spawn the real `perch` binary and exercise
//! the HTTP surface and the viewer WebSocket against the mock agent.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use perch_specs::PerchProcess;

const TIMEOUT: Duration = Duration::from_secs(15);

type Ws = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn connect(perch: &PerchProcess, workspace: &str, tab: &str) -> anyhow::Result<Ws> {
    let (ws, _) = tokio_tungstenite::connect_async(perch.ws_url(workspace, tab)).await?;
    Ok(ws)
}

/// Read text frames until one satisfies `pred` (skipping everything else).
async fn recv_until(
    ws: &mut Ws,
    pred: impl Fn(&serde_json::Value) -> bool,
) -> anyhow::Result<serde_json::Value> {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .ok_or_else(|| anyhow::anyhow!("timed out waiting for frame"))?;
        let msg = tokio::time::timeout(remaining, ws.next())
            .await?
            .ok_or_else(|| anyhow::anyhow!("ws stream ended"))??;
        if let Message::Text(text) = msg {
            let value: serde_json::Value = serde_json::from_str(&text)?;
            if pred(&value) {
                return Ok(value);
            }
        }
    }
}

/// Collect the attach sequence: `session_state`, replayed frames,
/// `session_replay_complete`, and the closing `session_state`.
async fn drain_attach(ws: &mut Ws) -> anyhow::Result<Vec<serde_json::Value>> {
    let mut frames = Vec::new();
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .ok_or_else(|| anyhow::anyhow!("timed out draining attach frames"))?;
        let msg = tokio::time::timeout(remaining, ws.next())
            .await?
            .ok_or_else(|| anyhow::anyhow!("ws stream ended"))??;
        let Message::Text(text) = msg else { continue };
        let value: serde_json::Value = serde_json::from_str(&text)?;
        let is_final_state = value["type"] == "session_state" && value["replayCount"] == 0
            && frames.iter().any(|f: &serde_json::Value| f["type"] == "session_replay_complete");
        frames.push(value);
        if is_final_state {
            return Ok(frames);
        }
    }
}

// -- HTTP ---------------------------------------------------------------------

#[tokio::test]
async fn http_health() -> anyhow::Result<()> {
    let perch = PerchProcess::start()?;
    perch.wait_healthy(TIMEOUT).await?;

    let resp: serde_json::Value =
        reqwest::get(format!("{}/api/v1/health", perch.base_url())).await?.json().await?;
    assert_eq!(resp["status"], "running");
    assert_eq!(resp["hosts"], 0);
    Ok(())
}

#[tokio::test]
async fn http_status_requires_bearer_auth() -> anyhow::Result<()> {
    let perch = PerchProcess::build().auth_token("sekrit").spawn()?;
    perch.wait_healthy(TIMEOUT).await?;

    let client = reqwest::Client::new();
    let denied = client.get(format!("{}/api/v1/status", perch.base_url())).send().await?;
    assert_eq!(denied.status().as_u16(), 401);

    let allowed = client
        .get(format!("{}/api/v1/status", perch.base_url()))
        .bearer_auth("sekrit")
        .send()
        .await?;
    assert_eq!(allowed.status().as_u16(), 200);
    Ok(())
}

// -- WebSocket attach ---------------------------------------------------------

#[tokio::test]
async fn ws_attach_delivers_the_state_sandwich() -> anyhow::Result<()> {
    let perch = PerchProcess::start()?;
    perch.wait_healthy(TIMEOUT).await?;

    let mut ws = connect(&perch, "ws-1", "tab-1").await?;
    let frames = drain_attach(&mut ws).await?;

    assert_eq!(frames[0]["type"], "session_state");
    assert_eq!(frames[0]["status"], "idle");
    assert_eq!(frames[0]["replayCount"], 0);
    assert_eq!(frames[1]["type"], "session_replay_complete");
    assert_eq!(frames[2]["type"], "session_state");
    assert_eq!(frames[2]["replayCount"], 0);
    Ok(())
}

#[tokio::test]
async fn ws_app_level_ping_pong() -> anyhow::Result<()> {
    let perch = PerchProcess::start()?;
    perch.wait_healthy(TIMEOUT).await?;

    let mut ws = connect(&perch, "ws-1", "tab-1").await?;
    drain_attach(&mut ws).await?;

    ws.send(Message::Text(r#"{"type":"ping"}"#.into())).await?;
    recv_until(&mut ws, |v| v["type"] == "pong").await?;
    Ok(())
}

#[tokio::test]
async fn ws_rejects_a_bad_token() -> anyhow::Result<()> {
    let perch = PerchProcess::build().auth_token("sekrit").spawn()?;
    perch.wait_healthy(TIMEOUT).await?;

    let port_url = perch.base_url().replace("http", "ws");
    let bad = format!("{port_url}/ws?workspace=w&tab=t&token=wrong");
    assert!(tokio_tungstenite::connect_async(bad).await.is_err());

    // The right token connects fine.
    let mut ws = connect(&perch, "w", "t").await?;
    drain_attach(&mut ws).await?;
    Ok(())
}

// -- Agent lifecycle ----------------------------------------------------------

#[tokio::test]
async fn select_agent_reaches_ready() -> anyhow::Result<()> {
    let perch = PerchProcess::start()?;
    perch.wait_healthy(TIMEOUT).await?;

    let mut ws = connect(&perch, "ws-1", "tab-1").await?;
    drain_attach(&mut ws).await?;

    ws.send(Message::Text(r#"{"type":"select_agent","agentType":"mock"}"#.into())).await?;
    recv_until(&mut ws, |v| v["type"] == "agent_status" && v["status"] == "starting").await?;
    recv_until(&mut ws, |v| v["type"] == "agent_status" && v["status"] == "ready").await?;
    Ok(())
}

#[tokio::test]
async fn select_agent_with_unknown_type_errors() -> anyhow::Result<()> {
    let perch = PerchProcess::start()?;
    perch.wait_healthy(TIMEOUT).await?;

    let mut ws = connect(&perch, "ws-1", "tab-1").await?;
    drain_attach(&mut ws).await?;

    ws.send(Message::Text(r#"{"type":"select_agent","agentType":"warp"}"#.into())).await?;
    let frame =
        recv_until(&mut ws, |v| v["type"] == "agent_status" && v["status"] == "error").await?;
    assert!(frame["error"].as_str().unwrap_or_default().contains("unknown agent type"));
    Ok(())
}

#[tokio::test]
async fn prompt_round_trip_through_the_mock_agent() -> anyhow::Result<()> {
    let perch = PerchProcess::start()?;
    perch.wait_healthy(TIMEOUT).await?;

    let mut ws = connect(&perch, "ws-1", "tab-1").await?;
    drain_attach(&mut ws).await?;

    ws.send(Message::Text(r#"{"type":"select_agent","agentType":"mock"}"#.into())).await?;
    recv_until(&mut ws, |v| v["type"] == "agent_status" && v["status"] == "ready").await?;

    let prompt = r#"{"jsonrpc":"2.0","id":1,"method":"session/prompt","params":{"prompt":[{"type":"text","text":"hello mock"}]}}"#;
    ws.send(Message::Text(prompt.into())).await?;

    // Synthesized user echo.
    let echo = recv_until(&mut ws, |v| {
        v["params"]["update"]["sessionUpdate"] == "user_message_chunk"
    })
    .await?;
    assert_eq!(echo["params"]["update"]["content"]["text"], "hello mock");

    recv_until(&mut ws, |v| v["type"] == "session_prompting").await?;

    // Streamed assistant chunk from the agent.
    recv_until(&mut ws, |v| {
        v["params"]["update"]["sessionUpdate"] == "agent_message_chunk"
    })
    .await?;

    recv_until(&mut ws, |v| v["type"] == "session_prompt_done").await?;
    let result = recv_until(&mut ws, |v| v.get("result").is_some()).await?;
    assert_eq!(result["id"], 1);
    assert_eq!(result["result"]["stopReason"], "end_turn");
    Ok(())
}

#[tokio::test]
async fn late_joining_viewer_replays_the_conversation() -> anyhow::Result<()> {
    let perch = PerchProcess::start()?;
    perch.wait_healthy(TIMEOUT).await?;

    let mut first = connect(&perch, "ws-1", "tab-1").await?;
    drain_attach(&mut first).await?;
    first
        .send(Message::Text(r#"{"type":"select_agent","agentType":"mock"}"#.into()))
        .await?;
    recv_until(&mut first, |v| v["type"] == "agent_status" && v["status"] == "ready").await?;

    let prompt = r#"{"jsonrpc":"2.0","id":1,"method":"session/prompt","params":{"prompt":[{"type":"text","text":"remember me"}]}}"#;
    first.send(Message::Text(prompt.into())).await?;
    recv_until(&mut first, |v| v.get("result").is_some()).await?;

    // A second viewer on the same tab sees the whole turn from the buffer.
    let mut second = connect(&perch, "ws-1", "tab-1").await?;
    let frames = drain_attach(&mut second).await?;

    assert!(frames[0]["replayCount"].as_u64().unwrap_or(0) > 0);
    assert!(frames
        .iter()
        .any(|f| f["params"]["update"]["content"]["text"] == "remember me"));
    assert!(frames.iter().any(|f| f["type"] == "session_prompt_done"));
    let last = frames.last().ok_or_else(|| anyhow::anyhow!("no frames"))?;
    assert_eq!(last["replayCount"], 0);
    Ok(())
}

#[tokio::test]
async fn viewers_on_different_tabs_are_isolated() -> anyhow::Result<()> {
    let perch = PerchProcess::start()?;
    perch.wait_healthy(TIMEOUT).await?;

    let mut a = connect(&perch, "ws-1", "tab-a").await?;
    drain_attach(&mut a).await?;
    a.send(Message::Text(r#"{"type":"select_agent","agentType":"mock"}"#.into())).await?;
    recv_until(&mut a, |v| v["type"] == "agent_status" && v["status"] == "ready").await?;

    // The other tab's host is untouched: still idle with an empty buffer.
    let mut b = connect(&perch, "ws-1", "tab-b").await?;
    let frames = drain_attach(&mut b).await?;
    assert_eq!(frames.len(), 3);
    assert_eq!(frames[0]["status"], "idle");
    Ok(())
}
