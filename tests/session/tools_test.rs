//! Host tool calls and permission asks tunneled through control requests.

use std::sync::Arc;
use std::time::Duration;

use agent_session::config::{PermissionConfig, PermissionPolicyKind};
use agent_session::permission::CallbackPolicy;
use agent_session::permission::PermissionOutcome;
use agent_session::tools::{jsonrpc, ToolCallError};
use agent_session::{SessionBuilder, SessionConfig, ToolEntry, ToolOutput};
use serde_json::{json, Value};

use super::peer::connect;

fn sleepy_tool() -> ToolEntry {
    ToolEntry::from_fn(
        "sleepy",
        "Wait, then echo the tag",
        json!({
            "type": "object",
            "properties": { "ms": { "type": "integer" }, "tag": { "type": "string" } },
        }),
        |args: Value| async move {
            let ms = args["ms"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok::<_, ToolCallError>(ToolOutput::text(args["tag"].as_str().unwrap_or_default()))
        },
    )
}

fn failing_tool() -> ToolEntry {
    ToolEntry::from_fn("broken", "Always fails", json!({"type": "object"}), |_| async {
        Err::<ToolOutput, _>(ToolCallError::Failed("disk on fire".to_string()))
    })
}

fn call(id: u64, tool: &str, arguments: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "tools/call",
        "params": { "name": tool, "arguments": arguments },
    })
}

#[tokio::test]
async fn handshake_advertises_tool_server() {
    let builder = SessionBuilder::new(SessionConfig::default()).tool(sleepy_tool());
    let (session, peer) = connect(builder).await;
    assert_eq!(peer.init_request["sdkMcpServers"], json!(["host"]));
    session.stop().await;

    let (session, peer) = connect(SessionBuilder::new(SessionConfig::default())).await;
    assert!(peer.init_request.get("sdkMcpServers").is_none());
    session.stop().await;
}

#[tokio::test]
async fn tools_list_describes_registered_tools() {
    let builder = SessionBuilder::new(SessionConfig::default())
        .tools([sleepy_tool(), failing_tool()]);
    let (session, mut peer) = connect(builder).await;

    peer.request_tool(
        "m1",
        "host",
        json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {} }),
    )
    .await;
    let response = peer.expect_control_response().await;
    assert_eq!(response["request_id"], "m1");
    let init = &response["response"]["mcp_response"];
    assert_eq!(init["result"]["protocolVersion"], jsonrpc::PROTOCOL_VERSION);

    peer.request_tool(
        "m2",
        "host",
        json!({ "jsonrpc": "2.0", "id": 2, "method": "tools/list" }),
    )
    .await;
    let response = peer.expect_control_response().await;
    let tools = response["response"]["mcp_response"]["result"]["tools"]
        .as_array()
        .unwrap()
        .clone();
    let names: Vec<&str> = tools.iter().filter_map(|t| t["name"].as_str()).collect();
    assert_eq!(names, vec!["sleepy", "broken"]);
    assert_eq!(tools[0]["inputSchema"]["type"], "object");
    session.stop().await;
}

#[tokio::test]
async fn concurrent_calls_answer_out_of_order() {
    let builder = SessionBuilder::new(SessionConfig::default()).tool(sleepy_tool());
    let (session, mut peer) = connect(builder).await;

    peer.request_tool("slow", "host", call(1, "sleepy", json!({ "ms": 300, "tag": "slow" })))
        .await;
    peer.request_tool("fast", "host", call(2, "sleepy", json!({ "ms": 0, "tag": "fast" })))
        .await;

    let first = peer.expect_control_response().await;
    let second = peer.expect_control_response().await;
    for (response, tag, id) in [(&first, "fast", 2), (&second, "slow", 1)] {
        assert_eq!(response["request_id"], tag);
        let reply = &response["response"]["mcp_response"];
        assert_eq!(reply["id"], id);
        assert_eq!(reply["result"]["content"][0]["text"], tag);
        assert_eq!(reply["result"]["isError"], false);
    }
    assert_eq!(session.stats().tool_calls, 2);
    session.stop().await;
}

#[tokio::test]
async fn tool_failures_and_bad_requests_are_reported() {
    let builder = SessionBuilder::new(SessionConfig::default()).tool(failing_tool());
    let (session, mut peer) = connect(builder).await;

    peer.request_tool("a", "host", call(1, "broken", json!({}))).await;
    let reply = peer.expect_control_response().await["response"]["mcp_response"].clone();
    assert_eq!(reply["result"]["isError"], true);
    assert_eq!(reply["result"]["content"][0]["text"], "disk on fire");

    peer.request_tool("b", "host", call(2, "missing", json!({}))).await;
    let reply = peer.expect_control_response().await["response"]["mcp_response"].clone();
    assert_eq!(jsonrpc::error_code(&reply), Some(jsonrpc::INVALID_PARAMS));

    peer.request_tool("c", "elsewhere", call(3, "broken", json!({}))).await;
    let reply = peer.expect_control_response().await["response"]["mcp_response"].clone();
    assert_eq!(jsonrpc::error_code(&reply), Some(jsonrpc::METHOD_NOT_FOUND));

    peer.request_tool(
        "d",
        "host",
        json!({ "jsonrpc": "2.0", "id": 4, "method": "resources/list" }),
    )
    .await;
    let reply = peer.expect_control_response().await["response"]["mcp_response"].clone();
    assert_eq!(jsonrpc::error_code(&reply), Some(jsonrpc::METHOD_NOT_FOUND));
    session.stop().await;
}

#[tokio::test]
async fn cancelled_call_never_answers() {
    let builder = SessionBuilder::new(SessionConfig::default()).tool(sleepy_tool());
    let (session, mut peer) = connect(builder).await;

    peer.request_tool("long", "host", call(1, "sleepy", json!({ "ms": 10_000, "tag": "late" })))
        .await;
    peer.send(json!({ "type": "control_cancel_request", "request_id": "long" }))
        .await;
    peer.request_tool(
        "ping",
        "host",
        json!({ "jsonrpc": "2.0", "id": 2, "method": "ping" }),
    )
    .await;

    let response = peer.expect_control_response().await;
    assert_eq!(response["request_id"], "ping");
    session.stop().await;
}

#[tokio::test]
async fn default_policy_allows_tool_use() {
    let (session, mut peer) = connect(SessionBuilder::new(SessionConfig::default())).await;

    peer.request(
        "p1",
        json!({
            "subtype": "can_use_tool",
            "tool_name": "Bash",
            "input": { "command": "ls" },
            "tool_use_id": "toolu_1",
        }),
    )
    .await;
    let response = peer.expect_control_response().await;
    assert_eq!(response["subtype"], "success");
    assert_eq!(response["request_id"], "p1");
    assert_eq!(response["response"]["behavior"], "allow");
    assert_eq!(response["response"]["updatedInput"]["command"], "ls");
    assert_eq!(session.stats().permission_requests, 1);
    session.stop().await;
}

#[tokio::test]
async fn read_only_policy_denies_writes() {
    let config = SessionConfig {
        permission: PermissionConfig {
            policy: PermissionPolicyKind::ReadOnly,
            read_only_tools: Vec::new(),
        },
        ..SessionConfig::default()
    };
    let (session, mut peer) = connect(SessionBuilder::new(config)).await;

    for (id, tool, behavior) in [("p1", "Bash", "deny"), ("p2", "Read", "allow")] {
        peer.request(
            id,
            json!({ "subtype": "can_use_tool", "tool_name": tool, "input": {} }),
        )
        .await;
        let response = peer.expect_control_response().await;
        assert_eq!(response["request_id"], id);
        assert_eq!(response["response"]["behavior"], behavior, "tool {tool}");
    }
    session.stop().await;
}

#[tokio::test]
async fn builder_policy_overrides_config() {
    let policy = CallbackPolicy::new(|_request| PermissionOutcome::Cancelled);
    let builder =
        SessionBuilder::new(SessionConfig::default()).permission_policy(Arc::new(policy));
    let (session, mut peer) = connect(builder).await;

    peer.request(
        "p1",
        json!({ "subtype": "can_use_tool", "tool_name": "Read", "input": {} }),
    )
    .await;
    let response = peer.expect_control_response().await;
    assert_eq!(response["response"]["behavior"], "deny");
    session.stop().await;
}

#[tokio::test]
async fn unfamiliar_option_kind_does_not_reject_request() {
    let (session, mut peer) = connect(SessionBuilder::new(SessionConfig::default())).await;

    peer.request(
        "p1",
        json!({
            "subtype": "can_use_tool",
            "tool_name": "Read",
            "input": { "path": "a.txt" },
            "options": [
                { "optionId": "later", "name": "Ask later", "kind": "defer_to_user" },
                { "optionId": "yes", "name": "Allow", "kind": "allow_once" },
            ],
        }),
    )
    .await;
    let response = peer.expect_control_response().await;
    assert_eq!(response["subtype"], "success");
    assert_eq!(response["response"]["behavior"], "allow");
    assert_eq!(session.stats().protocol_errors, 0);
    session.stop().await;
}
