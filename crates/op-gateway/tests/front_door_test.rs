//! JSON-RPC front door behaviour

mod common;

use common::{config_with, CountingCredential, Script, ScriptedTransport};
use op_gateway::transport::serve_lines;
use op_gateway::{GatewayServer, McpRequest};
use serde_json::{json, Value};
use std::sync::Arc;

fn server() -> GatewayServer {
    let transport = Arc::new(
        ScriptedTransport::new()
            .with("crm", Script::with_tools(&["search"]))
            .with("erp", Script::with_tools(&["orders"])),
    );
    let config = config_with(&["crm", "erp"]).build();
    GatewayServer::from_config(&config, transport, Arc::new(CountingCredential::default()))
}

#[tokio::test]
async fn test_initialize() {
    let response = server()
        .handle_request(
            McpRequest::new("initialize")
                .with_id(1)
                .with_params(json!({ "clientInfo": { "name": "test-client", "version": "1.0.0" } })),
        )
        .await
        .unwrap();

    assert!(response.is_success());
    let result = response.result.unwrap();
    assert_eq!(result["protocolVersion"], "2024-11-05");
    assert_eq!(result["serverInfo"]["name"], "op-gateway");
    assert!(result["capabilities"]["tools"].is_object());
}

#[tokio::test]
async fn test_notifications_get_no_response() {
    let server = server();
    assert!(server
        .handle_request(McpRequest::new("notifications/initialized"))
        .await
        .is_none());
    assert!(server.handle_request(McpRequest::new("tools/list")).await.is_none());
}

#[tokio::test]
async fn test_tools_list_then_call() {
    let server = server();

    let response = server
        .handle_request(McpRequest::new("tools/list").with_id("a"))
        .await
        .unwrap();
    assert_eq!(response.id, json!("a"));
    let tools = response.result.unwrap()["tools"].as_array().unwrap().clone();
    assert_eq!(tools.len(), 3);
    assert_eq!(tools[2]["name"], "erp_orders");
    assert!(tools[2]["inputSchema"].is_object());

    let response = server
        .handle_request(
            McpRequest::new("tools/call")
                .with_id(2)
                .with_params(json!({ "name": "erp_orders" })),
        )
        .await
        .unwrap();
    let result = response.result.unwrap();
    assert_eq!(result["content"][0]["text"], "erp ran orders");
}

#[tokio::test]
async fn test_failed_call_is_a_result_not_an_error() {
    let response = server()
        .handle_request(
            McpRequest::new("tools/call")
                .with_id(3)
                .with_params(json!({ "name": "nowhere_tool", "arguments": {} })),
        )
        .await
        .unwrap();

    assert!(response.is_success());
    assert_eq!(response.result.unwrap()["isError"], true);
}

#[tokio::test]
async fn test_malformed_requests() {
    let server = server();

    let response = server
        .handle_request(McpRequest::new("tools/call").with_id(4).with_params(json!({})))
        .await
        .unwrap();
    assert_eq!(response.error.unwrap().code, -32602);

    let response = server
        .handle_request(McpRequest::new("resources/list").with_id(5))
        .await
        .unwrap();
    assert_eq!(response.error.unwrap().code, -32601);

    let response = server.handle_request(McpRequest::new("ping").with_id(6)).await.unwrap();
    assert!(response.is_success());
}

#[tokio::test]
async fn test_stdio_session() {
    let server = server();
    let input = [
        json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {} }),
        json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }),
        json!({ "jsonrpc": "2.0", "id": 2, "method": "tools/list" }),
        json!({ "jsonrpc": "2.0", "id": 3, "method": "tools/call", "params": { "name": "crm_search" } }),
    ]
    .iter()
    .map(Value::to_string)
    .collect::<Vec<_>>()
    .join("\n");

    let mut output = Vec::new();
    serve_lines(&server, input.as_bytes(), &mut output).await.unwrap();

    let responses: Vec<Value> = String::from_utf8(output)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(responses.len(), 3);
    assert_eq!(responses[2]["id"], 3);
    assert_eq!(responses[2]["result"]["content"][0]["text"], "crm ran search");
}
