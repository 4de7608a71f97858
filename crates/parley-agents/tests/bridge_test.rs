use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parley_agents::ProtocolBridge;
use parley_agents::tools::builtin_registry;
use parley_common::ConversationId;
use parley_db::{ConversationConfig, MessageStore, SqliteStore, ToolInit};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn bridge() -> ProtocolBridge {
    ProtocolBridge::new(Arc::new(builtin_registry(Duration::from_secs(2)).unwrap()))
}

async fn call(bridge: &ProtocolBridge, line: &str) -> Value {
    let out = bridge.handle_line(line).await.expect("response expected");
    serde_json::from_str(&out).unwrap()
}

#[tokio::test]
async fn test_list_then_unknown_tool_is_invalid_params() {
    let bridge = bridge();

    let listed = call(&bridge, r#"{"jsonrpc":"2.0","method":"tools/list","id":1}"#).await;
    let tools = listed["result"]["tools"].as_array().unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0]["name"], "current_time");
    assert_eq!(tools[0]["inputSchema"]["type"], "object");

    let resp = call(
        &bridge,
        r#"{"jsonrpc":"2.0","method":"tools/call","params":{"name":"nope","arguments":{}},"id":"a"}"#,
    )
    .await;
    assert_eq!(resp["error"]["code"], -32602);
    assert_eq!(resp["id"], "a");
}

#[tokio::test]
async fn test_call_returns_text_content() {
    let resp = call(
        &bridge(),
        r#"{"jsonrpc":"2.0","method":"tools/call","params":{"name":"current_time","arguments":{"utc_offset_minutes":0}},"id":7}"#,
    )
    .await;
    assert_eq!(resp["id"], 7);
    assert_eq!(resp["result"]["isError"], false);
    assert_eq!(resp["result"]["content"][0]["type"], "text");
    assert!(resp["result"]["content"][0]["text"]
        .as_str()
        .unwrap()
        .ends_with("+00:00"));
}

#[tokio::test]
async fn test_tool_failure_is_error_result_not_rpc_error() {
    let resp = call(
        &bridge(),
        r#"{"jsonrpc":"2.0","method":"tools/call","params":{"name":"current_time","arguments":{"utc_offset_minutes":"soon"}},"id":3}"#,
    )
    .await;
    assert!(resp.get("error").is_none());
    assert_eq!(resp["result"]["isError"], true);
}

#[tokio::test]
async fn test_protocol_errors_use_standard_codes() {
    let bridge = bridge();

    let resp = call(&bridge, "{nope").await;
    assert_eq!(resp["error"]["code"], -32700);
    assert_eq!(resp["id"], Value::Null);

    let resp = call(&bridge, r#"{"jsonrpc":"1.0","method":"tools/list","id":2}"#).await;
    assert_eq!(resp["error"]["code"], -32600);
    assert_eq!(resp["id"], 2);

    let resp = call(&bridge, r#"{"jsonrpc":"2.0","method":"tools/explode","id":null}"#).await;
    assert_eq!(resp["error"]["code"], -32601);
    assert!(resp.as_object().unwrap().contains_key("id"));
    assert_eq!(resp["id"], Value::Null);

    let resp = call(&bridge, r#"{"jsonrpc":"2.0","method":"tools/call","params":{},"id":4}"#).await;
    assert_eq!(resp["error"]["code"], -32602);

    assert!(bridge
        .handle_line(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
        .await
        .is_none());
}

#[tokio::test]
async fn test_initialize_reports_server_info() {
    let resp = call(
        &bridge(),
        r#"{"jsonrpc":"2.0","method":"initialize","params":{},"id":0}"#,
    )
    .await;
    assert_eq!(resp["result"]["serverInfo"]["name"], "parley");
    assert!(resp["result"]["protocolVersion"].is_string());
}

#[tokio::test]
async fn test_serve_survives_malformed_lines() {
    let bridge = bridge();
    let (client, server) = tokio::io::duplex(4096);
    let (server_read, server_write) = tokio::io::split(server);
    let serving = tokio::spawn(async move {
        bridge
            .serve(BufReader::new(server_read), server_write)
            .await
    });

    let (client_read, mut client_write) = tokio::io::split(client);
    client_write
        .write_all(
            concat!(
                "garbage\n",
                "\n",
                "{\"jsonrpc\":\"2.0\",\"method\":\"ping\",\"id\":1}\n",
            )
            .as_bytes(),
        )
        .await
        .unwrap();

    let mut lines = BufReader::new(client_read).lines();
    let first: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
    assert_eq!(first["error"]["code"], -32700);
    let second: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
    assert_eq!(second, json!({"jsonrpc":"2.0","result":{},"id":1}));

    drop(client_write);
    serving.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_serve_answers_invalid_utf8_and_keeps_reading() {
    let bridge = bridge();
    let (client, server) = tokio::io::duplex(4096);
    let (server_read, server_write) = tokio::io::split(server);
    let serving = tokio::spawn(async move {
        bridge
            .serve(BufReader::new(server_read), server_write)
            .await
    });

    let (client_read, mut client_write) = tokio::io::split(client);
    let mut input = b"{\"jsonrpc\":\"2.0\",\"method\":\"ping\",\"id\":\"".to_vec();
    input.push(0xff);
    input.extend_from_slice(b"\"}\n{\"jsonrpc\":\"2.0\",\"method\":\"ping\",\"id\":2}\n");
    client_write.write_all(&input).await.unwrap();

    let mut lines = BufReader::new(client_read).lines();
    let first: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
    assert_eq!(first["error"]["code"], -32700);
    assert_eq!(first["id"], Value::Null);
    let second: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
    assert_eq!(second, json!({"jsonrpc":"2.0","result":{},"id":2}));

    drop(client_write);
    serving.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_conversation_scope_resolves_init_data() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks/wf-1"))
        .respond_with(ResponseTemplate::new(200).set_body_string("started"))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let conversation = ConversationId::from("conv-9");
    let config = ConversationConfig {
        enabled_tools: vec!["workflow_webhook".into()],
        tool_init: HashMap::from([(
            "workflow_webhook".to_string(),
            ToolInit {
                session: "s".into(),
                host: server.uri(),
                target: "wf-1".into(),
            },
        )]),
        system_prompt: None,
    };
    store
        .set_conversation_config(&conversation, &config)
        .await
        .unwrap();

    let bridge = ProtocolBridge::with_conversation(
        Arc::new(builtin_registry(Duration::from_secs(2)).unwrap()),
        store,
        conversation,
    );

    let listed = call(&bridge, r#"{"jsonrpc":"2.0","method":"tools/list","id":1}"#).await;
    let names: Vec<_> = listed["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, vec!["workflow_webhook"]);

    let resp = call(
        &bridge,
        r#"{"jsonrpc":"2.0","method":"tools/call","params":{"name":"current_time"},"id":2}"#,
    )
    .await;
    assert_eq!(resp["error"]["code"], -32602);

    let resp = call(
        &bridge,
        r#"{"jsonrpc":"2.0","method":"tools/call","params":{"name":"workflow_webhook","arguments":{"event":"go"}},"id":3}"#,
    )
    .await;
    assert_eq!(resp["result"]["content"][0]["text"], "started");
}
