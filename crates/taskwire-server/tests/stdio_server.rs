//! End-to-end tests for the server over an in-process stdio pipe.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{
    duplex, split, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf,
    WriteHalf,
};
use tokio::task::JoinHandle;
use tokio_test::{assert_err, assert_ok};

use taskwire::{ProtocolResult, PROTOCOL_VERSION};
use taskwire_server::types::ToolCallParams;
use taskwire_server::{ServerConfig, StdioTransport, TaskServer};

// ─────────────────────── helpers ───────────────────────

/// A client end wired to a running server.
struct Harness {
    server: Arc<TaskServer>,
    writer: WriteHalf<DuplexStream>,
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    serve: JoinHandle<ProtocolResult<()>>,
}

impl Harness {
    fn start(config: ServerConfig) -> Self {
        let (client, server_io) = duplex(64 * 1024);
        let (server_read, server_write) = split(server_io);
        let (client_read, writer) = split(client);

        let server = Arc::new(TaskServer::new(config).unwrap());
        let transport = Arc::new(StdioTransport::with_io(server_read, server_write));
        let running = server.clone();
        let serve = tokio::spawn(async move { running.serve(transport).await });

        Self {
            server,
            writer,
            lines: BufReader::new(client_read).lines(),
            serve,
        }
    }

    async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    async fn send(&mut self, message: Value) {
        self.send_raw(&message.to_string()).await;
    }

    /// Next frame the server writes.
    async fn recv(&mut self) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
            .await
            .expect("timed out waiting for server output")
            .unwrap()
            .expect("server closed its output");
        serde_json::from_str(&line).unwrap()
    }

    /// Read until the response for `id`, returning it with any notifications
    /// seen on the way.
    async fn response_for(&mut self, id: i64) -> (Value, Vec<Value>) {
        let mut notifications = Vec::new();
        loop {
            let frame = self.recv().await;
            if frame.get("id") == Some(&json!(id)) {
                return (frame, notifications);
            }
            notifications.push(frame);
        }
    }

    async fn call(&mut self, id: i64, method: &str, params: Value) -> Value {
        self.send(request(id, method, params)).await;
        self.response_for(id).await.0
    }

    async fn initialize(&mut self) {
        let response = self.call(0, "initialize", init_params()).await;
        assert!(response.get("result").is_some(), "initialize failed: {response}");
        self.send(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .await;
    }
}

/// Build a JSON-RPC request.
fn request(id: i64, method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params
    })
}

fn init_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": { "tasks": { "list": {}, "cancel": {} } },
        "clientInfo": { "name": "test-client", "version": "1.0" }
    })
}

fn fast_config() -> ServerConfig {
    ServerConfig {
        poll_interval_ms: 10,
        ..ServerConfig::default()
    }
}

async fn wait_for(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never became true");
}

// ═══════════════════════════════════════════════════════
// HANDSHAKE
// ═══════════════════════════════════════════════════════

/// Test 1: initialize advertises tools and task support for tools/call.
#[tokio::test]
async fn test_01_initialize_handshake() {
    let mut h = Harness::start(ServerConfig::default());

    let response = h.call(0, "initialize", init_params()).await;
    let result = &response["result"];
    assert_eq!(result["protocolVersion"], PROTOCOL_VERSION);
    assert_eq!(result["serverInfo"]["name"], "taskwire-server");
    assert!(result["capabilities"]["tools"].is_object());
    assert!(result["capabilities"]["tasks"]["requests"]["tools"]["call"].is_object());
    assert!(result["capabilities"]["tasks"]["list"].is_object());

    assert!(!h.server.is_initialized());
    h.send(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
        .await;
    let server = h.server.clone();
    wait_for(move || server.is_initialized()).await;

    println!("TEST 01 — initialize handshake: PASS");
}

/// Test 2: A mismatched protocol version is answered with the server's own.
#[tokio::test]
async fn test_02_version_mismatch_uses_server_version() {
    let mut h = Harness::start(ServerConfig::default());

    let response = h
        .call(
            0,
            "initialize",
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": { "name": "old-client", "version": "0.1" }
            }),
        )
        .await;
    assert_eq!(response["result"]["protocolVersion"], PROTOCOL_VERSION);

    println!("TEST 02 — version mismatch: PASS");
}

/// Test 3: ping answers with an empty object.
#[tokio::test]
async fn test_03_ping() {
    let mut h = Harness::start(ServerConfig::default());
    let response = h.call(7, "ping", json!({})).await;
    assert_eq!(response["result"], json!({}));

    println!("TEST 03 — ping: PASS");
}

// ═══════════════════════════════════════════════════════
// TOOLS
// ═══════════════════════════════════════════════════════

/// Test 4: tools/list names both tools with their task support.
#[tokio::test]
async fn test_04_tools_list() {
    let mut h = Harness::start(ServerConfig::default());
    h.initialize().await;

    let response = h.call(1, "tools/list", json!({})).await;
    let tools = response["result"]["tools"].as_array().unwrap();
    let names: Vec<&str> = tools.iter().map(|t| t["name"].as_str().unwrap()).collect();
    assert_eq!(names, vec!["echo", "sleep"]);
    for tool in tools {
        assert_eq!(tool["execution"]["taskSupport"], "optional");
        assert_eq!(tool["inputSchema"]["type"], "object");
    }

    println!("TEST 04 — tools/list: PASS");
}

/// Test 5: A direct call returns the tool result inline.
#[tokio::test]
async fn test_05_echo_call() {
    let mut h = Harness::start(ServerConfig::default());
    h.initialize().await;

    let response = h
        .call(
            2,
            "tools/call",
            json!({"name": "echo", "arguments": {"text": "hello"}}),
        )
        .await;
    assert_eq!(response["result"]["content"][0]["type"], "text");
    assert_eq!(response["result"]["content"][0]["text"], "hello");
    assert!(response["result"].get("isError").is_none());

    println!("TEST 05 — echo call: PASS");
}

/// Test 6: Unknown tools and bad arguments are invalid params.
#[tokio::test]
async fn test_06_invalid_tool_calls() {
    let mut h = Harness::start(ServerConfig::default());
    h.initialize().await;

    let response = h
        .call(3, "tools/call", json!({"name": "nope", "arguments": {}}))
        .await;
    assert_eq!(response["error"]["code"], -32602);
    assert!(response["error"]["message"]
        .as_str()
        .unwrap()
        .contains("Unknown tool: nope"));

    let response = h
        .call(4, "tools/call", json!({"name": "echo", "arguments": {}}))
        .await;
    assert_eq!(response["error"]["code"], -32602);

    let response = h.call(5, "tools/call", json!({"arguments": {}})).await;
    assert_eq!(response["error"]["code"], -32602);

    assert_err!(serde_json::from_value::<ToolCallParams>(json!({"arguments": {}})));
    assert_ok!(serde_json::from_value::<ToolCallParams>(json!({"name": "echo"})));

    println!("TEST 06 — invalid tool calls: PASS");
}

/// Test 7: Unregistered methods are reported as not found.
#[tokio::test]
async fn test_07_method_not_found() {
    let mut h = Harness::start(ServerConfig::default());
    let response = h.call(9, "resources/list", json!({})).await;
    assert_eq!(response["error"]["code"], -32601);

    println!("TEST 07 — method not found: PASS");
}

/// Test 8: sleep reports one progress notification per step.
#[tokio::test]
async fn test_08_sleep_reports_progress() {
    let mut h = Harness::start(ServerConfig::default());
    h.initialize().await;

    h.send(request(
        6,
        "tools/call",
        json!({
            "name": "sleep",
            "arguments": {"ms": 30, "steps": 3, "text": "rested"},
            "_meta": {"progressToken": "tok-1"}
        }),
    ))
    .await;
    let (response, notifications) = h.response_for(6).await;

    assert_eq!(response["result"]["content"][0]["text"], "rested");
    let progress: Vec<&Value> = notifications
        .iter()
        .filter(|n| n["method"] == "notifications/progress")
        .collect();
    assert_eq!(progress.len(), 3);
    assert_eq!(progress[0]["params"]["progressToken"], "tok-1");
    assert_eq!(progress[2]["params"]["progress"], 3);
    assert_eq!(progress[2]["params"]["total"], 3);

    println!("TEST 08 — sleep progress: PASS");
}

/// Test 9: Cancelling a running call stops it without a response.
#[tokio::test]
async fn test_09_cancel_direct_call() {
    let mut h = Harness::start(ServerConfig::default());
    h.initialize().await;

    h.send(request(
        7,
        "tools/call",
        json!({"name": "sleep", "arguments": {"ms": 60_000}}),
    ))
    .await;
    let server = h.server.clone();
    wait_for(move || server.protocol().is_handling(&taskwire::RequestId::Number(7))).await;

    h.send(json!({
        "jsonrpc": "2.0",
        "method": "notifications/cancelled",
        "params": {"requestId": 7, "reason": "changed my mind"}
    }))
    .await;
    let server = h.server.clone();
    wait_for(move || !server.protocol().is_handling(&taskwire::RequestId::Number(7))).await;

    // The next frame answers the ping, not the cancelled call.
    let response = h.call(8, "ping", json!({})).await;
    assert_eq!(response["id"], 8);

    println!("TEST 09 — cancel direct call: PASS");
}

// ═══════════════════════════════════════════════════════
// TASKS
// ═══════════════════════════════════════════════════════

/// Test 10: A task-mode call returns a task, then tasks/result yields the
/// tool output once it finishes.
#[tokio::test]
async fn test_10_task_lifecycle() {
    let mut h = Harness::start(fast_config());
    h.initialize().await;

    let response = h
        .call(
            10,
            "tools/call",
            json!({
                "name": "sleep",
                "arguments": {"ms": 20, "text": "done"},
                "task": {"ttl": 60_000}
            }),
        )
        .await;
    let task = &response["result"]["task"];
    let task_id = task["taskId"].as_str().unwrap().to_string();
    assert_eq!(task["status"], "working");
    assert_eq!(task["ttl"], 60_000);
    assert_eq!(task["pollInterval"], 10);
    assert_eq!(h.server.task_count(), 1);

    let response = h.call(11, "tasks/result", json!({"taskId": task_id})).await;
    let result = &response["result"];
    assert_eq!(result["content"][0]["text"], "done");
    assert_eq!(
        result["_meta"]["io.modelcontextprotocol/related-task"]["taskId"],
        task_id.as_str()
    );

    let response = h.call(12, "tasks/get", json!({"taskId": task_id})).await;
    assert_eq!(response["result"]["status"], "completed");

    println!("TEST 10 — task lifecycle: PASS");
}

/// Test 11: A failing tool run as a task ends failed with an error result.
#[tokio::test]
async fn test_11_task_failure() {
    let mut h = Harness::start(fast_config());
    h.initialize().await;

    let response = h
        .call(
            13,
            "tools/call",
            json!({"name": "missing", "arguments": {}, "task": {}}),
        )
        .await;
    let task_id = response["result"]["task"]["taskId"]
        .as_str()
        .unwrap()
        .to_string();

    let response = h.call(14, "tasks/result", json!({"taskId": task_id})).await;
    assert_eq!(response["result"]["isError"], true);
    assert!(response["result"]["content"][0]["text"]
        .as_str()
        .unwrap()
        .contains("Unknown tool: missing"));

    let response = h.call(15, "tasks/get", json!({"taskId": task_id})).await;
    assert_eq!(response["result"]["status"], "failed");

    println!("TEST 11 — task failure: PASS");
}

/// Test 12: Completing a task announces its final status.
#[tokio::test]
async fn test_12_task_status_notification() {
    let mut h = Harness::start(fast_config());
    h.initialize().await;

    h.send(request(
        16,
        "tools/call",
        json!({"name": "echo", "arguments": {"text": "x"}, "task": {}}),
    ))
    .await;
    // The task may finish before its creation is answered.
    let (response, seen) = h.response_for(16).await;
    let task_id = response["result"]["task"]["taskId"]
        .as_str()
        .unwrap()
        .to_string();

    let is_status = |frame: &Value| frame["method"] == "notifications/tasks/status";
    let status = match seen.into_iter().find(is_status) {
        Some(frame) => frame,
        None => loop {
            let frame = h.recv().await;
            if is_status(&frame) {
                break frame;
            }
        },
    };
    assert_eq!(status["params"]["taskId"], task_id.as_str());
    assert_eq!(status["params"]["status"], "completed");

    println!("TEST 12 — task status notification: PASS");
}

/// Test 13: tasks/list and tasks/cancel work on server-created tasks.
#[tokio::test]
async fn test_13_list_and_cancel_tasks() {
    let mut h = Harness::start(fast_config());
    h.initialize().await;

    let response = h
        .call(
            17,
            "tools/call",
            json!({"name": "sleep", "arguments": {"ms": 60_000}, "task": {}}),
        )
        .await;
    let task_id = response["result"]["task"]["taskId"]
        .as_str()
        .unwrap()
        .to_string();

    let response = h.call(18, "tasks/list", json!({})).await;
    let tasks = response["result"]["tasks"].as_array().unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0]["taskId"], task_id.as_str());

    let response = h.call(19, "tasks/cancel", json!({"taskId": task_id})).await;
    assert_eq!(response["result"]["status"], "cancelled");

    let response = h.call(20, "tasks/cancel", json!({"taskId": task_id})).await;
    assert_eq!(response["error"]["code"], -32602);

    println!("TEST 13 — list and cancel tasks: PASS");
}

/// Test 14: Tasks created without a ttl take the configured default.
#[tokio::test]
async fn test_14_default_task_ttl() {
    let mut h = Harness::start(ServerConfig {
        task_ttl_ms: Some(30_000),
        ..fast_config()
    });
    h.initialize().await;

    let response = h
        .call(
            21,
            "tools/call",
            json!({"name": "echo", "arguments": {"text": "x"}, "task": {}}),
        )
        .await;
    assert_eq!(response["result"]["task"]["ttl"], 30_000);

    println!("TEST 14 — default task ttl: PASS");
}

// ═══════════════════════════════════════════════════════
// TRANSPORT
// ═══════════════════════════════════════════════════════

/// Test 15: Malformed JSON gets a parse error with a null id and the
/// session keeps going.
#[tokio::test]
async fn test_15_parse_error() {
    let mut h = Harness::start(ServerConfig::default());

    h.send_raw("{this is not json").await;
    let reply = h.recv().await;
    assert_eq!(reply["id"], Value::Null);
    assert_eq!(reply["error"]["code"], -32700);

    let response = h.call(22, "ping", json!({})).await;
    assert_eq!(response["result"], json!({}));

    println!("TEST 15 — parse error: PASS");
}

/// Test 16: A request with the wrong jsonrpc version is rejected by id.
#[tokio::test]
async fn test_16_wrong_jsonrpc_version() {
    let mut h = Harness::start(ServerConfig::default());

    h.send(json!({"jsonrpc": "1.0", "id": 23, "method": "ping"}))
        .await;
    let reply = h.recv().await;
    assert_eq!(reply["id"], 23);
    assert_eq!(reply["error"]["code"], -32600);

    println!("TEST 16 — wrong jsonrpc version: PASS");
}

/// Test 17: Closing the input ends serve cleanly.
#[tokio::test]
async fn test_17_eof_stops_server() {
    let mut h = Harness::start(ServerConfig::default());
    h.initialize().await;

    h.writer.shutdown().await.unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(5), h.serve)
        .await
        .expect("serve did not stop")
        .unwrap();
    assert_ok!(outcome);
    assert!(!h.server.protocol().is_connected());

    println!("TEST 17 — EOF stops server: PASS");
}
