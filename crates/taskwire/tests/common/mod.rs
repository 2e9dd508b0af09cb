//! Shared helpers for the protocol integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use taskwire::*;

/// A transport that records everything sent and lets the test play the peer.
#[derive(Clone, Default)]
pub struct RecordingTransport {
    inner: Arc<Mutex<Recorded>>,
}

#[derive(Default)]
struct Recorded {
    sink: Option<TransportSink>,
    sent: Vec<(JsonRpcMessage, TransportSendOptions)>,
    session_id: Option<String>,
    fail_sends: bool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session_id(self, session_id: &str) -> Self {
        self.inner.lock().unwrap().session_id = Some(session_id.to_string());
        self
    }

    pub fn fail_sends(&self) {
        self.inner.lock().unwrap().fail_sends = true;
    }

    /// Everything sent so far, as JSON.
    pub fn sent(&self) -> Vec<Value> {
        self.inner
            .lock()
            .unwrap()
            .sent
            .iter()
            .map(|(message, _)| serde_json::to_value(message).unwrap())
            .collect()
    }

    pub fn sent_with_options(&self) -> Vec<(Value, TransportSendOptions)> {
        self.inner
            .lock()
            .unwrap()
            .sent
            .iter()
            .map(|(message, options)| (serde_json::to_value(message).unwrap(), options.clone()))
            .collect()
    }

    /// Sent messages with the given method.
    pub fn sent_method(&self, method: &str) -> Vec<Value> {
        self.sent()
            .into_iter()
            .filter(|message| message["method"] == method)
            .collect()
    }

    /// Deliver a message as if the peer sent it.
    pub fn inject(&self, message: Value) {
        let message: JsonRpcMessage = serde_json::from_value(message).unwrap();
        let sink = self.inner.lock().unwrap().sink.clone().expect("transport not started");
        sink.message(message, MessageExtra::default());
    }

    pub fn inject_error(&self, error: ProtocolError) {
        let sink = self.inner.lock().unwrap().sink.clone().expect("transport not started");
        sink.error(error);
    }

    /// Signal a close as if the peer hung up.
    pub fn hang_up(&self) {
        let sink = self.inner.lock().unwrap().sink.take();
        if let Some(sink) = sink {
            sink.closed();
        }
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn start(&self, sink: TransportSink) -> ProtocolResult<()> {
        self.inner.lock().unwrap().sink = Some(sink);
        Ok(())
    }

    async fn send(
        &self,
        message: JsonRpcMessage,
        options: TransportSendOptions,
    ) -> ProtocolResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_sends {
            return Err(ProtocolError::Transport("send refused".to_string()));
        }
        inner.sent.push((message, options));
        Ok(())
    }

    async fn close(&self) -> ProtocolResult<()> {
        self.hang_up();
        Ok(())
    }

    fn session_id(&self) -> Option<String> {
        self.inner.lock().unwrap().session_id.clone()
    }
}

/// A protocol attached to a fresh recording transport.
pub async fn connected(options: ProtocolOptions) -> (Protocol, RecordingTransport) {
    let protocol = Protocol::new(options);
    let transport = RecordingTransport::new();
    protocol.connect(Arc::new(transport.clone())).await.unwrap();
    (protocol, transport)
}

/// Two protocols talking over an in-memory pair.
pub async fn linked(client: ProtocolOptions, server: ProtocolOptions) -> (Protocol, Protocol) {
    let (client_side, server_side) = InMemoryTransport::create_linked_pair();
    let client_protocol = Protocol::new(client);
    let server_protocol = Protocol::new(server);
    server_protocol.connect(Arc::new(server_side)).await.unwrap();
    client_protocol.connect(Arc::new(client_side)).await.unwrap();
    (client_protocol, server_protocol)
}

/// Options with an in-memory task store and queue.
pub fn task_options() -> (ProtocolOptions, Arc<InMemoryTaskStore>, Arc<InMemoryTaskMessageQueue>) {
    let store = Arc::new(InMemoryTaskStore::new());
    let queue = Arc::new(InMemoryTaskMessageQueue::new());
    let options = ProtocolOptions::default()
        .with_task_store(store.clone())
        .with_task_message_queue(queue.clone());
    (options, store, queue)
}

/// Let spawned tasks run.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// Collects errors reported through `on_error`.
pub fn capture_errors(protocol: &Protocol) -> Arc<Mutex<Vec<String>>> {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    protocol.set_on_error(move |error| sink.lock().unwrap().push(error.to_string()));
    errors
}

pub fn response(id: i64, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

pub fn request(id: i64, method: &str, params: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params })
}

pub fn notification(method: &str, params: Value) -> Value {
    json!({ "jsonrpc": "2.0", "method": method, "params": params })
}
