//! Pluggable task storage and the per-task outbound message queue.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{
    JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ListTasksResult,
    ProtocolResult, RequestDescriptor, RequestId, Task, TaskCreationParams, TaskStatus,
};

pub use memory::{InMemoryTaskMessageQueue, InMemoryTaskStore};

/// Durable task records. Implementations decide persistence; every call is
/// scoped by an optional session id.
#[async_trait]
pub trait TaskStore: Send + Sync + 'static {
    /// Create a task in `working` status for the request that asked for it.
    async fn create_task(
        &self,
        params: TaskCreationParams,
        request_id: RequestId,
        request: RequestDescriptor,
        session_id: Option<&str>,
    ) -> ProtocolResult<Task>;

    async fn get_task(&self, task_id: &str, session_id: Option<&str>)
        -> ProtocolResult<Option<Task>>;

    async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        status_message: Option<String>,
        session_id: Option<&str>,
    ) -> ProtocolResult<()>;

    /// Record the final result and move the task to `status`.
    async fn store_task_result(
        &self,
        task_id: &str,
        status: TaskStatus,
        result: Value,
        session_id: Option<&str>,
    ) -> ProtocolResult<()>;

    async fn get_task_result(&self, task_id: &str, session_id: Option<&str>)
        -> ProtocolResult<Value>;

    async fn list_tasks(
        &self,
        cursor: Option<&str>,
        session_id: Option<&str>,
    ) -> ProtocolResult<ListTasksResult>;
}

/// A message waiting for delivery through `tasks/result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "message", rename_all = "lowercase")]
pub enum QueuedMessage {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    Response(JsonRpcResponse),
    Error(JsonRpcError),
}

impl QueuedMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            QueuedMessage::Request(_) => "request",
            QueuedMessage::Notification(_) => "notification",
            QueuedMessage::Response(_) => "response",
            QueuedMessage::Error(_) => "error",
        }
    }
}

/// Queue entry with its enqueue time in milliseconds since the epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    #[serde(flatten)]
    pub message: QueuedMessage,
    pub timestamp: i64,
}

impl QueueEntry {
    pub fn now(message: QueuedMessage) -> Self {
        Self {
            message,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// FIFO of messages per `(task, session)`.
#[async_trait]
pub trait TaskMessageQueue: Send + Sync + 'static {
    /// Append an entry. Fails when the queue already holds `max_queue_size`
    /// entries.
    async fn enqueue(
        &self,
        task_id: &str,
        entry: QueueEntry,
        session_id: Option<&str>,
        max_queue_size: Option<usize>,
    ) -> ProtocolResult<()>;

    async fn dequeue(&self, task_id: &str, session_id: Option<&str>)
        -> ProtocolResult<Option<QueueEntry>>;

    /// Remove and return every queued entry.
    async fn dequeue_all(&self, task_id: &str, session_id: Option<&str>)
        -> ProtocolResult<Vec<QueueEntry>>;
}
