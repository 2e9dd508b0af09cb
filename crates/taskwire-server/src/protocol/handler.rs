//! Request routing for the server: handshake, tool listing and tool calls.

use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tokio::sync::Notify;

use taskwire::{
    CreateTaskResult, DeclaredCapabilities, InMemoryTaskMessageQueue, InMemoryTaskStore,
    InitializeParams, Protocol, ProtocolError, ProtocolOptions, ProtocolResult,
    RequestHandlerExtra, TaskCreationParams, TaskStatus, Transport,
};

use super::negotiation::{server_capabilities, NegotiatedCapabilities};
use crate::config::ServerConfig;
use crate::tools::ToolRegistry;
use crate::types::{ToolCallParams, ToolCallResult, ToolListResult};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// A protocol endpoint with the server's handlers and task store installed.
pub struct TaskServer {
    protocol: Protocol,
    config: ServerConfig,
    negotiated: Arc<Mutex<NegotiatedCapabilities>>,
    store: Arc<InMemoryTaskStore>,
}

impl TaskServer {
    pub fn new(config: ServerConfig) -> ProtocolResult<Self> {
        let store = Arc::new(InMemoryTaskStore::new().with_default_ttl(config.task_ttl_ms));
        let policy = Arc::new(DeclaredCapabilities::new(server_capabilities().tasks));
        let options = config.apply(
            ProtocolOptions::default()
                .with_task_store(store.clone())
                .with_task_message_queue(Arc::new(InMemoryTaskMessageQueue::new()))
                .with_capabilities(policy.clone()),
        );

        let server = Self {
            protocol: Protocol::new(options),
            config,
            negotiated: Arc::new(Mutex::new(NegotiatedCapabilities::default())),
            store,
        };
        server.register_handlers(policy)?;
        Ok(server)
    }

    fn register_handlers(&self, policy: Arc<DeclaredCapabilities>) -> ProtocolResult<()> {
        let negotiated = self.negotiated.clone();
        self.protocol.set_typed_request_handler(
            "initialize",
            move |params: InitializeParams, _extra| {
                let result = lock(&negotiated).negotiate(params, &policy);
                async move { ProtocolResult::Ok(result) }
            },
        )?;

        let negotiated = self.negotiated.clone();
        self.protocol
            .set_notification_handler("notifications/initialized", move |_| {
                lock(&negotiated).mark_initialized();
                async { ProtocolResult::Ok(()) }
            });

        self.protocol.set_request_handler("tools/list", |_, _| async {
            let result = ToolListResult {
                tools: ToolRegistry::list_tools(),
                next_cursor: None,
            };
            serde_json::to_value(result).map_err(ProtocolError::from)
        })?;

        let poll_interval_ms = self.config.poll_interval_ms;
        self.protocol
            .set_request_handler("tools/call", move |request, extra| {
                handle_tool_call(request.params, extra, poll_interval_ms)
            })?;

        Ok(())
    }

    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// True once the client sent `notifications/initialized`.
    pub fn is_initialized(&self) -> bool {
        lock(&self.negotiated).initialized
    }

    pub fn task_count(&self) -> usize {
        self.store.len()
    }

    /// Connect to `transport` and run until it closes.
    pub async fn serve(&self, transport: Arc<dyn Transport>) -> ProtocolResult<()> {
        let closed = Arc::new(Notify::new());
        let on_close = closed.clone();
        self.protocol.set_on_close(move || on_close.notify_one());

        self.protocol.connect(transport).await?;
        tracing::info!("Server ready");

        closed.notified().await;
        tracing::info!("Transport closed, server stopping");
        Ok(())
    }
}

async fn handle_tool_call(
    params: Option<Value>,
    extra: RequestHandlerExtra,
    poll_interval_ms: u64,
) -> ProtocolResult<Value> {
    let ToolCallParams {
        name,
        arguments,
        task,
    } = params
        .map(serde_json::from_value::<ToolCallParams>)
        .transpose()
        .map_err(|e| ProtocolError::InvalidParams(e.to_string()))?
        .ok_or_else(|| ProtocolError::InvalidParams("Missing tool call params".to_string()))?;

    let Some(task) = task else {
        tracing::debug!("Calling tool {name}");
        let result = ToolRegistry::call(&name, arguments, &extra).await?;
        return Ok(serde_json::to_value(result)?);
    };

    let store = extra
        .task_store
        .clone()
        .ok_or_else(|| ProtocolError::InternalError("No task store configured".to_string()))?;
    let created = store
        .create_task(TaskCreationParams {
            ttl: task.ttl.or(extra.task_requested_ttl),
            poll_interval: Some(poll_interval_ms),
        })
        .await?;
    tracing::info!(task_id = %created.task_id, tool = %name, "Running tool as task");

    let task_id = created.task_id.clone();
    tokio::spawn(async move {
        let (status, result) =
            match ToolRegistry::call(&name, arguments, &extra).await {
                Ok(result) => (TaskStatus::Completed, result),
                Err(e) => (TaskStatus::Failed, ToolCallResult::error(e.to_string())),
            };
        let stored = match serde_json::to_value(result) {
            Ok(value) => store.store_task_result(&task_id, status, value).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = stored {
            // The task may have been cancelled or expired meanwhile.
            tracing::debug!(task_id = %task_id, "Task result not stored: {e}");
        }
    });

    Ok(serde_json::to_value(CreateTaskResult {
        task: created,
        meta: None,
    })?)
}
