//! Task plumbing: the per-request task store, the `tasks/*` handlers, the
//! side-channel message queue, and client helpers for polling tasks.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::time::Duration;

use super::handlers::boxed_request_handler;
use super::{AbortSignal, NotificationOptions, Protocol, RequestHandlerExtra, RequestOptions};
use crate::schema::{ResultSchema, Typed};
use crate::task::{QueueEntry, QueuedMessage, TaskStore};
use crate::transport::TransportSendOptions;
use crate::types::{
    with_meta, JsonRpcMessage, JsonRpcRequest, ListTasksParams, ListTasksResult, Notification,
    ProtocolError, ProtocolResult, Request, RequestDescriptor, RequestId, Task, TaskCreationParams,
    TaskIdParams, TaskStatus, DEFAULT_TASK_POLL_INTERVAL_MS, RELATED_TASK_META_KEY, TASKS_CANCEL,
    TASKS_GET, TASKS_LIST, TASKS_RESULT, TASK_STATUS_NOTIFICATION,
};

/// Task store view bound to one inbound request and session.
///
/// Status changes made through it are announced to the peer with
/// `notifications/tasks/status`.
#[derive(Clone)]
pub struct RequestTaskStore {
    protocol: Protocol,
    store: Arc<dyn TaskStore>,
    request_id: RequestId,
    request: RequestDescriptor,
    session_id: Option<String>,
}

impl RequestTaskStore {
    pub(crate) fn new(
        protocol: Protocol,
        store: Arc<dyn TaskStore>,
        request: &JsonRpcRequest,
        session_id: Option<String>,
    ) -> Self {
        Self {
            protocol,
            store,
            request_id: request.id.clone(),
            request: RequestDescriptor {
                method: request.method.clone(),
                params: request.params.clone(),
            },
            session_id,
        }
    }

    fn session(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Create a task for the request this store is bound to.
    pub async fn create_task(&self, params: TaskCreationParams) -> ProtocolResult<Task> {
        self.store
            .create_task(
                params,
                self.request_id.clone(),
                self.request.clone(),
                self.session(),
            )
            .await
    }

    pub async fn get_task(&self, task_id: &str) -> ProtocolResult<Task> {
        self.store
            .get_task(task_id, self.session())
            .await?
            .ok_or_else(|| {
                ProtocolError::InvalidParams("Failed to retrieve task: Task not found".to_string())
            })
    }

    /// Move a task to `status`. Terminal tasks are rejected without change.
    pub async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        status_message: Option<String>,
    ) -> ProtocolResult<()> {
        let task = self
            .store
            .get_task(task_id, self.session())
            .await?
            .ok_or_else(|| {
                ProtocolError::InvalidParams(format!(
                    "Task \"{task_id}\" not found - it may have been cleaned up"
                ))
            })?;
        if task.status.is_terminal() {
            return Err(ProtocolError::InvalidParams(format!(
                "Cannot update task \"{task_id}\" from terminal status \"{}\" to \"{status}\". \
                 Terminal states (completed, failed, cancelled) cannot transition to other states.",
                task.status
            )));
        }
        self.store
            .update_task_status(task_id, status, status_message, self.session())
            .await?;
        self.announce(task_id).await
    }

    /// Record the final result of a task.
    pub async fn store_task_result(
        &self,
        task_id: &str,
        status: TaskStatus,
        result: Value,
    ) -> ProtocolResult<()> {
        self.store
            .store_task_result(task_id, status, result, self.session())
            .await?;
        self.announce(task_id).await
    }

    pub async fn get_task_result(&self, task_id: &str) -> ProtocolResult<Value> {
        self.store.get_task_result(task_id, self.session()).await
    }

    pub async fn list_tasks(&self, cursor: Option<&str>) -> ProtocolResult<ListTasksResult> {
        self.store.list_tasks(cursor, self.session()).await
    }

    /// Broadcast the task's current state; release its progress handler once
    /// it is terminal. The queue is left for `tasks/result` to drain.
    async fn announce(&self, task_id: &str) -> ProtocolResult<()> {
        let Some(task) = self.store.get_task(task_id, self.session()).await? else {
            return Ok(());
        };
        let notification = Notification::new(
            TASK_STATUS_NOTIFICATION,
            Some(serde_json::to_value(&task)?),
        );
        self.protocol
            .notification(notification, NotificationOptions::default())
            .await?;
        if task.status.is_terminal() {
            self.protocol.cleanup_task_progress_handler(task_id);
        }
        Ok(())
    }
}

pub(crate) fn poll_interval(task: &Task, default_ms: Option<u64>) -> Duration {
    Duration::from_millis(
        task.poll_interval
            .or(default_ms)
            .unwrap_or(DEFAULT_TASK_POLL_INTERVAL_MS),
    )
}

impl Protocol {
    fn task_store(&self) -> ProtocolResult<Arc<dyn TaskStore>> {
        self.inner
            .options
            .task_store
            .clone()
            .ok_or_else(|| ProtocolError::InternalError("No task store configured".to_string()))
    }

    pub(crate) fn install_task_handlers(&self) {
        self.install_request_handler(
            TASKS_GET,
            boxed_request_handler(|request, extra| async move {
                let params: TaskIdParams = parse_params(request.params)?;
                extra.protocol.handle_tasks_get(params, &extra).await
            }),
        );
        self.install_request_handler(
            TASKS_RESULT,
            boxed_request_handler(|request, extra| async move {
                let params: TaskIdParams = parse_params(request.params)?;
                extra.protocol.handle_tasks_result(params.task_id, &extra).await
            }),
        );
        self.install_request_handler(
            TASKS_LIST,
            boxed_request_handler(|request, extra| async move {
                let params: ListTasksParams = match request.params {
                    Some(params) => parse_params(Some(params))?,
                    None => ListTasksParams::default(),
                };
                extra.protocol.handle_tasks_list(params, &extra).await
            }),
        );
        self.install_request_handler(
            TASKS_CANCEL,
            boxed_request_handler(|request, extra| async move {
                let params: TaskIdParams = parse_params(request.params)?;
                extra.protocol.handle_tasks_cancel(params.task_id, &extra).await
            }),
        );
    }

    async fn handle_tasks_get(
        &self,
        params: TaskIdParams,
        extra: &RequestHandlerExtra,
    ) -> ProtocolResult<Value> {
        let task = self
            .task_store()?
            .get_task(&params.task_id, extra.session_id.as_deref())
            .await?
            .ok_or_else(|| {
                ProtocolError::InvalidParams("Failed to retrieve task: Task not found".to_string())
            })?;
        Ok(serde_json::to_value(task)?)
    }

    /// Deliver queued messages until the task is terminal, then return its
    /// stored result tagged with the task id.
    async fn handle_tasks_result(
        &self,
        task_id: String,
        extra: &RequestHandlerExtra,
    ) -> ProtocolResult<Value> {
        let store = self.task_store()?;
        let session = extra.session_id.as_deref();

        loop {
            self.deliver_queued(&task_id, session, &extra.request_id).await?;

            let task = store
                .get_task(&task_id, session)
                .await?
                .ok_or_else(|| ProtocolError::InvalidParams(format!("Task not found: {task_id}")))?;

            if task.status.is_terminal() {
                let result = store.get_task_result(&task_id, session).await?;
                self.clear_task_queue(&task_id, session).await?;
                return Ok(with_meta(
                    Some(result),
                    RELATED_TASK_META_KEY,
                    json!({ "taskId": task_id }),
                ));
            }

            let interval = poll_interval(&task, self.inner.options.default_task_poll_interval);
            wait_or_abort(interval, &extra.signal).await?;
        }
    }

    /// Drain the task's queue: responses settle queued requests, everything
    /// else goes out on the `tasks/result` stream.
    async fn deliver_queued(
        &self,
        task_id: &str,
        session: Option<&str>,
        result_request_id: &RequestId,
    ) -> ProtocolResult<()> {
        let Some(queue) = self.inner.options.task_message_queue.clone() else {
            return Ok(());
        };
        while let Some(entry) = queue.dequeue(task_id, session).await? {
            let outbound = match entry.message {
                QueuedMessage::Response(response) => {
                    self.resolve_queued("Response", &response.id, Ok(response.result));
                    continue;
                }
                QueuedMessage::Error(error) => {
                    let outcome = Err(ProtocolError::from_error_object(error.error));
                    match &error.id {
                        Some(id) => self.resolve_queued("Error", id, outcome),
                        None => self.report_error(ProtocolError::InternalError(
                            "Error handler missing for request null".to_string(),
                        )),
                    }
                    continue;
                }
                QueuedMessage::Request(request) => JsonRpcMessage::Request(request),
                QueuedMessage::Notification(notification) => {
                    JsonRpcMessage::Notification(notification)
                }
            };
            if let Some(transport) = self.transport() {
                let options = TransportSendOptions {
                    related_request_id: Some(result_request_id.clone()),
                    ..Default::default()
                };
                transport.send(outbound, options).await?;
            }
        }
        Ok(())
    }

    fn resolve_queued(&self, kind: &str, id: &RequestId, outcome: ProtocolResult<Value>) {
        let known = id
            .as_number()
            .filter(|id| self.state().request_resolvers.contains(id));
        match known {
            Some(id) => self.settle_response(id, outcome),
            None => self.report_error(ProtocolError::InternalError(format!(
                "{kind} handler missing for request {id}"
            ))),
        }
    }

    async fn handle_tasks_list(
        &self,
        params: ListTasksParams,
        extra: &RequestHandlerExtra,
    ) -> ProtocolResult<Value> {
        let listed = self
            .task_store()?
            .list_tasks(params.cursor.as_deref(), extra.session_id.as_deref())
            .await
            .map_err(|e| ProtocolError::InvalidParams(format!("Failed to list tasks: {e}")))?;
        let mut value = serde_json::to_value(listed)?;
        if let Value::Object(map) = &mut value {
            map.insert("_meta".to_string(), json!({}));
        }
        Ok(value)
    }

    async fn handle_tasks_cancel(
        &self,
        task_id: String,
        extra: &RequestHandlerExtra,
    ) -> ProtocolResult<Value> {
        self.cancel_stored_task(&task_id, extra.session_id.as_deref())
            .await
            .map_err(|e| match e {
                ProtocolError::InvalidParams(_)
                | ProtocolError::InvalidRequest(_)
                | ProtocolError::Remote { .. } => e,
                other => ProtocolError::InvalidRequest(format!("Failed to cancel task: {other}")),
            })
    }

    async fn cancel_stored_task(
        &self,
        task_id: &str,
        session: Option<&str>,
    ) -> ProtocolResult<Value> {
        let store = self.task_store()?;
        let task = store
            .get_task(task_id, session)
            .await?
            .ok_or_else(|| ProtocolError::InvalidParams(format!("Task not found: {task_id}")))?;
        if task.status.is_terminal() {
            return Err(ProtocolError::InvalidParams(format!(
                "Cannot cancel task in terminal status: {}",
                task.status
            )));
        }
        store
            .update_task_status(
                task_id,
                TaskStatus::Cancelled,
                Some("Client cancelled task execution.".to_string()),
                session,
            )
            .await?;
        self.clear_task_queue(task_id, session).await?;

        let cancelled = store.get_task(task_id, session).await?.ok_or_else(|| {
            ProtocolError::InvalidParams(format!("Task not found after cancellation: {task_id}"))
        })?;
        let mut value = serde_json::to_value(cancelled)?;
        if let Value::Object(map) = &mut value {
            map.insert("_meta".to_string(), json!({}));
        }
        Ok(value)
    }

    /// Queue a message for delivery through `tasks/result`.
    pub(crate) async fn enqueue_task_message(
        &self,
        task_id: &str,
        message: QueuedMessage,
        session_id: Option<&str>,
    ) -> ProtocolResult<()> {
        let options = &self.inner.options;
        let (Some(_), Some(queue)) = (&options.task_store, &options.task_message_queue) else {
            return Err(ProtocolError::InternalError(
                "Cannot enqueue task message: taskStore and taskMessageQueue are not configured"
                    .to_string(),
            ));
        };
        tracing::debug!(task_id, kind = message.kind(), "Queueing task message");
        queue
            .enqueue(
                task_id,
                QueueEntry::now(message),
                session_id,
                options.max_task_queue_size,
            )
            .await
    }

    /// Empty the task's queue, failing any requests still waiting in it.
    pub(crate) async fn clear_task_queue(
        &self,
        task_id: &str,
        session_id: Option<&str>,
    ) -> ProtocolResult<()> {
        let Some(queue) = self.inner.options.task_message_queue.clone() else {
            return Ok(());
        };
        for entry in queue.dequeue_all(task_id, session_id).await? {
            let QueuedMessage::Request(request) = entry.message else {
                continue;
            };
            let known = request
                .id
                .as_number()
                .filter(|id| self.state().request_resolvers.contains(id));
            match known {
                Some(id) => self.settle_response(
                    id,
                    Err(ProtocolError::InternalError(
                        "Task cancelled or completed".to_string(),
                    )),
                ),
                None => self.report_error(ProtocolError::InternalError(format!(
                    "Resolver missing for request {} during task {task_id} cleanup",
                    request.id
                ))),
            }
        }
        Ok(())
    }

    /// `tasks/get` on the peer.
    pub async fn get_task(&self, task_id: &str, options: RequestOptions) -> ProtocolResult<Task> {
        let request = Request::new(TASKS_GET, Some(json!({ "taskId": task_id })));
        self.request(request, Typed::<Task>::new(), options).await
    }

    /// `tasks/result` on the peer; blocks until the task is terminal.
    pub async fn get_task_result<S: ResultSchema>(
        &self,
        task_id: &str,
        schema: S,
        options: RequestOptions,
    ) -> ProtocolResult<S::Output> {
        let request = Request::new(TASKS_RESULT, Some(json!({ "taskId": task_id })));
        self.request(request, schema, options).await
    }

    pub async fn list_tasks(
        &self,
        cursor: Option<&str>,
        options: RequestOptions,
    ) -> ProtocolResult<ListTasksResult> {
        let params = cursor.map(|cursor| json!({ "cursor": cursor }));
        self.request(
            Request::new(TASKS_LIST, params),
            Typed::<ListTasksResult>::new(),
            options,
        )
        .await
    }

    pub async fn cancel_task(
        &self,
        task_id: &str,
        options: RequestOptions,
    ) -> ProtocolResult<Task> {
        let request = Request::new(TASKS_CANCEL, Some(json!({ "taskId": task_id })));
        self.request(request, Typed::<Task>::new(), options).await
    }
}

fn parse_params<P: serde::de::DeserializeOwned>(params: Option<Value>) -> ProtocolResult<P> {
    serde_json::from_value(params.unwrap_or(Value::Null))
        .map_err(|e| ProtocolError::InvalidParams(e.to_string()))
}

/// Sleep for `interval` unless the signal fires first.
async fn wait_or_abort(interval: Duration, signal: &AbortSignal) -> ProtocolResult<()> {
    let cancelled = || ProtocolError::InvalidRequest("Request cancelled".to_string());
    if signal.is_aborted() {
        return Err(cancelled());
    }
    tokio::select! {
        _ = tokio::time::sleep(interval) => Ok(()),
        _ = signal.aborted() => Err(cancelled()),
    }
}
