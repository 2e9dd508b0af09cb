//! The connection pump and dispatch of inbound messages.

use std::sync::{Arc, Weak};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinError;

use super::handlers::{decode_params, NotificationHandlerFn, RequestHandlerFn};
use super::{AbortSignal, Inner, Protocol, RequestHandlerExtra, RequestTaskStore};
use crate::task::QueuedMessage;
use crate::transport::{MessageExtra, Transport, TransportEvent, TransportSendOptions};
use crate::types::{
    meta, related_task_id, JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, ProtocolError, ProtocolResult, RequestId, TaskCreationParams,
    CANCELLED_NOTIFICATION, PROGRESS_NOTIFICATION,
};

type NotificationJob = (NotificationHandlerFn, JsonRpcNotification);

/// Drain one transport's events in arrival order.
///
/// Responses, progress and cancellation are handled before the next event is
/// taken. Other notifications go to a worker that runs their handlers one at
/// a time, in the same order.
pub(crate) async fn pump(
    weak: Weak<Inner>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    generation: u64,
) {
    let (jobs, queue) = mpsc::unbounded_channel();
    tokio::spawn(run_notification_handlers(weak.clone(), queue));

    while let Some(event) = events.recv().await {
        let Some(protocol) = Protocol::upgrade(&weak) else {
            break;
        };
        if protocol.state().generation != generation {
            tracing::trace!(generation, "Dropping event from a replaced transport");
            continue;
        }
        match event {
            TransportEvent::Message(message, extra) => protocol.dispatch(message, extra, &jobs),
            TransportEvent::Error(error) => protocol.report_error(error),
            TransportEvent::Closed => {
                protocol.on_close();
                break;
            }
        }
    }
}

async fn run_notification_handlers(
    weak: Weak<Inner>,
    mut queue: mpsc::UnboundedReceiver<NotificationJob>,
) {
    while let Some((handler, notification)) = queue.recv().await {
        let method = notification.method.clone();
        let outcome = match tokio::spawn(handler(notification)).await {
            Ok(outcome) => outcome,
            Err(e) => Err(handler_crashed(e)),
        };
        if let Err(e) = outcome {
            if let Some(protocol) = Protocol::upgrade(&weak) {
                protocol.report_error(ProtocolError::InternalError(format!(
                    "Uncaught error in notification handler for {method}: {e}"
                )));
            }
        }
    }
}

/// Run a request handler in its own task so a panic becomes an error.
async fn run_request_handler(
    handler: RequestHandlerFn,
    request: JsonRpcRequest,
    extra: RequestHandlerExtra,
) -> ProtocolResult<Value> {
    match tokio::spawn(handler(request, extra)).await {
        Ok(outcome) => outcome,
        Err(e) => Err(handler_crashed(e)),
    }
}

fn handler_crashed(error: JoinError) -> ProtocolError {
    if !error.is_panic() {
        return ProtocolError::InternalError("Handler was cancelled".to_string());
    }
    let payload = error.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    ProtocolError::InternalError(format!("Handler panicked: {message}"))
}

impl Protocol {
    fn dispatch(
        &self,
        message: JsonRpcMessage,
        extra: MessageExtra,
        jobs: &mpsc::UnboundedSender<NotificationJob>,
    ) {
        tracing::trace!(?message, "Inbound message");
        match message {
            JsonRpcMessage::Response(JsonRpcResponse { id, result, .. }) => {
                self.on_response(Some(id), Ok(result))
            }
            JsonRpcMessage::Error(JsonRpcError { id, error, .. }) => {
                self.on_response(id, Err(ProtocolError::from_error_object(error)))
            }
            JsonRpcMessage::Request(request) => self.on_request(request, extra),
            JsonRpcMessage::Notification(notification) => {
                self.on_notification(notification, jobs)
            }
        }
    }

    fn on_response(&self, id: Option<RequestId>, outcome: ProtocolResult<Value>) {
        match id.as_ref().and_then(RequestId::as_number) {
            Some(id) => self.settle_response(id, outcome),
            None => self.report_error(ProtocolError::InternalError(format!(
                "Received a response for an unknown message ID: {}",
                id.map(|id| id.to_string()).unwrap_or_else(|| "null".to_string())
            ))),
        }
    }

    fn on_notification(
        &self,
        notification: JsonRpcNotification,
        jobs: &mpsc::UnboundedSender<NotificationJob>,
    ) {
        if !self.has_notification_handler(&notification.method) {
            if notification.method == PROGRESS_NOTIFICATION {
                return self.on_builtin(notification, Protocol::handle_progress);
            }
            if notification.method == CANCELLED_NOTIFICATION {
                return self.on_builtin(notification, Protocol::handle_cancelled);
            }
        }

        let Some(handler) = self.notification_handler(&notification.method) else {
            tracing::trace!(method = %notification.method, "Ignoring notification");
            return;
        };
        if jobs.send((handler, notification)).is_err() {
            tracing::trace!("Notification worker is gone");
        }
    }

    fn on_builtin<P: DeserializeOwned>(
        &self,
        notification: JsonRpcNotification,
        handle: fn(&Protocol, P),
    ) {
        match decode_params::<P>(notification.params) {
            Ok(params) => handle(self, params),
            Err(e) => self.report_error(ProtocolError::InternalError(format!(
                "Uncaught error in notification handler for {}: {e}",
                notification.method
            ))),
        }
    }

    fn on_request(&self, request: JsonRpcRequest, extra: MessageExtra) {
        let handler = self.request_handler(&request.method);
        let transport = self.transport();
        let session_id = transport.as_ref().and_then(|t| t.session_id());
        let task_id = related_task_id(request.params.as_ref());
        tracing::debug!(id = %request.id, method = %request.method, "Inbound request");

        let Some(handler) = handler else {
            let error = ProtocolError::MethodNotFound(request.method.clone());
            let message = JsonRpcMessage::Error(error.to_json_rpc_error(Some(request.id.clone())));
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this
                    .deliver_response(message, request.id, task_id, transport, session_id)
                    .await
                {
                    this.report_error(ProtocolError::Transport(format!(
                        "Failed to send an error response: {e}"
                    )));
                }
            });
            return;
        };

        let signal = AbortSignal::new();
        self.state()
            .inbound
            .insert(request.id.clone(), signal.clone());

        let task_creation: Option<TaskCreationParams> = request
            .params
            .as_ref()
            .and_then(|params| params.get("task"))
            .and_then(|task| serde_json::from_value(task.clone()).ok());
        let task_store = self
            .inner
            .options
            .task_store
            .clone()
            .map(|store| RequestTaskStore::new(self.clone(), store, &request, session_id.clone()));

        let handler_extra = RequestHandlerExtra {
            signal: signal.clone(),
            session_id: session_id.clone(),
            meta: meta(request.params.as_ref()).cloned(),
            request_id: request.id.clone(),
            task_id: task_id.clone(),
            task_store,
            task_requested_ttl: task_creation.as_ref().and_then(|task| task.ttl),
            auth_info: extra.auth_info,
            request_info: extra.request_info,
            protocol: self.clone(),
        };

        let this = self.clone();
        tokio::spawn(async move {
            let id = request.id.clone();
            let method = request.method.clone();
            let outcome = match task_creation {
                Some(_) => match this
                    .inner
                    .options
                    .capabilities
                    .assert_task_handler_capability(&method)
                {
                    Ok(()) => run_request_handler(handler, request, handler_extra).await,
                    Err(e) => Err(e),
                },
                None => run_request_handler(handler, request, handler_extra).await,
            };

            if signal.is_aborted() {
                tracing::debug!(%id, %method, "Request cancelled, dropping response");
                this.state().inbound.remove(&id);
                return;
            }

            let message = match outcome {
                Ok(result) => JsonRpcMessage::Response(JsonRpcResponse::new(id.clone(), result)),
                Err(error) => {
                    tracing::debug!(%id, %method, error = %error, "Request handler failed");
                    JsonRpcMessage::Error(error.to_json_rpc_error(Some(id.clone())))
                }
            };
            if let Err(e) = this
                .deliver_response(message, id.clone(), task_id, transport, session_id)
                .await
            {
                this.report_error(ProtocolError::Transport(format!(
                    "Failed to send response: {e}"
                )));
            }
            this.state().inbound.remove(&id);
        });
    }

    /// Send a response over the transport the request came in on, or queue it
    /// when the request belongs to a task and a queue is configured.
    async fn deliver_response(
        &self,
        message: JsonRpcMessage,
        request_id: RequestId,
        task_id: Option<String>,
        transport: Option<Arc<dyn Transport>>,
        session_id: Option<String>,
    ) -> ProtocolResult<()> {
        if let Some(task_id) = task_id.filter(|_| self.inner.options.task_message_queue.is_some()) {
            let queued = match message {
                JsonRpcMessage::Response(response) => QueuedMessage::Response(response),
                JsonRpcMessage::Error(error) => QueuedMessage::Error(error),
                JsonRpcMessage::Request(request) => QueuedMessage::Request(request),
                JsonRpcMessage::Notification(n) => QueuedMessage::Notification(n),
            };
            return self
                .enqueue_task_message(&task_id, queued, session_id.as_deref())
                .await;
        }
        match transport {
            Some(transport) => {
                let options = TransportSendOptions {
                    related_request_id: Some(request_id),
                    ..Default::default()
                };
                transport.send(message, options).await
            }
            None => Ok(()),
        }
    }

    /// Tear down connection state and fail every pending call.
    fn on_close(&self) {
        let pending = {
            let mut state = self.state();
            state.transport = None;
            state.progress_handlers.clear();
            state.task_progress_tokens.clear();
            state.pending_debounced.clear();
            state.request_resolvers.clear();
            state.timeouts.clear_all();
            std::mem::take(&mut state.response_handlers)
        };
        tracing::debug!(pending = pending.len(), "Connection closed");

        if let Some(hook) = self.close_hook() {
            hook();
        }
        for (_, call) in pending {
            let _ = call.tx.send(Err(ProtocolError::ConnectionClosed));
        }
    }
}
