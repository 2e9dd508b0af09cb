//! Outgoing requests and notifications, cancellation, and response settlement.

use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Duration;

use super::{NotificationOptions, PendingCall, Protocol, RequestOptions, DEBOUNCE_WINDOW};
use crate::schema::ResultSchema;
use crate::task::QueuedMessage;
use crate::transport::TransportSendOptions;
use crate::types::{
    with_field, with_meta, CancelledParams, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    Notification, ProtocolError, ProtocolResult, Request, RequestId, CANCELLED_NOTIFICATION,
    PROGRESS_TOKEN_META_KEY, RELATED_TASK_META_KEY,
};

impl Protocol {
    /// Send a request and wait for its result, validated by `schema`.
    pub async fn request<S: ResultSchema>(
        &self,
        request: Request,
        schema: S,
        options: RequestOptions,
    ) -> ProtocolResult<S::Output> {
        let transport = self.transport().ok_or(ProtocolError::NotConnected)?;

        if self.inner.options.enforce_strict_capabilities {
            let caps = &self.inner.options.capabilities;
            caps.assert_capability_for_method(&request.method)?;
            if options.task.is_some() {
                caps.assert_task_capability(&request.method)?;
            }
        }

        if let Some(signal) = &options.signal {
            if signal.is_aborted() {
                return Err(ProtocolError::from_abort_reason(signal.reason()));
            }
        }

        let id = self.next_message_id();
        let mut params = request.params;
        if options.on_progress.is_some() {
            params = Some(with_meta(params, PROGRESS_TOKEN_META_KEY, json!(id)));
        }
        if let Some(task) = &options.task {
            params = Some(with_field(params, "task", serde_json::to_value(task)?));
        }
        if let Some(related) = &options.related_task {
            params = Some(with_meta(
                params,
                RELATED_TASK_META_KEY,
                serde_json::to_value(related)?,
            ));
        }
        let message = JsonRpcRequest::new(RequestId::Number(id), request.method, params);

        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state();
            state.response_handlers.insert(
                id,
                PendingCall {
                    tx,
                    send_options: options.send_options(),
                },
            );
            if let Some(callback) = &options.on_progress {
                state.progress_handlers.insert(id, callback.clone());
            }
            state
                .timeouts
                .start(id, options.timeout_config(), self.timer_scheduler(id));
        }
        tracing::debug!(id, method = %message.method, "Sending request");

        let sent = match &options.related_task {
            Some(related) => {
                self.state().request_resolvers.insert(id);
                let session_id = transport.session_id();
                self.enqueue_task_message(
                    &related.task_id,
                    QueuedMessage::Request(message),
                    session_id.as_deref(),
                )
                .await
            }
            None => {
                transport
                    .send(JsonRpcMessage::Request(message), options.send_options())
                    .await
            }
        };
        if let Err(e) = sent {
            self.discard_pending(id);
            return Err(e);
        }

        let outcome = match &options.signal {
            Some(signal) => {
                tokio::select! {
                    outcome = rx => outcome,
                    _ = signal.aborted() => {
                        let reason = ProtocolError::from_abort_reason(signal.reason());
                        self.cancel(id, reason.clone());
                        return Err(reason);
                    }
                }
            }
            None => rx.await,
        };

        let value = outcome.map_err(|_| ProtocolError::ConnectionClosed)??;
        Ok(schema.validate(value)?)
    }

    /// Drop local state for a call that never made it onto the wire.
    fn discard_pending(&self, id: i64) {
        let mut state = self.state();
        state.response_handlers.remove(&id);
        state.progress_handlers.remove(&id);
        state.request_resolvers.remove(&id);
        state.timeouts.clear(id);
    }

    /// Abandon call `id`: clean up, tell the peer, and fail the caller with
    /// `reason`.
    pub(crate) fn cancel(&self, id: i64, reason: ProtocolError) {
        let (pending, transport) = {
            let mut state = self.state();
            let pending = state.response_handlers.remove(&id);
            state.progress_handlers.remove(&id);
            state.request_resolvers.remove(&id);
            state.timeouts.clear(id);
            (pending, state.transport.clone())
        };
        let Some(pending) = pending else {
            return;
        };
        tracing::debug!(id, reason = %reason, "Cancelling request");

        if let Some(transport) = transport {
            let params = CancelledParams {
                request_id: Some(RequestId::Number(id)),
                reason: Some(reason.to_string()),
            };
            let options = pending.send_options.clone();
            let this = self.clone();
            tokio::spawn(async move {
                let notification = JsonRpcMessage::Notification(JsonRpcNotification::new(
                    CANCELLED_NOTIFICATION,
                    serde_json::to_value(params).ok(),
                ));
                if let Err(e) = transport.send(notification, options).await {
                    this.report_error(ProtocolError::Transport(format!(
                        "Failed to send cancellation: {e}"
                    )));
                }
            });
        }

        let _ = pending.tx.send(Err(reason));
    }

    /// Build the closure the timeout tracker uses to arm a timer for `id`.
    pub(crate) fn timer_scheduler(
        &self,
        id: i64,
    ) -> impl FnOnce(u64, Duration) -> JoinHandle<()> {
        let weak = self.downgrade();
        move |epoch, delay| {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(protocol) = Protocol::upgrade(&weak) {
                    protocol.on_timer_expired(id, epoch);
                }
            })
        }
    }

    fn on_timer_expired(&self, id: i64, epoch: u64) {
        let expired = self.state().timeouts.expire(id, epoch);
        if let Some(timeout) = expired {
            self.cancel(
                id,
                ProtocolError::RequestTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                },
            );
        }
    }

    /// Route a response to the call waiting on `id`.
    ///
    /// A successful result carrying `task.taskId` keeps the call's progress
    /// handler alive for the task's lifetime.
    pub(crate) fn settle_response(&self, id: i64, outcome: ProtocolResult<Value>) {
        let mut state = self.state();
        let queued = state.request_resolvers.remove(&id);
        let Some(pending) = state.response_handlers.remove(&id) else {
            drop(state);
            let message = if queued {
                format!("Response handler missing for side-channeled request {id}")
            } else {
                format!("Received a response for an unknown message ID: {id}")
            };
            self.report_error(ProtocolError::InternalError(message));
            return;
        };
        state.timeouts.clear(id);

        let task_id = outcome
            .as_ref()
            .ok()
            .and_then(|result| result.get("task")?.get("taskId")?.as_str())
            .map(str::to_string);
        match task_id {
            Some(task_id) => {
                state.task_progress_tokens.insert(task_id, id);
            }
            None => {
                state.progress_handlers.remove(&id);
            }
        }
        drop(state);

        let _ = pending.tx.send(outcome);
    }

    /// Emit a one-way notification.
    pub async fn notification(
        &self,
        notification: Notification,
        options: NotificationOptions,
    ) -> ProtocolResult<()> {
        let transport = self.transport().ok_or(ProtocolError::NotConnected)?;
        self.inner
            .options
            .capabilities
            .assert_notification_capability(&notification.method)?;

        if let Some(related) = &options.related_task {
            let params = with_meta(
                notification.params,
                RELATED_TASK_META_KEY,
                serde_json::to_value(related)?,
            );
            let message = JsonRpcNotification::new(notification.method, Some(params));
            let session_id = transport.session_id();
            return self
                .enqueue_task_message(
                    &related.task_id,
                    QueuedMessage::Notification(message),
                    session_id.as_deref(),
                )
                .await;
        }

        let send_options = TransportSendOptions {
            related_request_id: options.related_request_id.clone(),
            ..Default::default()
        };

        let debounce = notification.params.is_none()
            && options.related_request_id.is_none()
            && self
                .inner
                .options
                .debounced_notification_methods
                .iter()
                .any(|m| *m == notification.method);
        if debounce {
            if !self
                .state()
                .pending_debounced
                .insert(notification.method.clone())
            {
                return Ok(());
            }
            let this = self.clone();
            tokio::spawn(async move {
                // Repeats arriving before the send completes are dropped.
                tokio::time::sleep(DEBOUNCE_WINDOW).await;
                let method = notification.method.clone();
                if let Some(transport) = this.transport() {
                    let message = JsonRpcMessage::Notification(notification.into());
                    if let Err(e) = transport.send(message, send_options).await {
                        this.report_error(e);
                    }
                }
                this.state().pending_debounced.remove(&method);
            });
            return Ok(());
        }

        let message = JsonRpcMessage::Notification(notification.into());
        transport.send(message, send_options).await
    }
}
