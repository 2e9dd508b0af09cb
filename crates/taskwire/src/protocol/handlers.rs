//! Handler registration and the context passed to request handlers.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};

use super::{lock, AbortSignal, NotificationOptions, Protocol, RequestOptions, RequestTaskStore};
use crate::schema::ResultSchema;
use crate::types::{
    JsonRpcNotification, JsonRpcRequest, Notification, ProtocolError, ProtocolResult,
    RelatedTask, Request, RequestId, TaskStatus,
};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

pub type RequestHandlerFn = Arc<
    dyn Fn(JsonRpcRequest, RequestHandlerExtra) -> BoxFuture<ProtocolResult<Value>> + Send + Sync,
>;

pub type NotificationHandlerFn =
    Arc<dyn Fn(JsonRpcNotification) -> BoxFuture<ProtocolResult<()>> + Send + Sync>;

#[derive(Default)]
pub(crate) struct HandlerRegistry {
    requests: HashMap<String, RequestHandlerFn>,
    notifications: HashMap<String, NotificationHandlerFn>,
    fallback_request: Option<RequestHandlerFn>,
    fallback_notification: Option<NotificationHandlerFn>,
}

impl HandlerRegistry {
    pub fn request(&self, method: &str) -> Option<RequestHandlerFn> {
        self.requests
            .get(method)
            .or(self.fallback_request.as_ref())
            .cloned()
    }

    pub fn notification(&self, method: &str) -> Option<NotificationHandlerFn> {
        self.notifications
            .get(method)
            .or(self.fallback_notification.as_ref())
            .cloned()
    }
}

/// Context handed to every request handler.
#[derive(Clone)]
pub struct RequestHandlerExtra {
    /// Fires when the peer cancels this request.
    pub signal: AbortSignal,
    pub session_id: Option<String>,
    /// `params._meta` of the request.
    pub meta: Option<Map<String, Value>>,
    pub request_id: RequestId,
    /// Task this request belongs to, from the related-task metadata.
    pub task_id: Option<String>,
    /// Present when the protocol has a task store.
    pub task_store: Option<RequestTaskStore>,
    /// Ttl the caller asked for when requesting task execution.
    pub task_requested_ttl: Option<u64>,
    pub auth_info: Option<Value>,
    pub request_info: Option<Value>,
    pub(crate) protocol: Protocol,
}

impl RequestHandlerExtra {
    /// Send a notification tied to this request (and its task, if any).
    pub async fn send_notification(&self, notification: Notification) -> ProtocolResult<()> {
        let options = NotificationOptions {
            related_request_id: Some(self.request_id.clone()),
            related_task: self.task_id.clone().map(RelatedTask::new),
        };
        self.protocol.notification(notification, options).await
    }

    /// Send a request to the peer on behalf of this request.
    ///
    /// Inside a task the task moves to `input_required` first, and the request
    /// is queued for delivery through `tasks/result`.
    pub async fn send_request<S: ResultSchema>(
        &self,
        request: Request,
        schema: S,
        mut options: RequestOptions,
    ) -> ProtocolResult<S::Output> {
        options.related_request_id = Some(self.request_id.clone());
        if options.related_task.is_none() {
            options.related_task = self.task_id.clone().map(RelatedTask::new);
        }
        if let (Some(related), Some(store)) = (&options.related_task, &self.task_store) {
            store
                .update_task_status(&related.task_id, TaskStatus::InputRequired, None)
                .await?;
        }
        self.protocol.request(request, schema, options).await
    }

    /// The protocol this request arrived on.
    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }
}

pub(crate) fn boxed_request_handler<F, Fut>(handler: F) -> RequestHandlerFn
where
    F: Fn(JsonRpcRequest, RequestHandlerExtra) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ProtocolResult<Value>> + Send + 'static,
{
    let boxed = move |request: JsonRpcRequest, extra: RequestHandlerExtra| {
        Box::pin(handler(request, extra)) as BoxFuture<ProtocolResult<Value>>
    };
    Arc::new(boxed)
}

pub(crate) fn boxed_notification_handler<F, Fut>(handler: F) -> NotificationHandlerFn
where
    F: Fn(JsonRpcNotification) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ProtocolResult<()>> + Send + 'static,
{
    Arc::new(
        move |notification: JsonRpcNotification| -> BoxFuture<ProtocolResult<()>> {
            Box::pin(handler(notification))
        },
    )
}

pub(crate) fn decode_params<P: DeserializeOwned>(params: Option<Value>) -> ProtocolResult<P> {
    serde_json::from_value(params.unwrap_or_else(|| json!({})))
        .map_err(|e| ProtocolError::InvalidParams(e.to_string()))
}

impl Protocol {
    pub(crate) fn install_request_handler(&self, method: &str, handler: RequestHandlerFn) {
        lock(&self.inner.handlers)
            .requests
            .insert(method.to_string(), handler);
    }

    pub(crate) fn install_notification_handler(
        &self,
        method: &str,
        handler: NotificationHandlerFn,
    ) {
        lock(&self.inner.handlers)
            .notifications
            .insert(method.to_string(), handler);
    }

    pub(crate) fn request_handler(&self, method: &str) -> Option<RequestHandlerFn> {
        lock(&self.inner.handlers).request(method)
    }

    pub(crate) fn notification_handler(&self, method: &str) -> Option<NotificationHandlerFn> {
        lock(&self.inner.handlers).notification(method)
    }

    /// Register the handler for `method`, replacing any existing one.
    pub fn set_request_handler<F, Fut>(&self, method: &str, handler: F) -> ProtocolResult<()>
    where
        F: Fn(JsonRpcRequest, RequestHandlerExtra) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ProtocolResult<Value>> + Send + 'static,
    {
        self.inner
            .options
            .capabilities
            .assert_request_handler_capability(method)?;
        self.install_request_handler(method, boxed_request_handler(handler));
        Ok(())
    }

    /// Register a handler whose params and result go through serde.
    /// Params that do not decode fail with `InvalidParams`.
    pub fn set_typed_request_handler<P, R, F, Fut>(
        &self,
        method: &str,
        handler: F,
    ) -> ProtocolResult<()>
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(P, RequestHandlerExtra) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ProtocolResult<R>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.set_request_handler(method, move |request, extra| {
            let handler = handler.clone();
            async move {
                let params = decode_params::<P>(request.params)?;
                let result = (*handler)(params, extra).await?;
                serde_json::to_value(result).map_err(ProtocolError::from)
            }
        })
    }

    pub fn remove_request_handler(&self, method: &str) {
        lock(&self.inner.handlers).requests.remove(method);
    }

    /// Fails if a handler for `method` is already registered.
    pub fn assert_can_set_request_handler(&self, method: &str) -> ProtocolResult<()> {
        if lock(&self.inner.handlers).requests.contains_key(method) {
            return Err(ProtocolError::InternalError(format!(
                "A request handler for {method} already exists, which would be overridden"
            )));
        }
        Ok(())
    }

    /// Handler for requests with no registered method.
    pub fn set_fallback_request_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(JsonRpcRequest, RequestHandlerExtra) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ProtocolResult<Value>> + Send + 'static,
    {
        lock(&self.inner.handlers).fallback_request = Some(boxed_request_handler(handler));
    }

    pub fn set_notification_handler<F, Fut>(&self, method: &str, handler: F)
    where
        F: Fn(JsonRpcNotification) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ProtocolResult<()>> + Send + 'static,
    {
        self.install_notification_handler(method, boxed_notification_handler(handler));
    }

    pub fn set_typed_notification_handler<P, F, Fut>(&self, method: &str, handler: F)
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ProtocolResult<()>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.set_notification_handler(method, move |notification| {
            let handler = handler.clone();
            async move {
                let params = decode_params::<P>(notification.params)?;
                (*handler)(params).await
            }
        });
    }

    pub fn remove_notification_handler(&self, method: &str) {
        lock(&self.inner.handlers).notifications.remove(method);
    }

    pub fn set_fallback_notification_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(JsonRpcNotification) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ProtocolResult<()>> + Send + 'static,
    {
        lock(&self.inner.handlers).fallback_notification =
            Some(boxed_notification_handler(handler));
    }

    /// `ping`. Cancellation and progress are routed by the pump itself.
    pub(crate) fn install_builtin_handlers(&self) {
        self.install_request_handler("ping", boxed_request_handler(|_, _| async { Ok(json!({})) }));
    }

    /// Whether `method` has a handler of its own, ignoring the fallback.
    pub(crate) fn has_notification_handler(&self, method: &str) -> bool {
        lock(&self.inner.handlers).notifications.contains_key(method)
    }
}
