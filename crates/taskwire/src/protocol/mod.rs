//! The protocol router: request/response correlation, handler dispatch,
//! timeouts, progress, cancellation and task plumbing over one transport.

pub mod capabilities;
pub mod handlers;
mod inbound;
mod outbound;
mod progress;
pub mod signal;
pub mod stream;
pub mod tasks;
pub mod timeout;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::oneshot;
use tokio::time::Duration;

use crate::task::{TaskMessageQueue, TaskStore};
use crate::transport::{
    ResumptionTokenCallback, Transport, TransportSendOptions, TransportSink,
};
use crate::types::{
    Progress, ProtocolError, ProtocolResult, RelatedTask, RequestId, TaskCreationParams,
};

pub use capabilities::{AllowAll, CapabilityPolicy, DeclaredCapabilities};
pub use handlers::{NotificationHandlerFn, RequestHandlerExtra, RequestHandlerFn};
pub use signal::AbortSignal;
pub use stream::{ResponseMessage, ResponseStream};
pub use tasks::RequestTaskStore;
pub use timeout::{TimeoutConfig, DEFAULT_REQUEST_TIMEOUT};

use handlers::HandlerRegistry;
use timeout::TimeoutTracker;

/// How long a debounced notification waits for repeats before it is sent.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(5);

pub type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;
pub type CloseHook = Arc<dyn Fn() + Send + Sync>;
pub type ErrorHook = Arc<dyn Fn(&ProtocolError) + Send + Sync>;

/// Construction-time options.
#[derive(Clone)]
pub struct ProtocolOptions {
    /// Check the peer's capabilities before sending requests.
    pub enforce_strict_capabilities: bool,
    /// Parameterless notifications of these methods sent within
    /// [`DEBOUNCE_WINDOW`] of each other go out once.
    pub debounced_notification_methods: Vec<String>,
    pub task_store: Option<Arc<dyn TaskStore>>,
    pub task_message_queue: Option<Arc<dyn TaskMessageQueue>>,
    pub max_task_queue_size: Option<usize>,
    /// Milliseconds between task polls when the task names no interval.
    pub default_task_poll_interval: Option<u64>,
    pub capabilities: Arc<dyn CapabilityPolicy>,
}

impl Default for ProtocolOptions {
    fn default() -> Self {
        Self {
            enforce_strict_capabilities: false,
            debounced_notification_methods: Vec::new(),
            task_store: None,
            task_message_queue: None,
            max_task_queue_size: None,
            default_task_poll_interval: None,
            capabilities: Arc::new(AllowAll),
        }
    }
}

impl ProtocolOptions {
    pub fn strict_capabilities(mut self, enforce: bool) -> Self {
        self.enforce_strict_capabilities = enforce;
        self
    }

    pub fn debounce(mut self, method: impl Into<String>) -> Self {
        self.debounced_notification_methods.push(method.into());
        self
    }

    pub fn with_task_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.task_store = Some(store);
        self
    }

    pub fn with_task_message_queue(mut self, queue: Arc<dyn TaskMessageQueue>) -> Self {
        self.task_message_queue = Some(queue);
        self
    }

    pub fn with_max_task_queue_size(mut self, size: usize) -> Self {
        self.max_task_queue_size = Some(size);
        self
    }

    pub fn with_default_task_poll_interval(mut self, interval_ms: u64) -> Self {
        self.default_task_poll_interval = Some(interval_ms);
        self
    }

    pub fn with_capabilities(mut self, capabilities: Arc<dyn CapabilityPolicy>) -> Self {
        self.capabilities = capabilities;
        self
    }
}

/// Per-request options.
#[derive(Clone, Default)]
pub struct RequestOptions {
    /// Time allowed between progress updates; defaults to 60s.
    pub timeout: Option<Duration>,
    /// Hard cap on total time regardless of progress.
    pub max_total_timeout: Option<Duration>,
    pub reset_timeout_on_progress: bool,
    pub on_progress: Option<ProgressCallback>,
    pub signal: Option<AbortSignal>,
    /// Ask the receiver to run the request as a task.
    pub task: Option<TaskCreationParams>,
    /// Queue the request for delivery through `tasks/result` of this task.
    pub related_task: Option<RelatedTask>,
    pub related_request_id: Option<RequestId>,
    pub resumption_token: Option<String>,
    pub on_resumption_token: Option<ResumptionTokenCallback>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_total_timeout(mut self, max: Duration) -> Self {
        self.max_total_timeout = Some(max);
        self
    }

    pub fn reset_timeout_on_progress(mut self) -> Self {
        self.reset_timeout_on_progress = true;
        self
    }

    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(Progress) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(callback));
        self
    }

    pub fn with_signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn with_task(mut self, task: TaskCreationParams) -> Self {
        self.task = Some(task);
        self
    }

    pub fn with_related_task(mut self, task_id: impl Into<String>) -> Self {
        self.related_task = Some(RelatedTask::new(task_id));
        self
    }

    pub fn with_related_request_id(mut self, id: RequestId) -> Self {
        self.related_request_id = Some(id);
        self
    }

    pub fn with_resumption_token(mut self, token: impl Into<String>) -> Self {
        self.resumption_token = Some(token.into());
        self
    }

    pub fn on_resumption_token<F>(mut self, callback: F) -> Self
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.on_resumption_token = Some(ResumptionTokenCallback::new(callback));
        self
    }

    /// Hints passed to the transport for this request and its cancellation.
    fn send_options(&self) -> TransportSendOptions {
        TransportSendOptions {
            related_request_id: self.related_request_id.clone(),
            resumption_token: self.resumption_token.clone(),
            on_resumption_token: self.on_resumption_token.clone(),
        }
    }

    fn timeout_config(&self) -> TimeoutConfig {
        TimeoutConfig {
            timeout: self.timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            max_total_timeout: self.max_total_timeout,
            reset_on_progress: self.reset_timeout_on_progress,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotificationOptions {
    pub related_request_id: Option<RequestId>,
    /// Queue the notification for delivery through `tasks/result`.
    pub related_task: Option<RelatedTask>,
}

pub(crate) struct PendingCall {
    tx: oneshot::Sender<ProtocolResult<serde_json::Value>>,
    send_options: TransportSendOptions,
}

/// Everything that changes as messages flow. Never held across an await.
#[derive(Default)]
pub(crate) struct ConnectionState {
    transport: Option<Arc<dyn Transport>>,
    generation: u64,
    response_handlers: HashMap<i64, PendingCall>,
    progress_handlers: HashMap<i64, ProgressCallback>,
    timeouts: TimeoutTracker,
    /// taskId → id of the request that created the task.
    task_progress_tokens: HashMap<String, i64>,
    /// Ids of requests that were queued instead of sent.
    request_resolvers: HashSet<i64>,
    inbound: HashMap<RequestId, AbortSignal>,
    pending_debounced: HashSet<String>,
}

pub(crate) struct Inner {
    options: ProtocolOptions,
    state: Mutex<ConnectionState>,
    handlers: Mutex<HandlerRegistry>,
    next_id: AtomicI64,
    on_close: Mutex<Option<CloseHook>>,
    on_error: Mutex<Option<ErrorHook>>,
}

/// One side of a JSON-RPC session. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Protocol {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Protocol {
    pub fn new(options: ProtocolOptions) -> Self {
        let has_store = options.task_store.is_some();
        let protocol = Self {
            inner: Arc::new(Inner {
                options,
                state: Mutex::new(ConnectionState::default()),
                handlers: Mutex::new(HandlerRegistry::default()),
                next_id: AtomicI64::new(0),
                on_close: Mutex::new(None),
                on_error: Mutex::new(None),
            }),
        };
        protocol.install_builtin_handlers();
        if has_store {
            protocol.install_task_handlers();
        }
        protocol
    }

    pub fn options(&self) -> &ProtocolOptions {
        &self.inner.options
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, ConnectionState> {
        lock(&self.inner.state)
    }

    pub(crate) fn downgrade(&self) -> Weak<Inner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    fn next_message_id(&self) -> i64 {
        self.inner.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Attach a transport and start it.
    ///
    /// Replaces any current transport. Events from the previous transport are
    /// ignored from here on and its pending calls are left to time out.
    pub async fn connect(&self, transport: Arc<dyn Transport>) -> ProtocolResult<()> {
        let (sink, events) = TransportSink::channel();
        let generation = {
            let mut state = self.state();
            state.generation += 1;
            state.transport = Some(transport.clone());
            state.generation
        };
        tokio::spawn(inbound::pump(self.downgrade(), events, generation));
        tracing::debug!(generation, "Transport attached");
        transport.start(sink).await
    }

    /// Close the current transport. Pending calls fail with
    /// `ConnectionClosed` once the transport reports the close.
    pub async fn close(&self) -> ProtocolResult<()> {
        let transport = self.transport();
        match transport {
            Some(transport) => transport.close().await,
            None => Ok(()),
        }
    }

    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.state().transport.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state().transport.is_some()
    }

    pub fn set_on_close<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *lock(&self.inner.on_close) = Some(Arc::new(hook));
    }

    pub fn set_on_error<F>(&self, hook: F)
    where
        F: Fn(&ProtocolError) + Send + Sync + 'static,
    {
        *lock(&self.inner.on_error) = Some(Arc::new(hook));
    }

    /// Report a problem that has no caller to return it to.
    pub(crate) fn report_error(&self, error: ProtocolError) {
        tracing::warn!(error = %error, "Protocol error");
        let hook = lock(&self.inner.on_error).clone();
        if let Some(hook) = hook {
            hook(&error);
        }
    }

    pub(crate) fn close_hook(&self) -> Option<CloseHook> {
        lock(&self.inner.on_close).clone()
    }

    /// Number of outbound calls still awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.state().response_handlers.len()
    }

    /// Whether a progress handler is registered for message `id`.
    pub fn has_progress_handler(&self, id: i64) -> bool {
        self.state().progress_handlers.contains_key(&id)
    }

    /// Whether a timeout is armed for message `id`.
    pub fn has_timeout(&self, id: i64) -> bool {
        self.state().timeouts.contains(id)
    }

    /// Whether an inbound request with `id` still has a running handler.
    pub fn is_handling(&self, id: &RequestId) -> bool {
        self.state().inbound.contains_key(id)
    }
}
