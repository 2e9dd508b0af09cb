//! Transport contract consumed by the protocol core.

pub mod memory;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::types::{JsonRpcMessage, ProtocolError, ProtocolResult, RequestId};

pub use memory::InMemoryTransport;

/// Per-send hints for the transport.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportSendOptions {
    /// Inbound request this message belongs to, for transports that route
    /// replies per request.
    pub related_request_id: Option<RequestId>,
    /// Token a resumable transport may use to continue an interrupted stream.
    pub resumption_token: Option<String>,
    /// Told about each new resumption token the transport issues.
    pub on_resumption_token: Option<ResumptionTokenCallback>,
}

/// Receives resumption tokens from a resumable transport.
#[derive(Clone)]
pub struct ResumptionTokenCallback(Arc<dyn Fn(String) + Send + Sync>);

impl ResumptionTokenCallback {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        Self(Arc::new(callback))
    }

    pub fn call(&self, token: String) {
        (self.0)(token)
    }
}

impl fmt::Debug for ResumptionTokenCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ResumptionTokenCallback")
    }
}

impl PartialEq for ResumptionTokenCallback {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Out-of-band data the transport attaches to an inbound message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageExtra {
    pub auth_info: Option<Value>,
    pub request_info: Option<Value>,
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    Message(JsonRpcMessage, MessageExtra),
    Error(ProtocolError),
    Closed,
}

/// Where a transport pushes inbound events once started.
#[derive(Debug, Clone)]
pub struct TransportSink {
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportSink {
    pub fn new(tx: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self { tx }
    }

    /// A sink plus the receiving end of its event channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn message(&self, message: JsonRpcMessage, extra: MessageExtra) {
        self.push(TransportEvent::Message(message, extra));
    }

    pub fn error(&self, error: ProtocolError) {
        self.push(TransportEvent::Error(error));
    }

    pub fn closed(&self) {
        self.push(TransportEvent::Closed);
    }

    fn push(&self, event: TransportEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("Transport event dropped, connection pump is gone");
        }
    }
}

/// A bidirectional message channel.
///
/// `start` is called once by `Protocol::connect`; after it returns the
/// transport delivers inbound events to the sink until it closes.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn start(&self, sink: TransportSink) -> ProtocolResult<()>;

    async fn send(&self, message: JsonRpcMessage, options: TransportSendOptions)
        -> ProtocolResult<()>;

    async fn close(&self) -> ProtocolResult<()>;

    fn session_id(&self) -> Option<String> {
        None
    }
}
