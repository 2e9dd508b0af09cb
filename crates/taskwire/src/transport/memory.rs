//! In-process transport pair.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{MessageExtra, Transport, TransportSendOptions, TransportSink};
use crate::types::{JsonRpcMessage, ProtocolError, ProtocolResult};

#[derive(Default)]
struct Endpoint {
    sink: Option<TransportSink>,
    /// Messages that arrived before `start`.
    backlog: Vec<JsonRpcMessage>,
    closed: bool,
}

/// One side of a linked pair. Whatever one side sends, the other receives.
pub struct InMemoryTransport {
    local: Arc<Mutex<Endpoint>>,
    peer: Arc<Mutex<Endpoint>>,
    session_id: Option<String>,
}

fn lock(endpoint: &Mutex<Endpoint>) -> std::sync::MutexGuard<'_, Endpoint> {
    endpoint.lock().unwrap_or_else(|e| e.into_inner())
}

impl InMemoryTransport {
    pub fn create_linked_pair() -> (Self, Self) {
        let a = Arc::new(Mutex::new(Endpoint::default()));
        let b = Arc::new(Mutex::new(Endpoint::default()));
        (
            Self {
                local: a.clone(),
                peer: b.clone(),
                session_id: None,
            },
            Self {
                local: b,
                peer: a,
                session_id: None,
            },
        )
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    fn shut(endpoint: &Mutex<Endpoint>) {
        let sink = {
            let mut ep = lock(endpoint);
            if ep.closed {
                return;
            }
            ep.closed = true;
            ep.sink.take()
        };
        if let Some(sink) = sink {
            sink.closed();
        }
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn start(&self, sink: TransportSink) -> ProtocolResult<()> {
        let mut ep = lock(&self.local);
        if ep.sink.is_some() {
            return Err(ProtocolError::Transport(
                "InMemoryTransport already started".to_string(),
            ));
        }
        for message in ep.backlog.drain(..) {
            sink.message(message, MessageExtra::default());
        }
        if ep.closed {
            sink.closed();
        } else {
            ep.sink = Some(sink);
        }
        Ok(())
    }

    async fn send(
        &self,
        message: JsonRpcMessage,
        _options: TransportSendOptions,
    ) -> ProtocolResult<()> {
        if lock(&self.local).closed {
            return Err(ProtocolError::ConnectionClosed);
        }
        let mut peer = lock(&self.peer);
        if peer.closed {
            return Err(ProtocolError::ConnectionClosed);
        }
        match &peer.sink {
            Some(sink) => sink.message(message, MessageExtra::default()),
            None => peer.backlog.push(message),
        }
        Ok(())
    }

    async fn close(&self) -> ProtocolResult<()> {
        Self::shut(&self.local);
        Self::shut(&self.peer);
        Ok(())
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.clone()
    }
}
