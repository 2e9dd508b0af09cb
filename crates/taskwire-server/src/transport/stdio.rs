//! Stdio transport: reads JSON-RPC from stdin, writes to stdout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;

use taskwire::{
    JsonRpcMessage, MessageExtra, ProtocolError, ProtocolResult, RequestId, Transport,
    TransportSendOptions, TransportSink,
};

use super::framing;
use crate::protocol::validator::validate_message;

type Reader = Box<dyn AsyncBufRead + Send + Unpin>;
type Writer = Arc<tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;
type SinkSlot = Arc<Mutex<Option<TransportSink>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn io_error(e: std::io::Error) -> ProtocolError {
    ProtocolError::Transport(e.to_string())
}

/// Newline-delimited JSON over a reader/writer pair, stdin/stdout by default.
pub struct StdioTransport {
    reader: Mutex<Option<Reader>>,
    writer: Writer,
    sink: SinkSlot,
    closed: Arc<AtomicBool>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl StdioTransport {
    pub fn new() -> Self {
        Self::with_io(tokio::io::stdin(), tokio::io::stdout())
    }

    pub fn with_io<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let reader: Reader = Box::new(BufReader::new(reader));
        let writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(writer);
        Self {
            reader: Mutex::new(Some(reader)),
            writer: Arc::new(tokio::sync::Mutex::new(writer)),
            sink: Arc::new(Mutex::new(None)),
            closed: Arc::new(AtomicBool::new(false)),
            reader_task: Mutex::new(None),
        }
    }
}

async fn write_frame(writer: &Writer, message: &JsonRpcMessage) -> ProtocolResult<()> {
    let framed = framing::frame_message(message)?;
    let mut writer = writer.lock().await;
    writer.write_all(framed.as_bytes()).await.map_err(io_error)?;
    writer.flush().await.map_err(io_error)
}

/// Answer a frame we could not hand to the protocol.
async fn reply_error(writer: &Writer, id: Option<RequestId>, error: &ProtocolError) {
    let response = JsonRpcMessage::Error(error.to_json_rpc_error(id));
    if let Err(e) = write_frame(writer, &response).await {
        tracing::warn!("Failed to write error response: {e}");
    }
}

async fn read_loop(
    mut reader: Reader,
    writer: Writer,
    sink: TransportSink,
    slot: SinkSlot,
    closed: Arc<AtomicBool>,
) {
    let mut line = String::new();

    tracing::info!("Stdio transport started");

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                tracing::info!("EOF on stdin, shutting down");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                sink.error(io_error(e));
                break;
            }
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let message = match framing::parse_message(trimmed) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Parse error: {e}");
                reply_error(&writer, None, &e).await;
                sink.error(e);
                continue;
            }
        };

        if let Err(e) = validate_message(&message) {
            let id = match &message {
                JsonRpcMessage::Request(request) => Some(request.id.clone()),
                _ => None,
            };
            reply_error(&writer, id, &e).await;
            continue;
        }

        sink.message(message, MessageExtra::default());
    }

    closed.store(true, Ordering::SeqCst);
    let sink = lock(&slot).take();
    if let Some(sink) = sink {
        sink.closed();
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn start(&self, sink: TransportSink) -> ProtocolResult<()> {
        let reader = lock(&self.reader)
            .take()
            .ok_or_else(|| ProtocolError::Transport("StdioTransport already started".into()))?;
        *lock(&self.sink) = Some(sink.clone());

        let task = tokio::spawn(read_loop(
            reader,
            self.writer.clone(),
            sink,
            self.sink.clone(),
            self.closed.clone(),
        ));
        *lock(&self.reader_task) = Some(task);
        Ok(())
    }

    async fn send(
        &self,
        message: JsonRpcMessage,
        _options: TransportSendOptions,
    ) -> ProtocolResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProtocolError::ConnectionClosed);
        }
        write_frame(&self.writer, &message).await
    }

    async fn close(&self) -> ProtocolResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(task) = lock(&self.reader_task).take() {
            task.abort();
        }
        let sink = lock(&self.sink).take();
        if let Some(sink) = sink {
            sink.closed();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use taskwire::TransportEvent;
    use tokio::io::{duplex, split, AsyncBufReadExt};

    #[tokio::test]
    async fn test_reads_frames_and_signals_eof() {
        let (peer, local) = duplex(1024);
        let (local_read, local_write) = split(local);
        let (_peer_read, mut peer_write) = split(peer);
        let transport = StdioTransport::with_io(local_read, local_write);
        let (sink, mut events) = TransportSink::channel();
        transport.start(sink).await.unwrap();

        peer_write
            .write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"notifications/initialized\"}\n\n")
            .await
            .unwrap();
        peer_write.shutdown().await.unwrap();

        match events.recv().await.unwrap() {
            TransportEvent::Message(JsonRpcMessage::Notification(n), _) => {
                assert_eq!(n.method, "notifications/initialized")
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(events.recv().await.unwrap(), TransportEvent::Closed));

        let err = transport
            .send(
                JsonRpcMessage::Notification(taskwire::JsonRpcNotification::new("x", None)),
                TransportSendOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err, ProtocolError::ConnectionClosed);
    }

    #[tokio::test]
    async fn test_parse_error_answered_with_null_id() {
        let (peer, local) = duplex(1024);
        let (local_read, local_write) = split(local);
        let (peer_read, mut peer_write) = split(peer);
        let transport = StdioTransport::with_io(local_read, local_write);
        let (sink, mut events) = TransportSink::channel();
        transport.start(sink).await.unwrap();

        peer_write.write_all(b"{oops\n").await.unwrap();

        let mut lines = tokio::io::BufReader::new(peer_read).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let reply: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(reply["id"], Value::Null);
        assert_eq!(reply["error"]["code"], -32700);
        assert!(matches!(
            events.recv().await.unwrap(),
            TransportEvent::Error(ProtocolError::ParseError(_))
        ));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (_peer, local) = duplex(64);
        let (local_read, local_write) = split(local);
        let transport = StdioTransport::with_io(local_read, local_write);
        let (sink, _events) = TransportSink::channel();
        transport.start(sink.clone()).await.unwrap();
        assert!(transport.start(sink).await.is_err());
    }
}
