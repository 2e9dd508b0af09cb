//! JSON-RPC envelope validation for inbound frames.

use taskwire::{JsonRpcMessage, ProtocolError, ProtocolResult, JSONRPC_VERSION};

/// Validate that a message is a well-formed JSON-RPC 2.0 frame.
pub fn validate_message(message: &JsonRpcMessage) -> ProtocolResult<()> {
    let version = match message {
        JsonRpcMessage::Request(r) => &r.jsonrpc,
        JsonRpcMessage::Notification(n) => &n.jsonrpc,
        JsonRpcMessage::Response(r) => &r.jsonrpc,
        JsonRpcMessage::Error(e) => &e.jsonrpc,
    };
    if version != JSONRPC_VERSION {
        return Err(ProtocolError::InvalidRequest(format!(
            "Expected jsonrpc version \"{JSONRPC_VERSION}\", got \"{version}\""
        )));
    }

    if message.method().is_some_and(str::is_empty) {
        return Err(ProtocolError::InvalidRequest(
            "Method name must not be empty".to_string(),
        ));
    }

    Ok(())
}
