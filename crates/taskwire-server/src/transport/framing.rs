//! Message framing for newline-delimited JSON.

use taskwire::{JsonRpcMessage, ProtocolError, ProtocolResult};

/// Parse a single line of text as a JSON-RPC message.
pub fn parse_message(line: &str) -> ProtocolResult<JsonRpcMessage> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(ProtocolError::ParseError("Empty message".to_string()));
    }

    serde_json::from_str(trimmed).map_err(|e| ProtocolError::ParseError(e.to_string()))
}

/// Serialize a message to a JSON line (with trailing newline).
pub fn frame_message(message: &JsonRpcMessage) -> ProtocolResult<String> {
    let mut json = serde_json::to_string(message)?;
    json.push('\n');
    Ok(json)
}
