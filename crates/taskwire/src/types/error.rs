//! Error types and JSON-RPC error codes for the protocol core.

use serde_json::{json, Value};

use super::message::{JsonRpcError, JsonRpcErrorObject, RequestId, JSONRPC_VERSION};

/// Standard JSON-RPC 2.0 error codes plus the session-level codes.
pub mod error_codes {
    pub const CONNECTION_CLOSED: i32 = -32000;
    pub const REQUEST_TIMEOUT: i32 = -32001;

    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
}

/// A result payload did not match the expected shape.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct ValidationError(pub String);

/// All errors surfaced by the protocol core.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Not connected")]
    NotConnected,

    #[error("Request timed out")]
    RequestTimeout { timeout_ms: u64 },

    #[error("Maximum total timeout exceeded")]
    MaxTotalTimeoutExceeded {
        max_total_timeout_ms: u64,
        total_elapsed_ms: u64,
    },

    /// The caller aborted the request; carries the abort reason.
    #[error("{0}")]
    Cancelled(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Result validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Capability not supported: {0}")]
    Capability(String),

    #[error("Transport error: {0}")]
    Transport(String),

    /// An error object received from the peer.
    #[error("{message}")]
    Remote {
        code: i32,
        message: String,
        data: Option<Value>,
    },
}

impl ProtocolError {
    pub fn code(&self) -> i32 {
        use error_codes::*;
        match self {
            ProtocolError::ConnectionClosed | ProtocolError::NotConnected => CONNECTION_CLOSED,
            ProtocolError::RequestTimeout { .. }
            | ProtocolError::MaxTotalTimeoutExceeded { .. }
            | ProtocolError::Cancelled(_) => REQUEST_TIMEOUT,
            ProtocolError::ParseError(_) => PARSE_ERROR,
            ProtocolError::InvalidRequest(_) => INVALID_REQUEST,
            ProtocolError::MethodNotFound(_) => METHOD_NOT_FOUND,
            ProtocolError::InvalidParams(_) | ProtocolError::Validation(_) => INVALID_PARAMS,
            ProtocolError::InternalError(_)
            | ProtocolError::Capability(_)
            | ProtocolError::Transport(_) => INTERNAL_ERROR,
            ProtocolError::Remote { code, .. } => *code,
        }
    }

    /// Structured data attached to the error, if any.
    pub fn data(&self) -> Option<Value> {
        match self {
            ProtocolError::RequestTimeout { timeout_ms } => Some(json!({ "timeout": timeout_ms })),
            ProtocolError::MaxTotalTimeoutExceeded {
                max_total_timeout_ms,
                total_elapsed_ms,
            } => Some(json!({
                "maxTotalTimeout": max_total_timeout_ms,
                "totalElapsed": total_elapsed_ms,
            })),
            ProtocolError::Remote { data, .. } => data.clone(),
            _ => None,
        }
    }

    /// Rebuild an error from a wire error object.
    pub fn from_error_object(error: JsonRpcErrorObject) -> Self {
        ProtocolError::Remote {
            code: error.code,
            message: error.message,
            data: error.data,
        }
    }

    /// Wrap an abort reason. Structured reasons are kept as they are.
    pub fn from_abort_reason(reason: Option<ProtocolError>) -> Self {
        reason.unwrap_or_else(|| ProtocolError::Cancelled("This operation was aborted".to_string()))
    }

    pub fn to_error_object(&self) -> JsonRpcErrorObject {
        let message = match self {
            ProtocolError::Remote { message, .. } => message.clone(),
            other => other.to_string(),
        };
        JsonRpcErrorObject {
            code: self.code(),
            message,
            data: self.data(),
        }
    }

    pub fn to_json_rpc_error(&self, id: Option<RequestId>) -> JsonRpcError {
        JsonRpcError {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            error: self.to_error_object(),
        }
    }

    /// True for errors that end a call because of time or caller abort.
    pub fn is_timeout(&self) -> bool {
        self.code() == error_codes::REQUEST_TIMEOUT
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::InternalError(e.to_string())
    }
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(ProtocolError::ConnectionClosed.code(), -32000);
        assert_eq!(ProtocolError::RequestTimeout { timeout_ms: 5 }.code(), -32001);
        assert_eq!(ProtocolError::MethodNotFound("x".into()).code(), -32601);
        assert_eq!(ProtocolError::InvalidParams("x".into()).code(), -32602);
        assert_eq!(
            ProtocolError::Remote {
                code: 42,
                message: "custom".into(),
                data: None
            }
            .code(),
            42
        );
    }

    #[test]
    fn test_timeout_data() {
        let err = ProtocolError::MaxTotalTimeoutExceeded {
            max_total_timeout_ms: 100,
            total_elapsed_ms: 120,
        };
        let obj = err.to_error_object();
        assert_eq!(obj.message, "Maximum total timeout exceeded");
        assert_eq!(obj.data.unwrap()["maxTotalTimeout"], 100);
    }

    #[test]
    fn test_remote_roundtrip_keeps_message() {
        let obj = JsonRpcErrorObject {
            code: -32602,
            message: "Task not found".into(),
            data: Some(json!({"taskId": "t1"})),
        };
        let err = ProtocolError::from_error_object(obj.clone());
        assert_eq!(err.to_error_object(), obj);
    }

    #[test]
    fn test_abort_reason_wrapping() {
        let wrapped = ProtocolError::from_abort_reason(None);
        assert!(wrapped.is_timeout());
        let kept = ProtocolError::from_abort_reason(Some(ProtocolError::ConnectionClosed));
        assert_eq!(kept, ProtocolError::ConnectionClosed);
    }
}
