//! Tool: echo. Returns the given text.

use serde::Deserialize;
use serde_json::{json, Value};
use taskwire::{ProtocolError, ProtocolResult};

use crate::types::{TaskSupport, ToolCallResult, ToolDefinition, ToolExecution};

#[derive(Debug, Deserialize)]
struct EchoParams {
    text: String,
}

pub fn definition() -> ToolDefinition {
    ToolDefinition {
        name: "echo".to_string(),
        description: Some("Return the given text unchanged".to_string()),
        input_schema: json!({
            "type": "object",
            "properties": {
                "text": { "type": "string", "description": "Text to echo back" }
            },
            "required": ["text"]
        }),
        execution: Some(ToolExecution {
            task_support: TaskSupport::Optional,
        }),
    }
}

pub async fn execute(args: Value) -> ProtocolResult<ToolCallResult> {
    let params: EchoParams =
        serde_json::from_value(args).map_err(|e| ProtocolError::InvalidParams(e.to_string()))?;

    Ok(ToolCallResult::text(params.text))
}
