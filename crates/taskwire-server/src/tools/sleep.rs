//! Tool: sleep. Waits, reporting progress, then answers.

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::Duration;

use taskwire::{
    Notification, ProtocolError, ProtocolResult, RequestHandlerExtra, PROGRESS_NOTIFICATION,
    PROGRESS_TOKEN_META_KEY,
};

use crate::types::{TaskSupport, ToolCallResult, ToolDefinition, ToolExecution};

#[derive(Debug, Deserialize)]
struct SleepParams {
    ms: u64,
    #[serde(default)]
    text: Option<String>,
    #[serde(default = "default_steps")]
    steps: u32,
}

fn default_steps() -> u32 {
    1
}

pub fn definition() -> ToolDefinition {
    ToolDefinition {
        name: "sleep".to_string(),
        description: Some("Sleep for the given milliseconds, then return".to_string()),
        input_schema: json!({
            "type": "object",
            "properties": {
                "ms": { "type": "integer", "minimum": 0 },
                "text": { "type": "string", "description": "Text to return when done" },
                "steps": { "type": "integer", "minimum": 1, "default": 1,
                           "description": "Progress updates to report along the way" }
            },
            "required": ["ms"]
        }),
        execution: Some(ToolExecution {
            task_support: TaskSupport::Optional,
        }),
    }
}

pub async fn execute(args: Value, extra: &RequestHandlerExtra) -> ProtocolResult<ToolCallResult> {
    let params: SleepParams =
        serde_json::from_value(args).map_err(|e| ProtocolError::InvalidParams(e.to_string()))?;

    let steps = params.steps.max(1);
    let step = Duration::from_millis(params.ms / u64::from(steps));
    let token = extra
        .meta
        .as_ref()
        .and_then(|meta| meta.get(PROGRESS_TOKEN_META_KEY))
        .cloned();

    for done in 1..=steps {
        tokio::select! {
            _ = tokio::time::sleep(step) => {}
            _ = extra.signal.aborted() => {
                return Err(ProtocolError::from_abort_reason(extra.signal.reason()));
            }
        }
        if let Some(token) = &token {
            let progress = json!({ "progressToken": token, "progress": done, "total": steps });
            extra
                .send_notification(Notification::new(PROGRESS_NOTIFICATION, Some(progress)))
                .await?;
        }
    }

    let text = params
        .text
        .unwrap_or_else(|| format!("Slept {}ms", params.ms));
    Ok(ToolCallResult::text(text))
}
