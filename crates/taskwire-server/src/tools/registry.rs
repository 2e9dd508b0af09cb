//! Tool registration and dispatch.

use serde_json::Value;
use taskwire::{ProtocolError, ProtocolResult, RequestHandlerExtra};

use crate::types::{ToolCallResult, ToolDefinition};

use super::{echo, sleep};

pub struct ToolRegistry;

impl ToolRegistry {
    pub fn list_tools() -> Vec<ToolDefinition> {
        vec![echo::definition(), sleep::definition()]
    }

    pub async fn call(
        name: &str,
        arguments: Option<Value>,
        extra: &RequestHandlerExtra,
    ) -> ProtocolResult<ToolCallResult> {
        let args = arguments.unwrap_or(Value::Object(serde_json::Map::new()));

        match name {
            "echo" => echo::execute(args).await,
            "sleep" => sleep::execute(args, extra).await,
            _ => Err(ProtocolError::InvalidParams(format!("Unknown tool: {name}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_names() {
        let names: Vec<String> = ToolRegistry::list_tools()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["echo", "sleep"]);
    }
}
