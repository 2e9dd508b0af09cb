//! Capability structures exchanged during initialization.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

pub const PROTOCOL_VERSION: &str = "2025-11-25";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    pub version: String,
}

/// Task support advertised by either side.
///
/// `requests` is a tree keyed by method segments, so support for
/// `tools/call` is `{"tools": {"call": {}}}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TasksCapability {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<Map<String, Value>>,
}

impl TasksCapability {
    /// Full support: listing, cancelling, and task execution of `methods`.
    pub fn for_requests(methods: &[&str]) -> Self {
        let mut requests = Map::new();
        for method in methods {
            let mut segments = method.split('/');
            let Some(head) = segments.next() else {
                continue;
            };
            let mut node = requests
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            for segment in segments {
                let Value::Object(map) = node else { break };
                node = map
                    .entry(segment.to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
            }
        }
        Self {
            list: Some(Map::new()),
            cancel: Some(Map::new()),
            requests: Some(requests),
        }
    }

    /// Whether `method` may be executed as a task.
    pub fn supports_request(&self, method: &str) -> bool {
        let Some(requests) = &self.requests else {
            return false;
        };
        let mut segments = method.split('/');
        let Some(head) = segments.next() else {
            return false;
        };
        let mut node = match requests.get(head) {
            Some(node) => node,
            None => return false,
        };
        for segment in segments {
            match node.get(segment) {
                Some(next) => node = next,
                None => return false,
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientCapabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experimental: Option<HashMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elicitation: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasks: Option<TasksCapability>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsCapability {
    #[serde(default)]
    pub list_changed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerCapabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experimental: Option<HashMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolsCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasks: Option<TasksCapability>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: ClientCapabilities,
    pub client_info: Implementation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    pub capabilities: ServerCapabilities,
    pub server_info: Implementation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_tree() {
        let caps = TasksCapability::for_requests(&["tools/call"]);
        let value = serde_json::to_value(&caps).unwrap();
        assert_eq!(value["requests"], json!({"tools": {"call": {}}}));
        assert!(caps.supports_request("tools/call"));
        assert!(!caps.supports_request("tools/list"));
        assert!(!caps.supports_request("sampling/createMessage"));
    }

    #[test]
    fn test_client_capabilities_parse() {
        let caps: ClientCapabilities = serde_json::from_value(json!({
            "tasks": {"requests": {"sampling": {"createMessage": {}}}}
        }))
        .unwrap();
        let tasks = caps.tasks.unwrap();
        assert!(tasks.supports_request("sampling/createMessage"));
        assert!(tasks.list.is_none());
    }
}
