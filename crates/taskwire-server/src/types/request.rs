//! Tool request parameter types.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use taskwire::TaskCreationParams;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallParams {
    pub name: String,
    #[serde(default)]
    pub arguments: Option<Value>,
    /// Present when the caller wants the call run as a task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<TaskCreationParams>,
}
