//! Built-in notification payloads and method names.

use serde::{Deserialize, Serialize};

use super::message::RequestId;

pub const CANCELLED_NOTIFICATION: &str = "notifications/cancelled";
pub const PROGRESS_NOTIFICATION: &str = "notifications/progress";
pub const TASK_STATUS_NOTIFICATION: &str = "notifications/tasks/status";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProgressToken {
    String(String),
    Number(i64),
}

impl ProgressToken {
    /// The outbound message id this token refers to.
    pub fn message_id(&self) -> Option<i64> {
        match self {
            ProgressToken::Number(n) => Some(*n),
            ProgressToken::String(s) => s.parse().ok(),
        }
    }
}

/// Progress reported for a pending request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressParams {
    pub progress_token: ProgressToken,
    #[serde(flatten)]
    pub progress: Progress,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelledParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}
