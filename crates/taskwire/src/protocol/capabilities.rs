//! Capability checks applied before sending and when registering handlers.

use std::sync::RwLock;

use crate::types::{
    ProtocolError, ProtocolResult, TasksCapability, TASKS_CANCEL, TASKS_GET, TASKS_LIST,
    TASKS_RESULT, TASK_STATUS_NOTIFICATION,
};

/// Decides whether an operation is allowed by the negotiated capabilities.
pub trait CapabilityPolicy: Send + Sync + 'static {
    /// Checked before sending a request when strict capabilities are enforced.
    fn assert_capability_for_method(&self, method: &str) -> ProtocolResult<()>;

    /// Checked before every outgoing notification.
    fn assert_notification_capability(&self, method: &str) -> ProtocolResult<()>;

    /// Checked when a request handler is registered.
    fn assert_request_handler_capability(&self, method: &str) -> ProtocolResult<()>;

    /// Checked before sending a task-augmented request.
    fn assert_task_capability(&self, method: &str) -> ProtocolResult<()>;

    /// Checked before running a handler for a task-augmented request.
    fn assert_task_handler_capability(&self, method: &str) -> ProtocolResult<()>;
}

/// Permits everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl CapabilityPolicy for AllowAll {
    fn assert_capability_for_method(&self, _method: &str) -> ProtocolResult<()> {
        Ok(())
    }

    fn assert_notification_capability(&self, _method: &str) -> ProtocolResult<()> {
        Ok(())
    }

    fn assert_request_handler_capability(&self, _method: &str) -> ProtocolResult<()> {
        Ok(())
    }

    fn assert_task_capability(&self, _method: &str) -> ProtocolResult<()> {
        Ok(())
    }

    fn assert_task_handler_capability(&self, _method: &str) -> ProtocolResult<()> {
        Ok(())
    }
}

/// Checks against the task capabilities this side declared and the ones the
/// peer advertised. The peer side is filled in once negotiation completes.
#[derive(Debug, Default)]
pub struct DeclaredCapabilities {
    local: RwLock<Option<TasksCapability>>,
    peer: RwLock<Option<TasksCapability>>,
}

impl DeclaredCapabilities {
    pub fn new(local: Option<TasksCapability>) -> Self {
        Self {
            local: RwLock::new(local),
            peer: RwLock::new(None),
        }
    }

    pub fn set_local(&self, local: Option<TasksCapability>) {
        *self.local.write().unwrap_or_else(|e| e.into_inner()) = local;
    }

    pub fn set_peer(&self, peer: Option<TasksCapability>) {
        *self.peer.write().unwrap_or_else(|e| e.into_inner()) = peer;
    }

    fn local(&self) -> Option<TasksCapability> {
        self.local.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn peer(&self) -> Option<TasksCapability> {
        self.peer.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Whether `caps` covers one of the `tasks/*` methods.
fn covers_task_method(caps: Option<&TasksCapability>, method: &str) -> Option<bool> {
    let supported = match method {
        TASKS_LIST => caps.is_some_and(|c| c.list.is_some()),
        TASKS_CANCEL => caps.is_some_and(|c| c.cancel.is_some()),
        TASKS_GET | TASKS_RESULT => caps.is_some(),
        _ => return None,
    };
    Some(supported)
}

impl CapabilityPolicy for DeclaredCapabilities {
    fn assert_capability_for_method(&self, method: &str) -> ProtocolResult<()> {
        match covers_task_method(self.peer().as_ref(), method) {
            Some(false) => Err(ProtocolError::Capability(format!(
                "Peer does not support tasks capability (required for {method})"
            ))),
            _ => Ok(()),
        }
    }

    fn assert_notification_capability(&self, method: &str) -> ProtocolResult<()> {
        if method == TASK_STATUS_NOTIFICATION && self.local().is_none() {
            return Err(ProtocolError::Capability(format!(
                "Tasks capability not declared (required for {method})"
            )));
        }
        Ok(())
    }

    fn assert_request_handler_capability(&self, method: &str) -> ProtocolResult<()> {
        match covers_task_method(self.local().as_ref(), method) {
            Some(false) => Err(ProtocolError::Capability(format!(
                "Tasks capability not declared (required for {method})"
            ))),
            _ => Ok(()),
        }
    }

    fn assert_task_capability(&self, method: &str) -> ProtocolResult<()> {
        if self.peer().is_some_and(|c| c.supports_request(method)) {
            Ok(())
        } else {
            Err(ProtocolError::Capability(format!(
                "Peer does not support task creation for {method}"
            )))
        }
    }

    fn assert_task_handler_capability(&self, method: &str) -> ProtocolResult<()> {
        if self.local().is_some_and(|c| c.supports_request(method)) {
            Ok(())
        } else {
            Err(ProtocolError::Capability(format!(
                "Task creation is not supported for {method}"
            )))
        }
    }
}
