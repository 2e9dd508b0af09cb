//! Abort signal shared between a caller and the work it started.

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::types::ProtocolError;

/// A cloneable, fire-once cancellation flag that remembers why it fired.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    token: CancellationToken,
    reason: Arc<Mutex<Option<ProtocolError>>>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire with a plain-text reason.
    pub fn abort(&self, reason: impl Into<String>) {
        self.abort_with(ProtocolError::Cancelled(reason.into()));
    }

    /// Fire with a structured reason. Only the first reason is kept.
    pub fn abort_with(&self, reason: ProtocolError) {
        {
            let mut slot = self.reason.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.token.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ProtocolError> {
        self.reason.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Completes once the signal fires.
    pub async fn aborted(&self) {
        self.token.cancelled().await;
    }
}
