//! Progress routing and inbound cancellation.

use super::Protocol;
use crate::types::{CancelledParams, ProgressParams, ProtocolError};

impl Protocol {
    /// Deliver a progress update to the call that owns the token, re-arming its
    /// timer when the call asked for that.
    pub(crate) fn handle_progress(&self, params: ProgressParams) {
        let token = params.progress_token;
        let Some(id) = token.message_id() else {
            self.report_error(ProtocolError::InternalError(format!(
                "Received a progress notification for an unknown token: {token:?}"
            )));
            return;
        };

        let (handler, failed) = {
            let mut state = self.state();
            let Some(handler) = state.progress_handlers.get(&id).cloned() else {
                drop(state);
                self.report_error(ProtocolError::InternalError(format!(
                    "Received a progress notification for an unknown token: {id}"
                )));
                return;
            };

            let mut failed = None;
            if state.response_handlers.contains_key(&id) && state.timeouts.resets_on_progress(id) {
                if let Err(error) = state.timeouts.reset(id, self.timer_scheduler(id)) {
                    let pending = state.response_handlers.remove(&id);
                    state.progress_handlers.remove(&id);
                    state.timeouts.clear(id);
                    failed = Some((pending, error));
                }
            }
            (handler, failed)
        };

        if let Some((pending, error)) = failed {
            tracing::debug!(id, error = %error, "Progress arrived past the total timeout");
            if let Some(pending) = pending {
                let _ = pending.tx.send(Err(error));
            }
            return;
        }

        handler(params.progress);
    }

    /// Fire the abort signal of a running inbound request.
    pub(crate) fn handle_cancelled(&self, params: CancelledParams) {
        let Some(request_id) = params.request_id else {
            return;
        };
        let signal = self.state().inbound.get(&request_id).cloned();
        if let Some(signal) = signal {
            tracing::debug!(id = %request_id, reason = ?params.reason, "Peer cancelled request");
            match params.reason {
                Some(reason) => signal.abort(reason),
                None => signal.abort("This operation was aborted"),
            }
        }
    }

    /// Forget the progress handler kept alive for `task_id`.
    pub(crate) fn cleanup_task_progress_handler(&self, task_id: &str) {
        let mut state = self.state();
        if let Some(id) = state.task_progress_tokens.remove(task_id) {
            state.progress_handlers.remove(&id);
        }
    }
}
