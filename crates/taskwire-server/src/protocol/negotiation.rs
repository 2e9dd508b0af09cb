//! Capability negotiation during initialization.

use std::sync::Arc;

use taskwire::{
    ClientCapabilities, DeclaredCapabilities, Implementation, InitializeParams, InitializeResult,
    ServerCapabilities, TasksCapability, ToolsCapability, PROTOCOL_VERSION,
};

/// Methods this server will run as tasks.
pub const TASK_METHODS: &[&str] = &["tools/call"];

/// What this server advertises in `initialize`.
pub fn server_capabilities() -> ServerCapabilities {
    ServerCapabilities {
        tools: Some(ToolsCapability { list_changed: false }),
        tasks: Some(TasksCapability::for_requests(TASK_METHODS)),
        ..Default::default()
    }
}

pub fn initialize_result() -> InitializeResult {
    InitializeResult {
        protocol_version: PROTOCOL_VERSION.to_string(),
        capabilities: server_capabilities(),
        server_info: Implementation {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
        instructions: None,
    }
}

/// Client capabilities recorded after negotiation.
#[derive(Debug, Default)]
pub struct NegotiatedCapabilities {
    pub client: Option<ClientCapabilities>,
    pub client_info: Option<Implementation>,
    pub initialized: bool,
}

impl NegotiatedCapabilities {
    /// Record the client's capabilities and feed its task support into the
    /// policy used for outbound checks.
    pub fn negotiate(
        &mut self,
        params: InitializeParams,
        policy: &Arc<DeclaredCapabilities>,
    ) -> InitializeResult {
        if params.protocol_version != PROTOCOL_VERSION {
            tracing::warn!(
                "Client requested protocol version {}, server supports {}. Proceeding with server version.",
                params.protocol_version,
                PROTOCOL_VERSION
            );
        }

        policy.set_peer(params.capabilities.tasks.clone());

        tracing::info!(
            "Initialized with client: {} v{}",
            params.client_info.name,
            params.client_info.version
        );

        self.client = Some(params.capabilities);
        self.client_info = Some(params.client_info);
        initialize_result()
    }

    pub fn mark_initialized(&mut self) {
        self.initialized = true;
        tracing::info!("Handshake complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use taskwire::CapabilityPolicy;

    #[test]
    fn test_negotiate_records_peer_tasks() {
        let policy = Arc::new(DeclaredCapabilities::new(Some(
            TasksCapability::for_requests(TASK_METHODS),
        )));
        let params: InitializeParams = serde_json::from_value(json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {"tasks": {"list": {}, "requests": {"sampling": {"createMessage": {}}}}},
            "clientInfo": {"name": "test-client", "version": "1.0"}
        }))
        .unwrap();

        let mut negotiated = NegotiatedCapabilities::default();
        let result = negotiated.negotiate(params, &policy);

        assert_eq!(result.protocol_version, PROTOCOL_VERSION);
        assert!(result.capabilities.tasks.unwrap().supports_request("tools/call"));
        assert!(policy.assert_capability_for_method("tasks/list").is_ok());
        assert!(policy.assert_capability_for_method("tasks/cancel").is_err());
        assert!(policy.assert_task_capability("sampling/createMessage").is_ok());
        assert_eq!(negotiated.client_info.unwrap().name, "test-client");
        assert!(!negotiated.initialized);
    }
}
