//! Taskwire server: serves task-capable tools over newline-delimited
//! JSON-RPC on stdio.

pub mod config;
pub mod protocol;
pub mod tools;
pub mod transport;
pub mod types;

pub use config::ServerConfig;
pub use protocol::TaskServer;
pub use transport::StdioTransport;
