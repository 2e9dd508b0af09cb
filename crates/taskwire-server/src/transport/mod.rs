//! Transport layer for the server.

pub mod framing;
pub mod stdio;

pub use stdio::StdioTransport;
