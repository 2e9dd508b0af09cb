//! Tool implementations.

pub mod echo;
pub mod registry;
pub mod sleep;

pub use registry::ToolRegistry;
