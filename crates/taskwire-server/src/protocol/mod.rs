//! Server-side protocol wiring and request routing.

pub mod handler;
pub mod negotiation;
pub mod validator;

pub use handler::TaskServer;
