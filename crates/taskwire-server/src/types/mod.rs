//! Tool data types used by the server.

pub mod request;
pub mod response;

pub use request::*;
pub use response::*;
