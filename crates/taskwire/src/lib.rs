//! Taskwire: a JSON-RPC 2.0 session core that multiplexes requests,
//! notifications and long-running tasks over one bidirectional transport.

pub mod protocol;
pub mod schema;
pub mod task;
pub mod transport;
pub mod types;

pub use protocol::{
    AbortSignal, AllowAll, CapabilityPolicy, DeclaredCapabilities, NotificationOptions, Protocol,
    ProtocolOptions, RequestHandlerExtra, RequestOptions, RequestTaskStore, ResponseMessage,
    ResponseStream, DEBOUNCE_WINDOW,
};
pub use schema::{AnyResult, ResultSchema, Typed};
pub use task::{
    InMemoryTaskMessageQueue, InMemoryTaskStore, QueueEntry, QueuedMessage, TaskMessageQueue,
    TaskStore,
};
pub use transport::{
    InMemoryTransport, MessageExtra, ResumptionTokenCallback, Transport, TransportEvent,
    TransportSendOptions, TransportSink,
};
pub use types::*;
