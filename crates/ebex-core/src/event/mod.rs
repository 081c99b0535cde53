pub mod diagnostics;
pub mod dispatcher;
pub mod error;
pub mod manager;
pub mod middleware;
pub mod queue;
pub mod registry;
pub mod types;

use std::sync::Arc;

use async_trait::async_trait;

/// Outcome of a handler or middleware callback. An `Err` (or a panic) is
/// reported to the diagnostic sink and otherwise ignored.
pub type CallbackResult = Result<(), BoxError>;

/// Asynchronous event handler trait
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, data: EventData) -> CallbackResult;
}

/// Shared handler reference. The allocation doubles as the handler's
/// identity for [`EventBus::off`].
pub type EventCallback = Arc<dyn EventHandler>;

/// True if `a` and `b` are the same handler allocation.
pub fn same_callback(a: &EventCallback, b: &EventCallback) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Re-export important types
pub use diagnostics::{DiagnosticSink, DispatchFailure, FailureOrigin, LogSink};
pub use dispatcher::{DispatchEngine, handler_fn, sync_handler};
pub use error::{BoxError, EventSystemError};
pub use manager::{EventBus, EventBusBuilder, MiddlewareRegistration, RegisterParams, Subscription};
pub use middleware::{Middleware, MiddlewareCallback, MiddlewareContext, Stage, StageCallback, middleware_fn, sync_middleware};
pub use queue::{Prioritized, PriorityQueue, QueueEntry};
pub use registry::{Handler, HandlerRegistry};
pub use types::{EventData, EventName, HandlerId, MAX_PRIORITY, Priority};

// Test module declaration
#[cfg(test)]
mod tests;
