//! In-process publish/subscribe event bus.
//!
//! Handlers register per event name with a priority. Every emission fans
//! out into one queue entry per handler, and a single drain loop per bus
//! dequeues entries strictly by priority across all events, running each
//! through `before`/`processing`/`after` middleware stages. Handler and
//! middleware failures are reported to a diagnostic sink and never reach
//! the emitter.
pub mod config;
pub mod error;
pub mod event;

pub use config::BusConfig;
pub use error::{Error, Result};
pub use event::{
    DiagnosticSink, DispatchFailure, EventBus, EventCallback, EventData, EventHandler,
    EventSystemError, Middleware, Priority, RegisterParams, Stage, Subscription,
};
