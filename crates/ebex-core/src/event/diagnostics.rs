//! Reporting of failures that the dispatch engine swallows.
//!
//! Handler and middleware failures never reach the code that called
//! `emit`. They are packaged as a [`DispatchFailure`] and handed to the
//! engine's [`DiagnosticSink`]; [`LogSink`] is the default.
use std::fmt;
use std::sync::Arc;

use crate::event::error::EventSystemError;
use crate::event::middleware::Stage;
use crate::event::types::{EventName, HandlerId};

/// Where a swallowed failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOrigin {
    /// The handler body itself
    Handler,
    /// A stage callback attached to the handler
    Middleware(Stage),
    /// A stage callback installed with `use_middleware`
    Global(Stage),
}

impl fmt::Display for FailureOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureOrigin::Handler => f.write_str("handler"),
            FailureOrigin::Middleware(stage) => write!(f, "middleware:{stage}"),
            FailureOrigin::Global(stage) => write!(f, "global:{stage}"),
        }
    }
}

/// Structured record of one swallowed failure.
#[derive(Debug)]
pub struct DispatchFailure {
    /// Name of the bus instance, from its configuration
    pub bus: Arc<str>,
    pub event: EventName,
    pub handler_id: Option<HandlerId>,
    pub origin: FailureOrigin,
    pub error: EventSystemError,
}

impl fmt::Display for DispatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] event={} origin={}", self.bus, self.event, self.origin)?;
        if let Some(id) = self.handler_id {
            write!(f, " handler={id}")?;
        }
        write!(f, ": {}", self.error)
    }
}

/// Receiver for swallowed dispatch failures.
pub trait DiagnosticSink: Send + Sync {
    fn report(&self, failure: &DispatchFailure);
}

/// Default sink: one `log::error!` record per failure.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl DiagnosticSink for LogSink {
    fn report(&self, failure: &DispatchFailure) {
        log::error!(target: "ebex::dispatch", "{failure}");
    }
}

impl<F> DiagnosticSink for F
where
    F: Fn(&DispatchFailure) + Send + Sync,
{
    fn report(&self, failure: &DispatchFailure) {
        self(failure)
    }
}
