//! # Ebex Event System Errors
//!
//! Defines [`EventSystemError`], the error enum for the event bus.
//!
//! Only the name-validation variants ever reach a caller. The callback
//! variants describe failures that the dispatch engine catches, hands to the
//! diagnostic sink and then suppresses.
use thiserror::Error;

/// Boxed error returned by handler and middleware callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum EventSystemError {
    #[error("Event name cannot be empty")]
    EmptyEventName,

    #[error("Event name must be a string: {reason}")]
    InvalidEventName {
        reason: String,
    },

    #[error("Callback returned an error: {source}")]
    Callback {
        #[source]
        source: BoxError,
    },

    #[error("Callback panicked: {message}")]
    CallbackPanicked {
        message: String,
    },
}

impl EventSystemError {
    /// True for the errors that registration-time validation produces.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            EventSystemError::EmptyEventName | EventSystemError::InvalidEventName { .. }
        )
    }
}
