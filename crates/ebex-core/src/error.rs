//! # Ebex Core Errors
//!
//! [`Error`] gathers the subsystem errors of the crate so callers that touch
//! both configuration and the bus can use one `Result` type.
use std::result::Result as StdResult;

use thiserror::Error as ThisError;

use crate::config::ConfigError;
use crate::event::error::EventSystemError;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("Event system error: {0}")]
    EventSystem(#[from] EventSystemError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Shorthand for Result with our Error type
pub type Result<T> = StdResult<T, Error>;
