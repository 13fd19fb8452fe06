//! Error types for the Cris runtime.
//!
//! Two families live here:
//!
//! - [`CrisError`] - infrastructure errors returned from the runtime's own API
//!   (bad runner counts, unknown commands, double resolution, ...).
//! - [`CommandFailure`] - the terminal failure of a single command. These are
//!   data, not errors of the runtime: a rejected or faulted command still
//!   completes, and its handle carries the failure.

use thiserror::Error;

use crate::token::CorrelationToken;
use crate::validation::ValidationResult;

/// Infrastructure error returned by the runtime API.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CrisError {
    /// A runner count outside `1..=max` was requested.
    #[error("parallel runner count {requested} is out of range (1..={max})")]
    InvalidRunnerCount { requested: usize, max: usize },

    /// A write-once slot was written a second time.
    #[error("{what} was already resolved")]
    AlreadyResolved { what: &'static str },

    /// A lifecycle step was attempted before validation succeeded.
    #[error("{what} attempted before a successful validation")]
    OutOfOrder { what: &'static str },

    /// No pipeline is registered for the submitted command type.
    #[error("no pipeline registered for command {command}")]
    UnknownCommand { command: &'static str },

    /// A pipeline was built without a handler.
    #[error("no handler registered for command {command}")]
    MissingHandler { command: &'static str },

    /// A pipeline was built with more than one handler.
    #[error("{count} handlers registered for command {command}, expected exactly one")]
    AmbiguousHandler { command: &'static str, count: usize },

    /// The component was created outside a Tokio runtime.
    #[error("no Tokio runtime available")]
    NoRuntime,

    /// The awaited value can no longer be produced.
    #[error("{what} closed before it was resolved")]
    Closed { what: &'static str },

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, CrisError>;

/// An unexpected failure while running a handler or post-handler.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message} (correlation {correlation})")]
pub struct ExecutionFault {
    pub message: String,
    pub correlation: CorrelationToken,
}

impl ExecutionFault {
    pub fn new(message: impl Into<String>, correlation: CorrelationToken) -> Self {
        Self {
            message: message.into(),
            correlation,
        }
    }

    /// Build a fault from a caught panic payload.
    pub(crate) fn from_panic(
        payload: Box<dyn std::any::Any + Send>,
        correlation: CorrelationToken,
    ) -> Self {
        Self::new(format!("panic: {}", panic_message(&*payload)), correlation)
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Why a command did not produce an output.
///
/// Callers can tell "rejected" apart from "failed while running".
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommandFailure {
    /// Validation produced at least one error; the handler never ran.
    #[error("rejected: {0}")]
    Rejected(ValidationResult),
    /// The handler or a post-handler failed.
    #[error("faulted: {0}")]
    Faulted(ExecutionFault),
}

impl CommandFailure {
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }

    pub fn is_faulted(&self) -> bool {
        matches!(self, Self::Faulted(_))
    }
}
