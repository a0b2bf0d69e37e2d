//! Distinguished result kinds shared by every core API (§7).
//!
//! There is no exception machinery: fallible operations either return a
//! plain [`GswError`] (parse errors, I/O, malformed configuration) or, for
//! operations with the richer five-way outcome described in the spec
//! (lock acquisition, blocking reads, queue sends), an [`Outcome<T>`].

use std::io;

/// Unrecoverable or configuration-time failure.
#[derive(thiserror::Error, Debug)]
pub enum GswError {
    #[error("{component}::{function}: {message}")]
    Failure {
        component: &'static str,
        function: &'static str,
        message: String,
    },

    #[error("resource already held")]
    Locked,

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed configuration: {0}")]
    ParseInt(#[from] std::num::ParseIntError),

    #[error("{0}")]
    Other(String),
}

impl GswError {
    pub fn failure(component: &'static str, function: &'static str, message: impl Into<String>) -> Self {
        Self::Failure {
            component,
            function,
            message: message.into(),
        }
    }
}

/// The five distinguished outcomes of §7, for operations that can block,
/// time out, or be interrupted rather than merely succeed or fail.
#[derive(Debug)]
pub enum Outcome<T> {
    Success(T),
    /// Would have blocked in nonblocking mode.
    Blocked,
    /// A signal caused a blocking wait to abort (the escape hatch fired).
    Interrupted,
    Timeout,
    /// The resource was already held by someone else.
    Locked,
}

impl<T> Outcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn into_result(self, component: &'static str, function: &'static str) -> Result<T, GswError> {
        match self {
            Outcome::Success(v) => Ok(v),
            Outcome::Blocked => Err(GswError::failure(component, function, "would block")),
            Outcome::Interrupted => Err(GswError::failure(component, function, "interrupted")),
            Outcome::Timeout => Err(GswError::failure(component, function, "timeout")),
            Outcome::Locked => Err(GswError::Locked),
        }
    }
}
