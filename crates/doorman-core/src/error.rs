//! Error types for the doorman core library

use std::fmt;
use std::panic::Location;

use thiserror::Error;

use crate::code::Code;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// A non-success outcome reported by the module stack.
///
/// Carries the typed code, its symbolic name, the native human-readable
/// description, a contextual message naming the call that failed, and the
/// source location that constructed the error.
#[derive(Debug, Clone)]
pub struct StackError {
    /// Typed outcome code
    pub code: Code,
    /// Human-readable string for the code, from the module stack
    pub err_str: String,
    /// Contextual message naming the failed call
    pub message: String,
    /// Source location that raised the error
    pub location: &'static Location<'static>,
}

impl StackError {
    #[track_caller]
    pub(crate) fn new(code: Code, err_str: String, message: impl Into<String>) -> Self {
        Self {
            code,
            err_str,
            message: message.into(),
            location: Location::caller(),
        }
    }

    /// Symbolic name of the carried code, e.g. `PAM_AUTH_ERR`.
    pub fn name(&self) -> &'static str {
        self.code.name()
    }
}

impl fmt::Display for StackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]: {}", self.code.name(), self.message)
    }
}

impl std::error::Error for StackError {}

/// Errors raised by handle operations.
///
/// `Stack` carries a native outcome and is the recoverable "the module stack
/// said no" case. Every other variant is detected at this library's boundary
/// and never carries a native code.
#[derive(Debug, Error)]
pub enum Error {
    /// Non-success outcome from the module stack
    #[error(transparent)]
    Stack(#[from] StackError),

    /// authenticate has not succeeded on this handle
    #[error("authenticate has not been successfully called on this handle")]
    NotAuthenticated,

    /// A session is already open on this handle
    #[error("session is already opened for this handle")]
    SessionAlreadyOpen,

    /// No session is open on this handle
    #[error("session is not opened for this handle")]
    SessionNotOpen,

    /// Malformed argument supplied by the caller
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The conversation callback answered with the wrong number of replies
    #[error("reply batch contains {got} entries, conversation expected {expected}")]
    ReplyCountMismatch { expected: usize, got: usize },

    /// The conversation callback answered a display-only message
    #[error("reply at index {index} answers a display-only message")]
    UnexpectedReply { index: usize },

    /// The audit hook rejected a privileged operation
    #[error("audit hook rejected {operation}: {reason}")]
    AuditRejected {
        operation: &'static str,
        reason: String,
    },

    /// PAM environment variable lookup failed
    #[error("{0}: pam environment variable not set")]
    EnvNotFound(String),

    /// The conversation callback itself failed
    #[error("conversation failed: {0}")]
    Conversation(String),
}

/// Abort on a broken contract with the native layer.
///
/// Continuing past one of these would mean operating on a handle in an
/// unknown state, so the process terminates with a diagnostic instead of
/// unwinding.
pub(crate) fn fatal(message: &str) -> ! {
    tracing::error!("fatal internal consistency fault: {message}");
    eprintln!("doorman: fatal internal consistency fault: {message}");
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_error_display() {
        let err = StackError::new(Code::AuthErr, "Authentication failure".to_string(), "pam_authenticate() failed");
        assert_eq!(err.to_string(), "[PAM_AUTH_ERR]: pam_authenticate() failed");
        assert_eq!(err.name(), "PAM_AUTH_ERR");
        assert!(err.location.file().ends_with("error.rs"));
    }

    #[test]
    fn test_usage_errors_carry_no_code() {
        let err = Error::SessionNotOpen;
        assert_eq!(err.to_string(), "session is not opened for this handle");
        assert!(!matches!(err, Error::Stack(_)));
    }
}
