//! Error types for the staged authenticator

use thiserror::Error;

use crate::authenticator::Stage;

/// Result type alias for authenticator operations
pub type Result<T> = std::result::Result<T, AuthError>;

/// Authenticator usage errors.
///
/// PAM-level outcomes are not errors here; they come back as
/// [`crate::AuthOutcome::Failed`] values so callers can drive retry flows
/// without unwinding.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Core library error
    #[error("Core error: {0}")]
    Core(#[from] doorman_core::Error),

    /// Method called in the wrong stage
    #[error("{current}: unexpected authenticator run state. Expected: {expected}")]
    WrongStage { current: Stage, expected: Stage },

    /// auth_init called while an authentication is already running
    #[error("Authentication already in progress")]
    AlreadyRunning,

    /// auth_continue called with no authentication running
    #[error("No authentication in progress")]
    NotRunning,

    /// No pam handle available - authentication may not have completed
    #[error("No pam handle available - authentication may not have completed")]
    NoHandle,

    /// The stored password was already consumed by a previous attempt
    #[error("Password has already been consumed")]
    PasswordConsumed,
}
