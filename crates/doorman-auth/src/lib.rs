//! Doorman Auth - staged PAM authentication flows
//!
//! Builds on `doorman-core` to drive full login lifecycles: a
//! [`PamAuthenticator`] runs authenticate on a worker thread and turns
//! conversation rounds into values a request/response caller can relay
//! ([`AuthOutcome::Prompts`] / [`PamAuthenticator::auth_continue`]);
//! a [`SimpleAuthenticator`] answers prompts from credentials captured
//! up front.

pub mod authenticator;
pub mod error;
pub mod simple;

pub use authenticator::{AccountFlag, AuthOutcome, PamAuthenticator, Stage, UserInfo};
pub use error::{AuthError, Result};
pub use simple::SimpleAuthenticator;
