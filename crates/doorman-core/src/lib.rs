//! Doorman Core - PAM application client for Rust
//!
//! This crate wraps one native PAM session per [`Handle`]: an application
//! creates a handle with a user and a [`Conversation`] callback, runs the
//! privileged operations (authenticate, account validation, credentials,
//! session open/close, password change) in the order the state machine
//! permits, and gets structured [`StackError`]s for every non-success
//! outcome. The module stack itself is a pluggable backend behind
//! [`ModuleStack`]: `libpam` for the real thing (feature `libpam`),
//! [`stack::scripted::ScriptedStack`] for tests and development.

pub mod audit;
pub mod code;
pub mod conv;
pub mod error;
pub mod handle;
pub mod stack;

pub use audit::{AuditEvent, AuditHook, TracingAudit};
pub use code::{flags, Code, CredOp, MessageStyle};
pub use conv::{Conversation, Message, NoConversation, Reply};
pub use error::{Error, Result, StackError};
pub use handle::Handle;
pub use stack::{Converse, ItemKind, ModuleStack, SessionConfig};

/// Handle over the system libpam.
#[cfg(feature = "libpam")]
pub type PamHandle = Handle<stack::libpam::LibPam>;
