//! Module-stack boundary
//!
//! The authentication-module stack is an external subsystem; this module
//! defines exactly the surface the handle needs from it. `scripted` is an
//! in-memory backend for tests and development; `libpam` (feature `libpam`)
//! is the real thing.

use std::path::PathBuf;

use crate::code::Code;
use crate::conv::{Message, Reply};

pub mod scripted;

#[cfg(feature = "libpam")]
pub mod libpam;

/// Parameters for starting one native session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// PAM service name, selects the module configuration
    pub service: String,
    /// User the session is for
    pub user: String,
    /// Override for the module configuration directory
    pub confdir: Option<PathBuf>,
    /// Requesting (remote) user, mirrored into PAM_RUSER
    pub ruser: Option<String>,
    /// Requesting host, mirrored into PAM_RHOST
    pub rhost: Option<String>,
    /// Minimum delay after a failed authenticate, in microseconds
    /// (0 leaves the module default in place)
    pub fail_delay_usec: u32,
}

impl SessionConfig {
    pub const DEFAULT_SERVICE: &'static str = "login";

    pub fn new(user: impl Into<String>) -> Self {
        Self {
            service: Self::DEFAULT_SERVICE.to_string(),
            user: user.into(),
            confdir: None,
            ruser: None,
            rhost: None,
            fail_delay_usec: 0,
        }
    }

    pub fn service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    pub fn confdir(mut self, confdir: impl Into<PathBuf>) -> Self {
        self.confdir = Some(confdir.into());
        self
    }

    pub fn ruser(mut self, ruser: impl Into<String>) -> Self {
        self.ruser = Some(ruser.into());
        self
    }

    pub fn rhost(mut self, rhost: impl Into<String>) -> Self {
        self.rhost = Some(rhost.into());
        self
    }

    pub fn fail_delay_usec(mut self, usec: u32) -> Self {
        self.fail_delay_usec = usec;
        self
    }
}

/// Handle items mirrored into the native session, from pam_get_item(3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemKind {
    /// PAM_USER
    User,
    /// PAM_RUSER
    RemoteUser,
    /// PAM_RHOST
    RemoteHost,
}

impl ItemKind {
    /// Symbolic name, e.g. `PAM_RUSER`.
    pub fn name(&self) -> &'static str {
        match self {
            ItemKind::User => "PAM_USER",
            ItemKind::RemoteUser => "PAM_RUSER",
            ItemKind::RemoteHost => "PAM_RHOST",
        }
    }

    /// Native item type value, from `_pam_types.h`.
    pub fn raw(&self) -> u32 {
        match self {
            ItemKind::User => 2,
            ItemKind::RemoteHost => 4,
            ItemKind::RemoteUser => 8,
        }
    }
}

/// The stack's view of the conversation bridge.
///
/// Backends hand each message batch to this object and get back either a
/// fully validated reply batch or a conversation-level failure code; a
/// partially built batch is never observable.
pub trait Converse {
    fn converse(&self, messages: Vec<Message>) -> std::result::Result<Vec<Reply>, Code>;
}

/// One authentication-module stack.
///
/// Every method is a 1:1 marshalling call; ordering, locking, and outcome
/// mapping are the handle's business. Implementations must tolerate being
/// shared across threads, but a single `Session` is only ever used by one
/// operation at a time (the handle serializes access under its lock).
pub trait ModuleStack: Send + Sync {
    /// Opaque per-session state owned by the backend.
    type Session: Send + Sync;

    /// Start a session. Maps pam_start(3) / pam_start_confdir(3).
    fn start(&self, config: &SessionConfig) -> std::result::Result<Self::Session, Code>;

    /// Release a session with the given disposition. Maps pam_end(3).
    /// Called exactly once per started session.
    fn end(&self, session: &Self::Session, disposition: Code);

    /// Maps pam_authenticate(3).
    fn authenticate(&self, session: &Self::Session, flags: u32, conv: &dyn Converse) -> Code;

    /// Maps pam_acct_mgmt(3).
    fn acct_mgmt(&self, session: &Self::Session, flags: u32, conv: &dyn Converse) -> Code;

    /// Maps pam_setcred(3).
    fn setcred(&self, session: &Self::Session, flags: u32, conv: &dyn Converse) -> Code;

    /// Maps pam_open_session(3).
    fn open_session(&self, session: &Self::Session, flags: u32, conv: &dyn Converse) -> Code;

    /// Maps pam_close_session(3).
    fn close_session(&self, session: &Self::Session, flags: u32, conv: &dyn Converse) -> Code;

    /// Maps pam_chauthtok(3). The two-phase check/update protocol runs
    /// inside the stack.
    fn chauthtok(&self, session: &Self::Session, flags: u32, conv: &dyn Converse) -> Code;

    /// Maps pam_get_item(3). `Ok(None)` when the item is unset.
    fn get_item(
        &self,
        session: &Self::Session,
        item: ItemKind,
    ) -> std::result::Result<Option<String>, Code>;

    /// Maps pam_set_item(3).
    fn set_item(&self, session: &Self::Session, item: ItemKind, value: &str) -> Code;

    /// Maps pam_getenv(3). `None` when the variable is unset.
    fn getenv(&self, session: &Self::Session, name: &str) -> Option<String>;

    /// Maps pam_putenv(3): `NAME=value` sets, bare `NAME` removes.
    fn putenv(&self, session: &Self::Session, entry: &str) -> Code;

    /// Maps pam_getenvlist(3).
    fn env_list(&self, session: &Self::Session) -> Vec<(String, String)>;

    /// Maps pam_fail_delay(3).
    fn fail_delay(&self, session: &Self::Session, usec: u32) -> Code;

    /// Maps pam_strerror(3).
    fn strerror(&self, code: Code) -> String;
}
