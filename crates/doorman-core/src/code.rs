//! Result taxonomy: PAM return codes, message styles, and credential operations
//!
//! The tables in this module mirror the Linux-PAM client API. They are closed:
//! a value outside a table arriving from the module stack means the contract
//! with the native layer is broken, which is handled as a fatal fault rather
//! than a recoverable error.

use serde::{Deserialize, Serialize};

use crate::error::fatal;

/// PAM return code.
///
/// Like errnos, the meaning of a code depends on the call that returned it;
/// the PAM application manpages give the per-call meanings. Some members are
/// only ever seen between the framework and its service modules, but the
/// table has to cover the full shared range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum Code {
    /// Successful function return
    Success = 0,
    /// dlopen() failure when dynamically loading a service module
    OpenErr = 1,
    /// Symbol not found
    SymbolErr = 2,
    /// Error in service module
    ServiceErr = 3,
    /// System error
    SystemErr = 4,
    /// Memory buffer error
    BufErr = 5,
    /// Permission denied
    PermDenied = 6,
    /// Authentication failure
    AuthErr = 7,
    /// Can not access authentication data due to insufficient credentials
    CredInsufficient = 8,
    /// Underlying authentication service can not retrieve authentication information
    AuthinfoUnavail = 9,
    /// User not known to the underlying authentication module
    UserUnknown = 10,
    /// An authentication service has maintained a retry count which has been reached
    Maxtries = 11,
    /// New authentication token required
    NewAuthtokReqd = 12,
    /// User account has expired
    AcctExpired = 13,
    /// Can not make/remove an entry for the specified session
    SessionErr = 14,
    /// Underlying authentication service can not retrieve user credentials
    CredUnavail = 15,
    /// User credentials expired
    CredExpired = 16,
    /// Failure setting user credentials
    CredErr = 17,
    /// No module specific data is present
    NoModuleData = 18,
    /// Conversation error
    ConvErr = 19,
    /// Authentication token manipulation error
    AuthtokErr = 20,
    /// Authentication information cannot be recovered
    AuthtokRecoveryErr = 21,
    /// Authentication token lock busy
    AuthtokLockBusy = 22,
    /// Authentication token aging disabled
    AuthtokDisableAging = 23,
    /// Preliminary check by password service
    TryAgain = 24,
    /// Ignore underlying account module
    Ignore = 25,
    /// Critical error, module should fail now
    Abort = 26,
    /// User's authentication token has expired
    AuthtokExpired = 27,
    /// Module is unknown
    ModuleUnknown = 28,
    /// Bad item passed to pam_*_item()
    BadItem = 29,
    /// Conversation function is event driven and data is not available yet
    ConvAgain = 30,
    /// Please call this function again to complete the authentication stack
    Incomplete = 31,
}

/// One row per code, in raw-value order so the raw value doubles as the index.
const CODE_TABLE: [(Code, &str, &str); Code::COUNT] = [
    (Code::Success, "PAM_SUCCESS", "Successful function return"),
    (Code::OpenErr, "PAM_OPEN_ERR", "Failed to load service module"),
    (Code::SymbolErr, "PAM_SYMBOL_ERR", "Symbol not found"),
    (Code::ServiceErr, "PAM_SERVICE_ERR", "Error in service module"),
    (Code::SystemErr, "PAM_SYSTEM_ERR", "System error"),
    (Code::BufErr, "PAM_BUF_ERR", "Memory buffer error"),
    (Code::PermDenied, "PAM_PERM_DENIED", "Permission denied"),
    (Code::AuthErr, "PAM_AUTH_ERR", "Authentication failure"),
    (
        Code::CredInsufficient,
        "PAM_CRED_INSUFFICIENT",
        "Insufficient credentials to access authentication data",
    ),
    (
        Code::AuthinfoUnavail,
        "PAM_AUTHINFO_UNAVAIL",
        "Authentication service cannot retrieve authentication info",
    ),
    (
        Code::UserUnknown,
        "PAM_USER_UNKNOWN",
        "User not known to the underlying authentication module",
    ),
    (
        Code::Maxtries,
        "PAM_MAXTRIES",
        "Have exhausted maximum number of retries for service",
    ),
    (
        Code::NewAuthtokReqd,
        "PAM_NEW_AUTHTOK_REQD",
        "Authentication token is no longer valid; new one required",
    ),
    (Code::AcctExpired, "PAM_ACCT_EXPIRED", "User account has expired"),
    (
        Code::SessionErr,
        "PAM_SESSION_ERR",
        "Cannot make/remove an entry for the specified session",
    ),
    (
        Code::CredUnavail,
        "PAM_CRED_UNAVAIL",
        "Authentication service cannot retrieve user credentials",
    ),
    (Code::CredExpired, "PAM_CRED_EXPIRED", "User credentials expired"),
    (Code::CredErr, "PAM_CRED_ERR", "Failure setting user credentials"),
    (Code::NoModuleData, "PAM_NO_MODULE_DATA", "No module specific data is present"),
    (Code::ConvErr, "PAM_CONV_ERR", "Conversation error"),
    (Code::AuthtokErr, "PAM_AUTHTOK_ERR", "Authentication token manipulation error"),
    (
        Code::AuthtokRecoveryErr,
        "PAM_AUTHTOK_RECOVERY_ERR",
        "Authentication information cannot be recovered",
    ),
    (Code::AuthtokLockBusy, "PAM_AUTHTOK_LOCK_BUSY", "Authentication token lock busy"),
    (
        Code::AuthtokDisableAging,
        "PAM_AUTHTOK_DISABLE_AGING",
        "Authentication token aging disabled",
    ),
    (Code::TryAgain, "PAM_TRY_AGAIN", "Failed preliminary check by password service"),
    (Code::Ignore, "PAM_IGNORE", "The return value should be ignored by PAM dispatch"),
    (Code::Abort, "PAM_ABORT", "Critical error - immediate abort"),
    (Code::AuthtokExpired, "PAM_AUTHTOK_EXPIRED", "Authentication token expired"),
    (Code::ModuleUnknown, "PAM_MODULE_UNKNOWN", "Module is unknown"),
    (Code::BadItem, "PAM_BAD_ITEM", "Bad item passed to pam_*_item()"),
    (Code::ConvAgain, "PAM_CONV_AGAIN", "Conversation is waiting for event"),
    (
        Code::Incomplete,
        "PAM_INCOMPLETE",
        "Application needs to call libpam again",
    ),
];

impl Code {
    /// Number of codes in the taxonomy. Must track `_PAM_RETURN_VALUES`.
    pub const COUNT: usize = 32;

    /// Symbolic name, e.g. `PAM_ACCT_EXPIRED`.
    pub fn name(&self) -> &'static str {
        CODE_TABLE[*self as usize].1
    }

    /// Short human-readable description of the code.
    pub fn description(&self) -> &'static str {
        CODE_TABLE[*self as usize].2
    }

    /// Look up a code by raw value. Total over `0..COUNT`.
    pub fn from_raw(raw: u32) -> Option<Code> {
        CODE_TABLE.get(raw as usize).map(|entry| entry.0)
    }

    /// Look up a code by symbolic name.
    pub fn from_name(name: &str) -> Option<Code> {
        CODE_TABLE
            .iter()
            .find(|entry| entry.1 == name)
            .map(|entry| entry.0)
    }

    /// Convert a raw value received from the module stack.
    ///
    /// A value outside the table means libpam defines more codes than the
    /// taxonomy covers; continuing with an unknown code would leave the
    /// handle in an unknown state.
    pub fn from_native(raw: u32) -> Code {
        match Code::from_raw(raw) {
            Some(code) => code,
            None => fatal(&format!("module stack returned unknown result code {raw}")),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Code::Success)
    }
}

impl core::fmt::Display for Code {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// Message style for one conversation prompt, from `struct pam_message`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum MessageStyle {
    /// Request input with terminal echo disabled (passwords, PINs)
    PromptEchoOff = 1,
    /// Request input with terminal echo enabled (usernames)
    PromptEchoOn = 2,
    /// Display an error message; admits no answer
    ErrorMsg = 3,
    /// Display informational text; admits no answer
    TextInfo = 4,
}

impl MessageStyle {
    /// Symbolic name, e.g. `PAM_PROMPT_ECHO_OFF`.
    pub fn name(&self) -> &'static str {
        match self {
            MessageStyle::PromptEchoOff => "PAM_PROMPT_ECHO_OFF",
            MessageStyle::PromptEchoOn => "PAM_PROMPT_ECHO_ON",
            MessageStyle::ErrorMsg => "PAM_ERROR_MSG",
            MessageStyle::TextInfo => "PAM_TEXT_INFO",
        }
    }

    /// Whether this style requests input (as opposed to displaying text).
    pub fn is_prompt(&self) -> bool {
        matches!(self, MessageStyle::PromptEchoOff | MessageStyle::PromptEchoOn)
    }

    pub fn from_raw(raw: u32) -> Option<MessageStyle> {
        match raw {
            1 => Some(MessageStyle::PromptEchoOff),
            2 => Some(MessageStyle::PromptEchoOn),
            3 => Some(MessageStyle::ErrorMsg),
            4 => Some(MessageStyle::TextInfo),
            _ => None,
        }
    }

    /// Convert a raw style received from the module stack; unknown styles are
    /// a broken native contract.
    pub fn from_native(raw: u32) -> MessageStyle {
        match MessageStyle::from_raw(raw) {
            Some(style) => style,
            None => fatal(&format!("module stack sent unknown message style {raw}")),
        }
    }
}

impl core::fmt::Display for MessageStyle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// Credential operation for `setcred`, from pam_setcred(3).
///
/// The four legal operations are a closed set; combining anything else with
/// the silent bit is unrepresentable by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum CredOp {
    /// Initialize the credentials for the user
    Establish = 0x0002,
    /// Delete the user's credentials
    Delete = 0x0004,
    /// Fully reinitialize the user's credentials
    Reinitialize = 0x0008,
    /// Extend the lifetime of the existing credentials
    Refresh = 0x0010,
}

impl CredOp {
    /// Symbolic name, e.g. `PAM_ESTABLISH_CRED`.
    pub fn name(&self) -> &'static str {
        match self {
            CredOp::Establish => "PAM_ESTABLISH_CRED",
            CredOp::Delete => "PAM_DELETE_CRED",
            CredOp::Reinitialize => "PAM_REINITIALIZE_CRED",
            CredOp::Refresh => "PAM_REFRESH_CRED",
        }
    }

    /// Native flag word for this operation, optionally with the silent bit.
    pub fn flags(&self, silent: bool) -> u32 {
        let mut value = *self as u32;
        if silent {
            value |= flags::SILENT;
        }
        value
    }
}

impl core::fmt::Display for CredOp {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// Flag bits shared by the privileged operations, from `_pam_types.h`.
pub mod flags {
    /// Do not emit any messages
    pub const SILENT: u32 = 0x8000;
    /// Fail if the user has a null authentication token
    pub const DISALLOW_NULL_AUTHTOK: u32 = 0x0001;
    /// Only update an expired authentication token
    pub const CHANGE_EXPIRED_AUTHTOK: u32 = 0x0020;
}
