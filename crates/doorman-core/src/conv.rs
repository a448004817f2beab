//! Conversation value types and the application callback trait
//!
//! The module stack requests input through the conversation protocol: a
//! batch of prompt/display messages goes to the application, a positional
//! batch of replies comes back. See pam_conv(3).

use serde::{Deserialize, Serialize};

use crate::code::MessageStyle;
use crate::error::Result;

/// One message in a conversation round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// What kind of message this is and whether it requests input
    pub style: MessageStyle,
    /// Message text from the service module
    pub text: String,
}

impl Message {
    pub fn new(style: MessageStyle, text: impl Into<String>) -> Self {
        Self {
            style,
            text: text.into(),
        }
    }
}

/// Positional answer to one message.
///
/// `None` answers a prompt with "no response" (legal for PAM, though the
/// requesting module will typically reject it) and is the only legal reply
/// to a display-only message.
pub type Reply = Option<String>;

/// Application-supplied conversation callback.
///
/// Invoked by the module stack, possibly several times per privileged
/// operation. The callback may block for as long as it needs (terminal
/// interaction, network round-trips); the handle's operation lock is
/// released for the duration of the call.
///
/// Implementations own whatever private data they need. The returned batch
/// must contain exactly one reply per message, in order.
pub trait Conversation: Send + Sync {
    fn converse(&self, messages: &[Message]) -> Result<Vec<Reply>>;
}

/// Answer every prompt with "no response".
///
/// Placeholder for handles that only perform operations which are not
/// expected to converse (environment management, setcred).
pub struct NoConversation;

impl Conversation for NoConversation {
    fn converse(&self, messages: &[Message]) -> Result<Vec<Reply>> {
        Ok(vec![None; messages.len()])
    }
}
