//! Conversation bridge behavior: round-trips, validation, lock suspension

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use doorman_core::stack::scripted::{Op, ScriptedStack};
use doorman_core::{
    Code, Conversation, Error, Handle, Message, MessageStyle, Reply, Result, SessionConfig,
};

/// Returns the same reply batch for every round.
struct FixedReplies(Vec<Reply>);

impl Conversation for FixedReplies {
    fn converse(&self, _messages: &[Message]) -> Result<Vec<Reply>> {
        Ok(self.0.clone())
    }
}

struct FailingCallback;

impl Conversation for FailingCallback {
    fn converse(&self, _messages: &[Message]) -> Result<Vec<Reply>> {
        Err(Error::Conversation("no password source available".to_string()))
    }
}

struct PanickingCallback;

impl Conversation for PanickingCallback {
    fn converse(&self, _messages: &[Message]) -> Result<Vec<Reply>> {
        panic!("callback blew up")
    }
}

fn mixed_batch() -> Vec<Message> {
    vec![
        Message::new(MessageStyle::PromptEchoOff, "Password: "),
        Message::new(MessageStyle::PromptEchoOn, "login: "),
        Message::new(MessageStyle::TextInfo, "Last login: yesterday"),
    ]
}

fn handle_with(
    stack: &ScriptedStack,
    conversation: Arc<dyn Conversation>,
) -> Handle<ScriptedStack> {
    Handle::new(stack.clone(), SessionConfig::new("alice"), conversation).unwrap()
}

#[test]
fn round_trip_preserves_positions() {
    let stack = ScriptedStack::new();
    stack.script_exchange(Op::Authenticate, mixed_batch(), None);
    let replies = vec![
        Some("secret123".to_string()),
        Some("alice".to_string()),
        None,
    ];
    let handle = handle_with(&stack, Arc::new(FixedReplies(replies.clone())));

    handle.authenticate(false, false).unwrap();

    // the stack received exactly the batch the callback produced
    assert_eq!(stack.replies(), vec![replies]);
    let log = handle.conversation_log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0], mixed_batch());
}

#[test]
fn empty_batch_is_legal() {
    let stack = ScriptedStack::new();
    stack.script_exchange(Op::Authenticate, Vec::new(), None);
    let handle = handle_with(&stack, Arc::new(FixedReplies(Vec::new())));

    handle.authenticate(false, false).unwrap();

    assert_eq!(stack.replies(), vec![Vec::new()]);
    assert_eq!(handle.conversation_log(), vec![Vec::new()]);
}

#[test]
fn too_few_replies_is_reported_not_truncated() {
    let stack = ScriptedStack::new();
    stack.script_exchange(Op::Authenticate, mixed_batch(), None);
    let handle = handle_with(
        &stack,
        Arc::new(FixedReplies(vec![Some("secret123".to_string()), None])),
    );

    let err = handle.authenticate(false, false).unwrap_err();
    assert!(matches!(
        err,
        Error::ReplyCountMismatch { expected: 3, got: 2 }
    ));
    // no partially built batch reached the stack
    assert!(stack.replies().is_empty());
}

#[test]
fn too_many_replies_is_reported_not_padded() {
    let stack = ScriptedStack::new();
    stack.script_exchange(Op::Authenticate, mixed_batch(), None);
    let handle = handle_with(&stack, Arc::new(FixedReplies(vec![None, None, None, None])));

    let err = handle.authenticate(false, false).unwrap_err();
    assert!(matches!(
        err,
        Error::ReplyCountMismatch { expected: 3, got: 4 }
    ));
    assert!(stack.replies().is_empty());
}

#[test]
fn display_messages_admit_no_answer() {
    let stack = ScriptedStack::new();
    stack.script_exchange(Op::Authenticate, mixed_batch(), None);
    let handle = handle_with(
        &stack,
        Arc::new(FixedReplies(vec![
            Some("secret123".to_string()),
            Some("alice".to_string()),
            Some("thanks".to_string()),
        ])),
    );

    let err = handle.authenticate(false, false).unwrap_err();
    assert!(matches!(err, Error::UnexpectedReply { index: 2 }));
    assert!(stack.replies().is_empty());
}

#[test]
fn callback_error_wins_over_native_outcome() {
    let stack = ScriptedStack::new();
    stack.script_exchange(
        Op::Authenticate,
        vec![Message::new(MessageStyle::PromptEchoOff, "Password: ")],
        None,
    );
    let handle = handle_with(&stack, Arc::new(FailingCallback));

    // the stack reports PAM_CONV_ERR, but the bridge-recorded error is
    // more precise and is the one raised
    let err = handle.authenticate(false, false).unwrap_err();
    assert!(matches!(err, Error::Conversation(_)));
    assert_eq!(handle.last_code(), Code::ConvErr);
}

#[test]
fn panicking_callback_is_contained() {
    let stack = ScriptedStack::new();
    stack.script_exchange(
        Op::Authenticate,
        vec![Message::new(MessageStyle::PromptEchoOff, "Password: ")],
        None,
    );
    let handle = handle_with(&stack, Arc::new(PanickingCallback));

    let err = handle.authenticate(false, false).unwrap_err();
    assert!(matches!(err, Error::Conversation(_)));
    // the handle stays usable after the contained panic
    handle.authenticate(false, false).unwrap();
    assert!(handle.is_authenticated());
}

#[test]
fn each_round_is_logged_in_order() {
    let stack = ScriptedStack::new();
    stack.script_exchange(
        Op::Authenticate,
        vec![Message::new(MessageStyle::PromptEchoOn, "login: ")],
        None,
    );
    stack.script_exchange(
        Op::Authenticate,
        vec![Message::new(MessageStyle::PromptEchoOff, "Password: ")],
        None,
    );
    let handle = handle_with(&stack, Arc::new(FixedReplies(vec![Some("x".to_string())])));

    handle.authenticate(false, false).unwrap();

    let log = handle.conversation_log();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0][0].style, MessageStyle::PromptEchoOn);
    assert_eq!(log[1][0].style, MessageStyle::PromptEchoOff);
}

#[test]
fn replace_conversation_swaps_for_the_next_operation() {
    let stack = ScriptedStack::new();
    stack.script_exchange(
        Op::Authenticate,
        vec![Message::new(MessageStyle::PromptEchoOff, "Password: ")],
        Some(vec![Some("new-secret".to_string())]),
    );
    let handle = handle_with(&stack, Arc::new(FixedReplies(vec![Some("old-secret".to_string())])));

    handle.replace_conversation(Arc::new(FixedReplies(vec![Some("new-secret".to_string())])));
    handle.authenticate(false, false).unwrap();
}

/// Callback that parks until the test releases it, so the test can observe
/// what the handle allows while a conversation is in flight.
struct ParkedCallback {
    entered: mpsc::Sender<()>,
    release: Mutex<mpsc::Receiver<()>>,
}

impl Conversation for ParkedCallback {
    fn converse(&self, messages: &[Message]) -> Result<Vec<Reply>> {
        self.entered.send(()).ok();
        self.release
            .lock()
            .unwrap()
            .recv()
            .map_err(|_| Error::Conversation("release channel closed".to_string()))?;
        Ok(vec![Some("secret123".to_string()); messages.len()])
    }
}

#[test]
fn lock_is_released_while_the_callback_runs() {
    let stack = ScriptedStack::new();
    stack.script_exchange(
        Op::Authenticate,
        vec![Message::new(MessageStyle::PromptEchoOff, "Password: ")],
        None,
    );
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let handle = handle_with(
        &stack,
        Arc::new(ParkedCallback {
            entered: entered_tx,
            release: Mutex::new(release_rx),
        }),
    );

    std::thread::scope(|scope| {
        let auth = scope.spawn(|| handle.authenticate(false, false));

        entered_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("callback never entered");

        // authenticate is mid-conversation on the other thread; the lock
        // must be free for other operations on this handle
        handle.setenv("CANARY", "FOO").unwrap();
        assert_eq!(handle.getenv("CANARY").unwrap(), "FOO");

        release_tx.send(()).unwrap();
        auth.join().unwrap().unwrap();
    });

    assert!(handle.is_authenticated());
}
