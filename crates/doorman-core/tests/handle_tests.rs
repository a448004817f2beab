//! Handle state machine and lifecycle behavior over the scripted stack

use std::sync::Arc;

use doorman_core::stack::scripted::{Op, ScriptedStack};
use doorman_core::{
    AuditEvent, AuditHook, Code, Conversation, CredOp, Error, Handle, ItemKind, Message,
    MessageStyle, NoConversation, Reply, Result, SessionConfig,
};

/// Answers echo-off prompts with a fixed password, echo-on prompts with the
/// username, and display messages with nothing.
struct PasswordAnswers {
    username: String,
    password: String,
}

impl Conversation for PasswordAnswers {
    fn converse(&self, messages: &[Message]) -> Result<Vec<Reply>> {
        Ok(messages
            .iter()
            .map(|message| match message.style {
                MessageStyle::PromptEchoOff => Some(self.password.clone()),
                MessageStyle::PromptEchoOn => Some(self.username.clone()),
                _ => None,
            })
            .collect())
    }
}

fn alice_handle(stack: &ScriptedStack) -> Handle<ScriptedStack> {
    Handle::new(
        stack.clone(),
        SessionConfig::new("alice"),
        Arc::new(PasswordAnswers {
            username: "alice".to_string(),
            password: "secret123".to_string(),
        }),
    )
    .unwrap()
}

#[test]
fn fresh_handle_state() {
    let stack = ScriptedStack::new();
    let handle = alice_handle(&stack);

    assert!(!handle.is_authenticated());
    assert!(!handle.is_session_open());
    assert!(handle.conversation_log().is_empty());
    assert_eq!(handle.last_code(), Code::Success);
}

#[test]
fn open_session_requires_authentication() {
    let stack = ScriptedStack::new();
    let handle = alice_handle(&stack);

    let err = handle.open_session(false).unwrap_err();
    assert!(matches!(err, Error::NotAuthenticated));
    // rejected locally, the stack never saw the call
    assert_eq!(stack.invocations(Op::OpenSession), 0);
}

#[test]
fn close_session_requires_open_session() {
    let stack = ScriptedStack::new();
    let handle = alice_handle(&stack);

    let err = handle.close_session(false).unwrap_err();
    assert!(matches!(err, Error::SessionNotOpen));
    assert_eq!(stack.invocations(Op::CloseSession), 0);
}

#[test]
fn authenticate_with_password_prompt() {
    let stack = ScriptedStack::new();
    stack.script_exchange(
        Op::Authenticate,
        vec![Message::new(MessageStyle::PromptEchoOff, "Password: ")],
        Some(vec![Some("secret123".to_string())]),
    );
    let handle = alice_handle(&stack);

    handle.authenticate(false, false).unwrap();

    assert!(handle.is_authenticated());
    let log = handle.conversation_log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].len(), 1);
    assert_eq!(log[0][0].text, "Password: ");
}

#[test]
fn failed_authenticate_raises_stack_error() {
    let stack = ScriptedStack::new();
    stack.script_outcome(Op::Authenticate, Code::AuthErr);
    let handle = alice_handle(&stack);

    let err = handle.authenticate(false, false).unwrap_err();
    match err {
        Error::Stack(stack_err) => {
            assert_eq!(stack_err.code, Code::AuthErr);
            assert_eq!(stack_err.name(), "PAM_AUTH_ERR");
            assert!(stack_err.message.starts_with("pam_authenticate()"));
            assert!(stack_err.to_string().starts_with("[PAM_AUTH_ERR]"));
        }
        other => panic!("expected stack error, got {other:?}"),
    }
    assert!(!handle.is_authenticated());
    assert_eq!(handle.last_code(), Code::AuthErr);
}

#[test]
fn authentication_survives_failed_acct_mgmt() {
    let stack = ScriptedStack::new();
    stack.script_outcome(Op::AcctMgmt, Code::AcctExpired);
    let handle = alice_handle(&stack);

    handle.authenticate(false, false).unwrap();
    assert!(handle.is_authenticated());

    let err = handle.acct_mgmt(false, false).unwrap_err();
    match err {
        Error::Stack(stack_err) => assert_eq!(stack_err.name(), "PAM_ACCT_EXPIRED"),
        other => panic!("expected stack error, got {other:?}"),
    }
    // account validation is orthogonal to authentication state
    assert!(handle.is_authenticated());
}

#[test]
fn session_state_transitions() {
    let stack = ScriptedStack::new();
    let handle = alice_handle(&stack);

    handle.authenticate(false, false).unwrap();
    handle.open_session(false).unwrap();
    assert!(handle.is_session_open());

    let err = handle.open_session(false).unwrap_err();
    assert!(matches!(err, Error::SessionAlreadyOpen));
    assert_eq!(stack.invocations(Op::OpenSession), 1);

    handle.close_session(false).unwrap();
    assert!(!handle.is_session_open());
    assert_eq!(stack.invocations(Op::CloseSession), 1);
}

#[test]
fn operation_flags_reach_the_stack() {
    let stack = ScriptedStack::new();
    let handle = alice_handle(&stack);

    handle.authenticate(true, true).unwrap();
    handle.acct_mgmt(false, true).unwrap();
    handle.setcred(CredOp::Establish, true).unwrap();
    handle.chauthtok(true, true).unwrap();

    let flags_for = |op: Op| -> Vec<u32> {
        stack
            .calls()
            .iter()
            .filter(|call| call.op == op)
            .map(|call| call.flags)
            .collect()
    };
    assert_eq!(flags_for(Op::Authenticate), vec![0x8000 | 0x0001]);
    assert_eq!(flags_for(Op::AcctMgmt), vec![0x0001]);
    assert_eq!(flags_for(Op::Setcred), vec![0x8000 | 0x0002]);
    assert_eq!(flags_for(Op::Chauthtok), vec![0x8000 | 0x0020]);
}

#[test]
fn setcred_failure_maps_outcome() {
    let stack = ScriptedStack::new();
    stack.script_outcome(Op::Setcred, Code::CredExpired);
    let handle = alice_handle(&stack);

    let err = handle.setcred(CredOp::Refresh, false).unwrap_err();
    match err {
        Error::Stack(stack_err) => {
            assert_eq!(stack_err.code, Code::CredExpired);
            assert!(stack_err.message.starts_with("pam_setcred()"));
        }
        other => panic!("expected stack error, got {other:?}"),
    }
}

// ----------------------------------------
// Audit boundary
// ----------------------------------------

struct DenyAll;

impl AuditHook for DenyAll {
    fn event(&self, event: &AuditEvent<'_>) -> std::result::Result<(), String> {
        Err(format!("{} denied by policy", event.operation))
    }
}

struct RecordingHook {
    events: std::sync::Mutex<Vec<(String, Option<CredOp>)>>,
}

impl AuditHook for RecordingHook {
    fn event(&self, event: &AuditEvent<'_>) -> std::result::Result<(), String> {
        assert_eq!(event.user, "alice");
        self.events
            .lock()
            .unwrap()
            .push((event.operation.to_string(), event.cred_op));
        Ok(())
    }
}

#[test]
fn audit_rejection_stops_before_native_call() {
    let stack = ScriptedStack::new();
    let handle = Handle::with_audit(
        stack.clone(),
        SessionConfig::new("alice"),
        Arc::new(NoConversation),
        Box::new(DenyAll),
    )
    .unwrap();

    let err = handle.authenticate(false, false).unwrap_err();
    assert!(matches!(
        err,
        Error::AuditRejected {
            operation: "authenticate",
            ..
        }
    ));
    assert_eq!(stack.invocations(Op::Authenticate), 0);

    let err = handle.setcred(CredOp::Delete, false).unwrap_err();
    assert!(matches!(err, Error::AuditRejected { operation: "setcred", .. }));
    assert_eq!(stack.invocations(Op::Setcred), 0);
}

#[test]
fn audited_operations_carry_identity_and_cred_op() {
    let stack = ScriptedStack::new();
    let hook = Arc::new(RecordingHook {
        events: std::sync::Mutex::new(Vec::new()),
    });

    struct Shared(Arc<RecordingHook>);
    impl AuditHook for Shared {
        fn event(&self, event: &AuditEvent<'_>) -> std::result::Result<(), String> {
            self.0.event(event)
        }
    }

    let handle = Handle::with_audit(
        stack,
        SessionConfig::new("alice"),
        Arc::new(NoConversation),
        Box::new(Shared(Arc::clone(&hook))),
    )
    .unwrap();

    handle.authenticate(false, false).unwrap();
    handle.setcred(CredOp::Establish, false).unwrap();
    handle.open_session(false).unwrap();
    handle.close_session(false).unwrap();
    // not audited
    handle.acct_mgmt(false, false).unwrap();
    handle.chauthtok(false, false).unwrap();

    let events = hook.events.lock().unwrap().clone();
    assert_eq!(
        events,
        vec![
            ("authenticate".to_string(), None),
            ("setcred".to_string(), Some(CredOp::Establish)),
            ("open_session".to_string(), None),
            ("close_session".to_string(), None),
        ]
    );
}

// ----------------------------------------
// Lifecycle
// ----------------------------------------

#[test]
fn construction_validates_arguments() {
    let stack = ScriptedStack::new();
    let err = Handle::new(stack.clone(), SessionConfig::new(""), Arc::new(NoConversation))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    assert_eq!(stack.invocations(Op::Start), 0);
}

#[test]
fn construction_rolls_back_on_item_failure() {
    let stack = ScriptedStack::new();
    stack.script_outcome(Op::SetItem, Code::BadItem);

    let config = SessionConfig::new("alice").ruser("operator").rhost("198.51.100.7");
    let err = Handle::new(stack.clone(), config, Arc::new(NoConversation)).unwrap_err();

    match err {
        Error::Stack(stack_err) => {
            assert_eq!(stack_err.code, Code::BadItem);
            assert!(stack_err.message.contains("PAM_RUSER"));
        }
        other => panic!("expected stack error, got {other:?}"),
    }
    // the partially constructed session was released with an abort
    // disposition
    assert_eq!(stack.sessions_started(), 1);
    assert_eq!(stack.ended(), Some(Code::Abort));
}

#[test]
fn construction_applies_identity_and_fail_delay() {
    let stack = ScriptedStack::new();
    let config = SessionConfig::new("alice")
        .service("sshd")
        .ruser("operator")
        .rhost("198.51.100.7")
        .fail_delay_usec(2_000_000);
    let _handle = Handle::new(stack.clone(), config, Arc::new(NoConversation)).unwrap();

    assert_eq!(stack.item(ItemKind::User), Some("alice".to_string()));
    assert_eq!(stack.item(ItemKind::RemoteUser), Some("operator".to_string()));
    assert_eq!(stack.item(ItemKind::RemoteHost), Some("198.51.100.7".to_string()));
    let delays: Vec<u32> = stack
        .calls()
        .iter()
        .filter(|call| call.op == Op::FailDelay)
        .map(|call| call.flags)
        .collect();
    assert_eq!(delays, vec![2_000_000]);
}

#[test]
fn construction_accepts_confdir_override() {
    let confdir = tempfile::tempdir().unwrap();
    let stack = ScriptedStack::new();
    let config = SessionConfig::new("alice").confdir(confdir.path());
    let handle = Handle::new(stack, config, Arc::new(NoConversation)).unwrap();
    assert!(!handle.is_authenticated());
}

#[test]
fn teardown_uses_last_outcome_as_disposition() {
    let stack = ScriptedStack::new();
    stack.script_outcome(Op::Authenticate, Code::Maxtries);
    let handle = alice_handle(&stack);

    let _ = handle.authenticate(false, false);
    drop(handle);

    assert_eq!(stack.ended(), Some(Code::Maxtries));
}

#[test]
fn teardown_after_clean_flow_reports_success() {
    let stack = ScriptedStack::new();
    {
        let handle = alice_handle(&stack);
        handle.authenticate(false, false).unwrap();
        handle.open_session(false).unwrap();
        handle.close_session(false).unwrap();
    }
    assert_eq!(stack.ended(), Some(Code::Success));
}

// ----------------------------------------
// Items and environment
// ----------------------------------------

#[test]
fn item_accessors_round_trip_through_the_stack() {
    let stack = ScriptedStack::new();
    let handle = alice_handle(&stack);

    assert_eq!(handle.user().unwrap(), Some("alice".to_string()));
    assert_eq!(handle.ruser().unwrap(), None);

    handle.set_ruser("operator").unwrap();
    assert_eq!(handle.ruser().unwrap(), Some("operator".to_string()));

    handle.set_rhost("workstation-7").unwrap();
    assert_eq!(handle.rhost().unwrap(), Some("workstation-7".to_string()));
}

#[test]
fn item_setter_rejects_empty_values() {
    let stack = ScriptedStack::new();
    let handle = alice_handle(&stack);

    let err = handle.set_ruser("").unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    assert_eq!(stack.invocations(Op::SetItem), 0);
}

#[test]
fn item_getter_surfaces_native_failure() {
    let stack = ScriptedStack::new();
    let handle = alice_handle(&stack);
    stack.script_outcome(Op::GetItem, Code::BadItem);

    let err = handle.user().unwrap_err();
    match err {
        Error::Stack(stack_err) => assert_eq!(stack_err.code, Code::BadItem),
        other => panic!("expected stack error, got {other:?}"),
    }
}

#[test]
fn environment_set_get_unset() {
    let stack = ScriptedStack::new();
    let handle = alice_handle(&stack);

    handle.setenv("CANARY", "FOO").unwrap();
    assert_eq!(handle.getenv("CANARY").unwrap(), "FOO");

    handle.unsetenv("CANARY").unwrap();
    let err = handle.getenv("CANARY").unwrap_err();
    assert!(matches!(err, Error::EnvNotFound(_)));

    handle.setenv("CANARY", "FOO3").unwrap();
    handle.setenv("LANG", "C.UTF-8").unwrap();
    let env = handle.env_map();
    assert_eq!(env.get("CANARY"), Some(&"FOO3".to_string()));
    assert_eq!(env.get("LANG"), Some(&"C.UTF-8".to_string()));
}

#[test]
fn environment_rejects_malformed_names() {
    let stack = ScriptedStack::new();
    let handle = alice_handle(&stack);

    assert!(matches!(handle.getenv("").unwrap_err(), Error::InvalidArgument(_)));
    assert!(matches!(
        handle.setenv("BAD=NAME", "x").unwrap_err(),
        Error::InvalidArgument(_)
    ));
    // removing an unset variable is a stack-level PAM_BAD_ITEM
    let err = handle.unsetenv("NEVER_SET").unwrap_err();
    match err {
        Error::Stack(stack_err) => assert_eq!(stack_err.code, Code::BadItem),
        other => panic!("expected stack error, got {other:?}"),
    }
}

// ----------------------------------------
// Concurrency
// ----------------------------------------

#[test]
fn independent_handles_do_not_share_state() {
    let stack_a = ScriptedStack::new();
    let stack_b = ScriptedStack::new();
    stack_b.script_outcome(Op::Authenticate, Code::AuthErr);

    let handle_a = alice_handle(&stack_a);
    let handle_b = Handle::new(
        stack_b.clone(),
        SessionConfig::new("bob"),
        Arc::new(NoConversation),
    )
    .unwrap();

    std::thread::scope(|scope| {
        let a = scope.spawn(|| handle_a.authenticate(false, false));
        let b = scope.spawn(|| handle_b.authenticate(false, false));
        assert!(a.join().unwrap().is_ok());
        assert!(b.join().unwrap().is_err());
    });

    // per-handle, not global, state
    assert!(handle_a.is_authenticated());
    assert!(!handle_b.is_authenticated());
    assert_eq!(stack_a.invocations(Op::Authenticate), 1);
    assert_eq!(stack_b.invocations(Op::Authenticate), 1);
}

#[test]
fn operations_on_one_handle_serialize() {
    let stack = ScriptedStack::new();
    let handle = alice_handle(&stack);
    handle.authenticate(false, false).unwrap();

    std::thread::scope(|scope| {
        let mut workers = Vec::new();
        for _ in 0..4 {
            workers.push(scope.spawn(|| handle.acct_mgmt(false, false)));
        }
        for worker in workers {
            assert!(worker.join().unwrap().is_ok());
        }
    });
    assert_eq!(stack.invocations(Op::AcctMgmt), 4);
}
