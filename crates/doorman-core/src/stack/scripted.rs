//! Scripted in-memory module stack
//!
//! A deterministic stand-in for libpam, used by the test suites and for
//! developing conversation flows without a PAM configuration or root. Every
//! call is recorded; outcomes and conversation rounds are scripted per
//! operation ahead of time.
//!
//! This is not a PAM implementation: it never decides policy, it only plays
//! back what the test scripted.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::code::Code;
use crate::conv::{Message, Reply};
use crate::stack::{Converse, ItemKind, ModuleStack, SessionConfig};

/// Operations recorded by the scripted stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Start,
    Authenticate,
    AcctMgmt,
    Setcred,
    OpenSession,
    CloseSession,
    Chauthtok,
    GetItem,
    SetItem,
    Getenv,
    Putenv,
    EnvList,
    FailDelay,
}

/// One recorded native call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recorded {
    pub op: Op,
    pub flags: u32,
}

/// One scripted conversation round for an operation.
#[derive(Debug, Clone)]
pub struct Exchange {
    /// Messages the stack sends through the bridge
    pub prompts: Vec<Message>,
    /// When set, replies that must come back for the operation to keep
    /// going; a mismatch makes the operation fail with PAM_AUTH_ERR
    pub expect: Option<Vec<Reply>>,
}

#[derive(Default)]
struct Inner {
    outcomes: HashMap<Op, VecDeque<Code>>,
    exchanges: HashMap<Op, VecDeque<Exchange>>,
    items: HashMap<ItemKind, String>,
    env: HashMap<String, String>,
    calls: Vec<Recorded>,
    replies: Vec<Vec<Reply>>,
    ended: Option<Code>,
    started: usize,
}

/// Scripted module stack. Clones share state, so a test can keep a clone
/// for assertions after moving the stack into a handle.
#[derive(Clone, Default)]
pub struct ScriptedStack {
    inner: Arc<Mutex<Inner>>,
}

/// Marker session; all scripted state lives in the stack.
pub struct ScriptedSession(());

impl ScriptedStack {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue the outcome of the next invocation of `op`. Unqueued
    /// invocations succeed.
    pub fn script_outcome(&self, op: Op, code: Code) {
        self.lock().outcomes.entry(op).or_default().push_back(code);
    }

    /// Queue a conversation round for the next invocation of `op`.
    pub fn script_exchange(&self, op: Op, prompts: Vec<Message>, expect: Option<Vec<Reply>>) {
        self.lock()
            .exchanges
            .entry(op)
            .or_default()
            .push_back(Exchange { prompts, expect });
    }

    /// All native calls made so far, in order.
    pub fn calls(&self) -> Vec<Recorded> {
        self.lock().calls.clone()
    }

    /// Number of invocations of one operation.
    pub fn invocations(&self, op: Op) -> usize {
        self.lock().calls.iter().filter(|call| call.op == op).count()
    }

    /// Reply batches the stack received back through the bridge.
    pub fn replies(&self) -> Vec<Vec<Reply>> {
        self.lock().replies.clone()
    }

    /// Disposition passed to `end`, if the session was released.
    pub fn ended(&self) -> Option<Code> {
        self.lock().ended
    }

    /// Number of sessions started.
    pub fn sessions_started(&self) -> usize {
        self.lock().started
    }

    /// Current value of an item, as the native side sees it.
    pub fn item(&self, item: ItemKind) -> Option<String> {
        self.lock().items.get(&item).cloned()
    }

    /// Current value of a pam environment variable, as the native side
    /// sees it.
    pub fn env_value(&self, name: &str) -> Option<String> {
        self.lock().env.get(name).cloned()
    }

    fn record(&self, op: Op, flags: u32) {
        self.lock().calls.push(Recorded { op, flags });
    }

    fn take_outcome(&self, op: Op) -> Code {
        self.lock()
            .outcomes
            .get_mut(&op)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Code::Success)
    }

    fn take_exchanges(&self, op: Op) -> Vec<Exchange> {
        self.lock()
            .exchanges
            .get_mut(&op)
            .map(|queue| queue.drain(..).collect())
            .unwrap_or_default()
    }

    /// Shared body of the privileged operations: play back scripted
    /// conversation rounds, then report the scripted outcome.
    fn run_op(&self, op: Op, flags: u32, conv: &dyn Converse) -> Code {
        self.record(op, flags);
        // The bridge releases the handle lock while the callback runs, so
        // it may legitimately re-enter this stack from another thread;
        // never hold our own lock across the conversation.
        let exchanges = self.take_exchanges(op);
        for exchange in exchanges {
            match conv.converse(exchange.prompts) {
                Ok(replies) => {
                    self.lock().replies.push(replies.clone());
                    if let Some(expect) = exchange.expect {
                        if replies != expect {
                            return Code::AuthErr;
                        }
                    }
                }
                Err(code) => return code,
            }
        }
        self.take_outcome(op)
    }
}

impl ModuleStack for ScriptedStack {
    type Session = ScriptedSession;

    fn start(&self, config: &SessionConfig) -> std::result::Result<Self::Session, Code> {
        self.record(Op::Start, 0);
        let code = self.take_outcome(Op::Start);
        if code != Code::Success {
            return Err(code);
        }
        let mut inner = self.lock();
        inner.started += 1;
        inner.items.insert(ItemKind::User, config.user.clone());
        Ok(ScriptedSession(()))
    }

    fn end(&self, _session: &Self::Session, disposition: Code) {
        self.lock().ended = Some(disposition);
    }

    fn authenticate(&self, _session: &Self::Session, flags: u32, conv: &dyn Converse) -> Code {
        self.run_op(Op::Authenticate, flags, conv)
    }

    fn acct_mgmt(&self, _session: &Self::Session, flags: u32, conv: &dyn Converse) -> Code {
        self.run_op(Op::AcctMgmt, flags, conv)
    }

    fn setcred(&self, _session: &Self::Session, flags: u32, conv: &dyn Converse) -> Code {
        self.run_op(Op::Setcred, flags, conv)
    }

    fn open_session(&self, _session: &Self::Session, flags: u32, conv: &dyn Converse) -> Code {
        self.run_op(Op::OpenSession, flags, conv)
    }

    fn close_session(&self, _session: &Self::Session, flags: u32, conv: &dyn Converse) -> Code {
        self.run_op(Op::CloseSession, flags, conv)
    }

    fn chauthtok(&self, _session: &Self::Session, flags: u32, conv: &dyn Converse) -> Code {
        self.run_op(Op::Chauthtok, flags, conv)
    }

    fn get_item(
        &self,
        _session: &Self::Session,
        item: ItemKind,
    ) -> std::result::Result<Option<String>, Code> {
        self.record(Op::GetItem, 0);
        let code = self.take_outcome(Op::GetItem);
        if code != Code::Success {
            return Err(code);
        }
        Ok(self.lock().items.get(&item).cloned())
    }

    fn set_item(&self, _session: &Self::Session, item: ItemKind, value: &str) -> Code {
        self.record(Op::SetItem, 0);
        let code = self.take_outcome(Op::SetItem);
        if code == Code::Success {
            self.lock().items.insert(item, value.to_string());
        }
        code
    }

    fn getenv(&self, _session: &Self::Session, name: &str) -> Option<String> {
        self.record(Op::Getenv, 0);
        self.lock().env.get(name).cloned()
    }

    fn putenv(&self, _session: &Self::Session, entry: &str) -> Code {
        self.record(Op::Putenv, 0);
        let code = self.take_outcome(Op::Putenv);
        if code != Code::Success {
            return code;
        }
        match entry.split_once('=') {
            Some((name, value)) => {
                self.lock().env.insert(name.to_string(), value.to_string());
                Code::Success
            }
            // bare NAME removes; removing an unset variable is PAM_BAD_ITEM
            None => match self.lock().env.remove(entry) {
                Some(_) => Code::Success,
                None => Code::BadItem,
            },
        }
    }

    fn env_list(&self, _session: &Self::Session) -> Vec<(String, String)> {
        self.record(Op::EnvList, 0);
        let mut entries: Vec<(String, String)> = self
            .lock()
            .env
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        entries.sort();
        entries
    }

    fn fail_delay(&self, _session: &Self::Session, usec: u32) -> Code {
        self.record(Op::FailDelay, usec);
        self.take_outcome(Op::FailDelay)
    }

    fn strerror(&self, code: Code) -> String {
        code.description().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::MessageStyle;

    struct EchoBack;

    impl Converse for EchoBack {
        fn converse(&self, messages: Vec<Message>) -> std::result::Result<Vec<Reply>, Code> {
            Ok(messages.iter().map(|m| Some(m.text.clone())).collect())
        }
    }

    #[test]
    fn test_outcomes_play_back_in_order() {
        let stack = ScriptedStack::new();
        stack.script_outcome(Op::Authenticate, Code::AuthErr);
        let session = stack.start(&SessionConfig::new("bob")).unwrap();

        assert_eq!(stack.authenticate(&session, 0, &EchoBack), Code::AuthErr);
        // queue drained, back to the default
        assert_eq!(stack.authenticate(&session, 0, &EchoBack), Code::Success);
        assert_eq!(stack.invocations(Op::Authenticate), 2);
    }

    #[test]
    fn test_exchange_expectation_gates_outcome() {
        let stack = ScriptedStack::new();
        let prompt = Message::new(MessageStyle::PromptEchoOn, "login: ");
        stack.script_exchange(
            Op::Authenticate,
            vec![prompt],
            Some(vec![Some("nope".to_string())]),
        );
        let session = stack.start(&SessionConfig::new("bob")).unwrap();

        // EchoBack answers with the prompt text, not "nope"
        assert_eq!(stack.authenticate(&session, 0, &EchoBack), Code::AuthErr);
        assert_eq!(stack.replies().len(), 1);
    }

    #[test]
    fn test_putenv_parses_entries() {
        let stack = ScriptedStack::new();
        let session = stack.start(&SessionConfig::new("bob")).unwrap();

        assert_eq!(stack.putenv(&session, "CANARY=FOO"), Code::Success);
        assert_eq!(stack.getenv(&session, "CANARY"), Some("FOO".to_string()));
        assert_eq!(stack.putenv(&session, "CANARY"), Code::Success);
        assert_eq!(stack.getenv(&session, "CANARY"), None);
        assert_eq!(stack.putenv(&session, "CANARY"), Code::BadItem);
    }
}
