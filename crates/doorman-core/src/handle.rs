//! Authentication handle: owns one native session and serializes all
//! operations against it
//!
//! Native PAM handles are not thread-safe, so every call into the module
//! stack runs under the handle's operation lock. The lock is released for
//! the duration of the application's conversation callback (which may be
//! interactive and long-running) and reacquired before control returns to
//! the stack; see `Relay`.
//!
//! WARNING: individual service modules may themselves not be thread-safe,
//! in which case the library consumer needs a global lock across all
//! handles. Avoiding such modules in the PAM configuration is the better
//! fix.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::audit::{AuditEvent, AuditHook, TracingAudit};
use crate::code::{flags, Code, CredOp};
use crate::conv::{Conversation, Message, Reply};
use crate::error::{Error, Result, StackError};
use crate::stack::{Converse, ItemKind, ModuleStack, SessionConfig};

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Mutual exclusion for operations against the native session.
///
/// Not a plain `Mutex<T>`: the thread that entered the module stack is the
/// same thread the stack calls back into through the conversation bridge,
/// and the lock must be droppable for the duration of that callback while
/// the native call is still on the stack. Hence a hand-rolled boolean lock
/// with explicit suspend/resume.
struct OpLock {
    locked: Mutex<bool>,
    released: Condvar,
}

impl OpLock {
    fn new() -> Self {
        Self {
            locked: Mutex::new(false),
            released: Condvar::new(),
        }
    }

    fn lock_raw(&self) {
        let mut locked = relock(&self.locked);
        while *locked {
            locked = self
                .released
                .wait(locked)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *locked = true;
    }

    fn unlock_raw(&self) {
        *relock(&self.locked) = false;
        self.released.notify_one();
    }

    fn acquire(&self) -> OpGuard<'_> {
        self.lock_raw();
        OpGuard { lock: self }
    }

    /// Release the lock until the returned guard drops. Used around the
    /// conversation callback.
    fn suspend(&self) -> SuspendGuard<'_> {
        self.unlock_raw();
        SuspendGuard { lock: self }
    }
}

struct OpGuard<'a> {
    lock: &'a OpLock,
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock_raw();
    }
}

struct SuspendGuard<'a> {
    lock: &'a OpLock,
}

impl Drop for SuspendGuard<'_> {
    fn drop(&mut self) {
        self.lock.lock_raw();
    }
}

/// Authentication handle: one native session, one conversation callback,
/// and the session/authentication state machine.
///
/// Created for one authentication attempt, used for the privileged
/// operations in the order the state machine permits (authenticate →
/// acct_mgmt → setcred → open_session → … → close_session → setcred
/// delete), and torn down on drop, releasing the native session with the
/// last recorded outcome as its disposition.
///
/// A handle is safe to share between threads; operations on it are totally
/// ordered by its internal lock. Distinct handles never contend.
pub struct Handle<S: ModuleStack> {
    stack: S,
    session: S::Session,
    lock: OpLock,
    conversation: Mutex<Arc<dyn Conversation>>,
    log: Mutex<Vec<Vec<Message>>>,
    /// Error recorded by the bridge during the current native call; wins
    /// over the generic native outcome when the call fails
    pending: Mutex<Option<Error>>,
    audit: Box<dyn AuditHook>,
    user: String,
    authenticated: AtomicBool,
    session_open: AtomicBool,
    last_code: Mutex<Code>,
}

impl<S: ModuleStack> std::fmt::Debug for Handle<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle").field("user", &self.user).finish_non_exhaustive()
    }
}

impl<S: ModuleStack> Handle<S> {
    /// Start a session and build a handle around it, with the default
    /// audit hook.
    pub fn new(stack: S, config: SessionConfig, conversation: Arc<dyn Conversation>) -> Result<Self> {
        Self::with_audit(stack, config, conversation, Box::new(TracingAudit))
    }

    /// Start a session and build a handle around it.
    ///
    /// Construction is atomic: if any step after pam_start fails (setting
    /// the remote-user/remote-host items, applying the fail delay), the
    /// session is released with an abort disposition before the error is
    /// reported. Item failures are fatal to construction.
    pub fn with_audit(
        stack: S,
        config: SessionConfig,
        conversation: Arc<dyn Conversation>,
        audit: Box<dyn AuditHook>,
    ) -> Result<Self> {
        if config.user.is_empty() {
            return Err(Error::InvalidArgument("user is required".to_string()));
        }
        if config.service.is_empty() {
            return Err(Error::InvalidArgument("service name must not be empty".to_string()));
        }

        let session = match stack.start(&config) {
            Ok(session) => session,
            Err(code) => {
                return Err(stack_error(&stack, code, "pam_start() failed").into());
            }
        };

        let init = (|| -> Result<()> {
            if let Some(ruser) = &config.ruser {
                let code = stack.set_item(&session, ItemKind::RemoteUser, ruser);
                if code != Code::Success {
                    return Err(stack_error(&stack, code, "pam_set_item() failed for PAM_RUSER").into());
                }
            }
            if let Some(rhost) = &config.rhost {
                let code = stack.set_item(&session, ItemKind::RemoteHost, rhost);
                if code != Code::Success {
                    return Err(stack_error(&stack, code, "pam_set_item() failed for PAM_RHOST").into());
                }
            }
            if config.fail_delay_usec != 0 {
                let code = stack.fail_delay(&session, config.fail_delay_usec);
                if code != Code::Success {
                    return Err(stack_error(&stack, code, "pam_fail_delay() failed").into());
                }
            }
            Ok(())
        })();

        if let Err(err) = init {
            stack.end(&session, Code::Abort);
            return Err(err);
        }

        debug!(service = %config.service, user = %config.user, "pam session started");

        Ok(Self {
            stack,
            session,
            lock: OpLock::new(),
            conversation: Mutex::new(conversation),
            log: Mutex::new(Vec::new()),
            pending: Mutex::new(None),
            audit,
            user: config.user,
            authenticated: AtomicBool::new(false),
            session_open: AtomicBool::new(false),
            last_code: Mutex::new(Code::Success),
        })
    }

    /// Backend this handle runs against.
    pub fn stack(&self) -> &S {
        &self.stack
    }

    /// Whether authenticate has succeeded on this handle.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    /// Whether a session is currently open on this handle.
    pub fn is_session_open(&self) -> bool {
        self.session_open.load(Ordering::Acquire)
    }

    /// Outcome of the most recent native call; the disposition hint at
    /// teardown.
    pub fn last_code(&self) -> Code {
        *relock(&self.last_code)
    }

    /// Every prompt batch delivered through the conversation bridge so
    /// far, in delivery order.
    pub fn conversation_log(&self) -> Vec<Vec<Message>> {
        relock(&self.log).clone()
    }

    /// Swap the conversation callback.
    ///
    /// Safe between operations. Calling it from inside an in-flight
    /// conversation callback leaves it unspecified which callback answers
    /// the remaining rounds of that operation.
    pub fn replace_conversation(&self, conversation: Arc<dyn Conversation>) {
        *relock(&self.conversation) = conversation;
    }

    /// Authenticate the user through the configured service modules.
    ///
    /// Multi-step authentication is handled through the conversation
    /// callback. On success the handle becomes authenticated.
    pub fn authenticate(&self, silent: bool, disallow_null_authtok: bool) -> Result<()> {
        let mut call_flags = 0;
        if silent {
            call_flags |= flags::SILENT;
        }
        if disallow_null_authtok {
            call_flags |= flags::DISALLOW_NULL_AUTHTOK;
        }

        self.audit_event("authenticate", None)?;
        let code = self.call_op(
            |stack, session, conv| stack.authenticate(session, call_flags, conv),
            |handle| handle.authenticated.store(true, Ordering::Release),
        );
        self.outcome(code, "pam_authenticate() failed")
    }

    /// Verify that the account is valid and active (expiry, aging, access
    /// restrictions).
    ///
    /// Whether this requires prior authentication is the module stack's
    /// policy; no local precondition is enforced.
    pub fn acct_mgmt(&self, silent: bool, disallow_null_authtok: bool) -> Result<()> {
        let mut call_flags = 0;
        if silent {
            call_flags |= flags::SILENT;
        }
        if disallow_null_authtok {
            call_flags |= flags::DISALLOW_NULL_AUTHTOK;
        }

        let code = self.call_op(
            |stack, session, conv| stack.acct_mgmt(session, call_flags, conv),
            |_| {},
        );
        self.outcome(code, "pam_acct_mgmt() failed")
    }

    /// Establish, delete, reinitialize, or refresh the user's credentials.
    pub fn setcred(&self, operation: CredOp, silent: bool) -> Result<()> {
        let call_flags = operation.flags(silent);

        self.audit_event("setcred", Some(operation))?;
        let code = self.call_op(
            |stack, session, conv| stack.setcred(session, call_flags, conv),
            |_| {},
        );
        self.outcome(code, "pam_setcred() failed")
    }

    /// Open a session for the authenticated user.
    ///
    /// Requires a successful authenticate and no session currently open;
    /// both are checked locally and rejected without touching the module
    /// stack.
    pub fn open_session(&self, silent: bool) -> Result<()> {
        if !self.is_authenticated() {
            return Err(Error::NotAuthenticated);
        }
        if self.is_session_open() {
            return Err(Error::SessionAlreadyOpen);
        }
        let call_flags = if silent { flags::SILENT } else { 0 };

        self.audit_event("open_session", None)?;
        let code = self.call_op(
            |stack, session, conv| stack.open_session(session, call_flags, conv),
            |handle| handle.session_open.store(true, Ordering::Release),
        );
        self.outcome(code, "pam_open_session() failed")
    }

    /// Close the session opened with [`Handle::open_session`].
    ///
    /// Should be attempted even on abnormal teardown, so the only
    /// precondition is a previously opened session.
    pub fn close_session(&self, silent: bool) -> Result<()> {
        if !self.is_session_open() {
            return Err(Error::SessionNotOpen);
        }
        let call_flags = if silent { flags::SILENT } else { 0 };

        self.audit_event("close_session", None)?;
        let code = self.call_op(
            |stack, session, conv| stack.close_session(session, call_flags, conv),
            |handle| handle.session_open.store(false, Ordering::Release),
        );
        self.outcome(code, "pam_close_session() failed")
    }

    /// Change the user's authentication token (password).
    ///
    /// The stack runs its own two-phase check/update protocol and prompts
    /// for old and new tokens through the conversation callback.
    pub fn chauthtok(&self, silent: bool, change_expired_authtok: bool) -> Result<()> {
        let mut call_flags = 0;
        if silent {
            call_flags |= flags::SILENT;
        }
        if change_expired_authtok {
            call_flags |= flags::CHANGE_EXPIRED_AUTHTOK;
        }

        let code = self.call_op(
            |stack, session, conv| stack.chauthtok(session, call_flags, conv),
            |_| {},
        );
        self.outcome(code, "pam_chauthtok() failed")
    }

    /// PAM_USER as currently held by the native session.
    pub fn user(&self) -> Result<Option<String>> {
        self.get_item(ItemKind::User)
    }

    /// PAM_RUSER as currently held by the native session.
    pub fn ruser(&self) -> Result<Option<String>> {
        self.get_item(ItemKind::RemoteUser)
    }

    /// PAM_RHOST as currently held by the native session.
    pub fn rhost(&self) -> Result<Option<String>> {
        self.get_item(ItemKind::RemoteHost)
    }

    pub fn set_user(&self, value: &str) -> Result<()> {
        self.set_item(ItemKind::User, value)
    }

    pub fn set_ruser(&self, value: &str) -> Result<()> {
        self.set_item(ItemKind::RemoteUser, value)
    }

    pub fn set_rhost(&self, value: &str) -> Result<()> {
        self.set_item(ItemKind::RemoteHost, value)
    }

    /// Value of one PAM environment variable.
    ///
    /// WARNING: PAM environment variables should not hold sensitive data;
    /// applications commonly merge them into the process environment.
    pub fn getenv(&self, name: &str) -> Result<String> {
        if name.is_empty() {
            return Err(Error::InvalidArgument("name is required".to_string()));
        }
        let _guard = self.lock.acquire();
        self.stack
            .getenv(&self.session, name)
            .ok_or_else(|| Error::EnvNotFound(name.to_string()))
    }

    /// Set one PAM environment variable.
    pub fn setenv(&self, name: &str, value: &str) -> Result<()> {
        self.putenv(name, &format!("{name}={value}"))
    }

    /// Remove one PAM environment variable.
    pub fn unsetenv(&self, name: &str) -> Result<()> {
        self.putenv(name, name)
    }

    /// All PAM environment variables as a map.
    pub fn env_map(&self) -> HashMap<String, String> {
        let _guard = self.lock.acquire();
        self.stack.env_list(&self.session).into_iter().collect()
    }

    fn putenv(&self, name: &str, entry: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::InvalidArgument("name is required".to_string()));
        }
        if name.contains('=') {
            return Err(Error::InvalidArgument(
                "name must not contain '='".to_string(),
            ));
        }
        let _guard = self.lock.acquire();
        let code = self.stack.putenv(&self.session, entry);
        if code != Code::Success {
            return Err(stack_error(&self.stack, code, "pam_putenv() failed").into());
        }
        Ok(())
    }

    fn get_item(&self, item: ItemKind) -> Result<Option<String>> {
        let _guard = self.lock.acquire();
        self.stack.get_item(&self.session, item).map_err(|code| {
            stack_error(
                &self.stack,
                code,
                format!("pam_get_item() failed for {}", item.name()),
            )
            .into()
        })
    }

    fn set_item(&self, item: ItemKind, value: &str) -> Result<()> {
        if value.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "{} requires a non-empty value",
                item.name()
            )));
        }
        let _guard = self.lock.acquire();
        let code = self.stack.set_item(&self.session, item, value);
        if code != Code::Success {
            return Err(stack_error(
                &self.stack,
                code,
                format!("pam_set_item() failed for {}", item.name()),
            )
            .into());
        }
        Ok(())
    }

    fn audit_event(&self, operation: &'static str, cred_op: Option<CredOp>) -> Result<()> {
        let event = AuditEvent {
            operation,
            user: &self.user,
            cred_op,
        };
        self.audit
            .event(&event)
            .map_err(|reason| Error::AuditRejected { operation, reason })
    }

    /// Run one native call under the operation lock.
    ///
    /// The last-outcome record and any status-flag update happen inside
    /// the critical section, after the lock has been reacquired following
    /// any conversation rounds.
    fn call_op(
        &self,
        op: impl FnOnce(&S, &S::Session, &dyn Converse) -> Code,
        on_success: impl FnOnce(&Self),
    ) -> Code {
        *relock(&self.pending) = None;
        let guard = self.lock.acquire();
        let relay = Relay { handle: self };
        let code = op(&self.stack, &self.session, &relay);
        *relock(&self.last_code) = code;
        if code == Code::Success {
            on_success(self);
        }
        drop(guard);
        code
    }

    /// Map a native outcome to a result, preferring an error the bridge
    /// recorded during the same call over the generic stack outcome.
    #[track_caller]
    fn outcome(&self, code: Code, message: &str) -> Result<()> {
        if code == Code::Success {
            return Ok(());
        }
        if let Some(err) = relock(&self.pending).take() {
            return Err(err);
        }
        Err(stack_error(&self.stack, code, message).into())
    }
}

impl<S: ModuleStack> Drop for Handle<S> {
    fn drop(&mut self) {
        let disposition = *relock(&self.last_code);
        self.stack.end(&self.session, disposition);
    }
}

#[track_caller]
fn stack_error<S: ModuleStack>(stack: &S, code: Code, message: impl Into<String>) -> StackError {
    StackError::new(code, stack.strerror(code), message)
}

/// The conversation bridge handed to the module stack for the duration of
/// one privileged call.
///
/// The stack re-enters through here, on the same thread that made the
/// native call. The operation lock is released while the application
/// callback runs (so other threads are not stalled behind an interactive
/// prompt) and reacquired before control returns to the stack.
struct Relay<'a, S: ModuleStack> {
    handle: &'a Handle<S>,
}

impl<S: ModuleStack> Converse for Relay<'_, S> {
    fn converse(&self, messages: Vec<Message>) -> std::result::Result<Vec<Reply>, Code> {
        let handle = self.handle;
        let _resume = handle.lock.suspend();

        // A module may run another round after a failed one; the previous
        // round's error is stale at that point.
        *relock(&handle.pending) = None;

        relock(&handle.log).push(messages.clone());

        let callback = relock(&handle.conversation).clone();
        let replies = match catch_unwind(AssertUnwindSafe(|| callback.converse(&messages))) {
            Ok(Ok(replies)) => replies,
            Ok(Err(err)) => {
                *relock(&handle.pending) = Some(err);
                return Err(Code::ConvErr);
            }
            Err(_) => {
                *relock(&handle.pending) = Some(Error::Conversation(
                    "conversation callback panicked".to_string(),
                ));
                return Err(Code::ConvErr);
            }
        };

        if replies.len() != messages.len() {
            *relock(&handle.pending) = Some(Error::ReplyCountMismatch {
                expected: messages.len(),
                got: replies.len(),
            });
            return Err(Code::ConvErr);
        }
        for (index, (message, reply)) in messages.iter().zip(&replies).enumerate() {
            if !message.style.is_prompt() && reply.is_some() {
                *relock(&handle.pending) = Some(Error::UnexpectedReply { index });
                return Err(Code::ConvErr);
            }
        }

        Ok(replies)
        // _resume drops here: the lock is held again before the stack
        // regains control
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_op_lock_excludes_and_suspends() {
        let lock = Arc::new(OpLock::new());
        let guard = lock.acquire();

        let contender = {
            let lock = Arc::clone(&lock);
            std::thread::spawn(move || {
                let _guard = lock.acquire();
            })
        };
        // Contender stays blocked while the lock is held
        std::thread::sleep(Duration::from_millis(50));
        assert!(!contender.is_finished());

        {
            let _suspend = lock.suspend();
            // Suspension lets the contender through
            contender.join().unwrap();
        }

        drop(guard);
        let _guard = lock.acquire();
    }
}
