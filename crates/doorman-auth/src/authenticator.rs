//! Staged PAM authenticator
//!
//! Drives the blocking authenticate call on a worker thread and surfaces
//! conversation rounds to the caller as data: `auth_init` returns either
//! the final outcome or a batch of prompts, `auth_continue` feeds the
//! replies back in. This lets request/response services (web handlers,
//! RPC endpoints) run multi-step PAM conversations without holding a
//! thread inside the module stack between client round-trips.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use doorman_core::{
    Code, Conversation, Error as CoreError, Handle, Message, ModuleStack, Reply, SessionConfig,
};

use crate::error::{AuthError, Result};

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Where in the login lifecycle an authenticator currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    /// Nothing has run yet (also the state after `end`)
    Start,
    /// Authentication in progress, conversation rounds may be pending
    Auth,
    /// Authenticated; account checks and session open are legal
    Login,
    /// Session open; close and cleanup are legal
    Logout,
}

impl core::fmt::Display for Stage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Stage::Start => "START",
            Stage::Auth => "AUTH",
            Stage::Login => "LOGIN",
            Stage::Logout => "LOGOUT",
        };
        f.write_str(name)
    }
}

/// Account provenance and authentication-method flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountFlag {
    /// Account is an administrative account
    SysAdmin,
    /// Account is provided by a directory service
    DirectoryService,
    /// Account is provided by the local passwd database
    Local,
    /// Account is provided by Active Directory
    ActiveDirectory,
    /// Account is provided by FreeIPA
    Ipa,
    /// Account is provided by an ordinary LDAP server
    Ldap,
    /// Account requires two-factor authentication
    TwoFactor,
    /// Account authenticated by API key
    ApiKey,
    /// Account authenticated by a single-use password
    Otpw,
    /// Password change for the account is required
    PasswordChangeRequired,
}

/// Identity details reported after a successful authenticate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInfo {
    pub username: String,
    pub account_flags: Vec<AccountFlag>,
}

/// Result of one authenticator step.
#[derive(Debug)]
pub enum AuthOutcome {
    /// The step completed; `user_info` is populated for authenticate steps
    Success { user_info: Option<UserInfo> },
    /// The module stack wants input: answer with `auth_continue`
    Prompts(Vec<Message>),
    /// The step failed with a PAM-level outcome
    Failed { code: Code, reason: String },
}

impl AuthOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AuthOutcome::Success { .. })
    }

    fn from_result(result: doorman_core::Result<()>) -> AuthOutcome {
        match result {
            Ok(()) => AuthOutcome::Success { user_info: None },
            Err(err) => AuthOutcome::Failed {
                code: failure_code(&err),
                reason: err.to_string(),
            },
        }
    }
}

pub(crate) fn failure_code(err: &CoreError) -> Code {
    match err {
        CoreError::Stack(stack_err) => stack_err.code,
        _ => Code::SystemErr,
    }
}

/// Conversation callback that relays prompt batches to the authenticator
/// and blocks the worker until replies come back.
struct ChannelConversation {
    /// Thread the callback is allowed to run on; a callback on any other
    /// thread (say, from acct_mgmt on the caller's thread) would deadlock
    /// against the caller, so it is refused instead
    worker: Mutex<Option<ThreadId>>,
    prompts_tx: Sender<Vec<Message>>,
    replies_rx: Mutex<Receiver<Vec<Reply>>>,
}

impl ChannelConversation {
    fn bind_worker(&self) {
        *relock(&self.worker) = Some(thread::current().id());
    }
}

impl Conversation for ChannelConversation {
    fn converse(&self, messages: &[Message]) -> doorman_core::Result<Vec<Reply>> {
        if *relock(&self.worker) != Some(thread::current().id()) {
            return Err(CoreError::Conversation(
                "conversation invoked outside the authentication worker".to_string(),
            ));
        }
        self.prompts_tx.send(messages.to_vec()).map_err(|_| {
            CoreError::Conversation("authenticator dropped the conversation channel".to_string())
        })?;
        relock(&self.replies_rx).recv().map_err(|_| {
            CoreError::Conversation("authenticator closed before replies arrived".to_string())
        })
    }
}

struct AuthWorker<S: ModuleStack> {
    prompts_rx: Receiver<Vec<Message>>,
    replies_tx: Sender<Vec<Reply>>,
    result_rx: Receiver<std::result::Result<Handle<S>, CoreError>>,
}

enum Step<S: ModuleStack> {
    Finished(std::result::Result<Handle<S>, CoreError>),
    Prompts(Vec<Message>),
    WorkerDied,
    TimedOut,
    Idle,
}

/// Per-login-session authenticator holding an open pam handle and stage
/// information. One instance per session.
pub struct PamAuthenticator<S: ModuleStack + Clone + 'static> {
    username: String,
    service: String,
    timeout: Duration,
    ruser: Option<String>,
    rhost: Option<String>,
    fail_delay_usec: u32,
    pam_env: HashMap<String, String>,
    stack: S,
    stage: Stage,
    login_at: Option<DateTime<Utc>>,
    worker: Option<AuthWorker<S>>,
    handle: Option<Handle<S>>,
}

impl<S: ModuleStack + Clone + 'static> PamAuthenticator<S> {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(stack: S, username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            service: SessionConfig::DEFAULT_SERVICE.to_string(),
            timeout: Self::DEFAULT_TIMEOUT,
            ruser: None,
            rhost: None,
            fail_delay_usec: 0,
            pam_env: HashMap::new(),
            stack,
            stage: Stage::Start,
            login_at: None,
            worker: None,
            handle: None,
        }
    }

    pub fn service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    /// How long to wait for the worker before declaring the attempt dead.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
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

    /// PAM environment variable to set before authenticating.
    pub fn env_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.pam_env.insert(name.into(), value.into());
        self
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Time at which the session performed the actual login.
    pub fn login_at(&self) -> Option<DateTime<Utc>> {
        self.login_at
    }

    /// Handle of the authenticated session, once authentication completed.
    pub fn handle(&self) -> Option<&Handle<S>> {
        self.handle.as_ref()
    }

    pub(crate) fn check_stage(&self, expected: Stage) -> Result<()> {
        if self.stage != expected {
            return Err(AuthError::WrongStage {
                current: self.stage,
                expected,
            });
        }
        Ok(())
    }

    pub(crate) fn stack(&self) -> &S {
        &self.stack
    }

    pub(crate) fn pam_env(&self) -> &HashMap<String, String> {
        &self.pam_env
    }

    /// Adopt an already-authenticated handle and move to the login stage.
    pub(crate) fn install_handle(&mut self, handle: Handle<S>) {
        self.handle = Some(handle);
        self.stage = Stage::Login;
    }

    pub(crate) fn session_config(&self) -> SessionConfig {
        let mut config = SessionConfig::new(self.username.clone()).service(self.service.clone());
        if let Some(ruser) = &self.ruser {
            config = config.ruser(ruser.clone());
        }
        if let Some(rhost) = &self.rhost {
            config = config.rhost(rhost.clone());
        }
        if self.fail_delay_usec != 0 {
            config = config.fail_delay_usec(self.fail_delay_usec);
        }
        config
    }

    /// Start PAM authentication on a worker thread.
    ///
    /// Returns `Prompts` when the module stack wants input (answer with
    /// [`PamAuthenticator::auth_continue`]), otherwise the final outcome.
    pub fn auth_init(&mut self) -> Result<AuthOutcome> {
        if self.worker.is_some() {
            return Err(AuthError::AlreadyRunning);
        }
        self.check_stage(Stage::Start)?;

        let (prompts_tx, prompts_rx) = mpsc::channel();
        let (replies_tx, replies_rx) = mpsc::channel();
        let (result_tx, result_rx) = mpsc::channel();

        let conversation = Arc::new(ChannelConversation {
            worker: Mutex::new(None),
            prompts_tx,
            replies_rx: Mutex::new(replies_rx),
        });

        let stack = self.stack.clone();
        let config = self.session_config();
        let pam_env = self.pam_env.clone();
        thread::spawn(move || {
            conversation.bind_worker();
            let outcome = run_auth(stack, config, pam_env, conversation);
            // the authenticator may already have given up on us
            let _ = result_tx.send(outcome);
        });

        self.worker = Some(AuthWorker {
            prompts_rx,
            replies_tx,
            result_rx,
        });
        self.stage = Stage::Auth;
        debug!(user = %self.username, service = %self.service, "authentication started");

        Ok(self.wait_for_result())
    }

    /// Continue authentication by answering the pending prompt batch.
    pub fn auth_continue(&mut self, replies: Vec<Reply>) -> Result<AuthOutcome> {
        self.check_stage(Stage::Auth)?;
        let Some(worker) = &self.worker else {
            return Err(AuthError::NotRunning);
        };
        worker
            .replies_tx
            .send(replies)
            .map_err(|_| AuthError::NotRunning)?;
        Ok(self.wait_for_result())
    }

    /// Wait for the worker to either complete or request a conversation
    /// round.
    fn wait_for_result(&mut self) -> AuthOutcome {
        const POLL: Duration = Duration::from_millis(100);
        let deadline = Instant::now() + self.timeout;

        loop {
            let step = {
                let Some(worker) = &self.worker else {
                    return AuthOutcome::Failed {
                        code: Code::SystemErr,
                        reason: "no authentication in progress".to_string(),
                    };
                };
                match worker.result_rx.try_recv() {
                    Ok(result) => Step::Finished(result),
                    Err(TryRecvError::Disconnected) => Step::WorkerDied,
                    Err(TryRecvError::Empty) => match worker.prompts_rx.recv_timeout(POLL) {
                        Ok(prompts) => Step::Prompts(prompts),
                        Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                            if Instant::now() >= deadline {
                                Step::TimedOut
                            } else {
                                Step::Idle
                            }
                        }
                    },
                }
            };

            match step {
                Step::Finished(result) => return self.finish(result),
                Step::Prompts(prompts) => return AuthOutcome::Prompts(prompts),
                Step::WorkerDied => {
                    warn!(user = %self.username, "authentication worker exited without a result");
                    self.end();
                    return AuthOutcome::Failed {
                        code: Code::SystemErr,
                        reason: "authentication worker exited without a result".to_string(),
                    };
                }
                Step::TimedOut => {
                    let timeout = self.timeout;
                    self.end();
                    return AuthOutcome::Failed {
                        code: Code::SystemErr,
                        reason: format!("authentication timeout after {} seconds", timeout.as_secs()),
                    };
                }
                // result channel can lag a closed prompt channel by one
                // iteration
                Step::Idle => thread::yield_now(),
            }
        }
    }

    fn finish(&mut self, result: std::result::Result<Handle<S>, CoreError>) -> AuthOutcome {
        self.worker = None;
        match result {
            Ok(handle) => {
                self.handle = Some(handle);
                self.stage = Stage::Login;
                AuthOutcome::Success {
                    user_info: Some(UserInfo {
                        username: self.username.clone(),
                        account_flags: Vec::new(),
                    }),
                }
            }
            Err(err) => {
                let outcome = AuthOutcome::Failed {
                    code: failure_code(&err),
                    reason: err.to_string(),
                };
                self.end();
                outcome
            }
        }
    }

    /// Validate the authenticated account (expiry, aging, restrictions).
    ///
    /// Account management and authentication blend together in some
    /// modules, so a failure here leaves the stage unchanged and the
    /// caller decides whether the login proceeds.
    pub fn account_management(&mut self) -> Result<AuthOutcome> {
        self.check_stage(Stage::Login)?;
        let handle = self.handle.as_ref().ok_or(AuthError::NoHandle)?;
        Ok(AuthOutcome::from_result(handle.acct_mgmt(false, false)))
    }

    /// Open the PAM session and record the login time.
    pub fn login(&mut self) -> Result<AuthOutcome> {
        self.check_stage(Stage::Login)?;
        let handle = self.handle.as_ref().ok_or(AuthError::NoHandle)?;
        match handle.open_session(false) {
            Ok(()) => {
                self.login_at = Some(Utc::now());
                self.stage = Stage::Logout;
                Ok(AuthOutcome::Success { user_info: None })
            }
            Err(err) => {
                let outcome = AuthOutcome::Failed {
                    code: failure_code(&err),
                    reason: err.to_string(),
                };
                self.end();
                Ok(outcome)
            }
        }
    }

    /// Close the PAM session and clean up.
    pub fn logout(&mut self) -> Result<AuthOutcome> {
        self.check_stage(Stage::Logout)?;
        let handle = self.handle.as_ref().ok_or(AuthError::NoHandle)?;
        let outcome = AuthOutcome::from_result(handle.close_session(false));
        self.end();
        Ok(outcome)
    }

    /// Abandon any in-flight authentication, release the pam handle, and
    /// reset to the start stage.
    pub fn end(&mut self) {
        // dropping the worker closes the reply channel; an in-flight
        // conversation fails and the worker thread winds down on its own
        self.worker = None;
        self.handle = None;
        self.stage = Stage::Start;
        self.login_at = None;
    }
}

impl<S: ModuleStack + Clone + 'static> Drop for PamAuthenticator<S> {
    fn drop(&mut self) {
        if self.stage == Stage::Logout {
            if let Err(err) = self.logout() {
                warn!(user = %self.username, "logout during drop failed: {err}");
            }
        } else {
            self.end();
        }
    }
}

fn run_auth<S: ModuleStack + 'static>(
    stack: S,
    config: SessionConfig,
    pam_env: HashMap<String, String>,
    conversation: Arc<ChannelConversation>,
) -> std::result::Result<Handle<S>, CoreError> {
    let handle = Handle::new(stack, config, conversation)?;
    for (name, value) in &pam_env {
        handle.setenv(name, value)?;
    }
    handle.authenticate(false, false)?;
    Ok(handle)
}
