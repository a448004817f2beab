//! One-shot username/password authentication
//!
//! For callers that already hold the credentials and want a plain yes/no,
//! without driving conversation rounds themselves. The stored password
//! answers echo-off prompts, the username answers echo-on prompts, and it
//! is wiped after the first attempt.

use std::sync::Arc;
use std::time::Duration;

use zeroize::Zeroizing;

use doorman_core::{
    Conversation, Handle, Message, MessageStyle, ModuleStack, Reply, Result as CoreResult,
};

use crate::authenticator::{failure_code, AuthOutcome, PamAuthenticator, Stage, UserInfo};
use crate::error::{AuthError, Result};

/// Answers prompts from credentials captured up front.
struct StoredCredentials {
    username: String,
    password: Zeroizing<String>,
}

impl Conversation for StoredCredentials {
    fn converse(&self, messages: &[Message]) -> CoreResult<Vec<Reply>> {
        Ok(messages
            .iter()
            .map(|message| match message.style {
                MessageStyle::PromptEchoOff => Some(self.password.to_string()),
                MessageStyle::PromptEchoOn => Some(self.username.clone()),
                _ => None,
            })
            .collect())
    }
}

/// Simple authenticator with basic username/password authentication.
pub struct SimpleAuthenticator<S: ModuleStack + Clone + 'static> {
    inner: PamAuthenticator<S>,
    password: Option<Zeroizing<String>>,
}

impl<S: ModuleStack + Clone + 'static> SimpleAuthenticator<S> {
    pub fn new(stack: S, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            inner: PamAuthenticator::new(stack, username),
            password: Some(Zeroizing::new(password.into())),
        }
    }

    pub fn service(mut self, service: impl Into<String>) -> Self {
        self.inner = self.inner.service(service);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.inner = self.inner.timeout(timeout);
        self
    }

    pub fn ruser(mut self, ruser: impl Into<String>) -> Self {
        self.inner = self.inner.ruser(ruser);
        self
    }

    pub fn rhost(mut self, rhost: impl Into<String>) -> Self {
        self.inner = self.inner.rhost(rhost);
        self
    }

    pub fn fail_delay_usec(mut self, usec: u32) -> Self {
        self.inner = self.inner.fail_delay_usec(usec);
        self
    }

    pub fn env_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.inner = self.inner.env_var(name, value);
        self
    }

    pub fn stage(&self) -> Stage {
        self.inner.stage()
    }

    pub fn login_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.inner.login_at()
    }

    pub fn handle(&self) -> Option<&Handle<S>> {
        self.inner.handle()
    }

    /// Authenticate with the credentials given at construction.
    ///
    /// Runs synchronously: the stored credentials answer every prompt, so
    /// there is never a `Prompts` outcome. The password is consumed by the
    /// first call whether or not it succeeds.
    pub fn auth_init(&mut self) -> Result<AuthOutcome> {
        self.inner.check_stage(Stage::Start)?;
        let password = self.password.take().ok_or(AuthError::PasswordConsumed)?;

        let conversation = Arc::new(StoredCredentials {
            username: self.inner.username().to_string(),
            password,
        });

        let result = (|| -> doorman_core::Result<Handle<S>> {
            let handle = Handle::new(
                self.inner.stack().clone(),
                self.inner.session_config(),
                conversation,
            )?;
            for (name, value) in self.inner.pam_env() {
                handle.setenv(name, value)?;
            }
            handle.authenticate(false, false)?;
            Ok(handle)
        })();

        match result {
            Ok(handle) => {
                self.inner.install_handle(handle);
                Ok(AuthOutcome::Success {
                    user_info: Some(UserInfo {
                        username: self.inner.username().to_string(),
                        account_flags: Vec::new(),
                    }),
                })
            }
            Err(err) => Ok(AuthOutcome::Failed {
                code: failure_code(&err),
                reason: err.to_string(),
            }),
        }
    }

    /// Authenticate and reduce the outcome to a bool.
    pub fn authenticate_simple(&mut self) -> Result<bool> {
        Ok(self.auth_init()?.is_success())
    }

    pub fn account_management(&mut self) -> Result<AuthOutcome> {
        self.inner.account_management()
    }

    pub fn login(&mut self) -> Result<AuthOutcome> {
        self.inner.login()
    }

    pub fn logout(&mut self) -> Result<AuthOutcome> {
        self.inner.logout()
    }

    pub fn end(&mut self) {
        self.inner.end();
    }
}
