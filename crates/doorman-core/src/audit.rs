//! Audit boundary for privileged operations
//!
//! Before authenticate, setcred, open_session, and close_session the handle
//! emits an audit event carrying the identity (and the credential operation
//! for setcred). A hook that rejects the event stops the operation before
//! the native handle is touched.

use serde::Serialize;

use crate::code::CredOp;

/// One audit event, emitted before a privileged operation runs.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent<'a> {
    /// Operation about to run, e.g. `authenticate`
    pub operation: &'static str,
    /// User the handle was created for
    pub user: &'a str,
    /// Requested credential operation, for setcred events
    pub cred_op: Option<CredOp>,
}

/// Receives audit events for privileged operations.
///
/// Returning `Err` rejects the event: the operation fails with an audit
/// error and the module stack is not invoked.
pub trait AuditHook: Send + Sync {
    fn event(&self, event: &AuditEvent<'_>) -> std::result::Result<(), String>;
}

/// Default hook: log the event through `tracing` and allow it.
pub struct TracingAudit;

impl AuditHook for TracingAudit {
    fn event(&self, event: &AuditEvent<'_>) -> std::result::Result<(), String> {
        match event.cred_op {
            Some(op) => tracing::info!(
                operation = event.operation,
                user = event.user,
                cred_op = %op,
                "privileged pam operation"
            ),
            None => tracing::info!(
                operation = event.operation,
                user = event.user,
                "privileged pam operation"
            ),
        }
        Ok(())
    }
}
