//! Error types for the governance pipeline
//!
//! Most failures are turned into a user-visible outcome and audited. The
//! variants here are the ones raised to the caller, plus the full taxonomy
//! so callers and tests can classify outcomes uniformly.

use crate::planner::MalformedOutput;
use overseer_kernel::audit::AuditError;
use overseer_kernel::sandbox::SandboxError;
use overseer_kernel::Identity;

/// Main governance error type
#[derive(Debug, thiserror::Error)]
pub enum GovernanceError {
    /// Planner output was not the expected JSON shape
    #[error("malformed planner output: {0}")]
    MalformedPlannerOutput(#[from] MalformedOutput),

    /// Review rejected the action
    #[error("action rejected by review: {0}")]
    ReviewRejected(String),

    /// Approver rejected the action
    #[error("escalation denied")]
    EscalationDenied,

    /// No decision arrived in time
    #[error("escalation timed out after {0}s")]
    EscalationTimedOut(u64),

    /// Identity is not configured at all
    #[error("identity {0} is not authorized")]
    NotAuthorized(Identity),

    /// Identity is known but may not execute
    #[error("denied: {0}")]
    Denied(String),

    /// Action touched the protected resource
    #[error("protected resource violation: {0}")]
    ProtectedResourceViolation(String),

    /// Action failed at runtime after all attempts
    #[error("sandbox runtime error: {0}")]
    SandboxRuntime(#[from] SandboxError),

    /// Audit store failure
    #[error("audit failure: {0}")]
    Audit(#[from] AuditError),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl GovernanceError {
    /// Check if the error is a policy violation rather than a fault
    #[inline]
    #[must_use]
    pub fn is_policy_violation(&self) -> bool {
        matches!(
            self,
            Self::ProtectedResourceViolation(_) | Self::NotAuthorized(_) | Self::Denied(_)
        )
    }
}
