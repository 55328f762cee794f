//! Governance configuration
//!
//! Loaded from TOML. Every field has a default so a partial file (or none
//! at all) yields a working configuration.

use crate::error::GovernanceError;
use chrono::Duration;
use overseer_kernel::audit::{AuditLog, FileAuditStore};
use overseer_kernel::feedback::{FeedbackLoop, DEFAULT_MAX_ATTEMPTS};
use overseer_kernel::memory::{RollingMemory, DEFAULT_HORIZON_SECS, DEFAULT_RECENT_ACTIONS};
use overseer_kernel::review::{
    RiskReviewer, StaticGate, DEFAULT_BLOCKED_PATTERNS, DEFAULT_MAX_SCRIPT_CHARS,
    DEFAULT_PROTECTED_RESOURCE,
};
use overseer_kernel::sandbox::{Sandbox, DEFAULT_STEP_BUDGET};
use overseer_kernel::Identity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Privilege class of a known identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// May have actions executed
    Admin,
    /// May converse only
    Member,
}

/// Pipeline configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernanceConfig {
    /// Identities allowed to execute actions
    pub admins: BTreeSet<Identity>,
    /// Identities allowed to converse but not execute
    pub members: BTreeSet<Identity>,
    /// Newline count above which review always escalates
    pub max_lines_before_escalation: usize,
    /// Hard size ceiling enforced by the static gate
    pub max_script_chars: usize,
    /// Substrings the static gate refuses
    pub blocked_patterns: Vec<String>,
    /// Identifier no action may touch
    pub protected_resource: String,
    /// Execution attempts per action
    pub max_attempts: u32,
    /// How long an escalation waits for a decision
    pub escalation_timeout_secs: u64,
    /// Retention horizon of per-identity conversation memory
    pub memory_horizon_secs: i64,
    /// Capacity of the recent-actions log
    pub recent_actions_capacity: usize,
    /// Audit log file
    pub audit_log_path: PathBuf,
    /// Interpreter step budget per attempt
    pub step_budget: u64,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            admins: BTreeSet::new(),
            members: BTreeSet::new(),
            max_lines_before_escalation: 60,
            max_script_chars: DEFAULT_MAX_SCRIPT_CHARS,
            blocked_patterns: DEFAULT_BLOCKED_PATTERNS.iter().map(ToString::to_string).collect(),
            protected_resource: DEFAULT_PROTECTED_RESOURCE.to_string(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            escalation_timeout_secs: 120,
            memory_horizon_secs: DEFAULT_HORIZON_SECS,
            recent_actions_capacity: DEFAULT_RECENT_ACTIONS,
            audit_log_path: PathBuf::from("data/actions.log"),
            step_budget: DEFAULT_STEP_BUDGET,
        }
    }
}

impl GovernanceConfig {
    /// Default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse TOML text
    ///
    /// # Errors
    /// Malformed TOML or invalid values.
    pub fn from_toml_str(text: &str) -> Result<Self, GovernanceError> {
        let config: Self =
            toml::from_str(text).map_err(|e| GovernanceError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    ///
    /// # Errors
    /// Unreadable file, malformed TOML or invalid values.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, GovernanceError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| GovernanceError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Check value ranges
    ///
    /// # Errors
    /// The first invalid field.
    pub fn validate(&self) -> Result<(), GovernanceError> {
        let invalid = |msg: &str| Err(GovernanceError::Config(msg.to_string()));
        if self.max_attempts == 0 {
            return invalid("max_attempts must be at least 1");
        }
        if self.escalation_timeout_secs == 0 {
            return invalid("escalation_timeout_secs must be positive");
        }
        if self.memory_horizon_secs <= 0 {
            return invalid("memory_horizon_secs must be positive");
        }
        if self.step_budget == 0 {
            return invalid("step_budget must be positive");
        }
        if self.max_script_chars == 0 {
            return invalid("max_script_chars must be positive");
        }
        if let Some(id) = self.admins.intersection(&self.members).next() {
            return Err(GovernanceError::Config(format!(
                "identity {id} is listed as both admin and member"
            )));
        }
        Ok(())
    }

    /// Role of `identity`, `None` when unknown
    #[must_use]
    pub fn role_of(&self, identity: Identity) -> Option<Role> {
        if self.admins.contains(&identity) {
            Some(Role::Admin)
        } else if self.members.contains(&identity) {
            Some(Role::Member)
        } else {
            None
        }
    }

    /// Add an admin
    #[must_use]
    pub fn with_admin(mut self, identity: impl Into<Identity>) -> Self {
        self.admins.insert(identity.into());
        self
    }

    /// Add a non-privileged member
    #[must_use]
    pub fn with_member(mut self, identity: impl Into<Identity>) -> Self {
        self.members.insert(identity.into());
        self
    }

    /// With attempt limit
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// With escalation timeout
    #[must_use]
    pub fn with_escalation_timeout_secs(mut self, secs: u64) -> Self {
        self.escalation_timeout_secs = secs;
        self
    }

    /// With protected resource identifier
    #[must_use]
    pub fn with_protected_resource(mut self, id: impl Into<String>) -> Self {
        self.protected_resource = id.into();
        self
    }

    /// With audit log path
    #[must_use]
    pub fn with_audit_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.audit_log_path = path.into();
        self
    }

    /// With interpreter step budget
    #[must_use]
    pub fn with_step_budget(mut self, budget: u64) -> Self {
        self.step_budget = budget;
        self
    }

    /// Escalation timeout as a duration
    #[must_use]
    pub fn escalation_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.escalation_timeout_secs)
    }

    /// Reviewer built from this configuration
    #[must_use]
    pub fn reviewer(&self) -> RiskReviewer {
        RiskReviewer::new(self.max_lines_before_escalation)
    }

    /// Static gate built from this configuration
    #[must_use]
    pub fn gate(&self) -> StaticGate {
        StaticGate::new(
            &self.blocked_patterns,
            self.protected_resource.as_str(),
            self.max_script_chars,
        )
    }

    /// Sandbox built from this configuration
    #[must_use]
    pub fn sandbox(&self) -> Sandbox {
        Sandbox::new().with_step_budget(self.step_budget)
    }

    /// Retry loop built from this configuration
    #[must_use]
    pub fn feedback_loop(&self) -> FeedbackLoop {
        FeedbackLoop::new(self.max_attempts)
    }

    /// Rolling memory built from this configuration
    #[must_use]
    pub fn memory(&self) -> RollingMemory {
        RollingMemory::new(
            Duration::seconds(self.memory_horizon_secs),
            self.recent_actions_capacity,
        )
    }

    /// Audit log at the configured path
    ///
    /// # Errors
    /// The file or its directory could not be opened.
    pub fn open_audit_log(&self) -> Result<AuditLog, GovernanceError> {
        let store = FileAuditStore::open(&self.audit_log_path)?;
        Ok(AuditLog::open(Arc::new(store))?)
    }
}
