//! Static execution gate
//!
//! Runs at execution-authorization time. Unlike the advisory reviewer it has
//! no escalation path: a violation is final.

use serde::{Deserialize, Serialize};

/// Default hard size ceiling in characters
pub const DEFAULT_MAX_SCRIPT_CHARS: usize = 5_000;

/// Default protected resource identifier
pub const DEFAULT_PROTECTED_RESOURCE: &str = "1444077226365816864";

/// Raw OS, filesystem, process and socket access markers
pub const DEFAULT_BLOCKED_PATTERNS: &[&str] = &[
    "import os",
    "os.remove",
    "os.rmdir",
    "shutil.rmtree",
    "subprocess",
    "std::process",
    "std::fs",
    "open(\"/",
    "socket",
    "exec(",
    "eval(",
];

/// Reason the gate refused an action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum GateViolation {
    /// Text contains a blocked substring
    #[error("script contains blocked pattern: {0}")]
    BlockedPattern(String),

    /// Text references the protected resource
    #[error("script references protected resource {0}")]
    ProtectedResource(String),

    /// Text exceeds the hard size ceiling
    #[error("script too large and ambiguous ({size} > {limit} characters)")]
    TooLarge {
        /// Observed size in characters
        size: usize,
        /// Configured ceiling
        limit: usize,
    },
}

/// Pattern-based hard gate
#[derive(Debug, Clone)]
pub struct StaticGate {
    blocked_patterns: Vec<String>,
    protected_resource: String,
    max_chars: usize,
}

impl StaticGate {
    /// Create a gate with explicit settings
    ///
    /// Patterns are matched case-insensitively.
    pub fn new<I, S>(blocked_patterns: I, protected_resource: impl Into<String>, max_chars: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            blocked_patterns: blocked_patterns
                .into_iter()
                .map(|p| p.as_ref().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
            protected_resource: protected_resource.into().trim().to_lowercase(),
            max_chars,
        }
    }

    /// Protected resource identifier (normalized)
    #[inline]
    #[must_use]
    pub fn protected_resource(&self) -> &str {
        &self.protected_resource
    }

    /// Check action text against the gate
    ///
    /// # Errors
    /// Returns the first violation found: blocked patterns, then the
    /// protected resource, then the size ceiling.
    pub fn check(&self, script: &str) -> Result<(), GateViolation> {
        let lowered = script.to_lowercase();

        if let Some(pattern) = self.blocked_patterns.iter().find(|p| lowered.contains(p.as_str())) {
            tracing::warn!(%pattern, "static gate blocked action");
            return Err(GateViolation::BlockedPattern(pattern.clone()));
        }

        if !self.protected_resource.is_empty() && lowered.contains(&self.protected_resource) {
            tracing::warn!(resource = %self.protected_resource, "static gate blocked protected resource");
            return Err(GateViolation::ProtectedResource(self.protected_resource.clone()));
        }

        let size = script.chars().count();
        if size > self.max_chars {
            return Err(GateViolation::TooLarge {
                size,
                limit: self.max_chars,
            });
        }

        Ok(())
    }
}

impl Default for StaticGate {
    fn default() -> Self {
        Self::new(
            DEFAULT_BLOCKED_PATTERNS.iter().copied(),
            DEFAULT_PROTECTED_RESOURCE,
            DEFAULT_MAX_SCRIPT_CHARS,
        )
    }
}
