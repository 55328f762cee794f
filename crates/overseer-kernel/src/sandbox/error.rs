//! Sandbox error types

use crate::feedback::Retryable;

/// Syntax error in action text
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("parse error at {line}:{column}: {message}")]
pub struct ParseError {
    /// 1-based line
    pub line: usize,
    /// 1-based column
    pub column: usize,
    /// What went wrong
    pub message: String,
}

impl ParseError {
    /// Create a parse error at a position
    pub fn new(line: usize, column: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            column,
            message: message.into(),
        }
    }
}

/// Errors raised while running an action
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SandboxError {
    /// Action text did not parse
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Entry point has the wrong shape
    #[error("invalid entry point: {0}")]
    EntryPoint(String),

    /// Name is neither a local, a function, a builtin nor a capability
    #[error("unknown name '{0}'")]
    UnknownName(String),

    /// Operation applied to a value of the wrong type
    #[error("type error: {0}")]
    Type(String),

    /// Wrong number of arguments
    #[error("{name} expects {expected} argument(s), got {got}")]
    Arity {
        /// Function name
        name: String,
        /// Expected count description
        expected: String,
        /// Supplied count
        got: usize,
    },

    /// Generic evaluation failure (division by zero, bad index, ...)
    #[error("runtime error: {0}")]
    Runtime(String),

    /// Evaluation step budget exhausted
    #[error("step budget of {0} exhausted")]
    StepBudgetExhausted(u64),

    /// Call depth limit reached
    #[error("call depth limit of {0} reached")]
    RecursionLimit(usize),

    /// A capability reported a failure
    #[error("capability '{name}' failed: {message}")]
    Capability {
        /// Capability name
        name: String,
        /// Failure detail
        message: String,
    },

    /// The action tried to touch the protected resource
    #[error("protected resource violation: {0}")]
    ProtectedResourceViolation(String),
}

impl SandboxError {
    /// Shorthand for a type error
    pub(crate) fn type_error(message: impl Into<String>) -> Self {
        Self::Type(message.into())
    }

    /// Shorthand for a runtime error
    pub(crate) fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }
}

impl Retryable for SandboxError {
    /// Unchanged text fails the same way again on parse and entry-point
    /// errors, so only runtime failures are retried
    fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Parse(_) | Self::EntryPoint(_) | Self::ProtectedResourceViolation(_)
        )
    }
}
