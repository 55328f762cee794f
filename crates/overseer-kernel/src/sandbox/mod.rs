//! Sandboxed Executor
//!
//! Runs generated action text against an explicit capability map. Action
//! text is parsed into a small brace-delimited language and evaluated by an
//! async tree-walking interpreter; it never reaches a host language runtime.
//!
//! # Modes
//!
//! - **Free text**: the entry point is `async fn main()`. Top-level names
//!   resolve to the supplied capabilities. No `main` means nothing to run.
//! - **Structured**: the entry point is `fn run(context)`. Only the context
//!   namespace is reachable; method calls on it dispatch to capabilities.
//!
//! # Limits
//!
//! Every evaluation step counts against a step budget and user-function
//! calls are bounded by a depth limit, so runaway loops and recursion end
//! with an error instead of hanging the caller.

mod ast;
mod builtins;
mod capability;
mod error;
mod interpreter;
mod lexer;
mod parser;
mod value;

pub use ast::{FunctionDef, Program};
pub use capability::{args, Capability, CapabilityError, CapabilityMap};
pub use error::{ParseError, SandboxError};
pub use parser::parse;
pub use value::Value;

use interpreter::Interpreter;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Default evaluation step budget
pub const DEFAULT_STEP_BUDGET: u64 = 10_000;

/// Default user-function call depth limit
pub const DEFAULT_MAX_CALL_DEPTH: usize = 64;

/// Entry point name for free-text actions
pub const FREE_TEXT_ENTRY: &str = "main";

/// Entry point name for structured commands
pub const COMMAND_ENTRY: &str = "run";

/// Result of running a free-text action
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// The text defined no entry point; nothing ran
    NoOp,
    /// The entry point ran to completion with this return value
    Completed(serde_json::Value),
}

impl ExecutionOutcome {
    /// Return value, `null` for a no-op
    #[must_use]
    pub fn value(&self) -> serde_json::Value {
        match self {
            Self::NoOp => serde_json::Value::Null,
            Self::Completed(v) => v.clone(),
        }
    }
}

/// Executor configuration and entry points
#[derive(Debug, Clone, Copy)]
pub struct Sandbox {
    step_budget: u64,
    max_call_depth: usize,
}

impl Default for Sandbox {
    fn default() -> Self {
        Self {
            step_budget: DEFAULT_STEP_BUDGET,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
        }
    }
}

impl Sandbox {
    /// Sandbox with default limits
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the step budget
    #[must_use]
    pub fn with_step_budget(mut self, budget: u64) -> Self {
        self.step_budget = budget;
        self
    }

    /// Set the call depth limit
    #[must_use]
    pub fn with_max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth;
        self
    }

    /// Configured step budget
    #[must_use]
    pub fn step_budget(&self) -> u64 {
        self.step_budget
    }

    /// Run free-text action text
    ///
    /// # Errors
    /// Parse errors, a malformed `main`, and anything raised while running.
    #[instrument(skip_all, fields(chars = text.len()))]
    pub async fn execute(
        &self,
        text: &str,
        capabilities: &CapabilityMap,
    ) -> Result<ExecutionOutcome, SandboxError> {
        let program = parse(text)?;
        let Some(entry) = program.function(FREE_TEXT_ENTRY) else {
            debug!("No entry point defined; nothing to run");
            return Ok(ExecutionOutcome::NoOp);
        };
        if !entry.is_async {
            return Err(SandboxError::EntryPoint(
                "main must be an async function".to_string(),
            ));
        }
        if !entry.params.is_empty() {
            return Err(SandboxError::EntryPoint(
                "main must not take parameters".to_string(),
            ));
        }

        let interp = Interpreter::new(
            &program,
            Some(capabilities),
            self.step_budget,
            self.max_call_depth,
        );
        let result = interp.call_function(entry, Vec::new(), 0).await;
        debug!(steps = interp.steps_used(), ok = result.is_ok(), "Action finished");
        result.map(|v| ExecutionOutcome::Completed(v.to_json()))
    }

    /// Run a structured command against a context namespace
    ///
    /// # Errors
    /// Parse errors, a missing or malformed `run`, and anything raised
    /// while running.
    #[instrument(skip_all, fields(chars = text.len()))]
    pub async fn execute_command(
        &self,
        text: &str,
        context: Arc<CapabilityMap>,
    ) -> Result<serde_json::Value, SandboxError> {
        let program = parse(text)?;
        let entry = program.function(COMMAND_ENTRY).ok_or_else(|| {
            SandboxError::EntryPoint("script did not define run(context)".to_string())
        })?;
        if entry.params.len() != 1 {
            return Err(SandboxError::EntryPoint(
                "run must take exactly one parameter".to_string(),
            ));
        }

        let interp = Interpreter::new(&program, None, self.step_budget, self.max_call_depth);
        let result = interp
            .call_function(entry, vec![Value::Namespace(context)], 0)
            .await;
        debug!(steps = interp.steps_used(), ok = result.is_ok(), "Command finished");
        result.map(|v| v.to_json())
    }
}
