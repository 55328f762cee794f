//! Overseer Core (overseer-core)
//!
//! Orchestration layer over `overseer-kernel`:
//! - **Pipeline**: authorization, planning, review, escalation, gate,
//!   sandboxed execution with retry, audit
//! - **Escalation**: pending-approval registry with exactly-once decisions
//! - **Command**: whitelisted structured command context
//! - **Config**: TOML-backed governance settings
//!
//! # Usage
//!
//! ```rust,ignore
//! use overseer_core::prelude::*;
//!
//! let pipeline = GovernancePipeline::new(config, planner, channel, audit)?;
//! let response = pipeline.handle_request(identity, "create a role", &capabilities).await?;
//! ```

pub mod command;
pub mod config;
pub mod error;
pub mod escalation;
pub mod pipeline;
pub mod planner;

pub use error::GovernanceError;

/// Common imports
pub mod prelude {
    pub use crate::command::{CommandContext, DEFAULT_COMMAND_SCRIPT};
    pub use crate::config::{GovernanceConfig, Role};
    pub use crate::error::GovernanceError;
    pub use crate::escalation::{
        ChannelError, DecisionAck, Destination, EscalationBroker, EscalationOutcome,
        EscalationPrompt, NotificationChannel,
    };
    pub use crate::pipeline::{ActionOutcome, ActionRequest, GovernancePipeline, PipelineResponse};
    pub use crate::planner::{Planner, PlannerError, PlannerReply};
    pub use overseer_kernel::prelude::*;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
