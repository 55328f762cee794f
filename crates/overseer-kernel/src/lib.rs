//! Overseer Kernel (overseer-kernel)
//!
//! Governance primitives for generated administrative actions:
//! 1. **Review**: advisory risk verdict plus the hard static gate
//! 2. **Sandbox**: capability-restricted interpreter for action text
//! 3. **Feedback**: bounded, sequential retry with error feedback
//! 4. **Audit**: append-only, hash-chained decision history
//! 5. **Memory**: rolling per-identity context and recent actions
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use overseer_kernel::prelude::*;
//!
//! let verdict = RiskReviewer::default().review(text);
//! StaticGate::default().check(text)?;
//! let outcome = Sandbox::new().execute(text, &capabilities).await?;
//! ```

pub mod audit;
pub mod feedback;
pub mod memory;
pub mod review;
pub mod sandbox;
pub mod scheduler;
pub mod types;

pub use types::*;

/// Common imports
pub mod prelude {
    pub use crate::audit::{AuditEntry, AuditError, AuditLog, AuditRecord, AuditStatus, AuditStore};
    pub use crate::feedback::{FeedbackLoop, FeedbackOutcome, Retryable};
    pub use crate::memory::RollingMemory;
    pub use crate::review::{GateViolation, ReviewDecision, RiskReviewer, RiskVerdict, StaticGate};
    pub use crate::sandbox::{
        Capability, CapabilityError, CapabilityMap, ExecutionOutcome, Sandbox, SandboxError,
    };
    pub use crate::scheduler::{ScheduledTaskId, TaskScheduler};
    pub use crate::types::{Clock, Identity, SharedClock, SystemClock, TicketId};
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
