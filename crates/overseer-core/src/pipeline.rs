//! Governance Pipeline
//!
//! Drives one request end to end: authorization, planning, then for each
//! proposed action review, escalation, the static gate and sandboxed
//! execution under the retry loop. Every transition is audited.
//!
//! ```text
//! Reviewed -> Rejected
//!          -> Escalated -> Denied
//!                       -> Approved -> Executing -> Succeeded | Failed
//! ```

use crate::command::{is_protected_target, CommandContext};
use crate::config::{GovernanceConfig, Role};
use crate::error::GovernanceError;
use crate::escalation::{EscalationBroker, EscalationOutcome, NotificationChannel};
use crate::planner::{MalformedOutput, Planner, PlannerReply};
use overseer_kernel::audit::{AuditEntry, AuditLog, AuditStatus};
use overseer_kernel::feedback::FeedbackLoop;
use overseer_kernel::memory::RollingMemory;
use overseer_kernel::review::{GateViolation, ReviewDecision, RiskReviewer, StaticGate};
use overseer_kernel::sandbox::{args, CapabilityError, CapabilityMap, Sandbox, SandboxError};
use overseer_kernel::scheduler::TaskScheduler;
use overseer_kernel::{Identity, RequestId, TicketId};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Message shown to identities that may converse but not execute
pub const MSG_NON_PRIVILEGED: &str = "You are not permitted to run administrative actions.";

/// Recent actions handed to the planner as context
pub const PLANNER_RECENT_ACTIONS: usize = 20;

const DENIED_NOT_AUTHORIZED: &str = "denied: not-authorized";
const NON_PRIVILEGED: &str = "non-privileged";

/// Platform operation guarded against the protected resource
const DELETE_CHANNEL: &str = "delete_channel";

/// One proposed action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRequest {
    /// Request identifier
    pub request_id: RequestId,
    /// Requesting identity
    pub identity: Identity,
    /// Action text
    pub text: String,
}

impl ActionRequest {
    /// Create a request with a fresh identifier
    #[must_use]
    pub fn new(identity: Identity, text: impl Into<String>) -> Self {
        Self {
            request_id: RequestId::new(),
            identity,
            text: text.into(),
        }
    }
}

/// Terminal state of one action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ActionOutcome {
    /// Review refused the action
    Rejected {
        /// Risks reported by review
        risks: Vec<String>,
    },
    /// Approval was not granted
    Denied {
        /// Why approval was not granted
        reason: String,
    },
    /// The static gate refused the action
    Blocked {
        /// Gate violation
        reason: String,
    },
    /// Some attempt succeeded
    Succeeded {
        /// Entry point return value (`null` for a no-op)
        result: Json,
        /// Attempts used
        attempts: u32,
    },
    /// Every attempt failed
    Failed {
        /// Detail of the final failure
        last_error: String,
        /// Attempts used
        attempts: u32,
    },
}

impl ActionOutcome {
    /// Reply shown to the requester
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Rejected { risks } => format!("Action rejected: {}", risks.join(", ")),
            Self::Denied { .. } => "Action not approved.".to_string(),
            Self::Blocked { reason } => format!("Action blocked: {reason}"),
            Self::Succeeded { attempts, .. } => {
                format!("Action executed successfully after {attempts} attempt(s).")
            }
            Self::Failed {
                last_error,
                attempts,
            } => format!("Action failed after {attempts} attempt(s): {last_error}"),
        }
    }

    /// Check if the action ran to completion
    #[inline]
    #[must_use]
    pub fn succeeded(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Rejected { .. } => "rejected",
            Self::Denied { .. } => "denied",
            Self::Blocked { .. } => "blocked",
            Self::Succeeded { .. } => "succeeded",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Everything produced for one inbound message
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PipelineResponse {
    /// Conversational reply from the planner (or its fallback)
    pub reply: String,
    /// Set when actions were proposed for a non-privileged identity
    pub denial: Option<String>,
    /// One outcome per executed-or-refused action, in proposal order
    pub outcomes: Vec<ActionOutcome>,
}

impl PipelineResponse {
    /// All user-visible messages, in order
    #[must_use]
    pub fn messages(&self) -> Vec<String> {
        let mut messages = Vec::with_capacity(2 + self.outcomes.len());
        if !self.reply.is_empty() {
            messages.push(self.reply.clone());
        }
        messages.extend(self.denial.clone());
        messages.extend(self.outcomes.iter().map(ActionOutcome::user_message));
        messages
    }
}

/// The governance orchestrator
///
/// Owns the shared registries (pending escalations, memory, scheduled
/// tasks, audit log); all access goes through its methods. Many requests
/// may be in flight at once on one instance.
pub struct GovernancePipeline {
    config: GovernanceConfig,
    reviewer: RiskReviewer,
    gate: StaticGate,
    sandbox: Sandbox,
    feedback: FeedbackLoop,
    planner: Arc<dyn Planner>,
    broker: Arc<EscalationBroker>,
    memory: Arc<RollingMemory>,
    audit: Arc<AuditLog>,
    scheduler: Arc<TaskScheduler>,
}

impl std::fmt::Debug for GovernancePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GovernancePipeline")
            .field("config", &self.config)
            .field("broker", &self.broker)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl GovernancePipeline {
    /// Build a pipeline from configuration and collaborators
    ///
    /// # Errors
    /// The configuration is invalid.
    pub fn new(
        config: GovernanceConfig,
        planner: Arc<dyn Planner>,
        channel: Arc<dyn NotificationChannel>,
        audit: Arc<AuditLog>,
    ) -> Result<Self, GovernanceError> {
        config.validate()?;
        let broker = EscalationBroker::with_timeout(channel, config.escalation_timeout());
        Ok(Self {
            reviewer: config.reviewer(),
            gate: config.gate(),
            sandbox: config.sandbox(),
            feedback: config.feedback_loop(),
            memory: Arc::new(config.memory()),
            planner,
            broker: Arc::new(broker),
            audit,
            scheduler: Arc::new(TaskScheduler::new()),
            config,
        })
    }

    /// Replace the rolling memory (e.g. one with an injected clock)
    #[must_use]
    pub fn with_memory(mut self, memory: RollingMemory) -> Self {
        self.memory = Arc::new(memory);
        self
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &GovernanceConfig {
        &self.config
    }

    /// Escalation broker; decision callbacks are delivered here
    #[must_use]
    pub fn broker(&self) -> Arc<EscalationBroker> {
        Arc::clone(&self.broker)
    }

    /// Rolling memory
    #[must_use]
    pub fn memory(&self) -> &RollingMemory {
        &self.memory
    }

    /// Audit log
    #[must_use]
    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Deferred-task scheduler
    #[must_use]
    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    fn authorize(&self, identity: Identity) -> Result<Role, GovernanceError> {
        if let Some(role) = self.config.role_of(identity) {
            return Ok(role);
        }
        warn!(%identity, "Request from unknown identity");
        self.audit.append(
            AuditEntry::new("request_authorization", AuditStatus::Denied, identity)
                .error(DENIED_NOT_AUTHORIZED),
        )?;
        Err(GovernanceError::NotAuthorized(identity))
    }

    /// Audit a non-privileged execution attempt and return the denial
    fn deny_non_privileged(
        &self,
        identity: Identity,
        proposed: usize,
    ) -> Result<GovernanceError, GovernanceError> {
        info!(%identity, proposed, "Execution denied for non-privileged identity");
        let denial = GovernanceError::Denied(NON_PRIVILEGED.to_string());
        self.audit.append(
            AuditEntry::new("request_authorization", AuditStatus::Denied, identity)
                .detail("proposed_actions", proposed)
                .error(denial.to_string()),
        )?;
        Ok(denial)
    }

    async fn plan(&self, identity: Identity, message: &str) -> Result<PlannerReply, GovernanceError> {
        let conversation = self.memory.recall(identity);
        let recent = self.memory.recent_actions(PLANNER_RECENT_ACTIONS);
        let raw = self
            .planner
            .propose(identity, message, &conversation, &recent)
            .await
            .map_err(MalformedOutput::from)?;
        Ok(PlannerReply::parse(&raw)?)
    }

    /// Handle one inbound chat message
    ///
    /// # Errors
    /// [`GovernanceError::NotAuthorized`] for unknown identities;
    /// [`GovernanceError::ProtectedResourceViolation`] when an action
    /// touched the protected resource; audit store failures.
    #[instrument(skip(self, message, capabilities))]
    pub async fn handle_request(
        &self,
        identity: Identity,
        message: &str,
        capabilities: &CapabilityMap,
    ) -> Result<PipelineResponse, GovernanceError> {
        let role = self.authorize(identity)?;

        self.memory.add_message(identity, message);
        let planned = match self.plan(identity, message).await {
            Ok(planned) => planned,
            Err(GovernanceError::MalformedPlannerOutput(cause)) => {
                warn!(error = %cause, "Planner output unusable; replying conversationally");
                PlannerReply::fallback(cause.fallback_reply())
            }
            Err(other) => return Err(other),
        };

        let mut response = PipelineResponse {
            reply: planned.reply,
            ..PipelineResponse::default()
        };
        if planned.actions.is_empty() {
            return Ok(response);
        }
        if role == Role::Member {
            let denial = self.deny_non_privileged(identity, planned.actions.len())?;
            debug!(%denial, "Proposed actions dropped");
            response.denial = Some(MSG_NON_PRIVILEGED.to_string());
            return Ok(response);
        }

        for text in planned.actions {
            let outcome = self
                .govern_action(ActionRequest::new(identity, text), capabilities)
                .await?;
            response.outcomes.push(outcome);
        }
        Ok(response)
    }

    /// Run one action through review, escalation, the gate and execution
    ///
    /// # Errors
    /// [`GovernanceError::ProtectedResourceViolation`] when the action
    /// touched the protected resource (audited first); audit store failures.
    #[instrument(skip_all, fields(request = %request.request_id, identity = %request.identity))]
    pub async fn govern_action(
        &self,
        request: ActionRequest,
        capabilities: &CapabilityMap,
    ) -> Result<ActionOutcome, GovernanceError> {
        let ActionRequest {
            request_id,
            identity,
            text,
        } = request;
        let verdict = self.reviewer.review(&text);
        let decision = verdict.decision();

        let mut review = AuditEntry::new(
            "action_review",
            if decision == ReviewDecision::Reject {
                AuditStatus::Rejected
            } else {
                AuditStatus::Success
            },
            identity,
        )
        .detail("request_id", request_id.to_string())
        .detail("decision", format!("{decision:?}").to_lowercase())
        .detail("summary", verdict.summary.as_str())
        .detail("risks", verdict.risks.clone());
        if decision == ReviewDecision::Reject {
            review = review.error(GovernanceError::ReviewRejected(verdict.risks.join(", ")).to_string());
        }
        self.audit.append(review)?;

        let outcome = match decision {
            ReviewDecision::Reject => {
                info!(risks = ?verdict.risks, "Action rejected by review");
                ActionOutcome::Rejected {
                    risks: verdict.risks,
                }
            }
            ReviewDecision::Escalate => {
                let ticket = TicketId::new();
                let escalation = self
                    .broker
                    .escalate(ticket, &verdict.summary, &verdict.risks, &text)
                    .await;
                let status = if escalation.is_approved() {
                    AuditStatus::Success
                } else {
                    AuditStatus::Denied
                };
                let mut entry = AuditEntry::new("action_escalation", status, identity)
                    .detail("request_id", request_id.to_string())
                    .detail("ticket_id", ticket.to_string())
                    .detail("outcome", escalation.as_str());
                if !escalation.is_approved() {
                    entry = entry.error(escalation_error(escalation, &self.broker).to_string());
                }
                self.audit.append(entry)?;

                if escalation.is_approved() {
                    self.authorize_and_execute(request_id, identity, &text, capabilities)
                        .await?
                } else {
                    ActionOutcome::Denied {
                        reason: escalation.as_str().to_string(),
                    }
                }
            }
            ReviewDecision::Approve => {
                self.authorize_and_execute(request_id, identity, &text, capabilities)
                    .await?
            }
        };

        self.memory
            .add_action(format!("[{}] {}", outcome.label(), verdict.summary));
        Ok(outcome)
    }

    async fn authorize_and_execute(
        &self,
        request_id: RequestId,
        identity: Identity,
        text: &str,
        capabilities: &CapabilityMap,
    ) -> Result<ActionOutcome, GovernanceError> {
        if let Some(blocked) = self.check_gate(request_id, identity, text)? {
            return Ok(blocked);
        }

        let guarded = self.guard_protected(capabilities, request_id, identity);
        let sandbox = &self.sandbox;
        let run = self
            .feedback
            .run(|attempt, previous| {
                if let Some(previous) = previous {
                    debug!(attempt, previous = %previous, "Retrying action");
                }
                sandbox.execute(text, &guarded)
            })
            .await;

        let mut entry = AuditEntry::new(
            "action_execute",
            if run.succeeded() {
                AuditStatus::Success
            } else {
                AuditStatus::Failed
            },
            identity,
        )
        .detail("request_id", request_id.to_string())
        .detail("attempts", run.attempts);
        if let Some(e) = &run.last_error {
            entry = entry.error(e.to_string());
        }
        if let Some(result) = &run.result {
            entry = entry.detail("result", result.value());
        }
        self.audit.append(entry)?;

        match (run.result, run.last_error) {
            (Some(result), _) => Ok(ActionOutcome::Succeeded {
                result: result.value(),
                attempts: run.attempts,
            }),
            (None, Some(SandboxError::ProtectedResourceViolation(id))) => {
                Err(GovernanceError::ProtectedResourceViolation(id))
            }
            (None, last_error) => Ok(ActionOutcome::Failed {
                last_error: last_error.map(|e| e.to_string()).unwrap_or_default(),
                attempts: run.attempts,
            }),
        }
    }

    /// Copy of `capabilities` whose `delete_channel` refuses the protected
    /// resource
    ///
    /// The gate only sees the literal text; identifiers computed at runtime
    /// are caught here. A refusal is audited and surfaces as a protected
    /// resource violation, which is never retried.
    fn guard_protected(
        &self,
        capabilities: &CapabilityMap,
        request_id: RequestId,
        identity: Identity,
    ) -> CapabilityMap {
        let mut guarded = capabilities.clone();
        let inner = capabilities.get(DELETE_CHANNEL).cloned();
        let protected = self.config.protected_resource.clone();
        let audit = Arc::clone(&self.audit);
        guarded.insert_fn(DELETE_CHANNEL, move |call_args| {
            let inner = inner.clone();
            let protected = protected.clone();
            let audit = Arc::clone(&audit);
            async move {
                let target = args::id(&call_args, 0, "channel_id")?;
                if is_protected_target(&target, &protected) {
                    let target = target.trim().to_string();
                    warn!(%identity, channel = %target, "Refused to delete protected resource");
                    let entry = AuditEntry::new(DELETE_CHANNEL, AuditStatus::Denied, identity)
                        .detail("request_id", request_id.to_string())
                        .detail("channel_id", target.as_str())
                        .error("protected resource");
                    if let Err(e) = audit.append(entry) {
                        error!(error = %e, "Failed to audit protected resource refusal");
                    }
                    return Err(CapabilityError::ProtectedResource(target));
                }
                match inner {
                    Some(inner) => inner.call(call_args).await,
                    None => Err(CapabilityError::Unavailable(format!(
                        "platform operation '{DELETE_CHANNEL}'"
                    ))),
                }
            }
        });
        guarded
    }

    /// Audit a gate refusal; `Some` when the action must not run
    fn check_gate(
        &self,
        request_id: RequestId,
        identity: Identity,
        text: &str,
    ) -> Result<Option<ActionOutcome>, GovernanceError> {
        let Err(violation) = self.gate.check(text) else {
            return Ok(None);
        };
        self.audit.append(
            AuditEntry::new("action_gate", AuditStatus::Rejected, identity)
                .detail("request_id", request_id.to_string())
                .error(violation.to_string()),
        )?;
        match violation {
            GateViolation::ProtectedResource(id) => {
                Err(GovernanceError::ProtectedResourceViolation(id))
            }
            other => Ok(Some(ActionOutcome::Blocked {
                reason: other.to_string(),
            })),
        }
    }

    /// Run a structured command script against a fresh command context
    ///
    /// `platform` supplies the primitive operations the context delegates
    /// to. The script is gated, retried and audited like any action, but
    /// not reviewed: structured commands come from the embedder rather than
    /// the planner.
    ///
    /// # Errors
    /// [`GovernanceError::NotAuthorized`] for unknown identities;
    /// [`GovernanceError::ProtectedResourceViolation`] when the script
    /// touched the protected resource; audit store failures.
    #[instrument(skip(self, script, payload, platform))]
    pub async fn run_command(
        &self,
        identity: Identity,
        description: &str,
        script: &str,
        payload: Json,
        platform: Arc<CapabilityMap>,
    ) -> Result<ActionOutcome, GovernanceError> {
        if self.authorize(identity)? == Role::Member {
            let denial = self.deny_non_privileged(identity, 1)?;
            return Ok(ActionOutcome::Denied {
                reason: denial.to_string(),
            });
        }

        let request_id = RequestId::new();
        if let Some(blocked) = self.check_gate(request_id, identity, script)? {
            return Ok(blocked);
        }

        let sandbox = self.sandbox;
        let run = self
            .feedback
            .run(|_, _| {
                let context = CommandContext::new(
                    payload.clone(),
                    Arc::clone(&platform),
                    Arc::clone(&self.audit),
                    Arc::clone(&self.scheduler),
                    self.config.protected_resource.as_str(),
                )
                .into_capabilities();
                async move { sandbox.execute_command(script, context).await }
            })
            .await;

        let mut entry = AuditEntry::new(
            "command_execute",
            if run.succeeded() {
                AuditStatus::Success
            } else {
                AuditStatus::Failed
            },
            identity,
        )
        .detail("request_id", request_id.to_string())
        .detail("description", description)
        .detail("attempts", run.attempts);
        if let Some(e) = &run.last_error {
            entry = entry.error(e.to_string());
        }
        self.audit.append(entry)?;
        self.memory.add_action(description);

        match (run.result, run.last_error) {
            (Some(result), _) => Ok(ActionOutcome::Succeeded {
                result,
                attempts: run.attempts,
            }),
            (None, Some(SandboxError::ProtectedResourceViolation(id))) => {
                Err(GovernanceError::ProtectedResourceViolation(id))
            }
            (None, last_error) => Ok(ActionOutcome::Failed {
                last_error: last_error.map(|e| e.to_string()).unwrap_or_default(),
                attempts: run.attempts,
            }),
        }
    }
}

fn escalation_error(outcome: EscalationOutcome, broker: &EscalationBroker) -> GovernanceError {
    match outcome {
        EscalationOutcome::TimedOut => GovernanceError::EscalationTimedOut(broker.timeout().as_secs()),
        _ => GovernanceError::EscalationDenied,
    }
}
