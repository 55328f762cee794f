//! Escalation Broker
//!
//! Routes risky actions to a human approver over a side channel and waits,
//! without blocking a worker thread, for an approve or reject decision.
//!
//! # Invariants
//!
//! - A pending ticket resolves at most once. Resolution removes the ticket
//!   from the registry, so later callbacks see "no pending request".
//! - The ticket is removed before [`EscalationBroker::escalate`] returns,
//!   whatever the outcome.
//! - Every failure path denies: no destination, dispatch failure and
//!   timeout all count as "not approved".

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use overseer_kernel::TicketId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{info, instrument, warn};

/// Default wait for a decision
pub const DEFAULT_ESCALATION_TIMEOUT: Duration = Duration::from_secs(120);

/// Acknowledgement shown after an approval
pub const ACK_APPROVED: &str = "Approved — executing once.";
/// Acknowledgement shown after a rejection
pub const ACK_REJECTED: &str = "Rejected.";
/// Acknowledgement for a callback whose ticket is gone
pub const ACK_NO_PENDING: &str = "No pending request.";
/// Acknowledgement for an unknown response
pub const ACK_UNRECOGNIZED: &str = "Unrecognized action.";

/// Where approval prompts are delivered (e.g. an owner chat id)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination(pub String);

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Notification channel failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// Channel is not connected or not started
    #[error("notification channel unavailable: {0}")]
    Unavailable(String),

    /// Delivery was attempted and refused
    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

/// Side channel used to reach the approver
#[async_trait::async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Find where to send prompts; `None` means nobody can approve
    async fn resolve_destination(&self) -> Option<Destination>;

    /// Deliver a prompt
    async fn notify(
        &self,
        destination: &Destination,
        prompt: &EscalationPrompt,
    ) -> Result<(), ChannelError>;
}

/// Approver's possible responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionResponse {
    /// Approve a single execution
    Approve,
    /// Reject
    Reject,
    /// Show the full action text without resolving
    View,
}

impl DecisionResponse {
    /// Callback verb
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::View => "view",
        }
    }

    /// Parse a callback verb
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "approve" => Some(Self::Approve),
            "reject" => Some(Self::Reject),
            "view" => Some(Self::View),
            _ => None,
        }
    }
}

/// One button on an approval prompt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseOption {
    /// Button label
    pub label: String,
    /// Opaque data echoed back in the callback, `<verb>:<ticket>`
    pub callback_data: String,
}

/// Rendered approval prompt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationPrompt {
    /// Ticket being decided
    pub ticket_id: TicketId,
    /// Message body
    pub text: String,
    /// Approve-once, reject and view-full-text responses
    pub responses: Vec<ResponseOption>,
}

impl EscalationPrompt {
    /// Render a prompt for a ticket
    #[must_use]
    pub fn render(ticket_id: TicketId, summary: &str, risks: &[String]) -> Self {
        let risk_list = if risks.is_empty() {
            "(none)".to_string()
        } else {
            risks
                .iter()
                .map(|r| format!("• {}", escape_markup(r)))
                .collect::<Vec<_>>()
                .join("\n")
        };
        let text = format!(
            "<b>Action Escalation</b>\n<b>Summary:</b> {}\n\n<b>Risks:</b>\n{risk_list}\n\nPending approval before execution.",
            escape_markup(summary)
        );
        let option = |label: &str, response: DecisionResponse| ResponseOption {
            label: label.to_string(),
            callback_data: format!("{}:{ticket_id}", response.as_str()),
        };
        Self {
            ticket_id,
            text,
            responses: vec![
                option("Approve (Once)", DecisionResponse::Approve),
                option("Reject", DecisionResponse::Reject),
                option("View Full Text", DecisionResponse::View),
            ],
        }
    }
}

/// Result of one escalation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationOutcome {
    /// Approver approved
    Approved,
    /// Approver rejected
    Rejected,
    /// No decision before the deadline
    TimedOut,
    /// No destination could be resolved
    NoDestination,
    /// The prompt could not be delivered
    DispatchFailed,
}

impl EscalationOutcome {
    /// Only an explicit approval counts
    #[inline]
    #[must_use]
    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved)
    }

    /// Short label for audit details
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::TimedOut => "timed_out",
            Self::NoDestination => "no_destination",
            Self::DispatchFailed => "dispatch_failed",
        }
    }
}

/// Reply to an inbound decision callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecisionAck {
    /// Ticket approved
    Approved,
    /// Ticket rejected
    Rejected,
    /// Escaped full action text; the ticket stays pending
    FullText(String),
    /// Ticket unknown or already resolved
    NoPendingRequest,
    /// Response verb not understood
    Unrecognized,
}

impl DecisionAck {
    /// Text to show the responder
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::Approved => ACK_APPROVED.to_string(),
            Self::Rejected => ACK_REJECTED.to_string(),
            Self::FullText(text) => format!("<b>Full Action</b>\n<pre>{text}</pre>"),
            Self::NoPendingRequest => ACK_NO_PENDING.to_string(),
            Self::Unrecognized => ACK_UNRECOGNIZED.to_string(),
        }
    }
}

/// Observable view of a pending ticket
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TicketInfo {
    /// Ticket id
    pub ticket_id: TicketId,
    /// Reviewer summary
    pub summary: String,
    /// Reviewer risks
    pub risks: Vec<String>,
    /// When the ticket was registered
    pub created_at: DateTime<Utc>,
}

struct PendingTicket {
    decision: oneshot::Sender<bool>,
    action_text: String,
    summary: String,
    risks: Vec<String>,
    created_at: DateTime<Utc>,
}

/// Removes a ticket from the registry when the waiting side goes away,
/// including when the `escalate` future is dropped mid-wait
struct TicketRegistration<'a> {
    pending: &'a DashMap<TicketId, PendingTicket>,
    ticket_id: TicketId,
}

impl Drop for TicketRegistration<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.ticket_id);
    }
}

/// Registry of pending approvals
pub struct EscalationBroker {
    channel: Arc<dyn NotificationChannel>,
    pending: DashMap<TicketId, PendingTicket>,
    timeout: Duration,
}

impl std::fmt::Debug for EscalationBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EscalationBroker")
            .field("pending", &self.pending.len())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl EscalationBroker {
    /// Create a broker with the default timeout
    #[must_use]
    pub fn new(channel: Arc<dyn NotificationChannel>) -> Self {
        Self::with_timeout(channel, DEFAULT_ESCALATION_TIMEOUT)
    }

    /// Create a broker with an explicit timeout
    #[must_use]
    pub fn with_timeout(channel: Arc<dyn NotificationChannel>, timeout: Duration) -> Self {
        Self {
            channel,
            pending: DashMap::new(),
            timeout,
        }
    }

    /// Decision timeout
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Ask the approver about an action and wait for the decision
    #[instrument(skip_all, fields(ticket = %ticket_id))]
    pub async fn escalate(
        &self,
        ticket_id: TicketId,
        summary: &str,
        risks: &[String],
        action_text: &str,
    ) -> EscalationOutcome {
        let Some(destination) = self.channel.resolve_destination().await else {
            warn!("No approval destination available; denying by default");
            return EscalationOutcome::NoDestination;
        };

        let (tx, rx) = oneshot::channel();
        let _registered = TicketRegistration {
            pending: &self.pending,
            ticket_id,
        };
        self.pending.insert(
            ticket_id,
            PendingTicket {
                decision: tx,
                action_text: action_text.to_string(),
                summary: summary.to_string(),
                risks: risks.to_vec(),
                created_at: Utc::now(),
            },
        );

        let prompt = EscalationPrompt::render(ticket_id, summary, risks);
        if let Err(e) = self.channel.notify(&destination, &prompt).await {
            warn!(error = %e, "Failed to dispatch approval prompt; denying");
            return EscalationOutcome::DispatchFailed;
        }
        info!(%destination, "Approval prompt dispatched");

        let outcome = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(true)) => EscalationOutcome::Approved,
            Ok(Ok(false)) => EscalationOutcome::Rejected,
            Ok(Err(_)) => {
                warn!("Decision slot dropped without a decision; denying");
                EscalationOutcome::Rejected
            }
            Err(_) => {
                warn!(timeout_secs = self.timeout.as_secs(), "Approval timed out");
                EscalationOutcome::TimedOut
            }
        };
        info!(outcome = outcome.as_str(), "Escalation finished");
        outcome
    }

    fn resolve(&self, ticket_id: TicketId, approved: bool) -> DecisionAck {
        let Some((_, ticket)) = self.pending.remove(&ticket_id) else {
            return DecisionAck::NoPendingRequest;
        };
        if ticket.decision.send(approved).is_err() {
            return DecisionAck::NoPendingRequest;
        }
        if approved {
            DecisionAck::Approved
        } else {
            DecisionAck::Rejected
        }
    }

    /// Apply an approver response to a ticket
    pub fn on_decision(&self, response: &str, ticket_id: TicketId) -> DecisionAck {
        let ack = match DecisionResponse::parse(response) {
            Some(DecisionResponse::Approve) => self.resolve(ticket_id, true),
            Some(DecisionResponse::Reject) => self.resolve(ticket_id, false),
            Some(DecisionResponse::View) => match self.pending.get(&ticket_id) {
                Some(ticket) => DecisionAck::FullText(escape_markup(&ticket.action_text)),
                None => DecisionAck::NoPendingRequest,
            },
            None if self.pending.contains_key(&ticket_id) => DecisionAck::Unrecognized,
            None => DecisionAck::NoPendingRequest,
        };
        info!(ticket = %ticket_id, response, resolved = matches!(ack, DecisionAck::Approved | DecisionAck::Rejected), "Decision callback handled");
        ack
    }

    /// Apply raw callback data of the form `<verb>:<ticket>`
    pub fn handle_callback(&self, data: &str) -> DecisionAck {
        let (verb, raw_id) = data.split_once(':').unwrap_or((data, ""));
        match TicketId::parse(raw_id) {
            Some(ticket_id) => self.on_decision(verb, ticket_id),
            None => DecisionAck::NoPendingRequest,
        }
    }

    /// Number of unresolved tickets
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Unresolved tickets, oldest first
    #[must_use]
    pub fn live_tickets(&self) -> Vec<TicketInfo> {
        let mut tickets: Vec<TicketInfo> = self
            .pending
            .iter()
            .map(|entry| TicketInfo {
                ticket_id: *entry.key(),
                summary: entry.summary.clone(),
                risks: entry.risks.clone(),
                created_at: entry.created_at,
            })
            .collect();
        tickets.sort_by_key(|t| (t.created_at, t.ticket_id));
        tickets
    }
}

/// Escape characters significant to the prompt markup
#[must_use]
pub fn escape_markup(content: &str) -> String {
    content
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
