//! Planner seam
//!
//! The planner turns a chat message into a reply plus zero or more action
//! texts. Its raw output is untrusted: anything that is not the expected
//! JSON shape degrades to a conversational reply with no actions.

use overseer_kernel::Identity;
use serde_json::Value;

/// Reply used when planner output is not valid JSON
pub const REPLY_UNPARSEABLE: &str = "I couldn't parse that request yet; could you rephrase?";

/// Reply used when planner output is JSON but not an object
pub const REPLY_UNEXPECTED_FORMAT: &str = "Unexpected model response format.";

/// Planner failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlannerError {
    /// Backend could not be reached
    #[error("planner unavailable: {0}")]
    Unavailable(String),

    /// Backend answered with an error
    #[error("planner failed: {0}")]
    Failed(String),
}

/// Why planner output could not be used
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedOutput {
    /// Output did not parse as JSON
    #[error("output is not JSON: {0}")]
    NotJson(String),

    /// Output parsed but is not a JSON object
    #[error("output is not a JSON object")]
    NotAnObject,

    /// The planner itself failed
    #[error(transparent)]
    Planner(#[from] PlannerError),
}

impl MalformedOutput {
    /// Conversational reply shown instead of running anything
    #[must_use]
    pub fn fallback_reply(&self) -> &'static str {
        match self {
            Self::NotAnObject => REPLY_UNEXPECTED_FORMAT,
            Self::NotJson(_) | Self::Planner(_) => REPLY_UNPARSEABLE,
        }
    }
}

/// Proposes actions for a message
#[async_trait::async_trait]
pub trait Planner: Send + Sync {
    /// Raw planner output for `message`, given recent conversation and
    /// recently executed actions
    async fn propose(
        &self,
        identity: Identity,
        message: &str,
        conversation: &[String],
        recent_actions: &[String],
    ) -> Result<String, PlannerError>;
}

/// Parsed planner output
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PlannerReply {
    /// Conversational reply
    pub reply: String,
    /// Action texts, in proposal order
    pub actions: Vec<String>,
}

impl PlannerReply {
    /// Fallback reply with no actions
    #[must_use]
    pub fn fallback(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            actions: Vec::new(),
        }
    }

    /// Parse `{"reply": string, "actions": [string]}`
    ///
    /// A non-list `actions` field yields no actions; non-string entries are
    /// rendered as JSON text.
    ///
    /// # Errors
    /// The output is not JSON, or not a JSON object.
    pub fn parse(raw: &str) -> Result<Self, MalformedOutput> {
        let parsed: Value =
            serde_json::from_str(raw.trim()).map_err(|e| MalformedOutput::NotJson(e.to_string()))?;
        let Value::Object(map) = parsed else {
            return Err(MalformedOutput::NotAnObject);
        };

        let reply = match map.get("reply") {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        };
        let actions = match map.get("actions") {
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect(),
            _ => Vec::new(),
        };
        Ok(Self { reply, actions })
    }
}
