//! Testing utilities for the Overseer workspace
//!
//! Scripted collaborators, recording capability maps and pipeline fixtures.

#![allow(missing_docs)]

use async_trait::async_trait;
use overseer_core::config::GovernanceConfig;
use overseer_core::escalation::{
    ChannelError, Destination, EscalationBroker, EscalationPrompt, NotificationChannel,
};
use overseer_core::pipeline::GovernancePipeline;
use overseer_core::planner::{Planner, PlannerError};
use overseer_kernel::audit::AuditLog;
use overseer_kernel::sandbox::{CapabilityError, CapabilityMap};
use overseer_kernel::Identity;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;

pub const ADMIN: Identity = Identity(1);
pub const MEMBER: Identity = Identity(2);
pub const STRANGER: Identity = Identity(99);

pub const PROTECTED_ID: &str = "1444077226365816864";

/// Recorded capability invocations, in call order
pub type CallLog = Arc<Mutex<Vec<(String, Vec<Value>)>>>;

/// Planner replaying queued outputs; repeats the last one when exhausted
#[derive(Debug, Default)]
pub struct ScriptedPlanner {
    outputs: Mutex<VecDeque<Result<String, PlannerError>>>,
    last: Mutex<Option<Result<String, PlannerError>>>,
    calls: Mutex<Vec<PlannerCall>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannerCall {
    pub identity: Identity,
    pub message: String,
    pub conversation: Vec<String>,
    pub recent_actions: Vec<String>,
}

impl ScriptedPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Planner answering `{"reply": reply, "actions": actions}`
    pub fn replying(reply: &str, actions: &[&str]) -> Self {
        Self::new().then_raw(json!({ "reply": reply, "actions": actions }).to_string())
    }

    pub fn then_raw(self, raw: impl Into<String>) -> Self {
        self.outputs.lock().push_back(Ok(raw.into()));
        self
    }

    pub fn then_error(self, error: PlannerError) -> Self {
        self.outputs.lock().push_back(Err(error));
        self
    }

    pub fn calls(&self) -> Vec<PlannerCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn propose(
        &self,
        identity: Identity,
        message: &str,
        conversation: &[String],
        recent_actions: &[String],
    ) -> Result<String, PlannerError> {
        self.calls.lock().push(PlannerCall {
            identity,
            message: message.to_string(),
            conversation: conversation.to_vec(),
            recent_actions: recent_actions.to_vec(),
        });
        let next = self.outputs.lock().pop_front();
        let mut last = self.last.lock();
        if let Some(next) = next {
            *last = Some(next);
        }
        last.clone()
            .unwrap_or_else(|| Ok(json!({ "reply": "ok", "actions": [] }).to_string()))
    }
}

/// Channel forwarding every prompt to a receiver
#[derive(Debug)]
pub struct RecordingChannel {
    prompts: mpsc::UnboundedSender<EscalationPrompt>,
    delivered: Mutex<Vec<EscalationPrompt>>,
}

impl RecordingChannel {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<EscalationPrompt>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            prompts: tx,
            delivered: Mutex::new(Vec::new()),
        });
        (channel, rx)
    }

    pub fn delivered(&self) -> Vec<EscalationPrompt> {
        self.delivered.lock().clone()
    }
}

#[async_trait]
impl NotificationChannel for RecordingChannel {
    async fn resolve_destination(&self) -> Option<Destination> {
        Some(Destination("approvals".to_string()))
    }

    async fn notify(&self, _: &Destination, prompt: &EscalationPrompt) -> Result<(), ChannelError> {
        self.delivered.lock().push(prompt.clone());
        self.prompts
            .send(prompt.clone())
            .map_err(|e| ChannelError::Delivery(e.to_string()))
    }
}

/// Channel with no reachable approver
#[derive(Debug, Default)]
pub struct SilentChannel;

#[async_trait]
impl NotificationChannel for SilentChannel {
    async fn resolve_destination(&self) -> Option<Destination> {
        None
    }

    async fn notify(&self, _: &Destination, _: &EscalationPrompt) -> Result<(), ChannelError> {
        Ok(())
    }
}

/// Channel whose deliveries always fail
#[derive(Debug, Default)]
pub struct FailingChannel;

#[async_trait]
impl NotificationChannel for FailingChannel {
    async fn resolve_destination(&self) -> Option<Destination> {
        Some(Destination("approvals".to_string()))
    }

    async fn notify(&self, _: &Destination, _: &EscalationPrompt) -> Result<(), ChannelError> {
        Err(ChannelError::Unavailable("transport down".to_string()))
    }
}

/// Answer every prompt arriving on `prompts` with `response`
pub fn spawn_approver(
    broker: Arc<EscalationBroker>,
    mut prompts: mpsc::UnboundedReceiver<EscalationPrompt>,
    response: &'static str,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(prompt) = prompts.recv().await {
            broker.on_decision(response, prompt.ticket_id);
        }
    })
}

/// Capability map whose operations record their calls and return `null`
pub fn recording_capabilities(names: &[&'static str]) -> (CapabilityMap, CallLog) {
    let log = CallLog::default();
    let mut map = CapabilityMap::new();
    for &name in names {
        let log = Arc::clone(&log);
        map.insert_fn(name, move |args| {
            log.lock().push((name.to_string(), args));
            async { Ok(Value::Null) }
        });
    }
    (map, log)
}

/// Platform operations expected by the command context
pub fn recording_platform() -> (Arc<CapabilityMap>, CallLog) {
    let (map, log) =
        recording_capabilities(&["create_role", "send_message", "send_dm", "delete_channel"]);
    (Arc::new(map), log)
}

/// Add a capability failing its first `failures` calls
pub fn insert_flaky(map: &mut CapabilityMap, name: &'static str, failures: usize, log: &CallLog) {
    let log = Arc::clone(log);
    map.insert_fn(name, move |args| {
        let attempt = {
            let mut calls = log.lock();
            calls.push((name.to_string(), args));
            calls.iter().filter(|(n, _)| n == name).count()
        };
        async move {
            if attempt <= failures {
                Err(CapabilityError::Failed(format!("transient failure {attempt}")))
            } else {
                Ok(json!(attempt))
            }
        }
    });
}

pub fn calls_to(log: &CallLog, name: &str) -> usize {
    log.lock().iter().filter(|(n, _)| n == name).count()
}

pub fn test_config() -> GovernanceConfig {
    GovernanceConfig::new()
        .with_admin(ADMIN)
        .with_member(MEMBER)
        .with_protected_resource(PROTECTED_ID)
}

pub fn build_pipeline(
    config: GovernanceConfig,
    planner: Arc<dyn Planner>,
    channel: Arc<dyn NotificationChannel>,
) -> GovernancePipeline {
    GovernancePipeline::new(config, planner, channel, Arc::new(AuditLog::in_memory())).unwrap()
}
