//! Structured command context
//!
//! In structured mode an action is a `fn run(context)` body and `context`
//! exposes a fixed set of whitelisted methods. Platform side effects go
//! through primitive operations supplied by the embedder; every effect is
//! audited. Deleting the protected resource is refused here regardless of
//! what review or an approver decided.

use overseer_kernel::audit::{AuditEntry, AuditLog, AuditStatus};
use overseer_kernel::sandbox::{args, CapabilityError, CapabilityMap};
use overseer_kernel::scheduler::{ScheduledTaskId, TaskScheduler};
use rand::seq::SliceRandom;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Actor name on records written by the context
pub const EXECUTOR_ACTOR: &str = "executor";

/// Messages summarized when no limit is given
pub const DEFAULT_SUMMARY_LIMIT: u64 = 20;

/// Methods available on `context`
pub const CONTEXT_METHODS: &[&str] = &[
    "summarize_recent",
    "create_role",
    "send_message",
    "send_to_sample_of_channels",
    "direct_message",
    "schedule_delayed_message",
    "delete_channel",
    "payload",
];

/// Script run when a structured request carries no script of its own
///
/// Summarizes the payload's messages, creates the requested role, posts the
/// summary, greets a sample of channels and schedules any listed messages.
pub const DEFAULT_COMMAND_SCRIPT: &str = r#"fn run(context) {
    let summary = context.summarize_recent(context.payload("summary_limit") || 20);
    let role = context.create_role(context.payload("role_name") || "auto-role");
    let channel = context.payload("channel_id");
    if channel {
        context.send_message(channel, summary);
    }
    context.send_to_sample_of_channels(3, context.payload("random_text") || "Automated hello");
    let dm_user = context.payload("dm_user_id");
    if dm_user {
        context.direct_message(dm_user, context.payload("dm_text") || summary);
    }
    for entry in context.payload("scheduled_messages") || [] {
        context.schedule_delayed_message(
            entry.get("channel_id"),
            entry.get("content", "Scheduled hello"),
            entry.get("delay_seconds", 3),
            entry.get("repeat", false),
            entry.get("interval_seconds", 3),
        );
    }
    return {"summary": summary, "role": role};
}
"#;

/// Per-invocation context behind the `context` namespace
pub struct CommandContext {
    payload: Map<String, Value>,
    platform: Arc<CapabilityMap>,
    audit: Arc<AuditLog>,
    scheduler: Arc<TaskScheduler>,
    protected_resource: String,
}

impl std::fmt::Debug for CommandContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandContext")
            .field("payload_keys", &self.payload.keys().collect::<Vec<_>>())
            .field("platform", &self.platform)
            .field("protected_resource", &self.protected_resource)
            .finish_non_exhaustive()
    }
}

/// Check if `target` names the protected resource, ignoring surrounding
/// whitespace and ASCII case
#[must_use]
pub fn is_protected_target(target: &str, protected: &str) -> bool {
    let protected = protected.trim();
    !protected.is_empty() && target.trim().eq_ignore_ascii_case(protected)
}

fn channel_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(map) => map.get("id").and_then(channel_id),
        _ => None,
    }
}

impl CommandContext {
    /// Build a context; a non-object payload is treated as empty
    #[must_use]
    pub fn new(
        payload: Value,
        platform: Arc<CapabilityMap>,
        audit: Arc<AuditLog>,
        scheduler: Arc<TaskScheduler>,
        protected_resource: impl Into<String>,
    ) -> Self {
        let payload = match payload {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            payload,
            platform,
            audit,
            scheduler,
            protected_resource: protected_resource.into(),
        }
    }

    fn record(&self, entry: AuditEntry) {
        if let Err(e) = self.audit.append(entry) {
            error!(error = %e, "Failed to write audit record for context operation");
        }
    }

    async fn delegate(&self, name: &str, call_args: Vec<Value>) -> Result<Value, CapabilityError> {
        let capability = self
            .platform
            .get(name)
            .ok_or_else(|| CapabilityError::Unavailable(format!("platform operation '{name}'")))?;
        capability.call(call_args).await
    }

    /// Read-only payload value, `null` when absent
    #[must_use]
    pub fn payload(&self, key: &str) -> Value {
        self.payload.get(key).cloned().unwrap_or(Value::Null)
    }

    /// One-line summary of the last `limit` payload messages
    #[must_use]
    pub fn summarize_recent(&self, limit: usize) -> String {
        let messages = self
            .payload
            .get("messages")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let recent = &messages[messages.len().saturating_sub(limit)..];
        let contents: Vec<&str> = recent
            .iter()
            .map(|m| match m {
                Value::String(s) => s.as_str(),
                other => other.get("content").and_then(Value::as_str).unwrap_or(""),
            })
            .collect();
        let summary = contents.join("; ");
        if summary.is_empty() {
            "No messages to summarize.".to_string()
        } else {
            format!("Summary of last {} messages: {summary}", recent.len())
        }
    }

    /// Create a role
    ///
    /// # Errors
    /// The platform operation is missing or failed.
    pub async fn create_role(&self, name: &str) -> Result<Value, CapabilityError> {
        let role = self.delegate("create_role", vec![json!(name)]).await?;
        self.record(
            AuditEntry::new("create_role", AuditStatus::Success, EXECUTOR_ACTOR)
                .detail("role", role.clone()),
        );
        Ok(role)
    }

    /// Post a message to a channel
    ///
    /// # Errors
    /// The platform operation is missing or failed.
    pub async fn send_message(&self, channel_id: &str, content: &str) -> Result<Value, CapabilityError> {
        let result = self
            .delegate("send_message", vec![json!(channel_id), json!(content)])
            .await?;
        self.record(
            AuditEntry::new("send_message", AuditStatus::Success, EXECUTOR_ACTOR)
                .detail("channel_id", channel_id)
                .detail("content", content),
        );
        Ok(result)
    }

    /// Send `text` to up to `count` distinct random payload channels
    ///
    /// # Errors
    /// The platform operation is missing or failed for some channel.
    pub async fn send_to_sample_of_channels(
        &self,
        count: usize,
        text: &str,
    ) -> Result<Vec<String>, CapabilityError> {
        let channels: Vec<String> = self
            .payload
            .get("channels")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(channel_id).collect())
            .unwrap_or_default();
        let chosen: Vec<String> = channels
            .choose_multiple(&mut rand::thread_rng(), count)
            .cloned()
            .collect();
        debug!(available = channels.len(), chosen = chosen.len(), "Sampled channels");
        for channel in &chosen {
            self.send_message(channel, text).await?;
        }
        Ok(chosen)
    }

    /// Send a direct message
    ///
    /// # Errors
    /// The platform operation is missing or failed.
    pub async fn direct_message(&self, user_id: &str, text: &str) -> Result<Value, CapabilityError> {
        let result = self.delegate("send_dm", vec![json!(user_id), json!(text)]).await?;
        self.record(
            AuditEntry::new("direct_message", AuditStatus::Success, EXECUTOR_ACTOR)
                .detail("user_id", user_id)
                .detail("content", text),
        );
        Ok(result)
    }

    /// Register a deferred (optionally repeating) message
    ///
    /// # Errors
    /// The scheduler refused the task.
    pub fn schedule_delayed_message(
        &self,
        channel_id: &str,
        content: &str,
        delay_seconds: u64,
        repeat: bool,
        interval_seconds: u64,
    ) -> Result<ScheduledTaskId, CapabilityError> {
        let platform = Arc::clone(&self.platform);
        let (channel, text) = (channel_id.to_string(), content.to_string());
        let job = move || {
            let platform = Arc::clone(&platform);
            let call_args = vec![json!(channel), json!(text)];
            async move {
                match platform.get("send_message") {
                    Some(capability) => capability.call(call_args).await.map(|_| ()),
                    None => Err(CapabilityError::Unavailable(
                        "platform operation 'send_message'".to_string(),
                    )),
                }
            }
        };
        let repeat_every = repeat.then(|| Duration::from_secs(interval_seconds));
        let id = self
            .scheduler
            .schedule(
                format!("message to {channel_id}"),
                Duration::from_secs(delay_seconds),
                repeat_every,
                job,
            )
            .map_err(|e| CapabilityError::Failed(e.to_string()))?;
        self.record(
            AuditEntry::new("schedule_message", AuditStatus::Success, EXECUTOR_ACTOR)
                .detail("task_id", id.to_string())
                .detail("channel_id", channel_id)
                .detail("delay_seconds", delay_seconds)
                .detail("repeat", repeat),
        );
        Ok(id)
    }

    /// Delete a channel unless it is the protected resource
    ///
    /// # Errors
    /// [`CapabilityError::ProtectedResource`] for the protected identifier;
    /// otherwise the platform operation is missing or failed.
    pub async fn delete_channel(&self, channel_id: &str) -> Result<Value, CapabilityError> {
        let target = channel_id.trim();
        if is_protected_target(target, &self.protected_resource) {
            self.record(
                AuditEntry::new("delete_channel", AuditStatus::Denied, EXECUTOR_ACTOR)
                    .detail("channel_id", target)
                    .error("protected resource"),
            );
            return Err(CapabilityError::ProtectedResource(target.to_string()));
        }
        let result = self.delegate("delete_channel", vec![json!(target)]).await?;
        self.record(
            AuditEntry::new("delete_channel", AuditStatus::Success, EXECUTOR_ACTOR)
                .detail("channel_id", target),
        );
        Ok(result)
    }

    /// Expose the whitelisted methods as a capability namespace
    #[must_use]
    pub fn into_capabilities(self) -> Arc<CapabilityMap> {
        let ctx = Arc::new(self);
        let mut map = CapabilityMap::new();

        let c = Arc::clone(&ctx);
        map.insert_fn("payload", move |a| {
            let c = Arc::clone(&c);
            async move { Ok::<_, CapabilityError>(c.payload(&args::string(&a, 0, "key")?)) }
        });

        let c = Arc::clone(&ctx);
        map.insert_fn("summarize_recent", move |a| {
            let c = Arc::clone(&c);
            async move {
                let limit = args::u64_or(&a, 0, "limit", DEFAULT_SUMMARY_LIMIT)?;
                Ok::<_, CapabilityError>(json!(c.summarize_recent(
                    usize::try_from(limit).unwrap_or(usize::MAX),
                )))
            }
        });

        let c = Arc::clone(&ctx);
        map.insert_fn("create_role", move |a| {
            let c = Arc::clone(&c);
            async move { c.create_role(&args::string(&a, 0, "name")?).await }
        });

        let c = Arc::clone(&ctx);
        map.insert_fn("send_message", move |a| {
            let c = Arc::clone(&c);
            async move {
                let channel = args::id(&a, 0, "channel_id")?;
                c.send_message(&channel, &args::string(&a, 1, "content")?).await
            }
        });

        let c = Arc::clone(&ctx);
        map.insert_fn("send_to_sample_of_channels", move |a| {
            let c = Arc::clone(&c);
            async move {
                let count = args::u64_or(&a, 0, "count", 3)?;
                let text = args::string(&a, 1, "text")?;
                let sent = c
                    .send_to_sample_of_channels(usize::try_from(count).unwrap_or(usize::MAX), &text)
                    .await?;
                Ok::<_, CapabilityError>(json!(sent))
            }
        });

        let c = Arc::clone(&ctx);
        map.insert_fn("direct_message", move |a| {
            let c = Arc::clone(&c);
            async move {
                let user = args::id(&a, 0, "user_id")?;
                c.direct_message(&user, &args::string(&a, 1, "text")?).await
            }
        });

        let c = Arc::clone(&ctx);
        map.insert_fn("schedule_delayed_message", move |a| {
            let c = Arc::clone(&c);
            async move {
                let channel = args::id(&a, 0, "channel_id")?;
                let content = args::string(&a, 1, "content")?;
                let delay = args::u64_or(&a, 2, "delay_seconds", 3)?;
                let repeat = args::bool_or(&a, 3, "repeat", false)?;
                let interval = args::u64_or(&a, 4, "interval_seconds", 3)?;
                let id = c.schedule_delayed_message(&channel, &content, delay, repeat, interval)?;
                Ok::<_, CapabilityError>(json!(id.to_string()))
            }
        });

        let c = ctx;
        map.insert_fn("delete_channel", move |a| {
            let c = Arc::clone(&c);
            async move { c.delete_channel(&args::id(&a, 0, "channel_id")?).await }
        });

        Arc::new(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use overseer_kernel::sandbox::{Sandbox, SandboxError};
    use parking_lot::Mutex;

    type Calls = Arc<Mutex<Vec<(String, Vec<Value>)>>>;

    fn platform(calls: &Calls) -> Arc<CapabilityMap> {
        let mut map = CapabilityMap::new();
        for name in ["create_role", "send_message", "send_dm", "delete_channel"] {
            let calls = Arc::clone(calls);
            map.insert_fn(name, move |a| {
                calls.lock().push((name.to_string(), a.clone()));
                async move {
                    Ok(match name {
                        "create_role" => json!({"name": a[0], "id": 12345}),
                        _ => Value::Null,
                    })
                }
            });
        }
        Arc::new(map)
    }

    fn context(payload: Value, calls: &Calls) -> (CommandContext, Arc<AuditLog>) {
        let audit = Arc::new(AuditLog::in_memory());
        let ctx = CommandContext::new(
            payload,
            platform(calls),
            Arc::clone(&audit),
            Arc::new(TaskScheduler::new()),
            "1444077226365816864",
        );
        (ctx, audit)
    }

    #[test]
    fn protected_target_ignores_case_and_whitespace() {
        assert!(is_protected_target(" AbC \n", "abc"));
        assert!(!is_protected_target("abcd", "abc"));
        assert!(!is_protected_target("", "  "));
    }

    #[test]
    fn summary_uses_last_messages() {
        let calls = Calls::default();
        let payload = json!({"messages": [{"content": "a"}, {"content": "b"}, "c"]});
        let (ctx, _) = context(payload, &calls);
        assert_eq!(ctx.summarize_recent(2), "Summary of last 2 messages: b; c");
        assert_eq!(ctx.summarize_recent(20), "Summary of last 3 messages: a; b; c");

        let (empty, _) = context(json!({}), &calls);
        assert_eq!(empty.summarize_recent(20), "No messages to summarize.");
    }

    #[tokio::test]
    async fn protected_channel_is_never_deleted() {
        let calls = Calls::default();
        let (ctx, audit) = context(json!({}), &calls);
        let err = ctx.delete_channel(" 1444077226365816864 ").await.unwrap_err();
        assert_eq!(err, CapabilityError::ProtectedResource("1444077226365816864".into()));
        assert!(calls.lock().is_empty());
        assert_eq!(audit.tail(1).unwrap()[0].status, AuditStatus::Denied);

        ctx.delete_channel("42").await.unwrap();
        assert_eq!(calls.lock()[0].0, "delete_channel");
    }

    #[tokio::test]
    async fn sample_picks_distinct_channels() {
        let calls = Calls::default();
        let (ctx, _) = context(json!({"channels": [1, 2, {"id": "3"}, 4]}), &calls);
        let sent = ctx.send_to_sample_of_channels(3, "hi").await.unwrap();
        assert_eq!(sent.len(), 3);
        let mut unique = sent.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 3);
        assert_eq!(calls.lock().len(), 3);

        let sent = ctx.send_to_sample_of_channels(10, "hi").await.unwrap();
        assert_eq!(sent.len(), 4);
    }

    #[tokio::test]
    async fn default_script_runs_through_namespace() {
        let calls = Calls::default();
        let payload = json!({
            "messages": [{"content": "deploy done"}],
            "role_name": "ops",
            "channel_id": 77,
            "channels": [1, 2],
            "scheduled_messages": [{"channel_id": 5, "content": "later", "delay_seconds": 60}]
        });
        let (ctx, audit) = context(payload, &calls);
        let result = Sandbox::new()
            .execute_command(DEFAULT_COMMAND_SCRIPT, ctx.into_capabilities())
            .await
            .unwrap();
        assert_eq!(result["summary"], json!("Summary of last 1 messages: deploy done"));
        assert_eq!(result["role"]["name"], json!("ops"));

        let actions: Vec<String> = audit.history().unwrap().into_iter().map(|r| r.action).collect();
        assert_eq!(
            actions,
            vec!["create_role", "send_message", "send_message", "send_message", "schedule_message"]
        );
    }

    #[tokio::test]
    async fn protected_delete_surfaces_as_violation_in_sandbox() {
        let calls = Calls::default();
        let (ctx, _) = context(json!({}), &calls);
        let err = Sandbox::new()
            .execute_command(
                "fn run(context) { context.delete_channel(1444077226365816864); }",
                ctx.into_capabilities(),
            )
            .await
            .unwrap_err();
        assert_eq!(
            err,
            SandboxError::ProtectedResourceViolation("1444077226365816864".into())
        );
    }
}
