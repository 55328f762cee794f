use overseer_core::command::DEFAULT_COMMAND_SCRIPT;
use overseer_core::error::GovernanceError;
use overseer_core::pipeline::{ActionOutcome, ActionRequest, MSG_NON_PRIVILEGED};
use overseer_core::planner::{PlannerError, REPLY_UNPARSEABLE};
use overseer_kernel::audit::{AuditRecord, AuditStatus};
use overseer_kernel::memory::RollingMemory;
use overseer_kernel::review::RISK_NOOP;
use overseer_kernel::sandbox::CapabilityMap;
use overseer_kernel::ManualClock;
use overseer_test_utils::*;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;

const CREATE_ROLE: &str = r#"async fn main() { await create_role("ops"); return "done"; }"#;
const BULK_SEND: &str =
    r#"async fn main() { for channel in [1, 2] { await send_message(channel, "hi"); } return 2; }"#;

fn actions(records: &[AuditRecord]) -> Vec<(&str, AuditStatus)> {
    records.iter().map(|r| (r.action.as_str(), r.status)).collect()
}

#[tokio::test]
async fn test_unknown_identity_is_not_authorized() {
    let planner = Arc::new(ScriptedPlanner::replying("sure", &[CREATE_ROLE]));
    let pipeline = build_pipeline(test_config(), planner.clone(), Arc::new(SilentChannel));
    let (caps, log) = recording_capabilities(&["create_role"]);

    let err = pipeline
        .handle_request(STRANGER, "make a role", &caps)
        .await
        .unwrap_err();
    assert!(matches!(err, GovernanceError::NotAuthorized(id) if id == STRANGER));

    let history = pipeline.audit().history().unwrap();
    assert_eq!(actions(&history), vec![("request_authorization", AuditStatus::Denied)]);
    assert_eq!(history[0].error.as_deref(), Some("denied: not-authorized"));
    assert!(history.iter().all(|r| r.status != AuditStatus::Success));
    assert!(planner.calls().is_empty());
    assert!(log.lock().is_empty());
}

#[tokio::test]
async fn test_blank_action_is_rejected_without_side_effects() {
    let planner = Arc::new(ScriptedPlanner::replying("nothing to do", &["   \n"]));
    let pipeline = build_pipeline(test_config(), planner, Arc::new(SilentChannel));
    let (caps, log) = recording_capabilities(&["create_role"]);

    let response = pipeline.handle_request(ADMIN, "hello", &caps).await.unwrap();
    assert_eq!(
        response.outcomes,
        vec![ActionOutcome::Rejected {
            risks: vec![RISK_NOOP.to_string()]
        }]
    );
    assert_eq!(response.messages().len(), 2);

    let history = pipeline.audit().history().unwrap();
    assert_eq!(actions(&history), vec![("action_review", AuditStatus::Rejected)]);
    assert!(log.lock().is_empty());
}

#[tokio::test]
async fn test_member_may_converse_but_not_execute() {
    let planner = Arc::new(ScriptedPlanner::replying("on it", &[CREATE_ROLE]));
    let pipeline = build_pipeline(test_config(), planner, Arc::new(SilentChannel));
    let (caps, log) = recording_capabilities(&["create_role"]);

    let response = pipeline.handle_request(MEMBER, "make a role", &caps).await.unwrap();
    assert_eq!(response.reply, "on it");
    assert_eq!(response.denial.as_deref(), Some(MSG_NON_PRIVILEGED));
    assert!(response.outcomes.is_empty());

    let history = pipeline.audit().history().unwrap();
    assert_eq!(actions(&history), vec![("request_authorization", AuditStatus::Denied)]);
    assert_eq!(history[0].error.as_deref(), Some("denied: non-privileged"));
    assert!(log.lock().is_empty());
}

#[tokio::test]
async fn test_malformed_planner_output_falls_back_to_conversation() {
    let planner = Arc::new(
        ScriptedPlanner::new()
            .then_raw("here is what I'd do: delete everything")
            .then_error(PlannerError::Unavailable("offline".into())),
    );
    let pipeline = build_pipeline(test_config(), planner, Arc::new(SilentChannel));
    let caps = CapabilityMap::new();

    let first = pipeline.handle_request(ADMIN, "hi", &caps).await.unwrap();
    assert_eq!(first.reply, REPLY_UNPARSEABLE);
    assert!(first.outcomes.is_empty());

    let second = pipeline.handle_request(ADMIN, "hi again", &caps).await.unwrap();
    assert_eq!(second.reply, REPLY_UNPARSEABLE);
    assert!(pipeline.audit().history().unwrap().is_empty());
}

#[tokio::test]
async fn test_low_risk_action_runs_and_is_remembered() {
    let planner = Arc::new(ScriptedPlanner::replying("creating", &[CREATE_ROLE]));
    let pipeline = build_pipeline(test_config(), planner.clone(), Arc::new(SilentChannel));
    let (caps, log) = recording_capabilities(&["create_role"]);

    let response = pipeline.handle_request(ADMIN, "make ops", &caps).await.unwrap();
    assert_eq!(
        response.outcomes,
        vec![ActionOutcome::Succeeded {
            result: json!("done"),
            attempts: 1
        }]
    );
    assert_eq!(calls_to(&log, "create_role"), 1);
    assert_eq!(
        actions(&pipeline.audit().history().unwrap()),
        vec![
            ("action_review", AuditStatus::Success),
            ("action_execute", AuditStatus::Success),
        ]
    );

    pipeline.handle_request(ADMIN, "thanks", &caps).await.unwrap();
    let calls = planner.calls();
    assert_eq!(calls[1].conversation, vec!["make ops".to_string(), "thanks".to_string()]);
    assert_eq!(calls[1].recent_actions.len(), 1);
    assert!(calls[1].recent_actions[0].starts_with("[succeeded]"));
}

#[tokio::test]
async fn test_transient_failures_are_retried_up_to_budget() {
    let pipeline = build_pipeline(
        test_config(),
        Arc::new(ScriptedPlanner::new()),
        Arc::new(SilentChannel),
    );
    let log = CallLog::default();
    let mut caps = CapabilityMap::new();
    insert_flaky(&mut caps, "create_role", 2, &log);

    let outcome = pipeline
        .govern_action(ActionRequest::new(ADMIN, CREATE_ROLE), &caps)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        ActionOutcome::Succeeded {
            result: json!("done"),
            attempts: 3
        }
    );

    let always = CallLog::default();
    let mut broken = CapabilityMap::new();
    insert_flaky(&mut broken, "create_role", usize::MAX, &always);
    let outcome = pipeline
        .govern_action(ActionRequest::new(ADMIN, CREATE_ROLE), &broken)
        .await
        .unwrap();
    match outcome {
        ActionOutcome::Failed {
            last_error,
            attempts,
        } => {
            assert_eq!(attempts, 3);
            assert!(last_error.contains("transient failure 3"), "{last_error}");
        }
        other => panic!("expected failure, got {other:?}"),
    }
    let last = pipeline.audit().tail(1).unwrap();
    assert_eq!(last[0].action, "action_execute");
    assert_eq!(last[0].status, AuditStatus::Failed);
    assert_eq!(last[0].details["attempts"], json!(3));
}

#[tokio::test]
async fn test_escalated_action_runs_once_approved() {
    let (channel, prompts) = RecordingChannel::new();
    let pipeline = build_pipeline(test_config(), Arc::new(ScriptedPlanner::new()), channel.clone());
    let approver = spawn_approver(pipeline.broker(), prompts, "approve");
    let (caps, log) = recording_capabilities(&["send_message"]);

    let outcome = pipeline
        .govern_action(ActionRequest::new(ADMIN, BULK_SEND), &caps)
        .await
        .unwrap();
    assert!(outcome.succeeded());
    assert_eq!(calls_to(&log, "send_message"), 2);
    assert_eq!(channel.delivered().len(), 1);
    assert_eq!(
        actions(&pipeline.audit().history().unwrap()),
        vec![
            ("action_review", AuditStatus::Success),
            ("action_escalation", AuditStatus::Success),
            ("action_execute", AuditStatus::Success),
        ]
    );
    assert_eq!(pipeline.broker().pending_count(), 0);
    approver.abort();
}

#[tokio::test]
async fn test_rejected_escalation_never_executes() {
    let (channel, prompts) = RecordingChannel::new();
    let pipeline = build_pipeline(test_config(), Arc::new(ScriptedPlanner::new()), channel);
    let approver = spawn_approver(pipeline.broker(), prompts, "reject");
    let (caps, log) = recording_capabilities(&["send_message"]);

    let outcome = pipeline
        .govern_action(ActionRequest::new(ADMIN, BULK_SEND), &caps)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        ActionOutcome::Denied {
            reason: "rejected".into()
        }
    );
    assert_eq!(outcome.user_message(), "Action not approved.");
    assert!(log.lock().is_empty());
    let last = pipeline.audit().tail(1).unwrap();
    assert_eq!(last[0].action, "action_escalation");
    assert_eq!(last[0].status, AuditStatus::Denied);
    approver.abort();
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_escalation_times_out_as_denial() {
    let (channel, _prompts) = RecordingChannel::new();
    let pipeline = build_pipeline(test_config(), Arc::new(ScriptedPlanner::new()), channel);
    let (caps, log) = recording_capabilities(&["send_message"]);

    let outcome = pipeline
        .govern_action(ActionRequest::new(ADMIN, BULK_SEND), &caps)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        ActionOutcome::Denied {
            reason: "timed_out".into()
        }
    );
    assert!(log.lock().is_empty());
    let last = pipeline.audit().tail(1).unwrap();
    assert_eq!(last[0].error.as_deref(), Some("escalation timed out after 120s"));
    assert_eq!(pipeline.broker().pending_count(), 0);
}

#[tokio::test]
async fn test_unreachable_approver_fails_closed() {
    let pipeline = build_pipeline(
        test_config(),
        Arc::new(ScriptedPlanner::new()),
        Arc::new(FailingChannel),
    );
    let (caps, log) = recording_capabilities(&["send_message"]);

    let outcome = pipeline
        .govern_action(ActionRequest::new(ADMIN, BULK_SEND), &caps)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        ActionOutcome::Denied {
            reason: "dispatch_failed".into()
        }
    );
    assert!(log.lock().is_empty());
}

#[tokio::test]
async fn test_protected_resource_in_text_is_raised_after_audit() {
    let (channel, prompts) = RecordingChannel::new();
    let pipeline = build_pipeline(test_config(), Arc::new(ScriptedPlanner::new()), channel);
    let approver = spawn_approver(pipeline.broker(), prompts, "approve");
    let (caps, log) = recording_capabilities(&["delete_channel"]);

    let text = format!(
        "async fn main() {{ for channel in [\"{PROTECTED_ID}\"] {{ await delete_channel(channel); }} }}"
    );
    let err = pipeline
        .govern_action(ActionRequest::new(ADMIN, text), &caps)
        .await
        .unwrap_err();
    assert!(matches!(err, GovernanceError::ProtectedResourceViolation(ref id) if id == PROTECTED_ID));
    assert!(err.is_policy_violation());
    assert!(log.lock().is_empty());

    let history = pipeline.audit().history().unwrap();
    let gate = history.last().unwrap();
    assert_eq!(gate.action, "action_gate");
    assert_eq!(gate.status, AuditStatus::Rejected);
    approver.abort();
}

#[tokio::test]
async fn test_protected_resource_built_at_runtime_is_refused() {
    let split = r#"async fn main() { await delete_channel("1444077226" + "365816864"); return "gone"; }"#;
    let planner = Arc::new(ScriptedPlanner::replying("on it", &[split]));
    let (channel, prompts) = RecordingChannel::new();
    let pipeline = build_pipeline(test_config(), planner, channel);
    let approver = spawn_approver(pipeline.broker(), prompts, "approve");
    let (caps, log) = recording_capabilities(&["delete_channel"]);

    let err = pipeline
        .handle_request(ADMIN, "remove that channel", &caps)
        .await
        .unwrap_err();
    assert!(matches!(err, GovernanceError::ProtectedResourceViolation(ref id) if id == PROTECTED_ID));
    assert!(log.lock().is_empty());

    let history = pipeline.audit().history().unwrap();
    let refusal = history
        .iter()
        .find(|r| r.action == "delete_channel")
        .expect("refusal is audited");
    assert_eq!(refusal.status, AuditStatus::Denied);
    assert_eq!(refusal.details["channel_id"], json!(PROTECTED_ID));
    let execute = history.last().unwrap();
    assert_eq!(execute.action, "action_execute");
    assert_eq!(execute.status, AuditStatus::Failed);
    assert_eq!(execute.details["attempts"], json!(1));

    let other = r#"async fn main() { await delete_channel("1444077226" + "0"); return "gone"; }"#;
    let outcome = pipeline
        .govern_action(ActionRequest::new(ADMIN, other), &caps)
        .await
        .unwrap();
    assert!(outcome.succeeded());
    assert_eq!(calls_to(&log, "delete_channel"), 1);
    approver.abort();
}

#[tokio::test]
async fn test_blocked_pattern_is_final() {
    let pipeline = build_pipeline(
        test_config(),
        Arc::new(ScriptedPlanner::new()),
        Arc::new(SilentChannel),
    );
    let (caps, log) = recording_capabilities(&["create_role"]);

    let outcome = pipeline
        .govern_action(
            ActionRequest::new(ADMIN, r#"async fn main() { let x = "import os"; }"#),
            &caps,
        )
        .await
        .unwrap();
    assert!(matches!(outcome, ActionOutcome::Blocked { ref reason } if reason.contains("import os")));
    assert!(log.lock().is_empty());
}

#[tokio::test]
async fn test_command_script_runs_against_context() {
    let pipeline = build_pipeline(
        test_config(),
        Arc::new(ScriptedPlanner::new()),
        Arc::new(SilentChannel),
    );
    let (platform, log) = recording_platform();
    let payload = json!({
        "messages": [{"content": "hello"}, {"content": "world"}],
        "role_name": "helpers",
        "channels": [10, 11, 12, 13],
    });

    let outcome = pipeline
        .run_command(ADMIN, "daily digest", DEFAULT_COMMAND_SCRIPT, payload, platform)
        .await
        .unwrap();
    match outcome {
        ActionOutcome::Succeeded { result, attempts } => {
            assert_eq!(attempts, 1);
            assert_eq!(result["summary"], json!("Summary of last 2 messages: hello; world"));
        }
        other => panic!("expected success, got {other:?}"),
    }
    assert_eq!(calls_to(&log, "create_role"), 1);
    assert_eq!(calls_to(&log, "send_message"), 3);

    let history = pipeline.audit().history().unwrap();
    let last = history.last().unwrap();
    assert_eq!(last.action, "command_execute");
    assert_eq!(last.details["description"], json!("daily digest"));
    assert_eq!(pipeline.memory().recent_actions(1), vec!["daily digest".to_string()]);
}

#[tokio::test]
async fn test_command_cannot_delete_protected_resource_even_indirectly() {
    let pipeline = build_pipeline(
        test_config(),
        Arc::new(ScriptedPlanner::new()),
        Arc::new(SilentChannel),
    );
    let (platform, log) = recording_platform();
    let script = r#"fn run(context) { context.delete_channel(" 1444077226" + "365816864 "); }"#;

    let err = pipeline
        .run_command(ADMIN, "cleanup", script, json!({}), platform)
        .await
        .unwrap_err();
    assert!(matches!(err, GovernanceError::ProtectedResourceViolation(_)));
    assert_eq!(calls_to(&log, "delete_channel"), 0);

    let history = pipeline.audit().history().unwrap();
    let executes: Vec<_> = history.iter().filter(|r| r.action == "command_execute").collect();
    assert_eq!(executes.len(), 1);
    assert_eq!(executes[0].details["attempts"], json!(1));
    assert_eq!(executes[0].status, AuditStatus::Failed);
}

#[tokio::test]
async fn test_member_commands_are_denied() {
    let pipeline = build_pipeline(
        test_config(),
        Arc::new(ScriptedPlanner::new()),
        Arc::new(SilentChannel),
    );
    let (platform, log) = recording_platform();
    let outcome = pipeline
        .run_command(MEMBER, "digest", DEFAULT_COMMAND_SCRIPT, json!({}), platform)
        .await
        .unwrap();
    assert!(matches!(outcome, ActionOutcome::Denied { .. }));
    assert!(log.lock().is_empty());
}

#[tokio::test]
async fn test_conversation_memory_respects_horizon() {
    let clock = ManualClock::default();
    let memory = RollingMemory::with_clock(chrono::Duration::hours(1), 10, Arc::new(clock.clone()));
    let planner = Arc::new(ScriptedPlanner::new());
    let pipeline = build_pipeline(test_config(), planner.clone(), Arc::new(SilentChannel))
        .with_memory(memory);
    let caps = CapabilityMap::new();

    pipeline.handle_request(ADMIN, "first", &caps).await.unwrap();
    clock.advance_secs(3601);
    pipeline.handle_request(ADMIN, "second", &caps).await.unwrap();

    assert_eq!(planner.calls()[1].conversation, vec!["second".to_string()]);
}
