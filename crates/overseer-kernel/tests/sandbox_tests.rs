use overseer_kernel::sandbox::{CapabilityError, CapabilityMap, ExecutionOutcome, Sandbox, SandboxError};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;

fn recording_map(calls: &Arc<Mutex<Vec<(String, Vec<Value>)>>>) -> CapabilityMap {
    let mut map = CapabilityMap::new();
    for name in ["send_message", "create_role"] {
        let calls = Arc::clone(calls);
        map.insert_fn(name, move |args| {
            calls.lock().push((name.to_string(), args));
            async { Ok(Value::Null) }
        });
    }
    map
}

#[tokio::test]
async fn test_free_text_action_calls_capabilities_in_order() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let caps = recording_map(&calls);
    let text = r#"
        async fn main() {
            let channels = [10, 20, 30];
            for c in channels {
                if c != 20 {
                    await send_message(c, "hello " + str(c));
                }
            }
            await create_role("moderators");
            return len(channels);
        }
    "#;

    let outcome = Sandbox::new().execute(text, &caps).await.unwrap();
    assert_eq!(outcome, ExecutionOutcome::Completed(json!(3)));

    let calls = calls.lock();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[0], ("send_message".to_string(), vec![json!(10), json!("hello 10")]));
    assert_eq!(calls[1].1[0], json!(30));
    assert_eq!(calls[2], ("create_role".to_string(), vec![json!("moderators")]));
}

#[tokio::test]
async fn test_unlisted_operation_is_unknown() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let caps = recording_map(&calls);
    let err = Sandbox::new()
        .execute("async fn main() { await ban_everyone(); }", &caps)
        .await
        .unwrap_err();
    assert_eq!(err, SandboxError::UnknownName("ban_everyone".into()));
    assert!(calls.lock().is_empty());
}

#[tokio::test]
async fn test_parse_error_reports_position() {
    let err = Sandbox::new()
        .execute("async fn main() {\n  let x = ;\n}", &CapabilityMap::new())
        .await
        .unwrap_err();
    let SandboxError::Parse(parse) = err else {
        panic!("expected parse error, got {err:?}");
    };
    assert_eq!(parse.line, 2);
}

#[tokio::test]
async fn test_deep_operator_chain_is_a_parse_error() {
    let terms = vec!["1"; 2400].join("+");
    let err = Sandbox::new()
        .execute(&format!("async fn main() {{ return {terms}; }}"), &CapabilityMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SandboxError::Parse(ref p) if p.message.contains("nesting too deep")));
}

#[tokio::test]
async fn test_repeated_doubling_hits_the_size_limit() {
    let err = Sandbox::new()
        .execute(
            "async fn main() { let a = [1]; for i in range(22) { a = a + a; } return len(a); }",
            &CapabilityMap::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SandboxError::Runtime(_)));
}

#[tokio::test]
async fn test_structured_command_uses_context_methods_only() {
    let context = Arc::new(CapabilityMap::new().with_fn("delete_channel", |args| async move {
        match args.first().and_then(Value::as_str) {
            Some("1") => Err(CapabilityError::ProtectedResource("1".into())),
            _ => Ok(json!("deleted")),
        }
    }));
    let sandbox = Sandbox::new();

    let ok = sandbox
        .execute_command(
            "fn run(context) { return context.delete_channel(\"2\"); }",
            Arc::clone(&context),
        )
        .await
        .unwrap();
    assert_eq!(ok, json!("deleted"));

    let err = sandbox
        .execute_command("fn run(context) { return context.delete_channel(\"1\"); }", context)
        .await
        .unwrap_err();
    assert_eq!(err, SandboxError::ProtectedResourceViolation("1".into()));
}

#[tokio::test]
async fn test_helper_functions_and_builtins_compose() {
    let text = r#"
        fn square(x) { return x * x; }
        async fn main() {
            let values = [];
            for pair in enumerate(["a", "b", "c"]) {
                values = values + [square(pair[0])];
            }
            return {"sum": sum(values), "max": max(values), "sorted": sorted([3, 1, 2])};
        }
    "#;
    let outcome = Sandbox::new().execute(text, &CapabilityMap::new()).await.unwrap();
    assert_eq!(
        outcome.value(),
        json!({"sum": 5, "max": 4, "sorted": [1, 2, 3]})
    );
}
