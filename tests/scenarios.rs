//! End-to-end scenarios exercising the public `run`/`reset` API against the
//! default in-memory state store.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde_json::json;
use toolcall_runtime::events::{EventBus, EventKind, EventObserver, RuntimeEvent};
use toolcall_runtime::orchestrator::{CallContext, RuntimeControls};
use toolcall_runtime::policy::PolicyRule;
use toolcall_runtime::verifier::BeforeCallChain;
use toolcall_runtime::{ErrorCode, RuntimeConfigBuilder};

struct RecordingObserver {
    events: Arc<std::sync::Mutex<Vec<EventKind>>>,
}

impl EventObserver for RecordingObserver {
    fn on_event(&self, event: &RuntimeEvent) {
        self.events.lock().unwrap().push(event.kind);
    }
}

fn controls_with_observer(config: toolcall_runtime::RuntimeConfig) -> (RuntimeControls, Arc<std::sync::Mutex<Vec<EventKind>>>) {
    let events = Arc::new(std::sync::Mutex::new(Vec::new()));
    let observer = Arc::new(RecordingObserver {
        events: events.clone(),
    });
    let bus = EventBus::new("tenant", Some(observer), vec![], None);
    (
        RuntimeControls::create(config, bus, BeforeCallChain::default(), None, None),
        events,
    )
}

#[tokio::test]
async fn s1_retry_then_success() {
    let mut builder = RuntimeConfigBuilder::new();
    builder.retry.max_attempts = 3;
    builder.retry.initial_delay_ms = 0;
    builder.retry.jitter_ratio = 0.0;
    let (runtime, events) = controls_with_observer(builder.resolve().unwrap());

    let attempts = Arc::new(AtomicU32::new(0));
    let attempts_clone = attempts.clone();
    let context = CallContext {
        tool_name: "http".to_string(),
        ..Default::default()
    };
    let result = runtime
        .run(context, move |_rt| {
            let attempts = attempts_clone.clone();
            async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(toolcall_runtime::ToolCallError::NetworkError {
                        message: "unavailable".to_string(),
                        status_code: Some(503),
                        cancelled_by_caller: false,
                    })
                } else {
                    Ok(json!("ok"))
                }
            }
        })
        .await;

    assert_eq!(result.unwrap(), json!("ok"));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    let retry_count = events.lock().unwrap().iter().filter(|k| **k == EventKind::Retry).count();
    assert_eq!(retry_count, 2);
}

#[tokio::test]
async fn s2_timeout_becomes_cancelled_network_error() {
    let mut builder = RuntimeConfigBuilder::new();
    builder.timeout_ms = 10;
    builder.retry.max_attempts = 1;
    let (runtime, _events) = controls_with_observer(builder.resolve().unwrap());

    let context = CallContext {
        tool_name: "http".to_string(),
        ..Default::default()
    };
    let result = runtime
        .run(context, |_rt| async {
            tokio::time::sleep(std::time::Duration::from_millis(40)).await;
            Ok(json!("too late"))
        })
        .await;

    let err = result.unwrap_err();
    assert_eq!(err.code(), ErrorCode::NetworkError);
    assert!(err.message().contains("timed out"));
}

#[tokio::test]
async fn s3_budget_exhaustion_then_reset() {
    let mut builder = RuntimeConfigBuilder::new();
    builder.max_calls = Some(2);
    let (runtime, _events) = controls_with_observer(builder.resolve().unwrap());

    let make_ctx = |label: &str| CallContext {
        tool_name: "http".to_string(),
        run_key: Some("r".to_string()),
        args: Some(json!({"label": label})),
        ..Default::default()
    };

    let r1 = runtime.run(make_ctx("a"), |_rt| async { Ok(json!("a")) }).await;
    assert_eq!(r1.unwrap(), json!("a"));

    let r2 = runtime.run(make_ctx("b"), |_rt| async { Ok(json!("b")) }).await;
    assert_eq!(r2.unwrap(), json!("b"));

    let r3 = runtime.run(make_ctx("c"), |_rt| async { Ok(json!("c")) }).await;
    assert_eq!(r3.unwrap_err().code(), ErrorCode::InvalidRequest);

    runtime.reset(Some("r")).await;
    let r4 = runtime.run(make_ctx("d"), |_rt| async { Ok(json!("d")) }).await;
    assert_eq!(r4.unwrap(), json!("d"));
}

#[tokio::test]
async fn s4_loop_warning_then_quarantine() {
    let mut builder = RuntimeConfigBuilder::new();
    builder.loop_breaker.enabled = true;
    builder.loop_breaker.warning_threshold = 2;
    builder.loop_breaker.quarantine_threshold = 3;
    builder.loop_breaker.stop_threshold = 10;
    builder.loop_breaker.quarantine_ms = 60_000;
    let (runtime, events) = controls_with_observer(builder.resolve().unwrap());

    let make_ctx = || CallContext {
        tool_name: "http".to_string(),
        args: Some(json!({"q": "same"})),
        ..Default::default()
    };

    for _ in 0..3 {
        let result = runtime
            .run(make_ctx(), |_rt| async {
                Err(toolcall_runtime::ToolCallError::ValidationError {
                    message: "same".to_string(),
                    status_code: Some(400),
                })
            })
            .await;
        assert!(result.is_err());
    }

    let recorded = events.lock().unwrap().clone();
    assert_eq!(recorded.iter().filter(|k| **k == EventKind::LoopWarning).count(), 1);
    assert_eq!(recorded.iter().filter(|k| **k == EventKind::LoopQuarantine).count(), 1);

    let fourth = runtime
        .run(make_ctx(), |_rt| async {
            Err(toolcall_runtime::ToolCallError::ValidationError {
                message: "same".to_string(),
                status_code: Some(400),
            })
        })
        .await;
    assert_eq!(fourth.unwrap_err().code(), ErrorCode::InvalidRequest);
}

#[tokio::test]
async fn s5_idempotency_replay_skips_second_execution() {
    let mut builder = RuntimeConfigBuilder::new();
    builder.idempotency.enabled = true;
    let (runtime, events) = controls_with_observer(builder.resolve().unwrap());

    let counter = Arc::new(AtomicU32::new(0));
    let make_ctx = || CallContext {
        tool_name: "http".to_string(),
        run_key: Some("r".to_string()),
        idempotency_key: Some("k".to_string()),
        ..Default::default()
    };

    let counter_clone = counter.clone();
    let r1 = runtime
        .run(make_ctx(), move |_rt| {
            let counter = counter_clone.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                Ok(json!(n))
            }
        })
        .await
        .unwrap();

    let counter_clone = counter.clone();
    let r2 = runtime
        .run(make_ctx(), move |_rt| {
            let counter = counter_clone.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                Ok(json!(n))
            }
        })
        .await
        .unwrap();

    assert_eq!(r1, r2);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    let replay_count = events
        .lock()
        .unwrap()
        .iter()
        .filter(|k| **k == EventKind::IdempotencyReplay)
        .count();
    assert_eq!(replay_count, 1);
}

#[tokio::test]
async fn s6_policy_specificity_exact_deny_beats_wildcard_allow() {
    let mut builder = RuntimeConfigBuilder::new();
    builder.policy_rules = vec![
        PolicyRule::allow("allow-all").with_tools(vec!["*".to_string()]),
        PolicyRule::deny("deny-exact")
            .with_tools(vec!["http".to_string()])
            .with_destinations(vec!["api.acme.local".to_string()]),
    ];
    let (runtime, _events) = controls_with_observer(builder.resolve().unwrap());

    let denied = runtime
        .run(
            CallContext {
                tool_name: "http".to_string(),
                destination: Some("https://api.acme.local/v1".to_string()),
                ..Default::default()
            },
            |_rt| async { Ok(json!("should not run")) },
        )
        .await;
    assert_eq!(denied.unwrap_err().code(), ErrorCode::Unauthorized);

    let allowed = runtime
        .run(
            CallContext {
                tool_name: "http".to_string(),
                destination: Some("https://other.local/v1".to_string()),
                ..Default::default()
            },
            |_rt| async { Ok(json!("ok")) },
        )
        .await;
    assert_eq!(allowed.unwrap(), json!("ok"));
}
