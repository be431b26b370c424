//! Executor scenarios: parallelism, ordering, retry timing, semaphore
//! bounds, cancellation.


use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axon::{
    CallEnv, ErrorKind, ExecutorConfig, FnTool, RetryPolicy, Tool, ToolCall, ToolExecutor,
    ToolRegistry, ToolSchema,
};
use axon::AgentError;
use serde_json::json;

fn timed_tool(name: &'static str, latency: Duration, reply: &'static str) -> Arc<dyn Tool> {
    Arc::new(FnTool::new(
        name,
        ToolSchema::object().allow_additional(),
        move |_input| async move {
            tokio::time::sleep(latency).await;
            Ok(json!(reply))
        },
    ))
}

/// **Scenario**: three independent tools of latency 100/200/150 ms under
/// concurrency 3 finish together, results index-aligned.
#[tokio::test]
async fn parallel_independent_tools() {
    let mut registry = ToolRegistry::new();
    registry
        .register(timed_tool("f", Duration::from_millis(100), "f out"))
        .unwrap();
    registry
        .register(timed_tool("g", Duration::from_millis(200), "g out"))
        .unwrap();
    registry
        .register(timed_tool("h", Duration::from_millis(150), "h out"))
        .unwrap();
    let executor = ToolExecutor::new(
        Arc::new(registry),
        ExecutorConfig {
            max_concurrency: 3,
            ..ExecutorConfig::default()
        },
    );
    let env = CallEnv::for_tests("s");

    let started = Instant::now();
    let records = executor
        .execute_parallel(
            &env,
            vec![
                ToolCall::new("f", json!({})).with_id("c0"),
                ToolCall::new("g", json!({})).with_id("c1"),
                ToolCall::new("h", json!({})).with_id("c2"),
            ],
        )
        .await;
    let elapsed = started.elapsed();

    assert_eq!(records.len(), 3);
    assert_eq!(records[0].id, "c0");
    assert_eq!(records[1].id, "c1");
    assert_eq!(records[2].id, "c2");
    assert_eq!(records[0].output, Some(json!("f out")));
    assert_eq!(records[1].output, Some(json!("g out")));
    assert_eq!(records[2].output, Some(json!("h out")));
    // Bounded by the slowest call, not the 450 ms sum.
    assert!(elapsed < Duration::from_millis(400), "took {elapsed:?}");
}

/// **Scenario**: transient failures back off with the configured delays,
/// then succeed; one record, three attempts.
#[tokio::test]
async fn retry_on_transient_then_success() {
    let remaining = Arc::new(AtomicU32::new(2));
    let mut registry = ToolRegistry::new();
    {
        let remaining = Arc::clone(&remaining);
        registry
            .register(Arc::new(FnTool::new(
                "flaky",
                ToolSchema::object().allow_additional(),
                move |_input| {
                    let remaining = Arc::clone(&remaining);
                    async move {
                        if remaining
                            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                            .is_ok()
                        {
                            Err(AgentError::Transient("upstream 503".into()))
                        } else {
                            Ok(json!("recovered"))
                        }
                    }
                },
            )))
            .unwrap();
    }
    let executor = ToolExecutor::new(
        Arc::new(registry),
        ExecutorConfig {
            retry: RetryPolicy::new(
                3,
                Duration::from_millis(10),
                Duration::from_secs(1),
                2.0,
            ),
            ..ExecutorConfig::default()
        },
    );
    let env = CallEnv::for_tests("s");

    let started = Instant::now();
    let records = executor
        .execute_parallel(&env, vec![ToolCall::new("flaky", json!({}))])
        .await;
    let elapsed = started.elapsed();

    assert!(records[0].success);
    assert_eq!(records[0].attempts, 3);
    assert_eq!(records[0].output, Some(json!("recovered")));
    // Two backoffs: >= 10 ms and >= 20 ms (plus jitter).
    assert!(elapsed >= Duration::from_millis(30), "took {elapsed:?}");
}

/// The semaphore bounds in-flight invocations; a size-1 semaphore
/// degenerates to sequential execution with preserved index mapping.
#[tokio::test]
async fn semaphore_bounds_concurrency() {
    let active = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));
    let mut registry = ToolRegistry::new();
    {
        let active = Arc::clone(&active);
        let peak = Arc::clone(&peak);
        registry
            .register(Arc::new(FnTool::new(
                "gauge",
                ToolSchema::object().allow_additional(),
                move |input| {
                    let active = Arc::clone(&active);
                    let peak = Arc::clone(&peak);
                    async move {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                        Ok(input)
                    }
                },
            )))
            .unwrap();
    }
    let registry = Arc::new(registry);

    let executor = ToolExecutor::new(
        Arc::clone(&registry),
        ExecutorConfig {
            max_concurrency: 2,
            ..ExecutorConfig::default()
        },
    );
    let env = CallEnv::for_tests("s");
    let calls: Vec<ToolCall> = (0..6)
        .map(|i| ToolCall::new("gauge", json!({"i": i})))
        .collect();
    let records = executor.execute_parallel(&env, calls).await;
    assert_eq!(records.len(), 6);
    assert!(peak.load(Ordering::SeqCst) <= 2, "peak {}", peak.load(Ordering::SeqCst));

    // Semaphore of one: sequential, still index-aligned.
    peak.store(0, Ordering::SeqCst);
    let executor = ToolExecutor::new(
        registry,
        ExecutorConfig {
            max_concurrency: 1,
            ..ExecutorConfig::default()
        },
    );
    let calls: Vec<ToolCall> = (0..4)
        .map(|i| ToolCall::new("gauge", json!({"i": i})))
        .collect();
    let records = executor.execute_parallel(&env, calls).await;
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    for (i, record) in records.iter().enumerate() {
        assert_eq!(record.output, Some(json!({"i": i})));
    }
}

/// Cancellation reaches queued and in-flight calls; every record reports
/// Cancelled and the batch returns promptly.
#[tokio::test]
async fn cancellation_propagates_to_the_batch() {
    let mut registry = ToolRegistry::new();
    registry
        .register(timed_tool("slow", Duration::from_secs(10), "late"))
        .unwrap();
    let executor = ToolExecutor::new(
        Arc::new(registry),
        ExecutorConfig {
            max_concurrency: 2,
            retry: RetryPolicy::none(),
            ..ExecutorConfig::default()
        },
    );
    let env = CallEnv::for_tests("s");

    let cancel = env.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let started = Instant::now();
    let calls: Vec<ToolCall> = (0..5)
        .map(|_| ToolCall::new("slow", json!({})))
        .collect();
    let records = executor.execute_parallel(&env, calls).await;

    assert_eq!(records.len(), 5);
    for record in &records {
        assert_eq!(record.error_kind(), Some(ErrorKind::Cancelled));
    }
    assert!(started.elapsed() < Duration::from_millis(1500));
}

/// Rate-limit errors honor the upstream Retry-After as a delay floor.
#[tokio::test]
async fn rate_limited_waits_at_least_retry_after() {
    let first = Arc::new(AtomicU32::new(0));
    let mut registry = ToolRegistry::new();
    {
        let first = Arc::clone(&first);
        registry
            .register(Arc::new(FnTool::new(
                "limited",
                ToolSchema::object().allow_additional(),
                move |_input| {
                    let first = Arc::clone(&first);
                    async move {
                        if first.fetch_add(1, Ordering::SeqCst) == 0 {
                            Err(AgentError::RateLimited {
                                message: "429".into(),
                                retry_after: Some(Duration::from_millis(80)),
                            })
                        } else {
                            Ok(json!("through"))
                        }
                    }
                },
            )))
            .unwrap();
    }
    let executor = ToolExecutor::new(
        Arc::new(registry),
        ExecutorConfig {
            retry: RetryPolicy::new(2, Duration::from_millis(1), Duration::from_secs(1), 2.0),
            ..ExecutorConfig::default()
        },
    );
    let env = CallEnv::for_tests("s");

    let started = Instant::now();
    let records = executor
        .execute_parallel(&env, vec![ToolCall::new("limited", json!({}))])
        .await;
    assert!(records[0].success);
    assert_eq!(records[0].attempts, 2);
    assert!(started.elapsed() >= Duration::from_millis(80));
}
