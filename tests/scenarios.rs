use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde_json::json;

use pipewright_core::error::PipewrightError;
use pipewright_core::graph::{GraphDefinition, Node, NodeKind};
use pipewright_core::traits::GraphStore;
use pipewright_core::types::{RunStatus, TriggerInfo};
use pipewright_engine::{ExecutionPlanner, Orchestrator};
use pipewright_executors::ExecutorRegistry;
use pipewright_store::{MemoryGraphStore, SqliteGraphStore};
use pipewright_test_utils::{
    cyclic_graph, join_graph, linear_graph, FlakyExecutor, HangingExecutor, RecordingNotifier,
};

fn orchestrator(store: Arc<dyn GraphStore>, registry: ExecutorRegistry) -> Orchestrator {
    Orchestrator::new(store, Arc::new(registry))
}

#[tokio::test]
async fn linear_pipeline_runs_in_order() {
    let graph = linear_graph("linear");
    let plan = ExecutionPlanner::plan(&graph).unwrap();
    assert_eq!(plan.order, vec!["A", "B", "C"]);

    let store = Arc::new(SqliteGraphStore::in_memory().unwrap());
    store.put_graph(&graph).await.unwrap();
    let notifier = Arc::new(RecordingNotifier::new());
    let orch = orchestrator(store.clone(), ExecutorRegistry::with_builtins())
        .with_notifier(notifier.clone());

    let record = orch
        .run("linear", TriggerInfo::manual(Some(json!({"x": 1}))))
        .await
        .unwrap();

    assert_eq!(record.status, RunStatus::Success);
    assert_eq!(record.final_output, Some(json!({"x": 1, "y": 2})));
    assert!(record.errors.is_empty());

    let history = store.list_runs("linear", 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0], record);
    assert_eq!(notifier.sent()[0].0, "Pipeline completed");
}

#[tokio::test]
async fn cycle_fails_before_any_node() {
    let store = Arc::new(MemoryGraphStore::with_graphs([cyclic_graph("cycle")]));
    let flaky = FlakyExecutor::new(0, "unused");
    let calls = flaky.counter();
    let mut registry = ExecutorRegistry::new();
    registry.register(NodeKind::ManualData, flaky);
    let orch = orchestrator(store.clone(), registry);

    let err = orch.run("cycle", TriggerInfo::manual(None)).await.unwrap_err();
    assert!(matches!(err, PipewrightError::CircularDependency { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let runs = store.runs();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Failed);
    assert!(runs[0]
        .error
        .as_deref()
        .unwrap()
        .starts_with("Circular dependency detected at node:"));
    assert!(runs[0].node_results.is_empty());
}

#[tokio::test(start_paused = true)]
async fn timeout_without_recovery_stops_the_run() {
    let graph = GraphDefinition::new(
        "timeout",
        vec![Node::new("T", "http_fetch").with_config("timeout", json!(100))],
    );
    let store = Arc::new(MemoryGraphStore::with_graphs([graph]));
    let mut registry = ExecutorRegistry::new();
    registry.register(NodeKind::HttpFetch, HangingExecutor);
    let orch = orchestrator(store.clone(), registry);

    let err = orch.run("timeout", TriggerInfo::manual(None)).await.unwrap_err();
    assert!(matches!(err, PipewrightError::NodeTimedOut { timeout_ms: 100, .. }));

    let record = &store.runs()[0];
    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(record.errors.len(), 1);
    assert_eq!(record.errors[0].node_id, "T");
    assert_eq!(record.errors[0].recovery, "pipeline_stopped");
    assert!(record.error.as_deref().unwrap().contains("timed out"));
}

#[tokio::test(start_paused = true)]
async fn transient_failures_recover_on_retry() {
    let graph = GraphDefinition::new(
        "retry",
        vec![Node::new("F", "http_fetch").with_config("maxRetries", json!(3))],
    );
    let store = Arc::new(MemoryGraphStore::with_graphs([graph]));
    let flaky = FlakyExecutor::new(2, "network error");
    let calls = flaky.counter();
    let mut registry = ExecutorRegistry::new();
    registry.register(NodeKind::HttpFetch, flaky);
    let orch = orchestrator(store, registry);

    let record = orch
        .run("retry", TriggerInfo::manual(Some(json!([1, 2, 3]))))
        .await
        .unwrap();

    assert_eq!(record.status, RunStatus::Success);
    assert_eq!(record.errors.len(), 1);
    assert_eq!(record.errors[0].recovery, "retry_success_attempt_3");
    assert_eq!(record.final_output, Some(json!([1, 2, 3])));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn fan_in_inner_join() {
    let store = Arc::new(MemoryGraphStore::with_graphs([join_graph("join")]));
    let orch = orchestrator(store, ExecutorRegistry::with_builtins());

    let record = orch.run("join", TriggerInfo::manual(None)).await.unwrap();
    assert_eq!(
        record.final_output,
        Some(json!([{"id": 1, "name": "A", "amt": 5}]))
    );
}

#[tokio::test]
async fn cached_fallback_after_hard_failure() {
    // S caches a value under F's key before F fails for good.
    let graph = GraphDefinition::new(
        "cache",
        vec![
            Node::new("S", "code").with_config("command", json!("true")),
            Node::new("F", "http_fetch")
                .with_inputs(["S"])
                .with_config("url", json!("http://127.0.0.1:9/unreachable"))
                .with_config("maxRetries", json!(0))
                .with_config("useCachedOnError", json!(true)),
        ],
    );
    let store = Arc::new(MemoryGraphStore::with_graphs([graph]));
    let mut registry = ExecutorRegistry::with_builtins();
    registry.register(
        NodeKind::Code,
        pipewright_test_utils::FnExecutor::new(|_, _, ctx| {
            ctx.set_storage("cache_F", json!({"stale": true}));
            Ok(serde_json::Value::Null)
        }),
    );
    let orch = orchestrator(store, registry);

    let record = orch.run("cache", TriggerInfo::manual(None)).await.unwrap();
    assert_eq!(record.final_output, Some(json!({"stale": true})));
    assert_eq!(record.errors[0].recovery, "used_cached_data");
    assert_eq!(record.warnings.len(), 1);
}
