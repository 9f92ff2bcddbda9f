use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use pipewright_core::config::EngineConfig;
use pipewright_core::error::{PipewrightError, Result};
use pipewright_core::event::EventBus;
use pipewright_core::graph::{Node, NodeConfig};
use pipewright_core::traits::{Executor, GraphStore, NotificationSink, TextGenerator};
use pipewright_core::types::{
    ExecutionId, PipelineEvent, RunRecord, RunStatus, StepContext, TriggerInfo,
};
use pipewright_executors::ExecutorRegistry;

use crate::context::ExecutionContext;
use crate::planner::ExecutionPlanner;
use crate::recovery::RecoveryChain;
use crate::run_log::RunLogger;

/// Drives one pipeline run at a time: plan, execute sequentially, recover, persist.
pub struct Orchestrator {
    store: Arc<dyn GraphStore>,
    registry: Arc<ExecutorRegistry>,
    notifier: Option<Arc<dyn NotificationSink>>,
    text_generator: Option<Arc<dyn TextGenerator>>,
    event_bus: Arc<EventBus>,
    run_log: Option<RunLogger>,
    config: EngineConfig,
    recovery: RecoveryChain,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn GraphStore>, registry: Arc<ExecutorRegistry>) -> Self {
        let config = EngineConfig::default();
        Self {
            store,
            registry,
            notifier: None,
            text_generator: None,
            event_bus: Arc::new(EventBus::default()),
            run_log: None,
            recovery: RecoveryChain::from_config(&config),
            config,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.recovery = RecoveryChain::from_config(&config);
        self.config = config;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_text_generator(mut self, generator: Arc<dyn TextGenerator>) -> Self {
        self.text_generator = Some(generator);
        self
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    /// Write a JSONL log for every run.
    pub fn with_run_log(mut self, logger: RunLogger) -> Self {
        self.run_log = Some(logger);
        self
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    /// Run a stored pipeline to completion.
    ///
    /// A run record is persisted either way. On failure the record carries
    /// the error message and the error itself is returned.
    pub async fn run(&self, pipeline_id: &str, trigger: TriggerInfo) -> Result<RunRecord> {
        let log_task = self.run_log.clone().map(|logger| {
            logger.spawn(&self.event_bus, pipeline_id, CancellationToken::new())
        });

        let mut ctx = ExecutionContext::new(pipeline_id, trigger);
        info!(
            pipeline_id = %pipeline_id,
            execution_id = %ctx.execution_id,
            trigger = %ctx.trigger.kind,
            "Pipeline run started"
        );
        self.event_bus.publish(PipelineEvent::RunStarted {
            execution_id: ctx.execution_id.clone(),
            pipeline_id: pipeline_id.to_string(),
            trigger: ctx.trigger.kind,
        });

        let outcome = self.execute(&mut ctx).await;

        let result = match outcome {
            Ok(final_output) => {
                let record = ctx.to_result(RunStatus::Success, final_output, None);
                let persisted = self.store.put_run(&record).await;
                self.finish(&record).await;
                persisted.map(|_| record)
            }
            Err(e) => {
                let record = ctx.to_result(RunStatus::Failed, None, Some(e.to_string()));
                if let Err(store_err) = self.store.put_run(&record).await {
                    error!(error = %store_err, "Failed to persist failed run record");
                }
                self.finish(&record).await;
                Err(e)
            }
        };

        if let Some(handle) = log_task {
            handle.await.ok();
        }
        result
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<Option<Value>> {
        let graph = self
            .store
            .get(&ctx.pipeline_id)
            .await?
            .ok_or_else(|| PipewrightError::PipelineNotFound(ctx.pipeline_id.clone()))?;

        let errors = ExecutionPlanner::validate(&graph);
        if !errors.is_empty() {
            return Err(PipewrightError::Validation(errors));
        }
        let order = ExecutionPlanner::order(&graph.nodes)?;
        debug!(
            pipeline_id = %graph.id,
            order = ?order.iter().map(|n| n.id.as_str()).collect::<Vec<_>>(),
            "Run order computed"
        );

        for node in &order {
            self.run_node(node, ctx).await?;
        }

        Ok(order
            .last()
            .and_then(|node| ctx.get_output(&node.id).cloned()))
    }

    async fn run_node(&self, node: &Node, ctx: &mut ExecutionContext) -> Result<()> {
        let started = Instant::now();
        let timeout_ms = node
            .config
            .timeout_ms()
            .unwrap_or(self.config.default_timeout_ms);
        let step = ctx.step_context(&node.id, CancellationToken::new(), self.text_generator.clone());

        // Lookup failures go through recovery like any other step error.
        let prepared = self
            .registry
            .get(&node.kind)
            .and_then(|executor| Ok((executor, ctx.get_input(node)?)));

        let (outcome, prepared) = match prepared {
            Ok((executor, input)) => {
                self.event_bus.publish(PipelineEvent::NodeStarted {
                    execution_id: ctx.execution_id.clone(),
                    node_id: node.id.clone(),
                    node_type: node.kind.clone(),
                    input: input.clone(),
                });
                debug!(node_id = %node.id, node_type = %node.kind, "Executing node");
                let outcome = invoke_with_timeout(
                    executor.clone(),
                    input.clone(),
                    node.config.clone(),
                    step.clone(),
                    timeout_ms,
                )
                .await;
                (outcome, Some((executor, input)))
            }
            Err(e) => (Err(e), None),
        };

        let error = match outcome {
            Ok(value) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                ctx.record_timing(&node.id, elapsed_ms);
                ctx.set_output(&node.id, value);
                self.event_bus.publish(PipelineEvent::NodeCompleted {
                    execution_id: ctx.execution_id.clone(),
                    node_id: node.id.clone(),
                    elapsed_ms,
                });
                debug!(node_id = %node.id, elapsed_ms, "Node completed");
                return Ok(());
            }
            Err(e) => e,
        };

        ctx.record_timing(&node.id, started.elapsed().as_millis() as u64);
        warn!(node_id = %node.id, node_type = %node.kind, error = %error, "Node failed");
        self.event_bus.publish(PipelineEvent::NodeFailed {
            execution_id: ctx.execution_id.clone(),
            node_id: node.id.clone(),
            error: error.to_string(),
        });

        let lookup_failure = error.to_string();
        let retry = || {
            let prepared = prepared.clone();
            let config = node.config.clone();
            let step = step.clone();
            let node_type = node.kind.clone();
            let lookup_failure = lookup_failure.clone();
            async move {
                match prepared {
                    Some((executor, input)) => {
                        invoke_with_timeout(executor, input, config, step, timeout_ms).await
                    }
                    None => Err(PipewrightError::execution(node_type, lookup_failure)),
                }
            }
        };

        let (value, recovery) = self.recovery.recover(node, error, ctx, retry).await?;

        info!(node_id = %node.id, recovery = %recovery, "Node recovered");
        ctx.set_output(&node.id, value);
        ctx.record_timing(&node.id, started.elapsed().as_millis() as u64);
        self.event_bus.publish(PipelineEvent::NodeRecovered {
            execution_id: ctx.execution_id.clone(),
            node_id: node.id.clone(),
            recovery: recovery.to_string(),
        });
        Ok(())
    }

    /// Announce the end of a run and notify. Never fails.
    async fn finish(&self, record: &RunRecord) {
        match &record.error {
            None => info!(
                pipeline_id = %record.pipeline_id,
                execution_id = %record.id,
                duration_ms = record.duration_ms,
                "Pipeline run completed"
            ),
            Some(e) => error!(
                pipeline_id = %record.pipeline_id,
                execution_id = %record.id,
                error = %e,
                "Pipeline run failed"
            ),
        }

        self.event_bus.publish(PipelineEvent::RunCompleted {
            execution_id: ExecutionId::from_string(&record.id),
            pipeline_id: record.pipeline_id.clone(),
            status: record.status,
            duration_ms: record.duration_ms,
            error: record.error.clone(),
        });

        let Some(notifier) = &self.notifier else {
            return;
        };
        let (title, message) = match &record.error {
            None => (
                "Pipeline completed",
                format!("{} finished in {}ms", record.pipeline_id, record.duration_ms),
            ),
            Some(e) => ("Pipeline failed", format!("{}: {}", record.pipeline_id, e)),
        };
        if let Err(e) = notifier.notify(title, &message).await {
            warn!(error = %e, "Notification delivery failed");
        }
    }
}

/// How long a timed-out executor gets to wind down after its token is cancelled.
const CANCEL_GRACE: Duration = Duration::from_millis(250);

/// Race one executor invocation against the node timeout.
///
/// The executor runs on its own task. On timeout the step's token is
/// cancelled and the task gets [`CANCEL_GRACE`] to stop before it is aborted.
async fn invoke_with_timeout(
    executor: Arc<dyn Executor>,
    input: Value,
    config: NodeConfig,
    mut step: StepContext,
    timeout_ms: u64,
) -> Result<Value> {
    let cancel = CancellationToken::new();
    step.cancel = cancel.clone();
    let node_id = step.node_id.clone();

    let mut handle = tokio::spawn(async move { executor.execute(input, config, step).await });

    match tokio::time::timeout(Duration::from_millis(timeout_ms), &mut handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(PipewrightError::execution(
            "executor",
            format!("node {} panicked: {}", node_id, join_err),
        )),
        Err(_) => {
            cancel.cancel();
            if tokio::time::timeout(CANCEL_GRACE, &mut handle).await.is_err() {
                debug!(node_id = %node_id, "Executor ignored cancellation, aborting");
                handle.abort();
            }
            Err(PipewrightError::NodeTimedOut {
                node: node_id,
                timeout_ms,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipewright_core::graph::{GraphDefinition, NodeKind};
    use pipewright_core::types::TriggerKind;
    use pipewright_store::MemoryGraphStore;
    use pipewright_test_utils::{
        cyclic_graph, linear_graph, BrokenNotifier, FailingExecutor, FlakyExecutor, FnExecutor,
        HangingExecutor, RecordingNotifier,
    };
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn orchestrator(store: Arc<MemoryGraphStore>, registry: ExecutorRegistry) -> Orchestrator {
        Orchestrator::new(store, Arc::new(registry))
    }

    #[tokio::test]
    async fn test_linear_run_succeeds() {
        let store = Arc::new(MemoryGraphStore::with_graphs([linear_graph("etl")]));
        let orch = orchestrator(store.clone(), ExecutorRegistry::with_builtins());

        let record = orch
            .run("etl", TriggerInfo::manual(Some(json!({"x": 1}))))
            .await
            .unwrap();

        assert_eq!(record.status, RunStatus::Success);
        assert_eq!(record.final_output, Some(json!({"x": 1, "y": 2})));
        assert_eq!(record.trigger_type, TriggerKind::Manual);
        assert_eq!(record.node_results.len(), 3);
        assert!(record.node_results.values().all(|r| r.success));
        assert_eq!(store.runs().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_pipeline_persists_failed_record() {
        let store = Arc::new(MemoryGraphStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let orch = orchestrator(store.clone(), ExecutorRegistry::with_builtins())
            .with_notifier(notifier.clone());

        let err = orch.run("ghost", TriggerInfo::manual(None)).await.unwrap_err();
        assert!(matches!(err, PipewrightError::PipelineNotFound(_)));

        let runs = store.runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert_eq!(runs[0].error.as_deref(), Some("Pipeline not found: ghost"));
        assert_eq!(notifier.sent()[0].0, "Pipeline failed");
    }

    #[tokio::test]
    async fn test_cycle_fails_before_any_node_runs() {
        let store = Arc::new(MemoryGraphStore::with_graphs([cyclic_graph("loop")]));
        let mut registry = ExecutorRegistry::new();
        let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counter = calls.clone();
        registry.register(
            NodeKind::ManualData,
            FnExecutor::new(move |input, _, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(input)
            }),
        );
        let orch = orchestrator(store.clone(), registry);

        let err = orch.run("loop", TriggerInfo::manual(None)).await.unwrap_err();
        assert!(matches!(err, PipewrightError::CircularDependency { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(store.runs()[0].error.as_deref().unwrap().contains("Circular dependency"));
    }

    #[tokio::test]
    async fn test_validation_errors_are_aggregated() {
        let graph = GraphDefinition::new(
            "bad",
            vec![
                Node::new("b", "filter").with_inputs(["x"]),
                Node::new("c", "filter").with_inputs(["y"]),
            ],
        );
        let store = Arc::new(MemoryGraphStore::with_graphs([graph]));
        let orch = orchestrator(store, ExecutorRegistry::with_builtins());

        let err = orch.run("bad", TriggerInfo::manual(None)).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Pipeline validation failed: Node b references missing input x; Node c references missing input y"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_stops_run_with_single_error_entry() {
        let graph = GraphDefinition::new(
            "slow",
            vec![Node::new("T", "code").with_config("timeout", json!(100))],
        );
        let store = Arc::new(MemoryGraphStore::with_graphs([graph]));
        let mut registry = ExecutorRegistry::new();
        registry.register(NodeKind::Code, HangingExecutor);
        let orch = orchestrator(store.clone(), registry);

        let err = orch.run("slow", TriggerInfo::manual(None)).await.unwrap_err();
        assert!(matches!(err, PipewrightError::NodeTimedOut { ref node, timeout_ms: 100 } if node == "T"));

        let record = &store.runs()[0];
        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(record.errors.len(), 1);
        assert_eq!(record.errors[0].recovery, "pipeline_stopped");
        assert!(!record.node_results["T"].success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_cancels_step_token() {
        let graph = GraphDefinition::new(
            "slow",
            vec![Node::new("T", "code")
                .with_config("timeout", json!(50))
                .with_config("maxRetries", json!(0))],
        );
        let store = Arc::new(MemoryGraphStore::with_graphs([graph]));
        let seen = Arc::new(std::sync::Mutex::new(None));
        let mut registry = ExecutorRegistry::new();
        registry.register(NodeKind::Code, CapturingHang { slot: seen.clone() });
        let orch = orchestrator(store, registry);

        orch.run("slow", TriggerInfo::manual(None)).await.unwrap_err();
        let token = seen.lock().unwrap().clone().unwrap();
        assert!(token.is_cancelled());
    }

    struct CapturingHang {
        slot: Arc<std::sync::Mutex<Option<CancellationToken>>>,
    }

    impl Executor for CapturingHang {
        fn description(&self) -> &str {
            "hangs after recording its cancellation token"
        }

        fn execute(
            &self,
            _input: Value,
            _config: NodeConfig,
            ctx: StepContext,
        ) -> futures::future::BoxFuture<'_, Result<Value>> {
            *self.slot.lock().unwrap() = Some(ctx.cancel.clone());
            Box::pin(futures::future::pending())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_executor_sees_cancellation() {
        let graph = GraphDefinition::new(
            "slow",
            vec![Node::new("S", "code")
                .with_config("timeout", json!(100))
                .with_config("maxRetries", json!(0))],
        );
        let store = Arc::new(MemoryGraphStore::with_graphs([graph]));
        let stopped = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let mut registry = ExecutorRegistry::new();
        registry.register(NodeKind::Code, CooperativeHang { stopped: stopped.clone() });
        let orch = orchestrator(store, registry);

        let err = orch.run("slow", TriggerInfo::manual(None)).await.unwrap_err();
        assert!(matches!(err, PipewrightError::NodeTimedOut { timeout_ms: 100, .. }));
        assert!(stopped.load(Ordering::SeqCst));
    }

    /// Waits on its token and records that cancellation arrived.
    struct CooperativeHang {
        stopped: Arc<std::sync::atomic::AtomicBool>,
    }

    impl Executor for CooperativeHang {
        fn description(&self) -> &str {
            "hangs until cancelled"
        }

        fn execute(
            &self,
            _input: Value,
            _config: NodeConfig,
            ctx: StepContext,
        ) -> futures::future::BoxFuture<'_, Result<Value>> {
            Box::pin(async move {
                ctx.cancel.cancelled().await;
                self.stopped.store(true, Ordering::SeqCst);
                Err(PipewrightError::execution("code", "command cancelled"))
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_config_error_is_not_retried() {
        let graph = GraphDefinition::new("nourl", vec![Node::new("F", "http_fetch")]);
        let store = Arc::new(MemoryGraphStore::with_graphs([graph]));
        let orch = orchestrator(store.clone(), ExecutorRegistry::with_builtins());

        let start = tokio::time::Instant::now();
        let err = orch.run("nourl", TriggerInfo::manual(None)).await.unwrap_err();
        assert!(matches!(err, PipewrightError::InvalidConfig { .. }));
        assert!(start.elapsed() < Duration::from_millis(1000));

        let record = &store.runs()[0];
        assert_eq!(record.errors.len(), 1);
        assert_eq!(record.errors[0].recovery, "pipeline_stopped");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_success() {
        let graph = GraphDefinition::new(
            "flaky",
            vec![Node::new("F", "http_fetch").with_config("maxRetries", json!(3))],
        );
        let store = Arc::new(MemoryGraphStore::with_graphs([graph]));
        let flaky = FlakyExecutor::new(2, "network error");
        let counter = flaky.counter();
        let mut registry = ExecutorRegistry::new();
        registry.register(NodeKind::HttpFetch, flaky);
        let orch = orchestrator(store, registry);

        let record = orch
            .run("flaky", TriggerInfo::manual(Some(json!({"ok": true}))))
            .await
            .unwrap();
        assert_eq!(record.status, RunStatus::Success);
        assert_eq!(record.final_output, Some(json!({"ok": true})));
        assert_eq!(record.errors.len(), 1);
        assert_eq!(record.errors[0].recovery, "retry_success_attempt_3");
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(record.node_results["F"].success);
    }

    #[tokio::test]
    async fn test_skip_continues_with_null() {
        let graph = GraphDefinition::new(
            "skip",
            vec![
                Node::new("A", "filter").with_config("skipOnError", json!(true)),
                Node::new("B", "manual_data").with_inputs(["A"]),
            ],
        );
        let store = Arc::new(MemoryGraphStore::with_graphs([graph]));
        let mut registry = ExecutorRegistry::with_builtins();
        registry.register(NodeKind::Filter, FailingExecutor::new("bad predicate"));
        let orch = orchestrator(store, registry);

        let record = orch.run("skip", TriggerInfo::manual(None)).await.unwrap();
        assert_eq!(record.final_output, Some(Value::Null));
        assert_eq!(record.errors[0].recovery, "skipped");
        assert_eq!(record.warnings.len(), 1);
        assert!(!record.node_results["A"].success);
        assert!(record.node_results["B"].success);
    }

    #[tokio::test]
    async fn test_unknown_type_goes_through_recovery() {
        let graph = GraphDefinition::new(
            "odd",
            vec![Node::new("X", "teleport").with_config("skipOnError", json!(true))],
        );
        let store = Arc::new(MemoryGraphStore::with_graphs([graph]));
        let orch = orchestrator(store, ExecutorRegistry::with_builtins());

        let record = orch.run("odd", TriggerInfo::manual(None)).await.unwrap();
        assert_eq!(record.errors[0].recovery, "skipped");
        assert!(record.errors[0].message.contains("Unknown executor type: teleport"));

        let strict = GraphDefinition::new("strict", vec![Node::new("X", "teleport")]);
        let store = Arc::new(MemoryGraphStore::with_graphs([strict]));
        let orch = orchestrator(store, ExecutorRegistry::with_builtins());
        let err = orch.run("strict", TriggerInfo::manual(None)).await.unwrap_err();
        assert!(matches!(err, PipewrightError::UnknownExecutorType(_)));
    }

    #[tokio::test]
    async fn test_broken_notifier_does_not_fail_run() {
        let store = Arc::new(MemoryGraphStore::with_graphs([linear_graph("etl")]));
        let orch = orchestrator(store, ExecutorRegistry::with_builtins())
            .with_notifier(Arc::new(BrokenNotifier));
        let record = orch.run("etl", TriggerInfo::manual(None)).await.unwrap();
        assert!(record.succeeded());
    }

    #[tokio::test]
    async fn test_events_bracket_the_run() {
        let store = Arc::new(MemoryGraphStore::with_graphs([linear_graph("etl")]));
        let orch = orchestrator(store, ExecutorRegistry::with_builtins());
        let mut rx = orch.event_bus().subscribe();

        let record = orch.run("etl", TriggerInfo::manual(None)).await.unwrap();

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(matches!(events.first(), Some(PipelineEvent::RunStarted { .. })));
        assert!(matches!(
            events.last(),
            Some(PipelineEvent::RunCompleted { status: RunStatus::Success, .. })
        ));
        let completed = events
            .iter()
            .filter(|e| matches!(e, PipelineEvent::NodeCompleted { .. }))
            .count();
        assert_eq!(completed, 3);
        assert!(events.iter().all(|e| e.execution_id().0 == record.id));
    }

    #[tokio::test]
    async fn test_run_log_written_per_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryGraphStore::with_graphs([linear_graph("etl")]));
        let orch = orchestrator(store, ExecutorRegistry::with_builtins())
            .with_run_log(RunLogger::new(dir.path().to_path_buf(), 2));

        orch.run("etl", TriggerInfo::manual(None)).await.unwrap();

        let file = std::fs::read_dir(dir.path().join("etl"))
            .unwrap()
            .next()
            .unwrap()
            .unwrap();
        let content = std::fs::read_to_string(file.path()).unwrap();
        assert_eq!(content.lines().count(), 5);
        assert!(content.lines().last().unwrap().contains("run_completed"));
    }
}
