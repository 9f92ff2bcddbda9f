use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::graph::{GraphDefinition, NodeConfig};
use crate::types::*;

/// Executor — the behavior behind one node type.
pub trait Executor: Send + Sync + 'static {
    /// Human-readable description.
    fn description(&self) -> &str;

    /// Run the step. Fails with a descriptive error on anything unrecoverable.
    fn execute(&self, input: Value, config: NodeConfig, ctx: StepContext)
        -> BoxFuture<'_, Result<Value>>;

    /// Authoring-time config check. The orchestrator never calls this.
    fn validate(&self, config: &NodeConfig) -> Vec<String> {
        let _ = config;
        Vec::new()
    }
}

/// Graph store — persistence for graph definitions and run records.
pub trait GraphStore: Send + Sync + 'static {
    /// Load a graph definition by pipeline id.
    fn get(&self, pipeline_id: &str) -> BoxFuture<'_, Result<Option<GraphDefinition>>>;

    /// Insert or replace a graph definition.
    fn put_graph(&self, graph: &GraphDefinition) -> BoxFuture<'_, Result<()>>;

    /// Persist a finished run.
    fn put_run(&self, record: &RunRecord) -> BoxFuture<'_, Result<()>>;

    /// List stored graphs.
    fn list_graphs(&self) -> BoxFuture<'_, Result<Vec<GraphSummary>>>;

    /// Most recent runs of a pipeline, newest first.
    fn list_runs(&self, pipeline_id: &str, limit: usize) -> BoxFuture<'_, Result<Vec<RunRecord>>>;
}

/// Notification sink — fire-and-forget run outcome signals.
pub trait NotificationSink: Send + Sync + 'static {
    fn notify(&self, title: &str, message: &str) -> BoxFuture<'_, Result<()>>;
}

/// Text generator used by AI-assisted steps.
pub trait TextGenerator: Send + Sync + 'static {
    fn generate(&self, prompt: String) -> BoxFuture<'_, Result<String>>;
}

/// Trigger source — something that decides when a pipeline runs.
pub trait TriggerSource: Send + Sync + 'static {
    /// Source name (e.g., "schedule", "manual").
    fn name(&self) -> &str;

    /// Start emitting trigger events until cancelled.
    fn start(
        &self,
        tx: mpsc::Sender<TriggerEvent>,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<()>>;
}
