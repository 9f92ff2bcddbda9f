use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use pipewright_core::error::{PipewrightError, Result};
use pipewright_core::graph::Node;
use pipewright_core::traits::TextGenerator;
use pipewright_core::types::{
    ErrorEntry, ExecutionId, FanInEntry, NodeRunSummary, Recovery, RunRecord, RunStatus, Scratch,
    StepContext, TriggerInfo, WarningEntry,
};

/// Per-run mutable state. Created fresh for every run and never shared.
pub struct ExecutionContext {
    pub execution_id: ExecutionId,
    pub pipeline_id: String,
    pub started_at: DateTime<Utc>,
    pub trigger: TriggerInfo,
    node_outputs: HashMap<String, Value>,
    scratch: Arc<Scratch>,
    errors: Vec<ErrorEntry>,
    warnings: Vec<WarningEntry>,
    node_timings: BTreeMap<String, u64>,
}

impl ExecutionContext {
    pub fn new(pipeline_id: impl Into<String>, trigger: TriggerInfo) -> Self {
        Self {
            execution_id: ExecutionId::new(),
            pipeline_id: pipeline_id.into(),
            started_at: Utc::now(),
            trigger,
            node_outputs: HashMap::new(),
            scratch: Arc::new(Scratch::new()),
            errors: Vec::new(),
            warnings: Vec::new(),
            node_timings: BTreeMap::new(),
        }
    }

    // ── Outputs ─────────────────────────────────────────────────

    pub fn set_output(&mut self, node_id: impl Into<String>, value: Value) {
        self.node_outputs.insert(node_id.into(), value);
    }

    pub fn get_output(&self, node_id: &str) -> Option<&Value> {
        self.node_outputs.get(node_id)
    }

    /// Resolve what a node receives.
    ///
    /// No inputs: the trigger data (or null). One input: that upstream's
    /// output. Several: a `{nodeId, data, schema}` list in declaration order.
    pub fn get_input(&self, node: &Node) -> Result<Value> {
        match node.inputs.as_slice() {
            [] => Ok(self.trigger.data.clone().unwrap_or(Value::Null)),
            [only] => self.upstream(&only.node_id).cloned(),
            many => {
                let entries = many
                    .iter()
                    .map(|input| {
                        Ok(FanInEntry {
                            node_id: input.node_id.clone(),
                            data: self.upstream(&input.node_id)?.clone(),
                            schema: input.input_schema.clone(),
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(serde_json::to_value(entries)?)
            }
        }
    }

    fn upstream(&self, node_id: &str) -> Result<&Value> {
        self.node_outputs
            .get(node_id)
            .ok_or_else(|| PipewrightError::MissingUpstreamOutput(node_id.to_string()))
    }

    // ── Scratch ─────────────────────────────────────────────────

    pub fn get_storage(&self, key: &str) -> Option<Value> {
        self.scratch.get_storage(key)
    }

    pub fn set_storage(&self, key: impl Into<String>, value: Value) {
        self.scratch.set_storage(key, value);
    }

    pub fn get_variable(&self, name: &str) -> Option<Value> {
        self.scratch.get_variable(name)
    }

    pub fn set_variable(&self, name: impl Into<String>, value: Value) {
        self.scratch.set_variable(name, value);
    }

    // ── Logs ────────────────────────────────────────────────────

    pub fn add_error(&mut self, node_id: &str, error: &PipewrightError, recovery: &Recovery) {
        self.errors.push(ErrorEntry {
            node_id: node_id.to_string(),
            message: error.to_string(),
            stack: Some(format!("{:?}", error)),
            recovery: recovery.to_string(),
            timestamp: Utc::now(),
        });
    }

    pub fn add_warning(&mut self, node_id: &str, message: impl Into<String>) {
        self.warnings.push(WarningEntry {
            node_id: node_id.to_string(),
            message: message.into(),
            timestamp: Utc::now(),
        });
    }

    pub fn record_timing(&mut self, node_id: &str, elapsed_ms: u64) {
        self.node_timings.insert(node_id.to_string(), elapsed_ms);
    }

    pub fn errors(&self) -> &[ErrorEntry] {
        &self.errors
    }

    pub fn warnings(&self) -> &[WarningEntry] {
        &self.warnings
    }

    pub fn timing(&self, node_id: &str) -> Option<u64> {
        self.node_timings.get(node_id).copied()
    }

    /// Handle given to an executor for one invocation.
    pub fn step_context(
        &self,
        node_id: &str,
        cancel: CancellationToken,
        text_generator: Option<Arc<dyn TextGenerator>>,
    ) -> StepContext {
        StepContext {
            execution_id: self.execution_id.clone(),
            pipeline_id: self.pipeline_id.clone(),
            node_id: node_id.to_string(),
            trigger: self.trigger.clone(),
            scratch: self.scratch.clone(),
            cancel,
            text_generator,
        }
    }

    /// Whether the node's own executor produced its output.
    ///
    /// A node that stopped the run, or whose output came from the cache or a
    /// skip, did not succeed. A successful retry still counts.
    fn node_succeeded(&self, node_id: &str) -> bool {
        self.node_outputs.contains_key(node_id)
            && !self.errors.iter().any(|e| {
                e.node_id == node_id && !e.recovery.starts_with("retry_success_attempt_")
            })
    }

    /// Assemble the durable run record.
    pub fn to_result(
        &self,
        status: RunStatus,
        final_output: Option<Value>,
        error: Option<String>,
    ) -> RunRecord {
        let completed_at = Utc::now();
        let node_results = self
            .node_timings
            .iter()
            .map(|(node_id, ms)| {
                (
                    node_id.clone(),
                    NodeRunSummary {
                        success: self.node_succeeded(node_id),
                        duration_ms: *ms,
                    },
                )
            })
            .collect();

        RunRecord {
            id: self.execution_id.to_string(),
            pipeline_id: self.pipeline_id.clone(),
            status,
            trigger_type: self.trigger.kind,
            started_at: self.started_at,
            completed_at,
            duration_ms: (completed_at - self.started_at).num_milliseconds().max(0) as u64,
            final_output,
            errors: self.errors.clone(),
            warnings: self.warnings.clone(),
            error,
            node_results,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipewright_core::graph::InputRef;
    use pipewright_core::types::TriggerKind;
    use serde_json::json;

    fn ctx(data: Option<Value>) -> ExecutionContext {
        ExecutionContext::new("p", TriggerInfo::manual(data))
    }

    #[test]
    fn test_root_receives_trigger_data() {
        let ctx = ctx(Some(json!({"x": 1})));
        let node = Node::new("A", "manual_data");
        assert_eq!(ctx.get_input(&node).unwrap(), json!({"x": 1}));
    }

    #[test]
    fn test_root_without_trigger_data_receives_null() {
        let ctx = ctx(None);
        assert_eq!(ctx.get_input(&Node::new("A", "manual_data")).unwrap(), Value::Null);
    }

    #[test]
    fn test_single_input_is_passed_through() {
        let mut ctx = ctx(None);
        ctx.set_output("A", json!([1, 2]));
        let node = Node::new("B", "filter").with_inputs(["A"]);
        assert_eq!(ctx.get_input(&node).unwrap(), json!([1, 2]));
    }

    #[test]
    fn test_missing_upstream_output() {
        let ctx = ctx(None);
        let node = Node::new("B", "filter").with_inputs(["A"]);
        let err = ctx.get_input(&node).unwrap_err();
        assert!(matches!(err, PipewrightError::MissingUpstreamOutput(ref id) if id == "A"));
    }

    #[test]
    fn test_fan_in_keeps_declaration_order_and_schema() {
        let mut ctx = ctx(None);
        ctx.set_output("L", json!([{"id": 1}]));
        ctx.set_output("R", json!([{"id": 2}]));
        let mut node = Node::new("J", "join").with_inputs(["R", "L"]);
        node.inputs[0] = InputRef {
            node_id: "R".into(),
            input_schema: Some(json!({"type": "array"})),
        };

        let input = ctx.get_input(&node).unwrap();
        assert_eq!(
            input,
            json!([
                {"nodeId": "R", "data": [{"id": 2}], "schema": {"type": "array"}},
                {"nodeId": "L", "data": [{"id": 1}], "schema": null},
            ])
        );
    }

    #[test]
    fn test_fan_in_missing_entry_fails() {
        let mut ctx = ctx(None);
        ctx.set_output("L", json!([]));
        let node = Node::new("J", "join").with_inputs(["L", "R"]);
        assert!(matches!(
            ctx.get_input(&node).unwrap_err(),
            PipewrightError::MissingUpstreamOutput(ref id) if id == "R"
        ));
    }

    #[test]
    fn test_storage_is_shared_with_step_handles() {
        let ctx = ctx(None);
        let step = ctx.step_context("fetch", CancellationToken::new(), None);
        step.set_storage(step.cache_key(), json!([1]));
        step.set_variable("region", json!("eu"));
        assert_eq!(ctx.get_storage("cache_fetch"), Some(json!([1])));
        assert_eq!(ctx.get_variable("region"), Some(json!("eu")));
        assert_eq!(step.execution_id, ctx.execution_id);
    }

    #[test]
    fn test_to_result_collects_logs_and_node_results() {
        let mut ctx = ctx(None);
        ctx.set_output("A", json!(1));
        ctx.record_timing("A", 3);
        ctx.set_output("B", Value::Null);
        ctx.record_timing("B", 4);
        ctx.add_error("B", &PipewrightError::execution("filter", "boom"), &Recovery::Skipped);
        ctx.add_warning("B", "Node skipped after error");
        ctx.set_output("C", json!(2));
        ctx.record_timing("C", 5);
        ctx.add_error(
            "C",
            &PipewrightError::execution("http_fetch", "network error"),
            &Recovery::RetrySuccess { attempt: 2 },
        );

        let record = ctx.to_result(RunStatus::Success, Some(json!(2)), None);
        assert_eq!(record.id, ctx.execution_id.to_string());
        assert_eq!(record.trigger_type, TriggerKind::Manual);
        assert_eq!(record.errors.len(), 2);
        assert_eq!(record.errors[0].recovery, "skipped");
        assert_eq!(record.warnings.len(), 1);
        assert!(record.node_results["A"].success);
        assert!(!record.node_results["B"].success);
        assert!(record.node_results["C"].success);
        assert_eq!(record.node_results["C"].duration_ms, 5);
        assert!(record.completed_at >= record.started_at);
    }
}
