//! Mocks and fixtures shared by the Pipewright test suites.

pub mod fixtures;
pub mod mocks;

use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use pipewright_core::types::{ExecutionId, FanInEntry, Scratch, StepContext, TriggerInfo};

pub use fixtures::*;
pub use mocks::*;

/// A step context for a manual trigger without data.
pub fn step_ctx(node_id: &str) -> StepContext {
    step_ctx_with_trigger(node_id, None)
}

/// A step context whose manual trigger carries `data`.
pub fn step_ctx_with_trigger(node_id: &str, data: Option<Value>) -> StepContext {
    StepContext {
        execution_id: ExecutionId::new(),
        pipeline_id: "test-pipeline".to_string(),
        node_id: node_id.to_string(),
        trigger: TriggerInfo::manual(data),
        scratch: Arc::new(Scratch::new()),
        cancel: CancellationToken::new(),
        text_generator: None,
    }
}

/// Build the fan-in list a multi-input node receives.
pub fn fan_in_input(entries: &[(&str, Value)]) -> Value {
    let list: Vec<FanInEntry> = entries
        .iter()
        .map(|(id, data)| FanInEntry {
            node_id: id.to_string(),
            data: data.clone(),
            schema: None,
        })
        .collect();
    serde_json::to_value(list).unwrap_or(Value::Null)
}
