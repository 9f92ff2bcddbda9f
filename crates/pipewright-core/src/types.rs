use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::traits::TextGenerator;

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Manual,
    Schedule,
    Webhook,
    FileWatch,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Manual => write!(f, "manual"),
            Self::Schedule => write!(f, "schedule"),
            Self::Webhook => write!(f, "webhook"),
            Self::FileWatch => write!(f, "file_watch"),
        }
    }
}

impl std::str::FromStr for TriggerKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "schedule" => Ok(Self::Schedule),
            "webhook" => Ok(Self::Webhook),
            "file_watch" => Ok(Self::FileWatch),
            other => Err(format!("unknown trigger type: {}", other)),
        }
    }
}

/// Trigger metadata passed verbatim into a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TriggerInfo {
    #[serde(rename = "type")]
    pub kind: TriggerKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alarm_name: Option<String>,
}

impl TriggerInfo {
    pub fn new(kind: TriggerKind, data: Option<Value>) -> Self {
        Self {
            kind,
            data,
            timestamp: Utc::now(),
            alarm_name: None,
        }
    }

    pub fn manual(data: Option<Value>) -> Self {
        Self::new(TriggerKind::Manual, data)
    }

    pub fn schedule(alarm_name: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            alarm_name: Some(alarm_name.into()),
            ..Self::new(TriggerKind::Schedule, data)
        }
    }
}

/// A trigger addressed to a specific pipeline.
#[derive(Debug, Clone)]
pub struct TriggerEvent {
    pub pipeline_id: String,
    pub trigger: TriggerInfo,
}

/// Final state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// How a failing node was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recovery {
    /// A retry succeeded; `attempt` counts the original call as attempt 1.
    RetrySuccess { attempt: u32 },
    UsedCachedData,
    Skipped,
    PipelineStopped,
}

impl Recovery {
    pub fn is_recovered(&self) -> bool {
        !matches!(self, Self::PipelineStopped)
    }
}

impl fmt::Display for Recovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RetrySuccess { attempt } => write!(f, "retry_success_attempt_{}", attempt),
            Self::UsedCachedData => write!(f, "used_cached_data"),
            Self::Skipped => write!(f, "skipped"),
            Self::PipelineStopped => write!(f, "pipeline_stopped"),
        }
    }
}

/// An error logged against a node, tagged with what recovery did about it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEntry {
    pub node_id: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    pub recovery: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WarningEntry {
    pub node_id: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Per-node outcome in a run record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeRunSummary {
    pub success: bool,
    pub duration_ms: u64,
}

/// The durable result of one run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub id: String,
    pub pipeline_id: String,
    pub status: RunStatus,
    pub trigger_type: TriggerKind,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_output: Option<Value>,
    #[serde(default)]
    pub errors: Vec<ErrorEntry>,
    #[serde(default)]
    pub warnings: Vec<WarningEntry>,
    /// Message of the error that failed the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub node_results: BTreeMap<String, NodeRunSummary>,
}

impl RunRecord {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Success
    }
}

/// Summary row for listing stored pipelines.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphSummary {
    pub id: String,
    pub name: String,
    pub node_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// One upstream stream delivered to a fan-in node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FanInEntry {
    pub node_id: String,
    pub data: Value,
    #[serde(default)]
    pub schema: Option<Value>,
}

/// Run-scoped scratch state shared between the engine and executors.
#[derive(Debug, Default)]
pub struct Scratch {
    storage: Mutex<HashMap<String, Value>>,
    variables: Mutex<HashMap<String, Value>>,
}

impl Scratch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_storage(&self, key: &str) -> Option<Value> {
        lock(&self.storage).get(key).cloned()
    }

    pub fn set_storage(&self, key: impl Into<String>, value: Value) {
        lock(&self.storage).insert(key.into(), value);
    }

    pub fn get_variable(&self, name: &str) -> Option<Value> {
        lock(&self.variables).get(name).cloned()
    }

    pub fn set_variable(&self, name: impl Into<String>, value: Value) {
        lock(&self.variables).insert(name.into(), value);
    }

    pub fn variables(&self) -> HashMap<String, Value> {
        lock(&self.variables).clone()
    }
}

// Single writer at a time; a poisoned lock still holds usable data.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Context handed to an executor for one invocation.
#[derive(Clone)]
pub struct StepContext {
    pub execution_id: ExecutionId,
    pub pipeline_id: String,
    pub node_id: String,
    pub trigger: TriggerInfo,
    pub scratch: Arc<Scratch>,
    /// Cancelled when the engine gives up on this invocation (timeout).
    pub cancel: CancellationToken,
    pub text_generator: Option<Arc<dyn TextGenerator>>,
}

impl StepContext {
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

    /// Storage key used by the cached-fallback recovery for this node.
    pub fn cache_key(&self) -> String {
        cache_key(&self.node_id)
    }
}

impl fmt::Debug for StepContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepContext")
            .field("execution_id", &self.execution_id)
            .field("pipeline_id", &self.pipeline_id)
            .field("node_id", &self.node_id)
            .field("trigger", &self.trigger.kind)
            .field("text_generator", &self.text_generator.is_some())
            .finish()
    }
}

/// Storage key holding the last good output of a node.
pub fn cache_key(node_id: &str) -> String {
    format!("cache_{}", node_id)
}

/// Pipeline event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    RunStarted {
        execution_id: ExecutionId,
        pipeline_id: String,
        trigger: TriggerKind,
    },
    NodeStarted {
        execution_id: ExecutionId,
        node_id: String,
        node_type: String,
        input: Value,
    },
    NodeCompleted {
        execution_id: ExecutionId,
        node_id: String,
        elapsed_ms: u64,
    },
    NodeFailed {
        execution_id: ExecutionId,
        node_id: String,
        error: String,
    },
    NodeRecovered {
        execution_id: ExecutionId,
        node_id: String,
        recovery: String,
    },
    RunCompleted {
        execution_id: ExecutionId,
        pipeline_id: String,
        status: RunStatus,
        duration_ms: u64,
        error: Option<String>,
    },
}

impl PipelineEvent {
    pub fn execution_id(&self) -> &ExecutionId {
        match self {
            Self::RunStarted { execution_id, .. }
            | Self::NodeStarted { execution_id, .. }
            | Self::NodeCompleted { execution_id, .. }
            | Self::NodeFailed { execution_id, .. }
            | Self::NodeRecovered { execution_id, .. }
            | Self::RunCompleted { execution_id, .. } => execution_id,
        }
    }
}
