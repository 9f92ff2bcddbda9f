use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{PipewrightError, Result};

/// A user-authored pipeline: nodes plus the trigger that starts it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GraphDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub trigger: TriggerDescriptor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl GraphDefinition {
    pub fn new(id: impl Into<String>, nodes: Vec<Node>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            nodes,
            trigger: TriggerDescriptor::default(),
            updated_at: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_trigger(mut self, trigger: TriggerDescriptor) -> Self {
        self.trigger = trigger;
        self
    }

    /// Look up a node by id.
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// How a pipeline expects to be started. Informational for the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TriggerDescriptor {
    #[serde(rename = "type", default = "default_trigger_type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
}

fn default_trigger_type() -> String {
    "manual".to_string()
}

/// A typed processing step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Unique within the graph.
    pub id: String,
    /// Executor type name. Kept as a string so unknown types fail at run time.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub config: NodeConfig,
    /// Upstream producers, in declaration order.
    #[serde(default)]
    pub inputs: Vec<InputRef>,
    /// Downstream consumers. Informational only.
    #[serde(default)]
    pub outputs: Vec<OutputRef>,
}

impl Node {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            config: NodeConfig::default(),
            inputs: vec![],
            outputs: vec![],
        }
    }

    /// Declare upstream producers by id.
    pub fn with_inputs<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = ids.into_iter().map(InputRef::new).collect();
        self
    }

    /// Set a single config key.
    pub fn with_config(mut self, key: impl Into<String>, value: Value) -> Self {
        self.config.set(key, value);
        self
    }

    pub fn input_ids(&self) -> impl Iterator<Item = &str> {
        self.inputs.iter().map(|i| i.node_id.as_str())
    }
}

/// Reference to an upstream node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InputRef {
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

impl InputRef {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            input_schema: None,
        }
    }
}

/// Reference to a downstream node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OutputRef {
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
}

/// Type-specific node settings, plus the engine-level recovery keys.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct NodeConfig(pub Map<String, Value>);

impl NodeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    /// Per-node timeout in milliseconds (`timeout`).
    pub fn timeout_ms(&self) -> Option<u64> {
        self.get("timeout").and_then(value_as_u64)
    }

    /// Retry budget (`maxRetries`).
    pub fn max_retries(&self) -> Option<u32> {
        self.get("maxRetries")
            .and_then(value_as_u64)
            .map(|n| n.min(u32::MAX as u64) as u32)
    }

    /// Fall back to `cache_<nodeId>` in storage on failure (`useCachedOnError`).
    pub fn use_cached_on_error(&self) -> bool {
        self.flag("useCachedOnError")
    }

    /// Replace the output with null on failure (`skipOnError`).
    pub fn skip_on_error(&self) -> bool {
        self.flag("skipOnError")
    }

    fn flag(&self, key: &str) -> bool {
        match self.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => false,
        }
    }

    /// Deserialize the whole config into an executor's typed settings.
    pub fn parse<T: DeserializeOwned>(&self, node_type: &str) -> Result<T> {
        serde_json::from_value(Value::Object(self.0.clone()))
            .map_err(|e| PipewrightError::invalid_config(node_type, e.to_string()))
    }
}

impl From<Value> for NodeConfig {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(map) => Self(map),
            _ => Self::default(),
        }
    }
}

fn value_as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Which part of a pipeline a node kind belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeCategory {
    Input,
    Processing,
    Output,
}

impl fmt::Display for NodeCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Processing => write!(f, "processing"),
            Self::Output => write!(f, "output"),
        }
    }
}

/// The closed set of step types the engine knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    // Input
    ManualData,
    HttpFetch,
    Webhook,
    FileWatch,
    // Processing
    Filter,
    Transform,
    Parse,
    AiTransform,
    Condition,
    Join,
    Deduplicate,
    Validate,
    Aggregate,
    Sort,
    Split,
    Loop,
    Switch,
    RetryUntil,
    Regex,
    FormatConvert,
    Template,
    UrlBuilder,
    Lookup,
    Union,
    Intersect,
    Distinct,
    Code,
    // Output
    Download,
    FileAppend,
    HttpPost,
    Email,
}

impl NodeKind {
    pub const ALL: [NodeKind; 31] = [
        Self::ManualData,
        Self::HttpFetch,
        Self::Webhook,
        Self::FileWatch,
        Self::Filter,
        Self::Transform,
        Self::Parse,
        Self::AiTransform,
        Self::Condition,
        Self::Join,
        Self::Deduplicate,
        Self::Validate,
        Self::Aggregate,
        Self::Sort,
        Self::Split,
        Self::Loop,
        Self::Switch,
        Self::RetryUntil,
        Self::Regex,
        Self::FormatConvert,
        Self::Template,
        Self::UrlBuilder,
        Self::Lookup,
        Self::Union,
        Self::Intersect,
        Self::Distinct,
        Self::Code,
        Self::Download,
        Self::FileAppend,
        Self::HttpPost,
        Self::Email,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ManualData => "manual_data",
            Self::HttpFetch => "http_fetch",
            Self::Webhook => "webhook",
            Self::FileWatch => "file_watch",
            Self::Filter => "filter",
            Self::Transform => "transform",
            Self::Parse => "parse",
            Self::AiTransform => "ai_transform",
            Self::Condition => "condition",
            Self::Join => "join",
            Self::Deduplicate => "deduplicate",
            Self::Validate => "validate",
            Self::Aggregate => "aggregate",
            Self::Sort => "sort",
            Self::Split => "split",
            Self::Loop => "loop",
            Self::Switch => "switch",
            Self::RetryUntil => "retry_until",
            Self::Regex => "regex",
            Self::FormatConvert => "format_convert",
            Self::Template => "template",
            Self::UrlBuilder => "url_builder",
            Self::Lookup => "lookup",
            Self::Union => "union",
            Self::Intersect => "intersect",
            Self::Distinct => "distinct",
            Self::Code => "code",
            Self::Download => "download",
            Self::FileAppend => "file_append",
            Self::HttpPost => "http_post",
            Self::Email => "email",
        }
    }

    pub fn category(&self) -> NodeCategory {
        match self {
            Self::ManualData | Self::HttpFetch | Self::Webhook | Self::FileWatch => {
                NodeCategory::Input
            }
            Self::Download | Self::FileAppend | Self::HttpPost | Self::Email => {
                NodeCategory::Output
            }
            _ => NodeCategory::Processing,
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeKind {
    type Err = PipewrightError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| PipewrightError::UnknownExecutorType(s.to_string()))
    }
}
