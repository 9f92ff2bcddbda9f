use std::collections::HashMap;
use std::sync::Arc;

use pipewright_core::error::{PipewrightError, Result};
use pipewright_core::graph::{Node, NodeKind};
use pipewright_core::traits::Executor;

use crate::builtin::{ai, code, input, network, output, relational, text, transform};

/// Registry of step executors, keyed by node kind.
pub struct ExecutorRegistry {
    executors: HashMap<NodeKind, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// Register an executor, replacing any previous one for the same kind.
    pub fn register(&mut self, kind: NodeKind, executor: impl Executor) {
        self.executors.insert(kind, Arc::new(executor));
    }

    /// Register a shared executor instance.
    pub fn register_arc(&mut self, kind: NodeKind, executor: Arc<dyn Executor>) {
        self.executors.insert(kind, executor);
    }

    /// Look up the executor for a node type name.
    pub fn get(&self, node_type: &str) -> Result<Arc<dyn Executor>> {
        let kind: NodeKind = node_type.parse()?;
        self.executors
            .get(&kind)
            .cloned()
            .ok_or_else(|| PipewrightError::UnknownExecutorType(node_type.to_string()))
    }

    /// Registered kinds, in declaration order.
    pub fn kinds(&self) -> Vec<NodeKind> {
        NodeKind::ALL
            .iter()
            .copied()
            .filter(|k| self.executors.contains_key(k))
            .collect()
    }

    /// Authoring-time config check for a node. Never consulted during a run.
    pub fn validate_node(&self, node: &Node) -> Vec<String> {
        match self.get(&node.kind) {
            Ok(executor) => executor
                .validate(&node.config)
                .into_iter()
                .map(|e| format!("Node {}: {}", node.id, e))
                .collect(),
            Err(e) => vec![format!("Node {}: {}", node.id, e)],
        }
    }

    /// Create a registry with every built-in executor registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();

        // ── Input (4) ───────────────────────────────────────────
        registry.register(NodeKind::ManualData, input::ManualDataExecutor);
        registry.register(NodeKind::HttpFetch, input::HttpFetchExecutor);
        registry.register(NodeKind::Webhook, input::WebhookExecutor);
        registry.register(NodeKind::FileWatch, input::FileWatchExecutor);

        // ── Row processing (7) ──────────────────────────────────
        registry.register(NodeKind::Filter, transform::FilterExecutor);
        registry.register(NodeKind::Transform, transform::TransformExecutor);
        registry.register(NodeKind::Parse, transform::ParseExecutor);
        registry.register(NodeKind::Condition, transform::ConditionExecutor);
        registry.register(NodeKind::Validate, transform::ValidateExecutor);
        registry.register(NodeKind::Loop, transform::LoopExecutor);
        registry.register(NodeKind::Switch, transform::SwitchExecutor);

        // ── Relational (8) ──────────────────────────────────────
        registry.register(NodeKind::Join, relational::JoinExecutor);
        registry.register(NodeKind::Aggregate, relational::AggregateExecutor);
        registry.register(NodeKind::Deduplicate, relational::DeduplicateExecutor);
        registry.register(NodeKind::Distinct, relational::DistinctExecutor);
        registry.register(NodeKind::Union, relational::UnionExecutor);
        registry.register(NodeKind::Intersect, relational::IntersectExecutor);
        registry.register(NodeKind::Sort, relational::SortExecutor);
        registry.register(NodeKind::Split, relational::SplitExecutor);

        // ── Text (4) ────────────────────────────────────────────
        registry.register(NodeKind::Regex, text::RegexExecutor);
        registry.register(NodeKind::FormatConvert, text::FormatConvertExecutor);
        registry.register(NodeKind::Template, text::TemplateExecutor);
        registry.register(NodeKind::UrlBuilder, text::UrlBuilderExecutor);

        // ── Network / AI / Code (5) ─────────────────────────────
        registry.register(NodeKind::Lookup, network::LookupExecutor);
        registry.register(NodeKind::RetryUntil, network::RetryUntilExecutor);
        registry.register(NodeKind::AiTransform, ai::AiTransformExecutor);
        registry.register(NodeKind::Code, code::CodeExecutor);

        // ── Output (4) ──────────────────────────────────────────
        registry.register(NodeKind::Download, output::DownloadExecutor);
        registry.register(NodeKind::FileAppend, output::FileAppendExecutor);
        registry.register(NodeKind::HttpPost, network::HttpPostExecutor);
        registry.register(NodeKind::Email, output::EmailExecutor);

        registry
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipewright_test_utils::EchoExecutor;
    use serde_json::json;

    #[test]
    fn test_builtins_cover_every_kind() {
        let registry = ExecutorRegistry::with_builtins();
        assert_eq!(registry.kinds(), NodeKind::ALL.to_vec());
        for kind in NodeKind::ALL {
            assert!(registry.get(kind.as_str()).is_ok(), "missing {}", kind);
        }
    }

    #[test]
    fn test_unknown_type() {
        let registry = ExecutorRegistry::with_builtins();
        let err = registry.get("teleport").err().unwrap();
        assert!(matches!(err, PipewrightError::UnknownExecutorType(ref t) if t == "teleport"));
    }

    #[test]
    fn test_known_kind_without_executor_is_unknown() {
        let mut registry = ExecutorRegistry::new();
        registry.register(NodeKind::Filter, EchoExecutor);
        assert!(registry.get("filter").is_ok());
        assert!(matches!(
            registry.get("sort").err().unwrap(),
            PipewrightError::UnknownExecutorType(_)
        ));
        assert_eq!(registry.kinds(), vec![NodeKind::Filter]);
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = ExecutorRegistry::with_builtins();
        registry.register(NodeKind::ManualData, EchoExecutor);
        let executor = registry.get("manual_data").unwrap();
        assert_eq!(executor.description(), EchoExecutor.description());
    }

    #[test]
    fn test_validate_node_prefixes_id() {
        let registry = ExecutorRegistry::with_builtins();
        let node = Node::new("fetch", "http_fetch");
        let errors = registry.validate_node(&node);
        assert_eq!(errors, vec!["Node fetch: url is required".to_string()]);

        let node = Node::new("x", "teleport").with_config("a", json!(1));
        assert_eq!(registry.validate_node(&node).len(), 1);
    }
}
