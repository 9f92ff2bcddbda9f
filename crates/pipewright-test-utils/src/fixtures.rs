use serde_json::json;
use tempfile::TempDir;

use pipewright_core::config::AppConfig;
use pipewright_core::graph::{GraphDefinition, Node};

/// A → B → C, all `manual_data`/`transform` nodes; B adds `y: 2`.
pub fn linear_graph(id: &str) -> GraphDefinition {
    GraphDefinition::new(
        id,
        vec![
            Node::new("A", "manual_data"),
            Node::new("B", "transform")
                .with_inputs(["A"])
                .with_config("set", json!({"y": 2})),
            Node::new("C", "manual_data").with_inputs(["B"]),
        ],
    )
}

/// A ↔ B.
pub fn cyclic_graph(id: &str) -> GraphDefinition {
    GraphDefinition::new(
        id,
        vec![
            Node::new("A", "manual_data").with_inputs(["B"]),
            Node::new("B", "manual_data").with_inputs(["A"]),
        ],
    )
}

/// Two static sources inner-joined on `id`.
pub fn join_graph(id: &str) -> GraphDefinition {
    GraphDefinition::new(
        id,
        vec![
            Node::new("L", "manual_data").with_config(
                "data",
                json!([{"id": 1, "name": "A"}, {"id": 2, "name": "B"}]),
            ),
            Node::new("R", "manual_data")
                .with_config("data", json!([{"id": 1, "amt": 5}, {"id": 3, "amt": 7}])),
            Node::new("J", "join")
                .with_inputs(["L", "R"])
                .with_config("type", json!("inner"))
                .with_config("leftKey", json!("id"))
                .with_config("rightKey", json!("id")),
        ],
    )
}

/// A single node of `kind` with the given id.
pub fn single_node_graph(id: &str, node_id: &str, kind: &str) -> GraphDefinition {
    GraphDefinition::new(id, vec![Node::new(node_id, kind)])
}

/// Parse a config snippet; panics on invalid TOML.
pub fn config_from_toml(toml_str: &str) -> AppConfig {
    toml::from_str(toml_str).expect("fixture config must parse")
}

/// A temporary workspace and a config rooted in it with an in-memory store.
pub fn temp_workspace() -> (TempDir, AppConfig) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let mut config = AppConfig::default();
    config.engine.workspace = dir.path().display().to_string();
    config.store.path = ":memory:".to_string();
    (dir, config)
}
