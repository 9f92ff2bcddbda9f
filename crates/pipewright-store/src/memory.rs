use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use futures::future::BoxFuture;

use pipewright_core::error::{PipewrightError, Result};
use pipewright_core::graph::GraphDefinition;
use pipewright_core::traits::GraphStore;
use pipewright_core::types::{GraphSummary, RunRecord};

/// Process-local store. Nothing survives the process.
#[derive(Default)]
pub struct MemoryGraphStore {
    graphs: Mutex<BTreeMap<String, GraphDefinition>>,
    runs: Mutex<Vec<RunRecord>>,
}

fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    m.lock().map_err(|e| PipewrightError::Store(e.to_string()))
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with graphs.
    pub fn with_graphs(graphs: impl IntoIterator<Item = GraphDefinition>) -> Self {
        let store = Self::new();
        if let Ok(mut map) = store.graphs.lock() {
            for graph in graphs {
                map.insert(graph.id.clone(), graph);
            }
        }
        store
    }

    /// Every persisted run, in insertion order.
    pub fn runs(&self) -> Vec<RunRecord> {
        lock(&self.runs).map(|r| r.clone()).unwrap_or_default()
    }
}

impl GraphStore for MemoryGraphStore {
    fn get(&self, pipeline_id: &str) -> BoxFuture<'_, Result<Option<GraphDefinition>>> {
        let pipeline_id = pipeline_id.to_string();
        Box::pin(async move {
            let graphs = lock(&self.graphs)?;
            Ok(graphs.get(&pipeline_id).cloned())
        })
    }

    fn put_graph(&self, graph: &GraphDefinition) -> BoxFuture<'_, Result<()>> {
        let mut graph = graph.clone();
        Box::pin(async move {
            graph.updated_at = Some(Utc::now());
            lock(&self.graphs)?.insert(graph.id.clone(), graph);
            Ok(())
        })
    }

    fn put_run(&self, record: &RunRecord) -> BoxFuture<'_, Result<()>> {
        let record = record.clone();
        Box::pin(async move {
            let mut runs = lock(&self.runs)?;
            runs.retain(|r| r.id != record.id);
            runs.push(record);
            Ok(())
        })
    }

    fn list_graphs(&self) -> BoxFuture<'_, Result<Vec<GraphSummary>>> {
        Box::pin(async move {
            let graphs = lock(&self.graphs)?;
            Ok(graphs
                .values()
                .map(|g| GraphSummary {
                    id: g.id.clone(),
                    name: g.name.clone(),
                    node_count: g.nodes.len(),
                    updated_at: g.updated_at,
                })
                .collect())
        })
    }

    fn list_runs(&self, pipeline_id: &str, limit: usize) -> BoxFuture<'_, Result<Vec<RunRecord>>> {
        let pipeline_id = pipeline_id.to_string();
        Box::pin(async move {
            let runs = lock(&self.runs)?;
            Ok(runs
                .iter()
                .rev()
                .filter(|r| r.pipeline_id == pipeline_id)
                .take(limit)
                .cloned()
                .collect())
        })
    }
}
