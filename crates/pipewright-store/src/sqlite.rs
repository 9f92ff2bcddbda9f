use chrono::{SecondsFormat, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use pipewright_core::error::{PipewrightError, Result};
use pipewright_core::graph::GraphDefinition;
use pipewright_core::traits::GraphStore;
use pipewright_core::types::{GraphSummary, RunRecord};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS graphs (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        definition TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS runs (
        id TEXT PRIMARY KEY,
        pipeline_id TEXT NOT NULL,
        status TEXT NOT NULL,
        record TEXT NOT NULL,
        started_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_runs_pipeline
        ON runs(pipeline_id, started_at);";

fn db_err(e: impl std::fmt::Display) -> PipewrightError {
    PipewrightError::Store(e.to_string())
}

/// SQLite-backed store for graph definitions and run records.
pub struct SqliteGraphStore {
    conn: Mutex<Connection>,
}

impl SqliteGraphStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| PipewrightError::Store(format!("Failed to create db directory: {}", e)))?;
        }

        let conn = Connection::open(path).map_err(db_err)?;

        // Enable WAL mode for better concurrent performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(db_err)
    }

    /// Delete a graph and its run history. Returns whether the graph existed.
    pub fn delete_graph(&self, pipeline_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM runs WHERE pipeline_id = ?1", params![pipeline_id])
            .map_err(db_err)?;
        let removed = conn
            .execute("DELETE FROM graphs WHERE id = ?1", params![pipeline_id])
            .map_err(db_err)?;
        Ok(removed > 0)
    }
}

impl GraphStore for SqliteGraphStore {
    fn get(&self, pipeline_id: &str) -> BoxFuture<'_, Result<Option<GraphDefinition>>> {
        let pipeline_id = pipeline_id.to_string();
        Box::pin(async move {
            let conn = self.lock()?;
            let definition: Option<String> = conn
                .query_row(
                    "SELECT definition FROM graphs WHERE id = ?1",
                    params![pipeline_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;

            match definition {
                Some(json) => Ok(Some(serde_json::from_str(&json)?)),
                None => Ok(None),
            }
        })
    }

    fn put_graph(&self, graph: &GraphDefinition) -> BoxFuture<'_, Result<()>> {
        let mut graph = graph.clone();
        Box::pin(async move {
            let now = Utc::now();
            graph.updated_at = Some(now);
            let definition = serde_json::to_string(&graph)?;

            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO graphs (id, name, definition, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    definition = excluded.definition,
                    updated_at = excluded.updated_at",
                params![graph.id, graph.name, definition, now.to_rfc3339()],
            )
            .map_err(db_err)?;

            debug!(pipeline_id = %graph.id, nodes = graph.nodes.len(), "Stored graph");
            Ok(())
        })
    }

    fn put_run(&self, record: &RunRecord) -> BoxFuture<'_, Result<()>> {
        let record = record.clone();
        Box::pin(async move {
            let json = serde_json::to_string(&record)?;
            let conn = self.lock()?;
            conn.execute(
                "INSERT OR REPLACE INTO runs (id, pipeline_id, status, record, started_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.id,
                    record.pipeline_id,
                    record.status.to_string(),
                    json,
                    record.started_at.to_rfc3339_opts(SecondsFormat::Nanos, true)
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn list_graphs(&self) -> BoxFuture<'_, Result<Vec<GraphSummary>>> {
        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare("SELECT definition FROM graphs ORDER BY id ASC")
                .map_err(db_err)?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(db_err)?;

            let mut out = Vec::new();
            for row in rows {
                let graph: GraphDefinition = serde_json::from_str(&row.map_err(db_err)?)?;
                out.push(GraphSummary {
                    node_count: graph.nodes.len(),
                    id: graph.id,
                    name: graph.name,
                    updated_at: graph.updated_at,
                });
            }
            Ok(out)
        })
    }

    fn list_runs(&self, pipeline_id: &str, limit: usize) -> BoxFuture<'_, Result<Vec<RunRecord>>> {
        let pipeline_id = pipeline_id.to_string();
        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(
                    "SELECT record FROM runs
                     WHERE pipeline_id = ?1
                     ORDER BY started_at DESC, rowid DESC
                     LIMIT ?2",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![pipeline_id, limit as i64], |row| row.get::<_, String>(0))
                .map_err(db_err)?;

            let mut out = Vec::new();
            for row in rows {
                out.push(serde_json::from_str(&row.map_err(db_err)?)?);
            }
            Ok(out)
        })
    }
}
