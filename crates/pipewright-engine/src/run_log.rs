use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use pipewright_core::config::LogConfig;
use pipewright_core::event::EventBus;
use pipewright_core::types::{ExecutionId, PipelineEvent};

/// JSONL run logger.
///
/// Follows one run on the EventBus and writes one JSON object per line to
/// `{log_dir}/{pipeline_id}/{timestamp}.jsonl`. Lines are flushed as they are
/// written, so a crash mid-run leaves every earlier line intact.
#[derive(Debug, Clone)]
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

/// A single log entry written to the JSONL file.
#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    execution_id: String,
    event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// `level` controls verbosity: 1=run summary, 2=per-node outcome, 3=node inputs.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Logger for an enabled `[log]` section, rooted at `log_dir`.
    pub fn from_config(config: &LogConfig, log_dir: PathBuf) -> Option<Self> {
        config.enabled.then(|| Self::new(log_dir, config.level))
    }

    /// Subscribe now and log in the background until the run completes.
    pub fn spawn(
        self,
        event_bus: &EventBus,
        pipeline_id: impl Into<String>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let rx = event_bus.subscribe();
        tokio::spawn(self.run(rx, pipeline_id.into(), cancel))
    }

    /// Write JSONL until cancellation or the run's `RunCompleted` event.
    pub async fn run(
        self,
        mut rx: broadcast::Receiver<PipelineEvent>,
        pipeline_id: String,
        cancel: CancellationToken,
    ) {
        let pipeline_dir = self.log_dir.join(&pipeline_id);
        if let Err(e) = tokio::fs::create_dir_all(&pipeline_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = pipeline_dir.join(format!("{}.jsonl", timestamp));

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");

        let mut writer = tokio::io::BufWriter::new(file);
        // Bound to the first run of this pipeline seen on the bus.
        let mut execution: Option<ExecutionId> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            if execution.is_none() {
                                if let PipelineEvent::RunStarted { execution_id, pipeline_id: p, .. } = &event {
                                    if *p == pipeline_id {
                                        execution = Some(execution_id.clone());
                                    }
                                }
                            }
                            if execution.as_ref() != Some(event.execution_id()) {
                                continue;
                            }

                            let entry = match self.event_to_entry(&event) {
                                Some(e) => e,
                                None => continue,
                            };

                            if let Ok(json) = serde_json::to_string(&entry) {
                                let line = format!("{}\n", json);
                                if let Err(e) = writer.write_all(line.as_bytes()).await {
                                    error!(error = %e, "Failed to write log entry");
                                    break;
                                }
                                if let Err(e) = writer.flush().await {
                                    error!(error = %e, "Failed to flush log");
                                }
                            }

                            if matches!(event, PipelineEvent::RunCompleted { .. }) {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
    }

    /// Convert an event to a log entry (None if filtered by level).
    fn event_to_entry(&self, event: &PipelineEvent) -> Option<LogEntry> {
        let entry = |event_type: &str, node_id: Option<&String>, detail| LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            execution_id: event.execution_id().to_string(),
            event_type: event_type.to_string(),
            node_id: node_id.cloned(),
            detail,
        };

        match event {
            // L1: run summary
            PipelineEvent::RunStarted {
                pipeline_id,
                trigger,
                ..
            } => Some(entry(
                "run_started",
                None,
                Some(json!({ "pipeline_id": pipeline_id, "trigger": trigger.to_string() })),
            )),
            PipelineEvent::RunCompleted {
                status,
                duration_ms,
                error,
                ..
            } => Some(entry(
                "run_completed",
                None,
                Some(json!({
                    "status": status.to_string(),
                    "duration_ms": duration_ms,
                    "error": error,
                })),
            )),

            // L2: per-node outcome
            PipelineEvent::NodeCompleted {
                node_id,
                elapsed_ms,
                ..
            } if self.level >= 2 => Some(entry(
                "node_completed",
                Some(node_id),
                Some(json!({ "elapsed_ms": elapsed_ms })),
            )),
            PipelineEvent::NodeFailed { node_id, error, .. } if self.level >= 2 => Some(entry(
                "node_failed",
                Some(node_id),
                Some(json!({ "error": error })),
            )),
            PipelineEvent::NodeRecovered {
                node_id, recovery, ..
            } if self.level >= 2 => Some(entry(
                "node_recovered",
                Some(node_id),
                Some(json!({ "recovery": recovery })),
            )),

            // L3: node inputs
            PipelineEvent::NodeStarted {
                node_id,
                node_type,
                input,
                ..
            } if self.level >= 3 => Some(entry(
                "node_started",
                Some(node_id),
                Some(json!({
                    "node_type": node_type,
                    "input": truncate_json(input, 500),
                })),
            )),

            _ => None,
        }
    }
}

/// Truncate a JSON value for logging.
fn truncate_json(value: &serde_json::Value, max_len: usize) -> String {
    let s = value.to_string();
    if s.len() <= max_len {
        return s;
    }
    let mut cut = max_len;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &s[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipewright_core::types::{RunStatus, TriggerKind};

    fn started(id: &str, pipeline_id: &str) -> PipelineEvent {
        PipelineEvent::RunStarted {
            execution_id: ExecutionId::from_string(id),
            pipeline_id: pipeline_id.into(),
            trigger: TriggerKind::Manual,
        }
    }

    fn completed(id: &str) -> PipelineEvent {
        PipelineEvent::RunCompleted {
            execution_id: ExecutionId::from_string(id),
            pipeline_id: "etl".into(),
            status: RunStatus::Success,
            duration_ms: 12,
            error: None,
        }
    }

    fn node_started(id: &str) -> PipelineEvent {
        PipelineEvent::NodeStarted {
            execution_id: ExecutionId::from_string(id),
            node_id: "A".into(),
            node_type: "manual_data".into(),
            input: serde_json::Value::Null,
        }
    }

    fn node_completed(id: &str) -> PipelineEvent {
        PipelineEvent::NodeCompleted {
            execution_id: ExecutionId::from_string(id),
            node_id: "A".into(),
            elapsed_ms: 3,
        }
    }

    #[test]
    fn test_entry_skips_empty_fields() {
        let logger = RunLogger::new(PathBuf::from("/tmp"), 1);
        let entry = logger.event_to_entry(&completed("e1")).unwrap();
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("run_completed"));
        assert!(json.contains("\"execution_id\":\"e1\""));
        assert!(!json.contains("node_id"));
    }

    #[test]
    fn test_truncate_json() {
        let value = json!({"key": "a very long string that should be truncated"});
        let result = truncate_json(&value, 20);
        assert!(result.len() <= 23);
        assert!(result.ends_with("..."));
    }

    #[test]
    fn test_event_level_filtering() {
        let logger = RunLogger::new(PathBuf::from("/tmp"), 1);
        assert!(logger.event_to_entry(&started("e", "etl")).is_some());
        assert!(logger.event_to_entry(&node_completed("e")).is_none());
        assert!(logger.event_to_entry(&node_started("e")).is_none());

        let logger2 = RunLogger::new(PathBuf::from("/tmp"), 2);
        assert!(logger2.event_to_entry(&node_completed("e")).is_some());
        assert!(logger2.event_to_entry(&node_started("e")).is_none());

        let logger3 = RunLogger::new(PathBuf::from("/tmp"), 3);
        assert!(logger3.event_to_entry(&node_started("e")).is_some());
    }

    #[test]
    fn test_disabled_config_yields_no_logger() {
        let config = LogConfig {
            enabled: false,
            ..LogConfig::default()
        };
        assert!(RunLogger::from_config(&config, PathBuf::from("/tmp")).is_none());
        assert!(RunLogger::from_config(&LogConfig::default(), PathBuf::from("/tmp")).is_some());
    }

    #[tokio::test]
    async fn test_writes_one_run_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::default();
        let handle = RunLogger::new(dir.path().to_path_buf(), 2).spawn(
            &bus,
            "etl",
            CancellationToken::new(),
        );

        bus.publish(started("other-run", "other"));
        bus.publish(started("e1", "etl"));
        bus.publish(node_started("e1"));
        bus.publish(node_completed("e1"));
        bus.publish(node_completed("other-run"));
        bus.publish(completed("e1"));
        handle.await.unwrap();

        let run_dir = dir.path().join("etl");
        let file = std::fs::read_dir(&run_dir).unwrap().next().unwrap().unwrap();
        let content = std::fs::read_to_string(file.path()).unwrap();
        let types: Vec<String> = content
            .lines()
            .map(|l| {
                let v: serde_json::Value = serde_json::from_str(l).unwrap();
                v["event_type"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(types, vec!["run_started", "node_completed", "run_completed"]);
    }

    #[tokio::test]
    async fn test_cancel_stops_logger() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::default();
        let cancel = CancellationToken::new();
        let handle = RunLogger::new(dir.path().to_path_buf(), 1).spawn(&bus, "etl", cancel.clone());
        cancel.cancel();
        handle.await.unwrap();
    }
}
